//! # binterp — runtime interpreter for declarative binary grammars
//!
//! Grammars in the Kaitai-Struct style (YAML documents with `seq`, `instances`, `types`,
//! `enums`) are loaded into an immutable [`Grammar`] and executed directly against byte
//! buffers. No code generation is involved.
//!
//! ## Pipeline
//!
//! - [`loader`] turns a YAML document into a [`Grammar`] (types in a flat arena, expressions
//!   parsed with a PEST grammar).
//! - [`Interpreter`] walks a grammar over a buffer and returns a [`Document`]: the parsed
//!   tree (possibly partial), a list of [`Diagnostic`]s, and the error that aborted the
//!   parse, if any.
//! - Sizes, counts, conditions, offsets and switch discriminants are expressions evaluated
//!   against the node under construction. Instances are lazy and memoized.
//! - Sized fields may be run through a transform (`zlib`, `xor`, ...) before parsing; the
//!   result is a new buffer and ranges inside it are marked derived.
//!
//! ## Example
//!
//! ```
//! use binterp::{loader, Interpreter};
//! use std::sync::Arc;
//!
//! let grammar = loader::parse(r#"
//! meta: {id: pkt, endian: be}
//! seq:
//!   - {id: magic, contents: "PK"}
//!   - {id: len, type: u2}
//!   - {id: body, size: len}
//! "#).unwrap();
//! let doc = Interpreter::new(Arc::new(grammar)).parse(vec![b'P', b'K', 0, 2, 0xaa, 0xbb]);
//! assert!(doc.is_complete());
//! assert_eq!(doc.root().field("len").and_then(|v| v.as_int()), Some(2));
//! ```

pub mod ast;
pub mod check;
pub mod diag;
pub mod dump;
mod eval;
pub mod expr;
mod instance;
pub mod interp;
pub mod loader;
pub mod node;
pub mod options;
pub mod process;
mod registry;
pub mod stream;
pub mod validate;
pub mod value;

pub use ast::{Grammar, TypeId};
pub use diag::{Diagnostic, DiagnosticKind, ErrorKind, ParseError, Severity};
pub use interp::Interpreter;
pub use loader::GrammarError;
pub use node::{Document, Field, ParsedNode};
pub use options::{CancelToken, Limits, ParseOptions, Strictness};
pub use process::{Transform, TransformError, TransformRegistry};
pub use stream::{ByteRange, Bytes, Endian, Stream};
pub use value::Value;
