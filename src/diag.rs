//! Error kinds and structured diagnostics.
//!
//! Every deviation found while parsing becomes a [`Diagnostic`] tagged with the field path
//! from the root and the absolute byte offset. Offsets inside a transform output (or a
//! concatenated `io` buffer) are relative to that buffer and carry the `derived` flag.
//! Fatal diagnostics mark a field whose parse was aborted; warnings and infos record
//! substitutions and inconsistencies while parsing continues.

use std::fmt;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("out of bounds: need {needed} byte(s) at offset {offset:#x}, {available} available")]
    OutOfBounds { offset: u64, needed: u64, available: u64 },
    #[error("contents mismatch: expected [{expected}], found [{actual}]")]
    ContentMismatch { expected: String, actual: String },
    #[error("validation failed: expected {expected}, found {actual}")]
    ValidationFailed { expected: String, actual: String },
    #[error("unhandled variant: no case for discriminant {discriminant} and no default")]
    UnhandledVariant { discriminant: String },
    #[error("transform `{name}` failed: {reason}")]
    TransformFailed { name: String, reason: String },
    #[error("resource limit exceeded: {what} ({requested} > {limit})")]
    ResourceLimitExceeded { what: String, requested: u64, limit: u64 },
    #[error("unresolved {what} `{name}`")]
    UnresolvedType { what: &'static str, name: String },
    #[error("expression: {0}")]
    Expression(String),
    #[error("grammar: {0}")]
    Grammar(String),
    #[error("parse cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Errors that end the whole parse regardless of strictness.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::ResourceLimitExceeded { .. } | ErrorKind::Cancelled)
    }

    pub(crate) fn limit(what: impl Into<String>, requested: u64, limit: u64) -> Self {
        ErrorKind::ResourceLimitExceeded { what: what.into(), requested, limit }
    }
}

/// An error located in the structure tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{path} @ {offset:#x}: {kind}")]
pub struct ParseError {
    pub kind: ErrorKind,
    pub path: String,
    pub offset: u64,
    /// `offset` is in a derived buffer, not the document.
    pub derived: bool,
}

impl ParseError {
    pub fn new(kind: ErrorKind, path: impl Into<String>, offset: usize) -> Self {
        ParseError { kind, path: path.into(), offset: offset as u64, derived: false }
    }

    pub(crate) fn in_derived(mut self, derived: bool) -> Self {
        self.derived = derived;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Fatal,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Fatal => "fatal",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    /// A typed failure. A fatal failure leaves the field absent, or holding an incomplete node.
    Error(ErrorKind),
    /// Integer with no symbol in the enum; retained as a raw value.
    UnrecognizedEnum { enum_name: String, value: i128 },
    /// Switch fell through in permissive mode; the field's bytes were kept as an opaque blob.
    OpaqueVariant { discriminant: String, len: usize },
    /// Undecodable characters were replaced with U+FFFD.
    LossyDecode { encoding: String },
    /// `repeat: eos` inside a node that shares its parent's stream.
    UnboundedRepeat,
    /// A `repeat: eos` element consumed nothing; the loop was stopped.
    EmptyRepeatElement { index: usize },
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Error(e) => write!(f, "{}", e),
            DiagnosticKind::UnrecognizedEnum { enum_name, value } => {
                write!(f, "value {} is not a member of enum `{}` (kept as unrecognized)", value, enum_name)
            }
            DiagnosticKind::OpaqueVariant { discriminant, len } => write!(
                f,
                "no case for discriminant {}; {} byte(s) kept as opaque blob",
                discriminant, len
            ),
            DiagnosticKind::LossyDecode { encoding } => {
                write!(f, "invalid {} sequence replaced with U+FFFD", encoding)
            }
            DiagnosticKind::UnboundedRepeat => {
                f.write_str("repeat to end of stream in a node without its own size bound")
            }
            DiagnosticKind::EmptyRepeatElement { index } => {
                write!(f, "repeat element {} consumed no bytes; repetition stopped", index)
            }
        }
    }
}

/// One finding, tagged with the field path and absolute byte offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub path: String,
    pub offset: u64,
    /// `offset` is in a derived buffer, not the document.
    pub derived: bool,
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    pub fn from_error(severity: Severity, e: &ParseError) -> Self {
        Diagnostic {
            severity,
            path: e.path.clone(),
            offset: e.offset,
            derived: e.derived,
            kind: DiagnosticKind::Error(e.kind.clone()),
        }
    }

    pub fn error_kind(&self) -> Option<&ErrorKind> {
        match &self.kind {
            DiagnosticKind::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = if self.derived { " (derived)" } else { "" };
        write!(f, "{}: {} @ {:#x}{}: {}", self.severity, self.path, self.offset, at, self.kind)
    }
}
