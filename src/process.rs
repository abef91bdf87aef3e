//! Transform pipeline: named byte-to-byte functions applied to a field's raw bytes before
//! the field's type is parsed from the result.
//!
//! Built-ins: `zlib`, `deflate`, `xor(key)`, `rol(n)`, `ror(n)`. Callers add their own with
//! [`TransformRegistry::register`]. Every transform is given the output cap from
//! [`crate::options::Limits::max_transform_output`] and must fail with
//! [`TransformError::TooLarge`] instead of producing more.

use crate::value::Value;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),
    #[error("output exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("bad arguments: {0}")]
    Arguments(String),
}

/// A byte transform. Arguments are the evaluated `process` call arguments.
pub trait Transform {
    fn apply(&self, input: &[u8], args: &[Value], limit: usize) -> Result<Vec<u8>, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(&[u8], &[Value], usize) -> Result<Vec<u8>, TransformError>,
{
    fn apply(&self, input: &[u8], args: &[Value], limit: usize) -> Result<Vec<u8>, TransformError> {
        self(input, args, limit)
    }
}

pub struct TransformRegistry {
    transforms: HashMap<String, Box<dyn Transform>>,
}

impl TransformRegistry {
    /// Registry with no transforms at all.
    pub fn empty() -> Self {
        TransformRegistry { transforms: HashMap::new() }
    }

    /// Registry with the built-in transforms.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register("zlib", Zlib);
        r.register("deflate", Deflate);
        r.register("xor", Xor);
        r.register("rol", Rotate { left: true });
        r.register("ror", Rotate { left: false });
        r
    }

    /// Add or replace a transform.
    pub fn register(&mut self, name: impl Into<String>, t: impl Transform + 'static) {
        self.transforms.insert(name.into(), Box::new(t));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Transform> {
        self.transforms.get(name).map(|b| b.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry").field("transforms", &names).finish()
    }
}

/// Read a decompressor to the end, stopping one byte past `limit`.
fn read_capped(reader: impl Read, limit: usize) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| TransformError::Failed(e.to_string()))?;
    if out.len() > limit {
        return Err(TransformError::TooLarge { limit });
    }
    Ok(out)
}

struct Zlib;

impl Transform for Zlib {
    fn apply(&self, input: &[u8], _args: &[Value], limit: usize) -> Result<Vec<u8>, TransformError> {
        read_capped(ZlibDecoder::new(input), limit)
    }
}

struct Deflate;

impl Transform for Deflate {
    fn apply(&self, input: &[u8], _args: &[Value], limit: usize) -> Result<Vec<u8>, TransformError> {
        read_capped(DeflateDecoder::new(input), limit)
    }
}

/// XOR with a single-byte integer key or a repeating byte-array key.
struct Xor;

impl Transform for Xor {
    fn apply(&self, input: &[u8], args: &[Value], _limit: usize) -> Result<Vec<u8>, TransformError> {
        let key: Vec<u8> = match args {
            [Value::Bytes(b)] => b.to_vec(),
            [v] => match v.as_int().and_then(|k| u8::try_from(k).ok()) {
                Some(k) => vec![k],
                None => return Err(TransformError::Arguments(format!("xor key {:?} is not a byte", v))),
            },
            _ => return Err(TransformError::Arguments("xor takes exactly one key".into())),
        };
        if key.is_empty() {
            return Err(TransformError::Arguments("xor key is empty".into()));
        }
        Ok(input.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k).collect())
    }
}

/// Per-byte bit rotation.
struct Rotate {
    left: bool,
}

impl Transform for Rotate {
    fn apply(&self, input: &[u8], args: &[Value], _limit: usize) -> Result<Vec<u8>, TransformError> {
        let n = match args {
            [v] => v.as_int().ok_or_else(|| TransformError::Arguments("rotation amount must be an integer".into()))?,
            _ => return Err(TransformError::Arguments("rotation takes exactly one amount".into())),
        };
        let n = n.rem_euclid(8) as u32;
        Ok(input
            .iter()
            .map(|b| if self.left { b.rotate_left(n) } else { b.rotate_right(n) })
            .collect())
    }
}
