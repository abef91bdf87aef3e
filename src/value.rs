//! Runtime values produced by parsing and by expression evaluation.

use crate::node::ParsedNode;
use crate::stream::{Bytes, Stream};
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    /// Result of integer arithmetic or a bit field.
    Int(i128),
    Bool(bool),
    Float(f32),
    Double(f64),
    Bytes(Bytes),
    Str(String),
    /// Integer tagged with its enum; `label` is `None` when the value is unrecognized.
    Enum { enum_name: String, value: i128, label: Option<String> },
    Node(Rc<ParsedNode>),
    List(Vec<Value>),
    Io(Stream),
}

impl Value {
    /// Decoded integer of the given width/signedness.
    pub fn from_int(v: i128, width: u8, signed: bool) -> Value {
        match (width, signed) {
            (1, false) => Value::U8(v as u8),
            (2, false) => Value::U16(v as u16),
            (4, false) => Value::U32(v as u32),
            (8, false) => Value::U64(v as u64),
            (1, true) => Value::I8(v as i8),
            (2, true) => Value::I16(v as i16),
            (4, true) => Value::I32(v as i32),
            (8, true) => Value::I64(v as i64),
            _ => Value::Int(v),
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::U8(x) => Some(*x as i128),
            Value::U16(x) => Some(*x as i128),
            Value::U32(x) => Some(*x as i128),
            Value::U64(x) => Some(*x as i128),
            Value::I8(x) => Some(*x as i128),
            Value::I16(x) => Some(*x as i128),
            Value::I32(x) => Some(*x as i128),
            Value::I64(x) => Some(*x as i128),
            Value::Int(x) => Some(*x),
            Value::Enum { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_int().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_int().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x as f64),
            Value::Double(x) => Some(*x),
            _ => self.as_int().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Rc<ParsedNode>> {
        match self {
            Value::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    /// Symbolic name of an enum value, if recognized.
    pub fn enum_label(&self) -> Option<&str> {
        match self {
            Value::Enum { label, .. } => label.as_deref(),
            _ => None,
        }
    }

    pub fn is_unrecognized_enum(&self) -> bool {
        matches!(self, Value::Enum { label: None, .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::U8(_) | Value::U16(_) | Value::U32(_) | Value::U64(_) => "unsigned integer",
            Value::I8(_) | Value::I16(_) | Value::I32(_) | Value::I64(_) | Value::Int(_) => "integer",
            Value::Bool(_) => "bool",
            Value::Float(_) | Value::Double(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::Enum { .. } => "enum",
            Value::Node(_) => "node",
            Value::List(_) => "list",
            Value::Io(_) => "stream",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Enum { enum_name: a, value: x, .. }, Value::Enum { enum_name: b, value: y, .. }) => {
                a == b && x == y
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Node(a), Value::Node(b)) => Rc::ptr_eq(a, b),
            (Value::Io(a), Value::Io(b)) => {
                a.same_buffer(b) && a.base() == b.base() && a.size() == b.size()
            }
            (Value::Float(_) | Value::Double(_), _) | (_, Value::Float(_) | Value::Double(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => match (self.as_int(), other.as_int()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Float(x) => write!(f, "{}", x),
            Value::Double(x) => write!(f, "{}", x),
            Value::Bytes(b) => write!(f, "{:?}", b),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Enum { enum_name, value, label: Some(l) } => write!(f, "{}::{}({})", enum_name, l, value),
            Value::Enum { enum_name, value, label: None } => write!(f, "{}::<unrecognized>({})", enum_name, value),
            Value::Node(n) => write!(f, "<{} @ {}>", n.type_name(), n.path()),
            Value::List(v) => f.debug_list().entries(v).finish(),
            Value::Io(s) => write!(f, "{:?}", s),
            other => match other.as_int() {
                Some(i) => write!(f, "{}", i),
                None => f.write_str("?"),
            },
        }
    }
}
