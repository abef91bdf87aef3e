//! Grammar data model: types, fields, instances, enums.
//!
//! A [`Grammar`] is immutable once loaded. Types live in a flat arena addressed by
//! [`TypeId`]; each type records its lexical parent so names resolve innermost-first
//! (see [`crate::registry`]). Type references are kept as names and resolved on demand,
//! so recursive and mutually-referential definitions need no special handling.

use crate::expr::Expr;
use crate::stream::Endian;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumId(pub usize);

#[derive(Debug, Clone)]
pub struct Grammar {
    /// Document id (`meta.id`); also the name of the root type.
    pub id: String,
    pub root: TypeId,
    pub types: Vec<TypeDef>,
    pub enums: Vec<EnumDef>,
}

#[derive(Debug, Clone, Default)]
pub struct TypeDef {
    pub name: String,
    /// `outer::inner` path from the root type.
    pub path: String,
    /// Enclosing type (lexical scope); `None` for the root.
    pub scope: Option<TypeId>,
    pub endian: Option<Endian>,
    pub bit_endian: Option<Endian>,
    pub encoding: Option<String>,
    pub seq: Vec<FieldSpec>,
    pub instances: Vec<(String, InstanceSpec)>,
    pub types: HashMap<String, TypeId>,
    pub enums: HashMap<String, EnumId>,
}

impl TypeDef {
    pub fn instance(&self, name: &str) -> Option<&InstanceSpec> {
        self.instances.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.seq.iter().position(|f| f.id == name)
    }
}

/// One field of a `seq` (or the parse part of a positional instance).
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub id: String,
    pub kind: ValueKind,
    pub size: SizeSpec,
    pub repeat: Repeat,
    pub cond: Option<Expr>,
    /// Enum name to map the integer through.
    pub enum_ref: Option<String>,
    pub valid: Option<Validation>,
    pub process: Option<ProcessSpec>,
    /// Bytes to skip after the field (computed after the field is stored).
    pub padding: Option<Expr>,
}

impl FieldSpec {
    pub fn new(id: impl Into<String>, kind: ValueKind) -> Self {
        FieldSpec {
            id: id.into(),
            kind,
            size: SizeSpec::Implicit,
            repeat: Repeat::Once,
            cond: None,
            enum_ref: None,
            valid: None,
            process: None,
            padding: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SizeSpec {
    /// Width follows from the value kind (scalars, contents, user types without a budget).
    Implicit,
    Expr(Expr),
    /// Everything left in the current stream.
    Eos,
    Terminator { term: u8, include: bool, consume: bool, eos_error: bool },
}

impl SizeSpec {
    pub fn is_budgeted(&self) -> bool {
        matches!(self, SizeSpec::Expr(_) | SizeSpec::Eos)
    }
}

#[derive(Debug, Clone)]
pub enum Repeat {
    Once,
    Expr(Expr),
    Eos,
    Until(Expr),
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    Int { width: u8, signed: bool, endian: Option<Endian> },
    Float { width: u8, endian: Option<Endian> },
    Bits { width: u8, endian: Option<Endian> },
    Bytes,
    Str { encoding: Option<String>, zero_terminated: bool },
    Contents(Vec<u8>),
    /// User type by (possibly `::`-qualified) name.
    User(String),
    Switch(SwitchSpec),
}

/// `switch-on` dispatch: cases are tried in declaration order.
#[derive(Debug, Clone)]
pub struct SwitchSpec {
    pub on: Expr,
    pub cases: Vec<(Expr, ValueKind)>,
    pub default: Option<Box<ValueKind>>,
}

#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub cond: Option<Expr>,
    pub kind: InstanceKind,
}

#[derive(Debug, Clone)]
pub enum InstanceKind {
    /// Pure expression.
    Value(Expr),
    /// Parse `field` at `pos` (default: 0) in `io` (default: the node's own stream).
    Parse { pos: Option<Expr>, io: Option<Expr>, field: FieldSpec },
}

#[derive(Debug, Clone)]
pub struct Validation {
    pub rule: ValidRule,
    /// Informational checks (redundant header counts etc.) never abort a field.
    pub informational: bool,
}

#[derive(Debug, Clone)]
pub enum ValidRule {
    Eq(Expr),
    Range { min: Option<Expr>, max: Option<Expr> },
    AnyOf(Vec<Expr>),
    /// Predicate over `_` (the decoded value).
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub by_value: BTreeMap<i128, String>,
    pub by_label: HashMap<String, i128>,
}

impl EnumDef {
    pub fn label(&self, v: i128) -> Option<&str> {
        self.by_value.get(&v).map(String::as_str)
    }
}

impl Grammar {
    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0]
    }

    pub fn enum_def(&self, id: EnumId) -> &EnumDef {
        &self.enums[id.0]
    }

    pub fn root_type(&self) -> &TypeDef {
        self.type_def(self.root)
    }

    /// Endianness in effect for a type: its own, else the nearest enclosing type's.
    pub fn endian_for(&self, mut id: TypeId) -> Option<Endian> {
        loop {
            let t = self.type_def(id);
            if t.endian.is_some() {
                return t.endian;
            }
            id = t.scope?;
        }
    }

    pub fn bit_endian_for(&self, mut id: TypeId) -> Endian {
        loop {
            let t = self.type_def(id);
            if let Some(e) = t.bit_endian {
                return e;
            }
            match t.scope {
                Some(s) => id = s,
                None => return Endian::Big,
            }
        }
    }

    pub fn encoding_for(&self, mut id: TypeId) -> Option<&str> {
        loop {
            let t = self.type_def(id);
            if let Some(e) = &t.encoding {
                return Some(e);
            }
            id = t.scope?;
        }
    }
}
