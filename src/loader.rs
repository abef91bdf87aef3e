//! Load grammar documents (YAML, Kaitai-Struct-like keys) into a [`Grammar`].
//!
//! ```text
//! meta:
//!   id: qcdt
//!   endian: le
//! seq:
//!   - id: magic
//!     contents: "QCDT"
//!   - id: num_dtbs
//!     type: u4
//!   - id: entries
//!     type: entry
//!     repeat: expr
//!     repeat-expr: num_dtbs
//! types:
//!   entry:
//!     seq:
//!       - id: platform_id
//!         type: u4
//!         enum: platform
//! enums:
//!   platform:
//!     0x1: msm
//! ```

use crate::ast::*;
use crate::expr::{parse_int, Expr};
use crate::stream::Endian;
use anyhow::Context;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{path}: {message}")]
    Invalid { path: String, message: String },
}

fn invalid(path: &str, message: impl Into<String>) -> GrammarError {
    GrammarError::Invalid { path: path.to_string(), message: message.into() }
}

/// Parse grammar source into a [`Grammar`].
pub fn parse(source: &str) -> Result<Grammar, GrammarError> {
    let doc: Value = serde_yaml::from_str(source)?;
    let map = doc.as_mapping().ok_or_else(|| invalid("<document>", "grammar must be a mapping"))?;
    let id = get(map, "meta")
        .and_then(Value::as_mapping)
        .and_then(|m| get(m, "id"))
        .and_then(Value::as_str)
        .unwrap_or("root")
        .to_string();
    let mut b = Builder::default();
    let root = b.build_type(&id, &id, None, map)?;
    log::debug!("loaded grammar `{}`: {} type(s), {} enum(s)", id, b.types.len(), b.enums.len());
    Ok(Grammar { id, root, types: b.types, enums: b.enums })
}

/// Read and parse a grammar file.
pub fn load_grammar_file(path: &Path) -> anyhow::Result<Grammar> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("read grammar: {}", path.display()))?;
    parse(&txt).with_context(|| format!("parse grammar: {}", path.display()))
}

fn get<'a>(m: &'a Mapping, key: &str) -> Option<&'a Value> {
    m.get(&Value::String(key.to_string()))
}

#[derive(Default)]
struct Builder {
    types: Vec<TypeDef>,
    enums: Vec<EnumDef>,
}

impl Builder {
    fn build_type(
        &mut self,
        name: &str,
        path: &str,
        scope: Option<TypeId>,
        map: &Mapping,
    ) -> Result<TypeId, GrammarError> {
        let id = TypeId(self.types.len());
        self.types.push(TypeDef {
            name: name.to_string(),
            path: path.to_string(),
            scope,
            ..TypeDef::default()
        });

        let mut def = TypeDef { name: name.to_string(), path: path.to_string(), scope, ..TypeDef::default() };

        if let Some(meta) = get(map, "meta") {
            let meta = meta.as_mapping().ok_or_else(|| invalid(&format!("{}.meta", path), "must be a mapping"))?;
            def.endian = opt_endian(get(meta, "endian"), &format!("{}.meta.endian", path))?;
            def.bit_endian = opt_endian(get(meta, "bit-endian"), &format!("{}.meta.bit-endian", path))?;
            def.encoding = get(meta, "encoding").and_then(Value::as_str).map(str::to_string);
        }

        // Nested definitions first so that they exist before anything refers to them by id.
        if let Some(types) = get(map, "types") {
            let types = types.as_mapping().ok_or_else(|| invalid(&format!("{}.types", path), "must be a mapping"))?;
            for (k, v) in types {
                let tname = k.as_str().ok_or_else(|| invalid(&format!("{}.types", path), "type names must be strings"))?;
                check_ident(tname, &format!("{}.types", path))?;
                let tmap = v.as_mapping().ok_or_else(|| invalid(&format!("{}.types.{}", path, tname), "must be a mapping"))?;
                let child = self.build_type(tname, &format!("{}::{}", path, tname), Some(id), tmap)?;
                def.types.insert(tname.to_string(), child);
            }
        }
        if let Some(enums) = get(map, "enums") {
            let enums = enums.as_mapping().ok_or_else(|| invalid(&format!("{}.enums", path), "must be a mapping"))?;
            for (k, v) in enums {
                let ename = k.as_str().ok_or_else(|| invalid(&format!("{}.enums", path), "enum names must be strings"))?;
                let e = build_enum(ename, v, &format!("{}.enums.{}", path, ename))?;
                def.enums.insert(ename.to_string(), EnumId(self.enums.len()));
                self.enums.push(e);
            }
        }

        if let Some(seq) = get(map, "seq") {
            let seq = seq.as_sequence().ok_or_else(|| invalid(&format!("{}.seq", path), "must be a list"))?;
            for (i, f) in seq.iter().enumerate() {
                let fpath = format!("{}.seq[{}]", path, i);
                let fmap = f.as_mapping().ok_or_else(|| invalid(&fpath, "field must be a mapping"))?;
                let fid = get(fmap, "id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(&fpath, "missing `id`"))?;
                check_ident(fid, &fpath)?;
                if def.field_index(fid).is_some() {
                    return Err(invalid(&fpath, format!("duplicate field id `{}`", fid)));
                }
                def.seq.push(build_field(fid, fmap, &fpath)?);
            }
        }

        if let Some(instances) = get(map, "instances") {
            let instances = instances.as_mapping().ok_or_else(|| invalid(&format!("{}.instances", path), "must be a mapping"))?;
            for (k, v) in instances {
                let iname = k.as_str().ok_or_else(|| invalid(&format!("{}.instances", path), "instance names must be strings"))?;
                let ipath = format!("{}.instances.{}", path, iname);
                check_ident(iname, &ipath)?;
                if def.field_index(iname).is_some() || def.instance(iname).is_some() {
                    return Err(invalid(&ipath, format!("`{}` is already defined", iname)));
                }
                let imap = v.as_mapping().ok_or_else(|| invalid(&ipath, "must be a mapping"))?;
                def.instances.push((iname.to_string(), build_instance(iname, imap, &ipath)?));
            }
        }

        self.types[id.0] = def;
        Ok(id)
    }
}

fn check_ident(s: &str, path: &str) -> Result<(), GrammarError> {
    let mut chars = s.chars();
    let ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(invalid(path, format!("`{}` is not a valid identifier", s)))
    }
}

fn opt_endian(v: Option<&Value>, path: &str) -> Result<Option<Endian>, GrammarError> {
    match v.map(|v| v.as_str()) {
        None => Ok(None),
        Some(Some("le")) => Ok(Some(Endian::Little)),
        Some(Some("be")) => Ok(Some(Endian::Big)),
        Some(_) => Err(invalid(path, "expected `le` or `be`")),
    }
}

fn build_enum(name: &str, v: &Value, path: &str) -> Result<EnumDef, GrammarError> {
    let m = v.as_mapping().ok_or_else(|| invalid(path, "enum must be a mapping"))?;
    let mut by_value = BTreeMap::new();
    let mut by_label = HashMap::new();
    for (k, v) in m {
        let key = match k {
            Value::Number(n) => n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from)),
            Value::String(s) => parse_int(s).ok(),
            Value::Bool(b) => Some(*b as i128),
            _ => None,
        }
        .ok_or_else(|| invalid(path, format!("enum key {:?} is not an integer", k)))?;
        let label = match v {
            Value::String(s) => s.clone(),
            Value::Mapping(lm) => get(lm, "id")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(path, "enum entry mapping needs `id`"))?
                .to_string(),
            _ => return Err(invalid(path, format!("enum label for {} must be a string", key))),
        };
        check_ident(&label, path)?;
        by_label.insert(label.clone(), key);
        by_value.insert(key, label);
    }
    Ok(EnumDef { name: name.to_string(), by_value, by_label })
}

/// Scalar YAML value as an expression: numbers and booleans are literals, strings are parsed.
fn expr_of(v: &Value, path: &str) -> Result<Expr, GrammarError> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Expr::Int(i as i128))
            } else if let Some(u) = n.as_u64() {
                Ok(Expr::Int(u as i128))
            } else {
                Ok(Expr::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::Bool(b) => Ok(Expr::Bool(*b)),
        Value::String(s) => Expr::parse(s).map_err(|e| invalid(path, e)),
        _ => Err(invalid(path, "expected an expression")),
    }
}

fn flag(m: &Mapping, key: &str, default: bool, path: &str) -> Result<bool, GrammarError> {
    match get(m, key) {
        None => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid(&format!("{}.{}", path, key), "expected a boolean")),
    }
}

/// Built-in type names; anything else is a user type reference.
pub fn parse_type_name(s: &str) -> ValueKind {
    let (base, endian) = if let Some(b) = s.strip_suffix("le") {
        (b, Some(Endian::Little))
    } else if let Some(b) = s.strip_suffix("be") {
        (b, Some(Endian::Big))
    } else {
        (s, None)
    };
    let digits = |t: &str| t.parse::<u8>().ok();
    match (base.chars().next(), base.get(1..)) {
        (Some('u'), Some(w)) if matches!(w, "1" | "2" | "4" | "8") => {
            ValueKind::Int { width: digits(w).unwrap_or(1), signed: false, endian }
        }
        (Some('s'), Some(w)) if matches!(w, "1" | "2" | "4" | "8") => {
            ValueKind::Int { width: digits(w).unwrap_or(1), signed: true, endian }
        }
        (Some('f'), Some(w)) if matches!(w, "4" | "8") => {
            ValueKind::Float { width: digits(w).unwrap_or(4), endian }
        }
        (Some('b'), Some(w)) if digits(w).is_some_and(|n| (1..=64).contains(&n)) => {
            ValueKind::Bits { width: digits(w).unwrap_or(1), endian }
        }
        _ if s == "str" => ValueKind::Str { encoding: None, zero_terminated: false },
        _ if s == "strz" => ValueKind::Str { encoding: None, zero_terminated: true },
        _ => ValueKind::User(s.to_string()),
    }
}

fn build_kind(v: &Value, path: &str) -> Result<ValueKind, GrammarError> {
    match v {
        Value::String(s) => Ok(parse_type_name(s)),
        Value::Mapping(m) => {
            let on = get(m, "switch-on").ok_or_else(|| invalid(path, "type mapping needs `switch-on`"))?;
            let on = expr_of(on, &format!("{}.switch-on", path))?;
            let cases_v = get(m, "cases")
                .and_then(Value::as_mapping)
                .ok_or_else(|| invalid(path, "switch needs a `cases` mapping"))?;
            let mut cases = Vec::new();
            let mut default = None;
            for (k, t) in cases_v {
                let cpath = format!("{}.cases", path);
                let tname = t.as_str().ok_or_else(|| invalid(&cpath, "case target must be a type name"))?;
                if k.as_str() == Some("_") {
                    default = Some(Box::new(parse_type_name(tname)));
                } else {
                    cases.push((expr_of(k, &cpath)?, parse_type_name(tname)));
                }
            }
            Ok(ValueKind::Switch(SwitchSpec { on, cases, default }))
        }
        _ => Err(invalid(path, "`type` must be a name or a switch mapping")),
    }
}

fn build_contents(v: &Value, path: &str) -> Result<Vec<u8>, GrammarError> {
    let mut out = Vec::new();
    let items: Vec<&Value> = match v {
        Value::Sequence(s) => s.iter().collect(),
        other => vec![other],
    };
    for item in items {
        match item {
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Number(n) => {
                let b = n
                    .as_u64()
                    .and_then(|x| u8::try_from(x).ok())
                    .ok_or_else(|| invalid(path, "contents bytes must be 0..=255"))?;
                out.push(b);
            }
            _ => return Err(invalid(path, "contents must be strings or bytes")),
        }
    }
    Ok(out)
}

fn build_validation(v: &Value, path: &str) -> Result<Validation, GrammarError> {
    let m = match v {
        Value::Mapping(m) => m,
        scalar => return Ok(Validation { rule: ValidRule::Eq(expr_of(scalar, path)?), informational: false }),
    };
    let informational = match get(m, "level").and_then(Value::as_str) {
        None | Some("error") => false,
        Some("info") => true,
        Some(other) => return Err(invalid(path, format!("unknown validation level `{}`", other))),
    };
    let rule = if let Some(eq) = get(m, "eq") {
        ValidRule::Eq(expr_of(eq, &format!("{}.eq", path))?)
    } else if let Some(list) = get(m, "any-of") {
        let list = list.as_sequence().ok_or_else(|| invalid(path, "`any-of` must be a list"))?;
        ValidRule::AnyOf(list.iter().map(|x| expr_of(x, path)).collect::<Result<_, _>>()?)
    } else if let Some(e) = get(m, "expr") {
        ValidRule::Expr(expr_of(e, &format!("{}.expr", path))?)
    } else {
        let min = get(m, "min").map(|x| expr_of(x, path)).transpose()?;
        let max = get(m, "max").map(|x| expr_of(x, path)).transpose()?;
        if min.is_none() && max.is_none() {
            return Err(invalid(path, "validation needs one of eq, min, max, any-of, expr"));
        }
        ValidRule::Range { min, max }
    };
    Ok(Validation { rule, informational })
}

fn build_process(v: &Value, path: &str) -> Result<ProcessSpec, GrammarError> {
    match expr_of(v, path)? {
        Expr::Name(name) => Ok(ProcessSpec { name, args: Vec::new() }),
        Expr::Call(f, args) => match *f {
            Expr::Name(name) => Ok(ProcessSpec { name, args }),
            _ => Err(invalid(path, "process must be `name` or `name(args)`")),
        },
        _ => Err(invalid(path, "process must be `name` or `name(args)`")),
    }
}

fn build_field(id: &str, m: &Mapping, path: &str) -> Result<FieldSpec, GrammarError> {
    let kind = if let Some(c) = get(m, "contents") {
        ValueKind::Contents(build_contents(c, &format!("{}.contents", path))?)
    } else {
        match get(m, "type") {
            Some(t) => build_kind(t, &format!("{}.type", path))?,
            None => ValueKind::Bytes,
        }
    };
    let kind = match kind {
        ValueKind::Str { zero_terminated, .. } => ValueKind::Str {
            encoding: get(m, "encoding").and_then(Value::as_str).map(str::to_string),
            zero_terminated,
        },
        k => k,
    };

    let size = if let Some(s) = get(m, "size") {
        SizeSpec::Expr(expr_of(s, &format!("{}.size", path))?)
    } else if flag(m, "size-eos", false, path)? {
        SizeSpec::Eos
    } else if let Some(t) = get(m, "terminator") {
        let term = t
            .as_u64()
            .and_then(|x| u8::try_from(x).ok())
            .ok_or_else(|| invalid(&format!("{}.terminator", path), "terminator must be a byte"))?;
        SizeSpec::Terminator {
            term,
            include: flag(m, "include", false, path)?,
            consume: flag(m, "consume", true, path)?,
            eos_error: flag(m, "eos-error", true, path)?,
        }
    } else if matches!(kind, ValueKind::Str { zero_terminated: true, .. }) {
        SizeSpec::Terminator { term: 0, include: false, consume: true, eos_error: flag(m, "eos-error", true, path)? }
    } else {
        SizeSpec::Implicit
    };

    let repeat = match get(m, "repeat").and_then(Value::as_str) {
        None => Repeat::Once,
        Some("expr") => Repeat::Expr(expr_of(
            get(m, "repeat-expr").ok_or_else(|| invalid(path, "`repeat: expr` needs `repeat-expr`"))?,
            &format!("{}.repeat-expr", path),
        )?),
        Some("eos") => Repeat::Eos,
        Some("until") => Repeat::Until(expr_of(
            get(m, "repeat-until").ok_or_else(|| invalid(path, "`repeat: until` needs `repeat-until`"))?,
            &format!("{}.repeat-until", path),
        )?),
        Some(other) => return Err(invalid(path, format!("unknown repeat mode `{}`", other))),
    };

    Ok(FieldSpec {
        id: id.to_string(),
        kind,
        size,
        repeat,
        cond: get(m, "if").map(|c| expr_of(c, &format!("{}.if", path))).transpose()?,
        enum_ref: get(m, "enum").and_then(Value::as_str).map(str::to_string),
        valid: get(m, "valid").map(|v| build_validation(v, &format!("{}.valid", path))).transpose()?,
        process: get(m, "process").map(|p| build_process(p, &format!("{}.process", path))).transpose()?,
        padding: get(m, "padding").map(|p| expr_of(p, &format!("{}.padding", path))).transpose()?,
    })
}

fn build_instance(id: &str, m: &Mapping, path: &str) -> Result<InstanceSpec, GrammarError> {
    let cond = get(m, "if").map(|c| expr_of(c, &format!("{}.if", path))).transpose()?;
    let kind = match get(m, "value") {
        Some(v) => InstanceKind::Value(expr_of(v, &format!("{}.value", path))?),
        None => InstanceKind::Parse {
            pos: get(m, "pos").map(|p| expr_of(p, &format!("{}.pos", path))).transpose()?,
            io: get(m, "io").map(|p| expr_of(p, &format!("{}.io", path))).transpose()?,
            field: build_field(id, m, path)?,
        },
    };
    Ok(InstanceSpec { cond, kind })
}
