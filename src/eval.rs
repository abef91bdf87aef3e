//! Expression evaluation against a partially built node.
//!
//! Unqualified names resolve to the node's already-parsed fields, then to its instances
//! (computed on demand). `_parent`, `_root`, `_io`, `_index` and `_` are special. Integer
//! arithmetic is done in `i128`; `/` and `%` are floored so `(-len) % 4` is the padding
//! needed to reach a multiple of four.

use crate::diag::ErrorKind;
use crate::expr::{BinOp, Expr, UnOp};
use crate::node::ParsedNode;
use crate::stream::{Bytes, Stream};
use crate::value::Value;
use std::cmp::Ordering;
use std::rc::Rc;

/// Evaluation environment for one expression.
pub(crate) struct Scope<'a> {
    pub node: &'a Rc<ParsedNode>,
    /// Live stream of the field being read (`_io`).
    pub io: &'a Stream,
    /// Index of the repetition in progress (`_index`).
    pub index: Option<usize>,
    /// Value just decoded (`_`), for `repeat-until` and validations.
    pub current: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn new(node: &'a Rc<ParsedNode>, io: &'a Stream) -> Self {
        Scope { node, io, index: None, current: None }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_current(mut self, current: &'a Value) -> Self {
        self.current = Some(current);
        self
    }
}

fn err<T>(msg: impl Into<String>) -> Result<T, ErrorKind> {
    Err(ErrorKind::Expression(msg.into()))
}

pub(crate) fn eval(expr: &Expr, scope: &Scope) -> Result<Value, ErrorKind> {
    match expr {
        Expr::Int(v) => Ok(Value::Int(*v)),
        Expr::Float(v) => Ok(Value::Double(*v)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Array(items) => {
            let values = items.iter().map(|e| eval(e, scope)).collect::<Result<Vec<_>, _>>()?;
            let bytes: Option<Vec<u8>> = values
                .iter()
                .map(|v| v.as_int().and_then(|i| u8::try_from(i).ok()))
                .collect();
            Ok(match bytes {
                Some(b) => Value::Bytes(Bytes::from_vec(b)),
                None => Value::List(values),
            })
        }
        Expr::Name(name) => name_value(name, scope),
        Expr::EnumRef { path, label } => enum_literal(scope.node, &path.join("::"), label),
        Expr::Member(obj, member) => {
            let target = eval(obj, scope)?;
            member_value(&target, member)
        }
        Expr::Index(obj, idx) => {
            let target = eval(obj, scope)?;
            let i = eval_int(idx, scope)?;
            index_value(&target, i)
        }
        Expr::Call(f, args) => call(f, args, scope),
        Expr::Unary(op, e) => {
            let v = eval(e, scope)?;
            unary(*op, &v)
        }
        Expr::Binary(BinOp::And, a, b) => {
            Ok(Value::Bool(eval_bool(a, scope)? && eval_bool(b, scope)?))
        }
        Expr::Binary(BinOp::Or, a, b) => {
            Ok(Value::Bool(eval_bool(a, scope)? || eval_bool(b, scope)?))
        }
        Expr::Binary(op, a, b) => {
            let l = eval(a, scope)?;
            let r = eval(b, scope)?;
            binary(*op, &l, &r)
        }
        Expr::Ternary(c, a, b) => {
            if eval_bool(c, scope)? {
                eval(a, scope)
            } else {
                eval(b, scope)
            }
        }
    }
}

pub(crate) fn eval_bool(expr: &Expr, scope: &Scope) -> Result<bool, ErrorKind> {
    match eval(expr, scope)? {
        Value::Bool(b) => Ok(b),
        other => err(format!("expected a boolean, got {}", other.type_name())),
    }
}

pub(crate) fn eval_int(expr: &Expr, scope: &Scope) -> Result<i128, ErrorKind> {
    let v = eval(expr, scope)?;
    v.as_int().ok_or_else(|| ErrorKind::Expression(format!("expected an integer, got {}", v.type_name())))
}

/// Non-negative integer usable as a size, count or offset.
pub(crate) fn eval_usize(expr: &Expr, scope: &Scope) -> Result<usize, ErrorKind> {
    let v = eval_int(expr, scope)?;
    usize::try_from(v).map_err(|_| ErrorKind::Expression(format!("{} is not a valid size or offset", v)))
}

fn name_value(name: &str, scope: &Scope) -> Result<Value, ErrorKind> {
    match name {
        "_io" => Ok(Value::Io(scope.io.clone())),
        "_index" => match scope.index {
            Some(i) => Ok(Value::Int(i as i128)),
            None => err("`_index` used outside a repetition"),
        },
        "_" => match scope.current {
            Some(v) => Ok(v.clone()),
            None => err("`_` used outside repeat-until or a validation"),
        },
        "_root" => scope.node.root().map(Value::Node).ok_or_else(|| ErrorKind::Expression("root dropped".into())),
        "_parent" => parent_of(scope.node),
        _ => lookup(scope.node, name),
    }
}

fn parent_of(node: &ParsedNode) -> Result<Value, ErrorKind> {
    node.parent()
        .map(Value::Node)
        .ok_or_else(|| ErrorKind::Expression(format!("`{}` has no parent", node.path())))
}

/// Field or instance `name` of `node`.
pub(crate) fn lookup(node: &Rc<ParsedNode>, name: &str) -> Result<Value, ErrorKind> {
    if let Some(v) = node.field(name) {
        return Ok(v);
    }
    let def = node.type_def();
    if def.instance(name).is_some() {
        return match node.instance(name) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => err(format!("instance `{}` is absent (its condition is false)", name)),
            Err(e) => Err(e.kind),
        };
    }
    if def.field_index(name).is_some() {
        return err(format!(
            "field `{}` of `{}` is not available (forward reference, absent, or failed)",
            name, def.path
        ));
    }
    err(format!("unknown name `{}` in `{}`", name, def.path))
}

fn enum_literal(node: &ParsedNode, enum_name: &str, label: &str) -> Result<Value, ErrorKind> {
    let grammar = &node.session.grammar;
    let id = grammar.resolve_enum(node.type_id, enum_name)?;
    let def = grammar.enum_def(id);
    match def.by_label.get(label) {
        Some(v) => Ok(Value::Enum { enum_name: def.name.clone(), value: *v, label: Some(label.to_string()) }),
        None => err(format!("enum `{}` has no member `{}`", def.name, label)),
    }
}

fn member_value(target: &Value, member: &str) -> Result<Value, ErrorKind> {
    match (target, member) {
        (Value::Node(n), "_io") => Ok(Value::Io(n.io())),
        (Value::Node(n), "_parent") => parent_of(n),
        (Value::Node(n), "_root") => n.root().map(Value::Node).ok_or_else(|| ErrorKind::Expression("root dropped".into())),
        (Value::Node(n), name) => lookup(n, name),
        (Value::Io(s), "size") => Ok(Value::Int(s.size() as i128)),
        (Value::Io(s), "pos") => Ok(Value::Int(s.pos() as i128)),
        (Value::Io(s), "eof") => Ok(Value::Bool(s.is_eof())),
        (Value::Bytes(b), "size" | "length") => Ok(Value::Int(b.len() as i128)),
        (Value::Bytes(b), "first") => index_value(&Value::Bytes(b.clone()), 0),
        (Value::Bytes(b), "last") => index_value(&Value::Bytes(b.clone()), b.len() as i128 - 1),
        (Value::Str(s), "length") => Ok(Value::Int(s.chars().count() as i128)),
        (Value::Str(s), "size") => Ok(Value::Int(s.len() as i128)),
        (Value::Str(s), "to_i") => s
            .trim()
            .parse::<i128>()
            .map(Value::Int)
            .or_else(|_| err(format!("`{}` is not a decimal integer", s))),
        (Value::List(items), "size" | "length") => Ok(Value::Int(items.len() as i128)),
        (Value::List(items), "first") => items.first().cloned().ok_or_else(|| ErrorKind::Expression("`first` of an empty list".into())),
        (Value::List(items), "last") => items.last().cloned().ok_or_else(|| ErrorKind::Expression("`last` of an empty list".into())),
        (Value::Enum { value, .. }, "to_i") => Ok(Value::Int(*value)),
        (Value::Bool(b), "to_i") => Ok(Value::Int(*b as i128)),
        (v, "to_i") if v.as_int().is_some() => Ok(Value::Int(v.as_int().unwrap_or_default())),
        (v, "to_s") if v.as_int().is_some() => Ok(Value::Str(v.as_int().unwrap_or_default().to_string())),
        (v, m) => err(format!("{} has no member `{}`", v.type_name(), m)),
    }
}

fn index_value(target: &Value, i: i128) -> Result<Value, ErrorKind> {
    let oob = |len: usize| ErrorKind::Expression(format!("index {} out of range for length {}", i, len));
    match target {
        Value::List(items) => usize::try_from(i)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| oob(items.len())),
        Value::Bytes(b) => usize::try_from(i)
            .ok()
            .and_then(|i| b.get(i))
            .map(|x| Value::U8(*x))
            .ok_or_else(|| oob(b.len())),
        other => err(format!("cannot index into {}", other.type_name())),
    }
}

fn call(f: &Expr, args: &[Expr], scope: &Scope) -> Result<Value, ErrorKind> {
    let Expr::Member(obj, method) = f else {
        return err("only method calls are supported");
    };
    let target = eval(obj, scope)?;
    match (&target, method.as_str(), args) {
        (Value::Bytes(b), "to_s", [enc]) => {
            let enc = eval(enc, scope)?;
            let enc = enc.as_str().ok_or_else(|| ErrorKind::Expression("encoding must be a string".into()))?;
            crate::interp::decode_str(b, enc).map(|(s, _)| Value::Str(s))
        }
        (Value::Str(s), "substring", [from, to]) => {
            let from = eval_usize(from, scope)?;
            let to = eval_usize(to, scope)?;
            let sub: String = s.chars().skip(from).take(to.saturating_sub(from)).collect();
            Ok(Value::Str(sub))
        }
        _ => err(format!("{} has no method `{}` taking {} argument(s)", target.type_name(), method, args.len())),
    }
}

fn unary(op: UnOp, v: &Value) -> Result<Value, ErrorKind> {
    match (op, v) {
        (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnOp::Neg, Value::Float(_) | Value::Double(_)) => Ok(Value::Double(-v.as_f64().unwrap_or_default())),
        (UnOp::Neg, v) if v.as_int().is_some() => v
            .as_int()
            .and_then(i128::checked_neg)
            .map(Value::Int)
            .ok_or_else(|| ErrorKind::Expression("integer overflow".into())),
        (UnOp::BitNot, v) if v.as_int().is_some() => Ok(Value::Int(!v.as_int().unwrap_or_default())),
        (op, v) => err(format!("operator {:?} does not apply to {}", op, v.type_name())),
    }
}

/// Floored division (rounds toward negative infinity).
pub(crate) fn floor_div(a: i128, b: i128) -> Option<i128> {
    let q = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

/// Floored modulo: the result takes the sign of the divisor.
pub(crate) fn floor_mod(a: i128, b: i128) -> Option<i128> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn is_float(v: &Value) -> bool {
    matches!(v, Value::Float(_) | Value::Double(_))
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, ErrorKind> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(l == r)),
        BinOp::Ne => return Ok(Value::Bool(l != r)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(l, r)?;
            return Ok(Value::Bool(match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }));
        }
        _ => {}
    }
    if let (BinOp::Add, Value::Str(a), Value::Str(b)) = (op, l, r) {
        return Ok(Value::Str(format!("{}{}", a, b)));
    }
    if is_float(l) || is_float(r) {
        let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
            return err(format!("cannot apply {:?} to {} and {}", op, l.type_name(), r.type_name()));
        };
        return match op {
            BinOp::Add => Ok(Value::Double(a + b)),
            BinOp::Sub => Ok(Value::Double(a - b)),
            BinOp::Mul => Ok(Value::Double(a * b)),
            BinOp::Div => Ok(Value::Double(a / b)),
            BinOp::Rem => Ok(Value::Double(a - b * (a / b).floor())),
            _ => err(format!("operator {:?} does not apply to floats", op)),
        };
    }
    let (Some(a), Some(b)) = (l.as_int(), r.as_int()) else {
        return err(format!("cannot apply {:?} to {} and {}", op, l.type_name(), r.type_name()));
    };
    if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
        return err("division by zero");
    }
    let shift = || u32::try_from(b).ok().filter(|s| *s < 128);
    let out = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => floor_div(a, b),
        BinOp::Rem => floor_mod(a, b),
        BinOp::BitAnd => Some(a & b),
        BinOp::BitOr => Some(a | b),
        BinOp::BitXor => Some(a ^ b),
        BinOp::Shl => shift().and_then(|s| a.checked_shl(s)),
        BinOp::Shr => shift().map(|s| a >> s),
        _ => None,
    };
    out.map(Value::Int).ok_or_else(|| ErrorKind::Expression(format!("integer overflow in {:?}", op)))
}

fn compare(l: &Value, r: &Value) -> Result<Ordering, ErrorKind> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Ok(a.as_slice().cmp(b.as_slice())),
        _ if is_float(l) || is_float(r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| ErrorKind::Expression("comparison with NaN".into())),
            _ => err(format!("cannot compare {} with {}", l.type_name(), r.type_name())),
        },
        _ => match (l.as_int(), r.as_int()) {
            (Some(a), Some(b)) => Ok(a.cmp(&b)),
            _ => err(format!("cannot compare {} with {}", l.type_name(), r.type_name())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floored_division_and_modulo() {
        assert_eq!(floor_mod(-1, 4), Some(3));
        assert_eq!(floor_mod(-4, 4), Some(0));
        assert_eq!(floor_mod(-6, 4), Some(2));
        assert_eq!(floor_mod(7, 4), Some(3));
        assert_eq!(floor_mod(7, -4), Some(-1));
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(floor_div(i128::MIN, -1), None);
    }

    #[test]
    fn padding_law_over_small_lengths() {
        let expected = [0, 3, 2, 1, 0, 3, 2, 1];
        for (len, want) in expected.iter().enumerate() {
            let v = binary(BinOp::Rem, &Value::Int(-(len as i128)), &Value::Int(4)).unwrap();
            assert_eq!(v.as_int(), Some(*want), "len {}", len);
        }
    }

    #[test]
    fn arithmetic_mixes_widths() {
        let v = binary(BinOp::Add, &Value::U8(200), &Value::U32(100)).unwrap();
        assert_eq!(v.as_int(), Some(300));
        let v = binary(BinOp::Mul, &Value::I16(-3), &Value::U64(5)).unwrap();
        assert_eq!(v.as_int(), Some(-15));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(matches!(binary(BinOp::Div, &Value::Int(1), &Value::Int(0)), Err(ErrorKind::Expression(_))));
        assert!(matches!(binary(BinOp::Rem, &Value::Int(1), &Value::Int(0)), Err(ErrorKind::Expression(_))));
    }

    #[test]
    fn overflow_is_an_error() {
        assert!(binary(BinOp::Mul, &Value::Int(i128::MAX), &Value::Int(2)).is_err());
        assert!(binary(BinOp::Shl, &Value::Int(1), &Value::Int(200)).is_err());
    }

    #[test]
    fn comparisons() {
        assert_eq!(binary(BinOp::Lt, &Value::U8(1), &Value::I64(2)).unwrap(), Value::Bool(true));
        assert_eq!(binary(BinOp::Ge, &Value::Double(2.5), &Value::U8(2)).unwrap(), Value::Bool(true));
        assert_eq!(
            binary(BinOp::Lt, &Value::Str("abc".into()), &Value::Str("abd".into())).unwrap(),
            Value::Bool(true)
        );
        assert!(compare(&Value::Bool(true), &Value::U8(1)).is_err());
    }

    #[test]
    fn string_concatenation() {
        let v = binary(BinOp::Add, &Value::Str("ab".into()), &Value::Str("cd".into())).unwrap();
        assert_eq!(v, Value::Str("abcd".into()));
    }

    #[test]
    fn members_of_bytes_and_lists() {
        let b = Value::Bytes(Bytes::from_vec(vec![1, 2, 3]));
        assert_eq!(member_value(&b, "size").unwrap().as_int(), Some(3));
        assert_eq!(member_value(&b, "last").unwrap().as_int(), Some(3));
        let l = Value::List(vec![Value::U8(9), Value::U8(8)]);
        assert_eq!(member_value(&l, "first").unwrap().as_int(), Some(9));
        assert!(member_value(&Value::List(vec![]), "last").is_err());
        assert!(index_value(&l, 5).is_err());
    }
}
