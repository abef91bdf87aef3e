//! Static checks over a loaded grammar, run without any input bytes.
//!
//! ## Rules
//!
//! - **Unresolved type / enum**: every type and enum name must resolve lexically from the
//!   type that declares the field.
//! - **Forward reference**: a `seq` field's size, count, condition or switch expression must
//!   not name the field itself or a later field of the same type.
//! - **Duplicate name**: an instance must not reuse a `seq` field id.
//! - **Missing endianness**: multi-byte numbers need `meta.endian` in scope or a `le`/`be` type.
//! - **Unbounded repeat**: a type with `repeat: eos` used without a size, so the loop runs to
//!   the end of the enclosing stream.

use crate::ast::{FieldSpec, Grammar, InstanceKind, Repeat, SizeSpec, TypeId, ValueKind};
use crate::expr::Expr;
use std::fmt;

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Identifies which rule produced the finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckRule {
    UnresolvedType,
    UnresolvedEnum,
    ForwardReference,
    DuplicateName,
    MissingEndian,
    UnboundedRepeat,
}

/// A single finding, located by `type::path.field`.
#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub rule: CheckRule,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}: {} [{:?}]", level, self.path, self.message, self.rule)
    }
}

/// Run all checks. Findings are in type declaration order.
pub fn check_grammar(grammar: &Grammar) -> Vec<Finding> {
    let mut out = Vec::new();
    for (i, def) in grammar.types.iter().enumerate() {
        let tid = TypeId(i);
        for (idx, field) in def.seq.iter().enumerate() {
            let path = format!("{}.{}", def.path, field.id);
            check_field(grammar, tid, field, &path, &mut out);
            forward_refs(grammar, tid, idx, field, &path, &mut out);
        }
        for (name, inst) in &def.instances {
            let path = format!("{}.{}", def.path, name);
            if def.field_index(name).is_some() {
                out.push(Finding {
                    severity: Severity::Error,
                    rule: CheckRule::DuplicateName,
                    path: path.clone(),
                    message: format!("instance `{}` shadows a seq field", name),
                });
            }
            let mut exprs: Vec<&Expr> = inst.cond.iter().collect();
            match &inst.kind {
                InstanceKind::Value(e) => exprs.push(e),
                InstanceKind::Parse { pos, io, field } => {
                    exprs.extend(pos.iter().chain(io.iter()));
                    check_field(grammar, tid, field, &path, &mut out);
                }
            }
            for e in exprs {
                enum_literals(grammar, tid, e, &path, &mut out);
            }
        }
    }
    out
}

fn field_kinds(kind: &ValueKind) -> Vec<&ValueKind> {
    match kind {
        ValueKind::Switch(s) => s.cases.iter().map(|(_, k)| k).chain(s.default.as_deref()).collect(),
        k => vec![k],
    }
}

fn field_exprs(field: &FieldSpec) -> Vec<&Expr> {
    let mut v: Vec<&Expr> = Vec::new();
    v.extend(field.cond.iter());
    if let SizeSpec::Expr(e) = &field.size {
        v.push(e);
    }
    match &field.repeat {
        Repeat::Expr(e) | Repeat::Until(e) => v.push(e),
        _ => {}
    }
    if let ValueKind::Switch(s) = &field.kind {
        v.push(&s.on);
        v.extend(s.cases.iter().map(|(k, _)| k));
    }
    v
}

fn check_field(grammar: &Grammar, tid: TypeId, field: &FieldSpec, path: &str, out: &mut Vec<Finding>) {
    for kind in field_kinds(&field.kind) {
        match kind {
            ValueKind::User(name) => match grammar.resolve_type(tid, name) {
                Err(_) => out.push(Finding {
                    severity: Severity::Error,
                    rule: CheckRule::UnresolvedType,
                    path: path.to_string(),
                    message: format!("type `{}` is not visible from `{}`", name, grammar.type_def(tid).path),
                }),
                Ok(target) => {
                    let eos = grammar.type_def(target).seq.iter().any(|f| matches!(f.repeat, Repeat::Eos));
                    if eos && matches!(field.size, SizeSpec::Implicit) {
                        out.push(Finding {
                            severity: Severity::Warning,
                            rule: CheckRule::UnboundedRepeat,
                            path: path.to_string(),
                            message: format!("`{}` repeats to end of stream but is used without a size", name),
                        });
                    }
                }
            },
            ValueKind::Int { width, endian: None, .. } | ValueKind::Float { width, endian: None }
                if *width > 1 && grammar.endian_for(tid).is_none() =>
            {
                out.push(Finding {
                    severity: Severity::Error,
                    rule: CheckRule::MissingEndian,
                    path: path.to_string(),
                    message: format!("{}-byte number with no endianness in scope", width),
                });
            }
            _ => {}
        }
    }
    if let Some(name) = &field.enum_ref {
        if grammar.resolve_enum(tid, name).is_err() {
            out.push(Finding {
                severity: Severity::Error,
                rule: CheckRule::UnresolvedEnum,
                path: path.to_string(),
                message: format!("enum `{}` is not visible from `{}`", name, grammar.type_def(tid).path),
            });
        }
    }
    for e in field_exprs(field) {
        enum_literals(grammar, tid, e, path, out);
    }
}

fn forward_refs(grammar: &Grammar, tid: TypeId, idx: usize, field: &FieldSpec, path: &str, out: &mut Vec<Finding>) {
    let def = grammar.type_def(tid);
    let mut names = Vec::new();
    for e in field_exprs(field) {
        e.free_names(&mut names);
    }
    names.sort();
    names.dedup();
    for name in names {
        if let Some(j) = def.field_index(&name) {
            if j >= idx {
                out.push(Finding {
                    severity: Severity::Error,
                    rule: CheckRule::ForwardReference,
                    path: path.to_string(),
                    message: format!("`{}` is not parsed yet when `{}` is read", name, field.id),
                });
            }
        }
    }
}

fn enum_literals(grammar: &Grammar, tid: TypeId, e: &Expr, path: &str, out: &mut Vec<Finding>) {
    let mut stack = vec![e];
    while let Some(e) = stack.pop() {
        match e {
            Expr::EnumRef { path: enum_path, label } => {
                let name = enum_path.join("::");
                let known = grammar
                    .resolve_enum(tid, &name)
                    .map(|id| grammar.enum_def(id).by_label.contains_key(label));
                let message = match known {
                    Ok(true) => continue,
                    Ok(false) => format!("enum `{}` has no member `{}`", name, label),
                    Err(_) => format!("enum `{}` is not visible from `{}`", name, grammar.type_def(tid).path),
                };
                out.push(Finding {
                    severity: Severity::Error,
                    rule: CheckRule::UnresolvedEnum,
                    path: path.to_string(),
                    message,
                });
            }
            Expr::Array(items) => stack.extend(items),
            Expr::Member(a, _) | Expr::Unary(_, a) => stack.push(a),
            Expr::Index(a, b) | Expr::Binary(_, a, b) => stack.extend([a.as_ref(), b.as_ref()]),
            Expr::Call(f, args) => {
                stack.push(f);
                stack.extend(args);
            }
            Expr::Ternary(c, a, b) => stack.extend([c.as_ref(), a.as_ref(), b.as_ref()]),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;

    fn rules(src: &str) -> Vec<CheckRule> {
        check_grammar(&loader::parse(src).unwrap()).into_iter().map(|f| f.rule).collect()
    }

    #[test]
    fn clean_grammar_has_no_findings() {
        let src = r#"
meta: {id: hdr, endian: le}
seq:
  - {id: len, type: u2}
  - {id: body, size: len, type: rec}
types:
  rec:
    seq:
      - {id: kind, type: u1, enum: kind}
      - {id: rest, type: u1, repeat: eos}
enums:
  kind: {1: one, 2: two}
"#;
        assert!(rules(src).is_empty());
    }

    #[test]
    fn unresolved_type_and_enum() {
        let src = r#"
meta: {id: t, endian: be}
seq:
  - {id: a, type: missing}
  - {id: b, type: u1, enum: nope}
"#;
        assert_eq!(rules(src), vec![CheckRule::UnresolvedType, CheckRule::UnresolvedEnum]);
    }

    #[test]
    fn forward_reference_in_size() {
        let src = r#"
meta: {id: t}
seq:
  - {id: body, size: len}
  - {id: len, type: u1}
"#;
        assert_eq!(rules(src), vec![CheckRule::ForwardReference]);
    }

    #[test]
    fn missing_endian_and_unbounded_repeat() {
        let src = r#"
meta: {id: t}
seq:
  - {id: n, type: u4}
  - {id: items, type: list}
types:
  list:
    seq:
      - {id: x, type: u1, repeat: eos}
"#;
        assert_eq!(rules(src), vec![CheckRule::MissingEndian, CheckRule::UnboundedRepeat]);
    }

    #[test]
    fn unknown_enum_member_in_expression() {
        let src = r#"
meta: {id: t}
seq:
  - {id: k, type: u1, enum: kind}
  - {id: extra, type: u1, if: k == kind::three}
enums:
  kind: {1: one}
"#;
        assert_eq!(rules(src), vec![CheckRule::UnresolvedEnum]);
    }
}
