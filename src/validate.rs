//! Validator: magic-byte checks and `valid` constraints on decoded values.

use crate::ast::{ValidRule, Validation};
use crate::diag::ErrorKind;
use crate::expr::Expr;
use crate::stream::hex;
use crate::value::Value;
use std::cmp::Ordering;

/// Fixed `contents` must match byte for byte.
pub fn check_contents(expected: &[u8], actual: &[u8]) -> Result<(), ErrorKind> {
    if expected == actual {
        Ok(())
    } else {
        Err(ErrorKind::ContentMismatch { expected: hex(expected), actual: hex(actual) })
    }
}

fn show(v: &Value) -> String {
    match v {
        Value::Bytes(b) => format!("[{}]", hex(b)),
        other => format!("{:?}", other),
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a.as_int(), b.as_int()) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
    }
}

/// Check `value` against `valid`. `eval` evaluates rule operands; for [`ValidRule::Expr`] it
/// is called with `_` bound to the value.
pub fn check(
    valid: &Validation,
    value: &Value,
    mut eval: impl FnMut(&Expr) -> Result<Value, ErrorKind>,
) -> Result<(), ErrorKind> {
    let fail = |expected: String| ErrorKind::ValidationFailed { expected, actual: show(value) };
    match &valid.rule {
        ValidRule::Eq(e) => {
            let want = eval(e)?;
            if *value != want {
                return Err(fail(show(&want)));
            }
        }
        ValidRule::Range { min, max } => {
            if let Some(e) = min {
                let lo = eval(e)?;
                if !matches!(order(value, &lo), Some(Ordering::Greater | Ordering::Equal)) {
                    return Err(fail(format!(">= {}", show(&lo))));
                }
            }
            if let Some(e) = max {
                let hi = eval(e)?;
                if !matches!(order(value, &hi), Some(Ordering::Less | Ordering::Equal)) {
                    return Err(fail(format!("<= {}", show(&hi))));
                }
            }
        }
        ValidRule::AnyOf(options) => {
            let mut seen = Vec::with_capacity(options.len());
            for e in options {
                let v = eval(e)?;
                if *value == v {
                    return Ok(());
                }
                seen.push(show(&v));
            }
            return Err(fail(format!("one of [{}]", seen.join(", "))));
        }
        ValidRule::Expr(e) => match eval(e)? {
            Value::Bool(true) => {}
            Value::Bool(false) => return Err(fail("a value satisfying the constraint".into())),
            other => {
                return Err(ErrorKind::Expression(format!(
                    "validation expression yielded {}, not a boolean",
                    other.type_name()
                )))
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(e: &Expr) -> Result<Value, ErrorKind> {
        match e {
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            _ => Err(ErrorKind::Expression("unsupported".into())),
        }
    }

    fn rule(rule: ValidRule) -> Validation {
        Validation { rule, informational: false }
    }

    #[test]
    fn contents_mismatch_reports_hex() {
        assert!(check_contents(b"QCDT", b"QCDT").is_ok());
        match check_contents(b"QCDT", b"QCDX") {
            Err(ErrorKind::ContentMismatch { expected, actual }) => {
                assert_eq!(expected, "51 43 44 54");
                assert_eq!(actual, "51 43 44 58");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn eq_and_range() {
        let v = Value::U32(3);
        assert!(check(&rule(ValidRule::Eq(Expr::Int(3))), &v, lit).is_ok());
        assert!(matches!(
            check(&rule(ValidRule::Eq(Expr::Int(2))), &v, lit),
            Err(ErrorKind::ValidationFailed { .. })
        ));
        let range = rule(ValidRule::Range { min: Some(Expr::Int(1)), max: Some(Expr::Int(3)) });
        assert!(check(&range, &v, lit).is_ok());
        assert!(check(&range, &Value::U32(4), lit).is_err());
        assert!(check(&range, &Value::U32(0), lit).is_err());
    }

    #[test]
    fn any_of_lists_candidates() {
        let r = rule(ValidRule::AnyOf(vec![Expr::Int(1), Expr::Int(2)]));
        assert!(check(&r, &Value::U8(2), lit).is_ok());
        match check(&r, &Value::U8(5), lit) {
            Err(ErrorKind::ValidationFailed { expected, actual }) => {
                assert_eq!(expected, "one of [1, 2]");
                assert_eq!(actual, "5");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn predicate_must_be_boolean() {
        assert!(check(&rule(ValidRule::Expr(Expr::Bool(true))), &Value::U8(0), lit).is_ok());
        assert!(matches!(
            check(&rule(ValidRule::Expr(Expr::Int(1))), &Value::U8(0), lit),
            Err(ErrorKind::Expression(_))
        ));
    }
}
