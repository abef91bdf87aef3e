//! Expression AST and parser (PEST grammar in `expr.pest`, precedence via Pratt parsing).

use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser as PestParser;

#[derive(PestParser)]
#[grammar = "expr.pest"]
struct ExprParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    BitNot,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
    Array(Vec<Expr>),
    Name(String),
    /// `enum_name::label`, possibly qualified with outer type names.
    EnumRef { path: Vec<String>, label: String },
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse expression source.
    pub fn parse(source: &str) -> Result<Expr, String> {
        let mut pairs = ExprParser::parse(Rule::root, source)
            .map_err(|e| format!("invalid expression `{}`: {}", source, e))?;
        let root = pairs.next().ok_or("empty expression")?;
        let ternary = root
            .into_inner()
            .find(|p| p.as_rule() == Rule::ternary)
            .ok_or("empty expression")?;
        build_ternary(ternary)
    }

    /// Names referenced without qualification (for static forward-reference checks).
    pub fn free_names(&self, out: &mut Vec<String>) {
        match self {
            Expr::Name(n) => out.push(n.clone()),
            Expr::Array(items) => items.iter().for_each(|e| e.free_names(out)),
            Expr::Member(e, _) => e.free_names(out),
            Expr::Index(a, b) => {
                a.free_names(out);
                b.free_names(out);
            }
            Expr::Call(f, args) => {
                f.free_names(out);
                args.iter().for_each(|e| e.free_names(out));
            }
            Expr::Unary(_, e) => e.free_names(out),
            Expr::Binary(_, a, b) => {
                a.free_names(out);
                b.free_names(out);
            }
            Expr::Ternary(c, a, b) => {
                c.free_names(out);
                a.free_names(out);
                b.free_names(out);
            }
            _ => {}
        }
    }
}

fn pratt() -> PrattParser<Rule> {
    PrattParser::new()
        .op(Op::infix(Rule::or_op, Assoc::Left))
        .op(Op::infix(Rule::and_op, Assoc::Left))
        .op(Op::infix(Rule::eq, Assoc::Left)
            | Op::infix(Rule::ne, Assoc::Left)
            | Op::infix(Rule::lt, Assoc::Left)
            | Op::infix(Rule::le, Assoc::Left)
            | Op::infix(Rule::gt, Assoc::Left)
            | Op::infix(Rule::ge, Assoc::Left))
        .op(Op::infix(Rule::bit_or, Assoc::Left))
        .op(Op::infix(Rule::bit_xor, Assoc::Left))
        .op(Op::infix(Rule::bit_and, Assoc::Left))
        .op(Op::infix(Rule::shl, Assoc::Left) | Op::infix(Rule::shr, Assoc::Left))
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
        .op(Op::infix(Rule::mul, Assoc::Left)
            | Op::infix(Rule::div, Assoc::Left)
            | Op::infix(Rule::rem, Assoc::Left))
}

fn build_ternary(pair: Pair<Rule>) -> Result<Expr, String> {
    let mut inner = pair.into_inner();
    let cond = build_binary(inner.next().ok_or("ternary: missing operand")?)?;
    match (inner.next(), inner.next()) {
        (Some(a), Some(b)) => Ok(Expr::Ternary(
            Box::new(cond),
            Box::new(build_ternary(a)?),
            Box::new(build_ternary(b)?),
        )),
        _ => Ok(cond),
    }
}

fn build_binary(pair: Pair<Rule>) -> Result<Expr, String> {
    pratt()
        .map_primary(build_unary)
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::or_op => BinOp::Or,
                Rule::and_op => BinOp::And,
                Rule::eq => BinOp::Eq,
                Rule::ne => BinOp::Ne,
                Rule::lt => BinOp::Lt,
                Rule::le => BinOp::Le,
                Rule::gt => BinOp::Gt,
                Rule::ge => BinOp::Ge,
                Rule::bit_or => BinOp::BitOr,
                Rule::bit_xor => BinOp::BitXor,
                Rule::bit_and => BinOp::BitAnd,
                Rule::shl => BinOp::Shl,
                Rule::shr => BinOp::Shr,
                Rule::add => BinOp::Add,
                Rule::sub => BinOp::Sub,
                Rule::mul => BinOp::Mul,
                Rule::div => BinOp::Div,
                Rule::rem => BinOp::Rem,
                r => return Err(format!("unexpected operator {:?}", r)),
            };
            Ok(Expr::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(pair.into_inner())
}

fn build_unary(pair: Pair<Rule>) -> Result<Expr, String> {
    let mut ops = Vec::new();
    let mut operand = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::prefix_op => ops.push(match p.as_str().trim() {
                "-" => UnOp::Neg,
                "~" => UnOp::BitNot,
                _ => UnOp::Not,
            }),
            Rule::postfix => operand = Some(build_postfix(p)?),
            _ => {}
        }
    }
    let mut e = operand.ok_or("unary: missing operand")?;
    for op in ops.into_iter().rev() {
        e = match (op, e) {
            (UnOp::Neg, Expr::Int(i)) => Expr::Int(-i),
            (UnOp::Neg, Expr::Float(f)) => Expr::Float(-f),
            (op, e) => Expr::Unary(op, Box::new(e)),
        };
    }
    Ok(e)
}

fn build_postfix(pair: Pair<Rule>) -> Result<Expr, String> {
    let mut inner = pair.into_inner();
    let mut e = build_primary(inner.next().ok_or("postfix: missing primary")?)?;
    for p in inner {
        e = match p.as_rule() {
            Rule::member => {
                let name = p.into_inner().next().ok_or("member: missing name")?;
                Expr::Member(Box::new(e), name.as_str().to_string())
            }
            Rule::index => {
                let idx = p.into_inner().next().ok_or("index: missing expression")?;
                Expr::Index(Box::new(e), Box::new(build_ternary(idx)?))
            }
            Rule::call => {
                let args = p.into_inner().map(build_ternary).collect::<Result<Vec<_>, _>>()?;
                Expr::Call(Box::new(e), args)
            }
            r => return Err(format!("unexpected postfix {:?}", r)),
        };
    }
    Ok(e)
}

fn build_primary(pair: Pair<Rule>) -> Result<Expr, String> {
    match pair.as_rule() {
        Rule::integer => parse_int(pair.as_str()).map(Expr::Int),
        Rule::float => pair
            .as_str()
            .parse::<f64>()
            .map(Expr::Float)
            .map_err(|e| format!("float literal: {}", e)),
        Rule::boolean => Ok(Expr::Bool(pair.as_str() == "true")),
        Rule::string => {
            let inner = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
            Ok(Expr::Str(unescape(inner)))
        }
        Rule::byte_array => pair
            .into_inner()
            .map(build_ternary)
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Array),
        Rule::enum_ref => {
            let mut parts: Vec<String> = pair.as_str().split("::").map(|s| s.trim().to_string()).collect();
            let label = parts.pop().ok_or("enum reference: missing label")?;
            Ok(Expr::EnumRef { path: parts, label })
        }
        Rule::ident => Ok(Expr::Name(pair.as_str().to_string())),
        Rule::ternary => build_ternary(pair),
        r => Err(format!("unexpected primary {:?}", r)),
    }
}

/// Integer literal with optional radix prefix and `_` separators.
pub fn parse_int(s: &str) -> Result<i128, String> {
    let s = s.replace('_', "");
    let (digits, radix) = match s.get(..2) {
        Some("0x") | Some("0X") => (&s[2..], 16),
        Some("0b") | Some("0B") => (&s[2..], 2),
        Some("0o") | Some("0O") => (&s[2..], 8),
        _ => (s.as_str(), 10),
    };
    i128::from_str_radix(digits, radix).map_err(|e| format!("integer literal `{}`: {}", s, e))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Expr {
        Expr::parse(s).unwrap_or_else(|e| panic!("{}", e))
    }

    #[test]
    fn precedence() {
        assert_eq!(
            p("1 + 2 * 3"),
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Int(1)),
                Box::new(Expr::Binary(BinOp::Mul, Box::new(Expr::Int(2)), Box::new(Expr::Int(3))))
            )
        );
        assert!(matches!(p("a == 1 and b < 2"), Expr::Binary(BinOp::And, _, _)));
        assert!(matches!(p("x > 0 ? 1 : 2"), Expr::Ternary(_, _, _)));
    }

    #[test]
    fn postfix_chain() {
        assert_eq!(
            p("_root.hdr.items[2]"),
            Expr::Index(
                Box::new(Expr::Member(
                    Box::new(Expr::Member(Box::new(Expr::Name("_root".into())), "hdr".into())),
                    "items".into()
                )),
                Box::new(Expr::Int(2))
            )
        );
        assert!(matches!(p("xor(0x5a)"), Expr::Call(_, ref a) if a.len() == 1));
    }

    #[test]
    fn literals() {
        assert_eq!(p("0x1_0"), Expr::Int(16));
        assert_eq!(p("0b101"), Expr::Int(5));
        assert_eq!(p("-3"), Expr::Int(-3));
        assert_eq!(p("'QCDT'"), Expr::Str("QCDT".into()));
        assert_eq!(p("[1, 2]"), Expr::Array(vec![Expr::Int(1), Expr::Int(2)]));
        assert_eq!(p("platform::msm"), Expr::EnumRef { path: vec!["platform".into()], label: "msm".into() });
        assert!(matches!(p("not flag"), Expr::Unary(UnOp::Not, _)));
        assert_eq!(p("notes"), Expr::Name("notes".into()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("(a").is_err());
    }
}
