//! Human-readable rendering of a parsed tree: one line per field with its byte range,
//! enum labels resolved, unrecognized enum values flagged.

use crate::node::ParsedNode;
use crate::stream::{hex, ByteRange};
use crate::value::Value;
use std::fmt::Write;
use std::rc::Rc;

/// Render `node` and everything below it, including instances already computed. Nodes that
/// `node`'s subtree does not own (an instance naming `_parent`, say) are shown by path.
pub fn dump_tree(node: &ParsedNode) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}{}", node.type_name(), range(node.range()), incomplete(node));
    write_fields(&mut out, node, 1);
    out
}

fn range(r: ByteRange) -> String {
    let tag = if r.derived { " derived" } else { "" };
    format!("[{:#x}..{:#x}{}]", r.offset, r.end(), tag)
}

fn incomplete(node: &ParsedNode) -> &'static str {
    if node.is_complete() {
        ""
    } else {
        " (incomplete)"
    }
}

fn write_fields(out: &mut String, node: &ParsedNode, indent: usize) {
    let pad = "  ".repeat(indent);
    for f in node.fields().iter() {
        let _ = write!(out, "{}{} {}: ", pad, f.name, range(f.range));
        write_value(out, node, &f.value, indent);
    }
    for (name, v) in node.resolved_instances() {
        let _ = write!(out, "{}{} (instance): ", pad, name);
        write_value(out, node, &v, indent);
    }
}

fn write_value(out: &mut String, owner: &ParsedNode, v: &Value, indent: usize) {
    match v {
        Value::Node(n) if !n.parent().is_some_and(|p| std::ptr::eq(Rc::as_ptr(&p), owner)) => {
            let _ = writeln!(out, "-> {}", n.path());
        }
        Value::Node(n) => {
            let _ = writeln!(out, "{}{}", n.type_name(), incomplete(n));
            write_fields(out, n, indent + 1);
        }
        Value::List(items) if items.is_empty() => {
            let _ = writeln!(out, "[]");
        }
        Value::List(items) => {
            let _ = writeln!(out, "[{} item(s)]", items.len());
            let pad = "  ".repeat(indent + 1);
            for (i, item) in items.iter().enumerate() {
                let _ = write!(out, "{}[{}] ", pad, i);
                write_value(out, owner, item, indent + 1);
            }
        }
        other => {
            let _ = writeln!(out, "{}", scalar(other));
        }
    }
}

/// One-line form of a leaf value.
pub fn scalar(v: &Value) -> String {
    match v {
        Value::Enum { enum_name, value, label: Some(l) } => format!("{}::{} ({})", enum_name, l, value),
        Value::Enum { enum_name, value, label: None } => format!("{} (unrecognized {})", value, enum_name),
        Value::Bytes(b) => format!("hex({})", hex(b)),
        Value::Str(s) => format!("{:?}", s),
        Value::Bool(b) => b.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Double(x) => x.to_string(),
        other => match other.as_int() {
            Some(i) => i.to_string(),
            None => format!("{:?}", other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Bytes;

    #[test]
    fn scalars() {
        assert_eq!(scalar(&Value::U16(513)), "513");
        assert_eq!(scalar(&Value::Bytes(Bytes::from_vec(vec![0xde, 0xad]))), "hex(de ad)");
        let known = Value::Enum { enum_name: "platform".into(), value: 4, label: Some("msm8974".into()) };
        assert_eq!(scalar(&known), "platform::msm8974 (4)");
        let unknown = Value::Enum { enum_name: "platform".into(), value: 99, label: None };
        assert_eq!(scalar(&unknown), "99 (unrecognized platform)");
    }
}
