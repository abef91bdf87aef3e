//! Lazy instances: value expressions, conditions, memoization, relocated reads, alternate
//! streams, and cycle detection.

use binterp::{loader, DiagnosticKind, ErrorKind, Interpreter, ParseOptions, Severity, Value};
use std::rc::Rc;
use std::sync::Arc;

const ARCHIVE: &str = r#"
meta:
  id: archive
  endian: be
seq:
  - id: count
    type: u1
  - id: index_ofs
    type: u2
  - id: chunks
    size: 2
    repeat: expr
    repeat-expr: count
instances:
  double_count:
    value: count * 2
  has_chunks:
    value: count > 0
  first_chunk:
    value: chunks[0]
    if: has_chunks
  index:
    pos: index_ofs
    type: index_entry
    repeat: expr
    repeat-expr: count
  joined:
    io: chunks
    pos: 1
    type: u2
  part_a:
    io: chunks
    pos: 0
    type: pair
  part_b:
    io: chunks
    pos: 2
    type: pair
  same_view:
    value: part_a._io == part_b._io
  loop_a:
    value: loop_b + 1
  loop_b:
    value: loop_a + 1
types:
  pair:
    seq:
      - {id: hi, type: u1}
      - {id: lo, type: u1}
  index_entry:
    seq:
      - id: tag
        type: u1
        enum: tag
    instances:
      archive_count:
        value: _parent.count
      root_count:
        value: _root.count
enums:
  tag:
    1: file
    2: dir
"#;

fn interpreter() -> Interpreter {
    let _ = env_logger::builder().is_test(true).try_init();
    Interpreter::new(Arc::new(loader::parse(ARCHIVE).expect("grammar")))
}

/// count=2, index at offset 7, chunks "ab" "cd", index tags [1, 2].
fn archive_bytes() -> Vec<u8> {
    vec![2, 0, 7, b'a', b'b', b'c', b'd', 1, 2]
}

#[test]
fn test_value_instances() {
    let doc = interpreter().parse(archive_bytes());
    assert!(doc.is_complete(), "{:?}", doc.diagnostics());
    let root = doc.root();
    assert_eq!(root.instance("double_count").expect("ok").and_then(|v| v.as_int()), Some(4));
    assert_eq!(root.instance("has_chunks").expect("ok"), Some(Value::Bool(true)));
    let first = root.instance("first_chunk").expect("ok").expect("present");
    assert_eq!(first.as_bytes(), Some(&b"ab"[..]));
}

#[test]
fn test_false_condition_makes_instance_absent() {
    let doc = interpreter().parse(vec![0, 0, 3]);
    assert!(doc.is_complete());
    assert_eq!(doc.root().instance("first_chunk").expect("ok"), None);
}

#[test]
fn test_positional_instance_parses_list_of_nodes() {
    let doc = interpreter().parse(archive_bytes());
    let index = doc.root().instance("index").expect("ok").expect("present");
    let entries = index.as_list().expect("list");
    assert_eq!(entries.len(), 2);
    let labels: Vec<_> = entries
        .iter()
        .map(|e| e.as_node().expect("node").field("tag").expect("tag").enum_label().map(str::to_string))
        .collect();
    assert_eq!(labels, vec![Some("file".to_string()), Some("dir".to_string())]);
    let second = entries[1].as_node().expect("node");
    assert_eq!(second.path(), "archive.index[1]");
    assert_eq!(second.range().offset, 8);
    // The instance was read after the seq; the seq extent is unchanged.
    assert_eq!(doc.root().range().len, 7);
}

#[test]
fn test_parent_and_root_from_instance_nodes() {
    let doc = interpreter().parse(archive_bytes());
    let index = doc.root().instance("index").expect("ok").expect("present");
    let entry = index.as_list().expect("list")[0].as_node().expect("node").clone();
    assert_eq!(entry.instance("archive_count").expect("ok").and_then(|v| v.as_int()), Some(2));
    assert_eq!(entry.instance("root_count").expect("ok").and_then(|v| v.as_int()), Some(2));
    let parent = entry.parent().expect("parent");
    assert!(parent.is_root());
}

#[test]
fn test_io_over_list_of_bytes_is_concatenated() {
    let doc = interpreter().parse(archive_bytes());
    let joined = doc.root().instance("joined").expect("ok").expect("present");
    // "abcd" seen as one stream; u2 at offset 1 is "bc".
    assert_eq!(joined.as_int(), Some(((b'b' as i128) << 8) | b'c' as i128));
}

#[test]
fn test_alternate_stream_is_built_once() {
    let doc = interpreter().parse(archive_bytes());
    let root = doc.root();
    let b = root.instance("part_b").expect("ok").expect("present");
    assert_eq!(b.as_node().and_then(|n| n.field("hi")).and_then(|v| v.as_int()), Some(b'c' as i128));
    // Both instances read from the same concatenated buffer.
    assert_eq!(root.instance("same_view").expect("ok"), Some(Value::Bool(true)));
}

#[test]
fn test_instances_are_memoized() {
    let doc = interpreter().parse(archive_bytes());
    let a = doc.root().instance("index").expect("ok").expect("present");
    let b = doc.root().instance("index").expect("ok").expect("present");
    let (a, b) = (a.as_list().expect("list"), b.as_list().expect("list"));
    assert_eq!(a[0], b[0], "same node returned on second access");
}

#[test]
fn test_cycle_is_an_error_not_a_hang() {
    let doc = interpreter().parse(archive_bytes());
    let err = doc.root().instance("loop_a").expect_err("cycle");
    assert!(matches!(err.kind, ErrorKind::Expression(_)));
    assert!(doc
        .diagnostics()
        .iter()
        .any(|d| d.severity == Severity::Fatal && d.path == "archive.loop_a"));
    // Errors are memoized too.
    assert_eq!(doc.root().instance("loop_a").expect_err("cycle"), err);
}

#[test]
fn test_unknown_instance_name() {
    let doc = interpreter().parse(archive_bytes());
    assert!(doc.root().instance("nope").is_err());
}

#[test]
fn test_out_of_range_instance_is_recorded() {
    // index_ofs points past the end.
    let doc = interpreter().with_options(ParseOptions::permissive()).parse(vec![1, 0, 40, b'a', b'b']);
    assert!(doc.error().is_none());
    let err = doc.root().instance("index").expect_err("out of range");
    assert!(matches!(err.kind, ErrorKind::OutOfBounds { .. }));
    let diags = doc.diagnostics();
    assert!(diags
        .iter()
        .any(|d| d.path == "archive.index" && matches!(d.kind, DiagnosticKind::Error(ErrorKind::OutOfBounds { .. }))));
    assert!(!doc.is_complete());
}

#[test]
fn test_field_size_from_instance() {
    const SRC: &str = r#"
meta: {id: hdr, endian: le}
seq:
  - {id: words, type: u1}
  - {id: body, size: byte_len}
  - {id: tail, type: u1}
instances:
  byte_len:
    value: words * 2
"#;
    let it = Interpreter::new(Arc::new(loader::parse(SRC).expect("grammar")));
    let doc = it.parse(vec![2, 1, 2, 3, 4, 9]);
    assert!(doc.is_complete(), "{:?}", doc.diagnostics());
    assert_eq!(doc.root().field("body").and_then(|v| v.as_bytes().map(<[u8]>::len)), Some(4));
    assert_eq!(doc.root().field("tail").and_then(|v| v.as_int()), Some(9));
}

#[test]
fn test_forward_reference_fails_with_expression_error() {
    const SRC: &str = r#"
meta: {id: fwd, endian: le}
seq:
  - {id: body, size: len}
  - {id: len, type: u1}
"#;
    let it = Interpreter::new(Arc::new(loader::parse(SRC).expect("grammar")));
    let doc = it.parse(vec![1, 2, 3]);
    let err = doc.error().expect("error");
    assert_eq!(err.path, "fwd.body");
    match &err.kind {
        ErrorKind::Expression(msg) => assert!(msg.contains("not available"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }
}

const LINKED: &str = r#"
meta: {id: list, endian: le}
seq:
  - {id: next_ofs, type: u1}
instances:
  next:
    pos: next_ofs
    type: link
    if: next_ofs != 0
types:
  link:
    seq:
      - {id: next_ofs, type: u1}
    instances:
      next:
        pos: next_ofs
        type: link
        if: next_ofs != 0
"#;

#[test]
fn test_self_linked_list_stops_at_depth_limit() {
    let it = Interpreter::new(Arc::new(loader::parse(LINKED).expect("grammar")));
    // The link at offset 1 points at itself.
    let doc = it.parse(vec![1, 1]);
    assert!(doc.is_complete());
    doc.resolve_instances();
    assert!(doc.diagnostics().iter().any(|d| matches!(
        d.error_kind(),
        Some(ErrorKind::ResourceLimitExceeded { limit: 64, .. })
    )));
    // Root is depth 1, so links fill depths 2..=64.
    let mut links = 0;
    let mut cur = doc.root().clone();
    while let Ok(Some(v)) = cur.instance("next") {
        cur = v.as_node().expect("node").clone();
        links += 1;
    }
    assert_eq!(links, 63);
    assert_eq!(cur.depth(), 64);
    assert_eq!(doc.extent(), 2);
    assert!(binterp::dump::dump_tree(doc.root()).contains("next (instance): link"));
}

const FAMILY: &str = r#"
meta: {id: family, endian: le}
seq:
  - {id: kid, type: child}
instances:
  me:
    value: _root
types:
  child:
    seq:
      - {id: age, type: u1}
    instances:
      up:
        value: _parent
      top:
        value: _root
"#;

#[test]
fn test_instances_naming_ancestors_do_not_keep_them_alive() {
    let it = Interpreter::new(Arc::new(loader::parse(FAMILY).expect("grammar")));
    let doc = it.parse(vec![7]);
    let kid = doc.root().field("kid").expect("kid").as_node().expect("node").clone();
    {
        let up = kid.instance("up").expect("ok").expect("present");
        assert!(Rc::ptr_eq(up.as_node().expect("node"), doc.root()));
        let me = doc.root().instance("me").expect("ok").expect("present");
        assert!(Rc::ptr_eq(me.as_node().expect("node"), doc.root()));
    }
    doc.resolve_instances();
    assert_eq!(doc.extent(), 1);
    let dump = binterp::dump::dump_tree(doc.root());
    assert!(dump.contains("up (instance): -> family"), "{}", dump);

    let root = Rc::downgrade(doc.root());
    drop(doc);
    assert!(root.upgrade().is_none());
    assert!(kid.parent().is_none());
    match kid.instance("up") {
        Err(e) => assert!(matches!(e.kind, ErrorKind::Expression(_))),
        Ok(v) => panic!("dropped ancestor still reachable: {:?}", v),
    }
}
