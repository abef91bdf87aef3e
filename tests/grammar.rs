//! Grammar loading: accepted shapes, rejected documents, and file loading.

use binterp::ast::{Repeat, SizeSpec, ValueKind};
use binterp::check::{check_grammar, CheckRule};
use binterp::loader::{self, load_grammar_file, GrammarError};
use binterp::Endian;
use std::io::Write;

const FULL: &str = r#"
meta:
  id: container
  endian: be
  encoding: ASCII
seq:
  - id: magic
    contents: "CT"
  - id: kind
    type: u1
    enum: kind
  - id: body
    size-eos: true
    type:
      switch-on: kind
      cases:
        kind::text: text_body
        0x02: u4le
        _: raw_body
instances:
  is_text:
    value: kind == kind::text
types:
  text_body:
    seq:
      - id: text
        type: str
        terminator: 0
  raw_body:
    seq:
      - id: words
        type: u2
        repeat: eos
enums:
  kind:
    0x01: text
    2: number
    3:
      id: raw
"#;

fn invalid_path(err: GrammarError) -> String {
    match err {
        GrammarError::Invalid { path, .. } => path,
        other => panic!("expected an invalid-grammar error, got {}", other),
    }
}

#[test]
fn test_full_grammar_shape() {
    let g = loader::parse(FULL).expect("grammar");
    assert_eq!(g.id, "container");
    let root = g.root_type();
    assert_eq!(root.path, "container");
    assert_eq!(root.endian, Some(Endian::Big));
    assert_eq!(root.seq.len(), 3);
    assert!(matches!(root.seq[0].kind, ValueKind::Contents(ref c) if c == b"CT"));
    assert_eq!(root.seq[1].enum_ref.as_deref(), Some("kind"));
    assert!(matches!(root.seq[2].size, SizeSpec::Eos));
    match &root.seq[2].kind {
        ValueKind::Switch(sw) => {
            assert_eq!(sw.cases.len(), 2);
            assert!(sw.default.is_some());
            assert!(matches!(sw.cases[1].1, ValueKind::Int { width: 4, signed: false, endian: Some(Endian::Little) }));
        }
        other => panic!("expected a switch, got {:?}", other),
    }
    assert!(root.instance("is_text").is_some());

    let text = g.type_def(root.types["text_body"]);
    assert_eq!(text.path, "container::text_body");
    assert!(matches!(text.seq[0].size, SizeSpec::Terminator { term: 0, include: false, consume: true, .. }));
    let raw = g.type_def(root.types["raw_body"]);
    assert!(matches!(raw.seq[0].repeat, Repeat::Eos));

    let kind = g.enum_def(root.enums["kind"]);
    assert_eq!(kind.label(1), Some("text"));
    assert_eq!(kind.label(3), Some("raw"));
    assert_eq!(kind.by_label.get("number"), Some(&2));
}

#[test]
fn test_full_grammar_passes_static_checks() {
    let g = loader::parse(FULL).expect("grammar");
    let findings = check_grammar(&g);
    // Only the unbounded repeat inside an unsized user type is worth flagging.
    assert!(
        findings.iter().all(|f| f.rule == CheckRule::UnboundedRepeat),
        "{:?}",
        findings.iter().map(ToString::to_string).collect::<Vec<_>>()
    );
}

#[test]
fn test_yaml_syntax_error() {
    let err = loader::parse("seq: [ {id: a").expect_err("bad yaml");
    assert!(matches!(err, GrammarError::Yaml(_)));
}

#[test]
fn test_document_must_be_mapping() {
    let err = loader::parse("- a\n- b\n").expect_err("not a mapping");
    assert_eq!(invalid_path(err), "<document>");
}

#[test]
fn test_missing_field_id() {
    let err = loader::parse("meta: {id: x}\nseq:\n  - type: u1\n").expect_err("missing id");
    assert_eq!(invalid_path(err), "x.seq[0]");
}

#[test]
fn test_duplicate_field_id() {
    let src = "meta: {id: x}\nseq:\n  - {id: a, type: u1}\n  - {id: a, type: u1}\n";
    let err = loader::parse(src).expect_err("duplicate");
    assert_eq!(invalid_path(err), "x.seq[1]");
}

#[test]
fn test_instance_shadowing_field() {
    let src = "meta: {id: x}\nseq:\n  - {id: a, type: u1}\ninstances:\n  a:\n    value: 1\n";
    let err = loader::parse(src).expect_err("shadowing");
    assert_eq!(invalid_path(err), "x.instances.a");
}

#[test]
fn test_bad_identifier() {
    let err = loader::parse("meta: {id: x}\nseq:\n  - {id: 9lives, type: u1}\n").expect_err("identifier");
    assert_eq!(invalid_path(err), "x.seq[0]");
}

#[test]
fn test_bad_endian() {
    let err = loader::parse("meta: {id: x, endian: middle}\n").expect_err("endian");
    assert_eq!(invalid_path(err), "x.meta.endian");
}

#[test]
fn test_repeat_expr_needs_count() {
    let err = loader::parse("meta: {id: x}\nseq:\n  - {id: a, type: u1, repeat: expr}\n").expect_err("count");
    assert_eq!(invalid_path(err), "x.seq[0]");
}

#[test]
fn test_bad_expression_is_rejected_at_load_time() {
    let err = loader::parse("meta: {id: x}\nseq:\n  - {id: a, size: 1 +, type: u1}\n").expect_err("expression");
    assert!(matches!(err, GrammarError::Invalid { .. }));
}

#[test]
fn test_bad_enum_key() {
    let err = loader::parse("meta: {id: x}\nenums:\n  e:\n    one: a\n").expect_err("enum key");
    assert_eq!(invalid_path(err), "x.enums.e");
}

#[test]
fn test_bad_validation_level() {
    let src = "meta: {id: x}\nseq:\n  - id: a\n    type: u1\n    valid:\n      eq: 1\n      level: loud\n";
    let err = loader::parse(src).expect_err("level");
    assert_eq!(invalid_path(err), "x.seq[0].valid");
}

#[test]
fn test_load_grammar_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(FULL.as_bytes()).expect("write");
    let g = load_grammar_file(file.path()).expect("load");
    assert_eq!(g.id, "container");
}

#[test]
fn test_load_grammar_file_reports_path() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("absent.ksy");
    let err = load_grammar_file(&missing).expect_err("missing file");
    assert!(format!("{:#}", err).contains("absent.ksy"));
}
