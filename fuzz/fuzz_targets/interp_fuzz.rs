//! Interpreter fuzz target: arbitrary bytes against a fixed grammar that exercises
//! counts, switches, sized budgets, transforms and positional instances.
//! Parsing must not panic in either mode and must stay within its limits.
//! Build with: cargo fuzz run interp_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
const GRAMMAR: &str = r#"
meta:
  id: fz
  endian: le
seq:
  - id: count
    type: u1
  - id: recs
    type: rec
    repeat: expr
    repeat-expr: count
  - id: tail
    size-eos: true
types:
  rec:
    seq:
      - id: tag
        type: u1
        enum: tag
      - id: len
        type: u2
      - id: body
        size: len
        type:
          switch-on: tag
          cases:
            tag::text: text
            tag::packed: packed
            tag::nested: rec
      - id: pad
        size: (-len) % 4
    instances:
      peek:
        io: _root._io
        pos: len % (_root._io.size + 1)
        type: u2be
  text:
    seq:
      - id: s
        type: strz
        encoding: UTF-8
  packed:
    seq:
      - id: inner
        size-eos: true
        process: zlib
        type: text
enums:
  tag:
    1: text
    2: packed
    3: nested
"#;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    use binterp::{loader, Interpreter, Limits, ParseOptions};
    use std::sync::Arc;

    let grammar = match loader::parse(GRAMMAR) {
        Ok(g) => Arc::new(g),
        Err(_) => return,
    };
    let limits = Limits { max_depth: 64, max_steps: 100_000, max_transform_output: 1 << 20, ..Limits::default() };
    for opts in [ParseOptions::strict(), ParseOptions::permissive()] {
        let it = Interpreter::new(grammar.clone()).with_options(opts.with_limits(limits));
        let doc = it.parse(data.to_vec());
        doc.resolve_instances();
        let _ = binterp::dump::dump_tree(doc.root());
        let _ = doc.extent();
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run interp_fuzz");
}
