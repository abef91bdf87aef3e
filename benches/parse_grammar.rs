//! Benchmark: interpret a device-tree-table style grammar over a synthetic image.
//! Eager parse of the seq, eager parse plus resolving every lazy instance, and a
//! zlib-wrapped variant that goes through the transform pipeline.

use binterp::{loader, Interpreter, ParseOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::Arc;

const TABLE: &str = r#"
meta:
  id: table
  endian: le
seq:
  - id: magic
    contents: "QCDT"
  - id: version
    type: u4
  - id: num_entries
    type: u4
  - id: entries
    type: entry
    repeat: expr
    repeat-expr: num_entries
  - id: terminator
    type: u4
    valid: 0
types:
  entry:
    seq:
      - id: platform
        type: u4
        enum: platform
      - id: variant
        type: u4
      - id: offset
        type: u4
      - id: len
        type: u4
    instances:
      blob:
        io: _root._io
        pos: offset
        size: len
enums:
  platform:
    0x7e: msm8974
    0x7f: apq8084
"#;

const PACKED: &str = r#"
meta:
  id: packed
  endian: le
seq:
  - id: len
    type: u4
  - id: body
    size: len
    process: zlib
    type: inner
types:
  inner:
    seq:
      - id: words
        type: u4
        repeat: eos
"#;

fn table_image(entries: u32, blob_len: u32) -> Vec<u8> {
    let header = 12 + 16 * entries as usize + 4;
    let mut v = b"QCDT".to_vec();
    v.extend_from_slice(&3u32.to_le_bytes());
    v.extend_from_slice(&entries.to_le_bytes());
    for i in 0..entries {
        let offset = header as u32 + i * blob_len;
        for word in [0x7e + (i % 3), i, offset, blob_len] {
            v.extend_from_slice(&word.to_le_bytes());
        }
    }
    v.extend_from_slice(&0u32.to_le_bytes());
    v.extend((0..entries * blob_len).map(|b| b as u8));
    v
}

fn packed_image(words: u32) -> Vec<u8> {
    let raw: Vec<u8> = (0..words).flat_map(|w| w.to_le_bytes()).collect();
    let mut e = ZlibEncoder::new(Vec::new(), Compression::default());
    e.write_all(&raw).expect("compress");
    let body = e.finish().expect("compress");
    let mut v = (body.len() as u32).to_le_bytes().to_vec();
    v.extend_from_slice(&body);
    v
}

fn bench_parse(c: &mut Criterion) {
    let table = Interpreter::new(Arc::new(loader::parse(TABLE).expect("table grammar")))
        .with_options(ParseOptions::permissive());
    let packed = Interpreter::new(Arc::new(loader::parse(PACKED).expect("packed grammar")));

    let image: Arc<[u8]> = table_image(1024, 64).into();
    let zimage: Arc<[u8]> = packed_image(64 * 1024).into();

    let warm = table.parse(image.to_vec());
    eprintln!(
        "parse_grammar: {} bytes, complete={}, {} diagnostic(s), extent {}",
        image.len(),
        warm.is_complete(),
        warm.diagnostics().len(),
        warm.extent()
    );

    c.bench_function("table_seq_only", |b| {
        b.iter(|| {
            let doc = table.parse(black_box(image.to_vec()));
            black_box(doc.root().fields().len())
        });
    });

    c.bench_function("table_with_instances", |b| {
        b.iter(|| {
            let doc = table.parse(black_box(image.to_vec()));
            doc.resolve_instances();
            black_box(doc.extent())
        });
    });

    c.bench_function("zlib_wrapped_words", |b| {
        b.iter(|| {
            let doc = packed.parse(black_box(zimage.to_vec()));
            black_box(doc.is_complete())
        });
    });
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
