//! Field parser: drives a grammar over a byte buffer and builds the structure tree.
//!
//! Fields are read in `seq` order. Sizes, counts, conditions and switch discriminants are
//! evaluated against the node under construction. Sized fields take their budget from the
//! enclosing stream *before* their content is parsed, so a failure inside the budget is
//! contained: the cursor is already past it and, in permissive mode, siblings keep parsing
//! from the right offset.

use crate::ast::{FieldSpec, Grammar, Repeat, SizeSpec, TypeId, ValueKind};
use crate::diag::{Diagnostic, DiagnosticKind, ErrorKind, ParseError, Severity};
use crate::eval::{eval, eval_bool, eval_int, eval_usize, Scope};
use crate::node::{Document, Field, ParsedNode};
use crate::options::ParseOptions;
use crate::process::{TransformError, TransformRegistry};
use crate::registry::{select_case, CaseMatch};
use crate::stream::{Endian, Stream};
use crate::validate;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Entry point: a loaded grammar plus parse configuration. Cheap to clone and reusable
/// across buffers; each parse gets its own session state.
#[derive(Debug, Clone)]
pub struct Interpreter {
    grammar: Arc<Grammar>,
    transforms: Arc<TransformRegistry>,
    options: ParseOptions,
}

impl Interpreter {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        Interpreter {
            grammar,
            transforms: Arc::new(TransformRegistry::with_builtins()),
            options: ParseOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_transforms(mut self, transforms: Arc<TransformRegistry>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Parse `data` as the grammar's root type.
    pub fn parse(&self, data: impl Into<Rc<[u8]>>) -> Document {
        self.run(self.grammar.root, data.into())
    }

    /// Parse `data` as a named type (resolved from the root scope, `::` paths allowed).
    pub fn parse_type(&self, name: &str, data: impl Into<Rc<[u8]>>) -> Result<Document, ParseError> {
        let id = self
            .grammar
            .resolve_type(self.grammar.root, name)
            .map_err(|kind| ParseError::new(kind, name, 0))?;
        Ok(self.run(id, data.into()))
    }

    fn run(&self, type_id: TypeId, data: Rc<[u8]>) -> Document {
        let session = Rc::new(Session {
            grammar: self.grammar.clone(),
            transforms: self.transforms.clone(),
            options: self.options.clone(),
            diagnostics: RefCell::new(Vec::new()),
            steps: Cell::new(0),
            depth: Cell::new(0),
        });
        let mut io = Stream::new(data);
        let path = self.grammar.type_def(type_id).name.clone();
        log::debug!("parse `{}`: {} byte(s), {:?}", path, io.size(), self.options.strictness);
        let root = ParsedNode::new(&session, type_id, path, &io, true, None);
        let error = match parse_node(&root, &mut io) {
            Ok(()) => None,
            Err(mut f) => {
                session.record(&mut f);
                Some(f.error)
            }
        };
        log::debug!(
            "parse `{}` finished: complete={}, {} byte(s) consumed, {} diagnostic(s)",
            root.path(),
            error.is_none(),
            io.pos(),
            session.diagnostics.borrow().len()
        );
        Document::new(root, session, error)
    }
}

/// Per-parse state shared by every node of one document.
pub(crate) struct Session {
    pub(crate) grammar: Arc<Grammar>,
    pub(crate) transforms: Arc<TransformRegistry>,
    pub(crate) options: ParseOptions,
    diagnostics: RefCell<Vec<Diagnostic>>,
    steps: Cell<u64>,
    depth: Cell<usize>,
}

impl Session {
    pub(crate) fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.borrow().clone()
    }

    pub(crate) fn report(&self, severity: Severity, path: &str, offset: usize, derived: bool, kind: DiagnosticKind) {
        let d = Diagnostic { severity, path: path.to_string(), offset: offset as u64, derived, kind };
        log::debug!("{}", d);
        self.diagnostics.borrow_mut().push(d);
    }

    /// Record a failure as a fatal diagnostic, once.
    pub(crate) fn record(&self, f: &mut Failure) {
        if !f.recorded {
            f.recorded = true;
            let d = Diagnostic::from_error(Severity::Fatal, &f.error);
            log::debug!("{}", d);
            self.diagnostics.borrow_mut().push(d);
        }
    }

    /// Count one unit of work; fails once the step budget is spent or the parse is cancelled.
    fn tick(&self) -> Result<(), ErrorKind> {
        if self.options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(ErrorKind::Cancelled);
        }
        let steps = self.steps.get() + 1;
        self.steps.set(steps);
        let limit = self.options.limits.max_steps;
        if steps > limit {
            return Err(ErrorKind::limit("parse steps", steps, limit));
        }
        Ok(())
    }

    /// Enter a node at tree depth `node_depth`. The effective depth is the larger of that and
    /// the current recursion depth, so instance chains evaluated after the parse still count.
    fn enter(&self, node_depth: usize) -> Result<DepthGuard<'_>, ErrorKind> {
        let previous = self.depth.get();
        let depth = (previous + 1).max(node_depth);
        let limit = self.options.limits.max_depth;
        if depth > limit {
            return Err(ErrorKind::limit("nesting depth", depth as u64, limit as u64));
        }
        self.depth.set(depth);
        Ok(DepthGuard { session: self, previous })
    }
}

struct DepthGuard<'a> {
    session: &'a Session,
    previous: usize,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.session.depth.set(self.previous);
    }
}

/// A field failure on its way up the tree.
#[derive(Debug)]
pub(crate) struct Failure {
    pub(crate) error: ParseError,
    /// The enclosing cursor already moved past the failed field's budget.
    contained: bool,
    recorded: bool,
    /// What was built before the failure (an incomplete node, or the elements read so far).
    partial: Option<Value>,
}

impl Failure {
    pub(crate) fn new(kind: ErrorKind, path: &str, offset: usize, derived: bool) -> Self {
        let error = ParseError::new(kind, path, offset).in_derived(derived);
        Failure { error, contained: false, recorded: false, partial: None }
    }

    fn contain(mut self) -> Self {
        self.contained = true;
        self
    }

    fn with_partial(mut self, partial: Value) -> Self {
        self.partial = Some(partial);
        self
    }

    fn is_terminal(&self) -> bool {
        self.error.kind.is_terminal()
    }
}

/// Wrap an `ErrorKind` with the field path and the offset where the field started in `io`.
fn at<'a>(path: &'a str, io: &Stream, offset: usize) -> impl Fn(ErrorKind) -> Failure + 'a {
    let derived = io.is_derived();
    move |kind| Failure::new(kind, path, offset, derived)
}

fn child_path(parent: &str, id: &str) -> String {
    format!("{}.{}", parent, id)
}

fn scope<'a>(node: &'a Rc<ParsedNode>, io: &'a Stream, index: Option<usize>) -> Scope<'a> {
    Scope { node, io, index, current: None }
}

/// Parse the `seq` of `node` from `io`.
pub(crate) fn parse_node(node: &Rc<ParsedNode>, io: &mut Stream) -> Result<(), Failure> {
    let session = node.session.clone();
    let _depth = session.enter(node.depth()).map_err(at(node.path(), io, io.absolute_pos()))?;
    let grammar = session.grammar.clone();
    let mut clean = true;
    for spec in &grammar.type_def(node.type_id).seq {
        let path = child_path(node.path(), &spec.id);
        let start = io.absolute_pos();
        session.tick().map_err(at(&path, io, start))?;
        log::trace!("{} @ {:#x}", path, start);
        let outcome = match read_field(node, io, spec, &path) {
            Ok(Some(value)) => {
                node.push_field(Field { name: spec.id.clone(), value, range: io.range(start, io.absolute_pos()) });
                skip_padding(node, io, spec, &path)
            }
            Ok(None) => Ok(()),
            Err(mut f) => {
                if let Some(partial) = f.partial.take() {
                    node.push_field(Field {
                        name: spec.id.clone(),
                        value: partial,
                        range: io.range(start, io.absolute_pos()),
                    });
                }
                Err(f)
            }
        };
        node.set_end(io.absolute_pos());
        if let Err(mut f) = outcome {
            session.record(&mut f);
            if f.is_terminal() || !session.options.is_permissive() || !f.contained {
                return Err(f);
            }
            clean = false;
        }
    }
    if clean {
        node.mark_complete();
    }
    Ok(())
}

fn skip_padding(node: &Rc<ParsedNode>, io: &mut Stream, spec: &FieldSpec, path: &str) -> Result<(), Failure> {
    let Some(padding) = &spec.padding else {
        return Ok(());
    };
    let start = io.absolute_pos();
    let n = eval_usize(padding, &Scope::new(node, io));
    let fail = at(path, io, start);
    n.and_then(|n| io.skip(n)).map_err(fail)
}

/// Read one field: condition, then repetition. `Ok(None)` when the condition is false.
pub(crate) fn read_field(
    node: &Rc<ParsedNode>,
    io: &mut Stream,
    spec: &FieldSpec,
    path: &str,
) -> Result<Option<Value>, Failure> {
    if let Some(cond) = &spec.cond {
        let present = eval_bool(cond, &Scope::new(node, io)).map_err(at(path, io, io.absolute_pos()))?;
        if !present {
            return Ok(None);
        }
    }
    read_repeated(node, io, spec, path).map(Some)
}

/// Read a field without checking its condition.
pub(crate) fn read_repeated(
    node: &Rc<ParsedNode>,
    io: &mut Stream,
    spec: &FieldSpec,
    path: &str,
) -> Result<Value, Failure> {
    let session = node.session.clone();
    let max = session.options.limits.max_repeat;
    let start = io.absolute_pos();
    let fail = at(path, io, start);
    let mut items = Vec::new();
    match &spec.repeat {
        Repeat::Once => return read_one(node, io, spec, path, None),
        Repeat::Expr(count) => {
            let n = eval_int(count, &Scope::new(node, io)).map_err(&fail)?;
            let n = u64::try_from(n)
                .map_err(|_| fail(ErrorKind::Expression(format!("negative repeat count {}", n))))?;
            if n > max {
                return Err(fail(ErrorKind::limit("repeat count", n, max)));
            }
            items.reserve(n.min(1024) as usize);
            for i in 0..n as usize {
                read_element(node, io, spec, path, i, &mut items)?;
            }
        }
        Repeat::Eos => {
            if !node.owns_stream() {
                session.report(Severity::Warning, path, start, io.is_derived(), DiagnosticKind::UnboundedRepeat);
            }
            let mut i = 0usize;
            while !io.is_eof() {
                if i as u64 >= max {
                    return Err(fail(ErrorKind::limit("repeat count", i as u64 + 1, max)));
                }
                let before = io.absolute_pos();
                read_element(node, io, spec, path, i, &mut items)?;
                if io.absolute_pos() == before {
                    session.report(
                        Severity::Warning,
                        &format!("{}[{}]", path, i),
                        before,
                        io.is_derived(),
                        DiagnosticKind::EmptyRepeatElement { index: i },
                    );
                    break;
                }
                i += 1;
            }
        }
        Repeat::Until(until) => {
            let mut i = 0usize;
            loop {
                if i as u64 >= max {
                    return Err(fail(ErrorKind::limit("repeat count", i as u64 + 1, max)));
                }
                if read_element(node, io, spec, path, i, &mut items)? {
                    let done = match items.last() {
                        Some(last) => {
                            let scope = Scope::new(node, io).with_index(i).with_current(last);
                            eval_bool(until, &scope)
                        }
                        None => Ok(false),
                    };
                    match done {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(kind) => {
                            let f = Failure::new(kind, &format!("{}[{}]", path, i), io.absolute_pos(), io.is_derived());
                            return Err(f.with_partial(Value::List(items)));
                        }
                    }
                }
                i += 1;
            }
        }
    }
    Ok(Value::List(items))
}

/// Read element `i` of a repetition into `items`. Returns whether a complete element was
/// added; a contained element failure in permissive mode is recorded and skipped.
fn read_element(
    node: &Rc<ParsedNode>,
    io: &mut Stream,
    spec: &FieldSpec,
    path: &str,
    i: usize,
    items: &mut Vec<Value>,
) -> Result<bool, Failure> {
    let session = &node.session;
    let elem_path = format!("{}[{}]", path, i);
    session.tick().map_err(at(&elem_path, io, io.absolute_pos()))?;
    match read_one(node, io, spec, &elem_path, Some(i)) {
        Ok(v) => {
            items.push(v);
            Ok(true)
        }
        Err(mut f) if f.contained && !f.is_terminal() && session.options.is_permissive() => {
            session.record(&mut f);
            if let Some(p) = f.partial.take() {
                items.push(p);
            }
            Ok(false)
        }
        Err(mut f) => {
            let mut list = std::mem::take(items);
            if let Some(p) = f.partial.take() {
                list.push(p);
            }
            f.contained = false;
            Err(f.with_partial(Value::List(list)))
        }
    }
}

/// Read a single value: carve out its byte budget, decode it, validate it.
fn read_one(
    node: &Rc<ParsedNode>,
    io: &mut Stream,
    spec: &FieldSpec,
    path: &str,
    index: Option<usize>,
) -> Result<Value, Failure> {
    let start = io.absolute_pos();
    let fail = at(path, io, start);
    let value = match &spec.size {
        SizeSpec::Implicit => {
            if let Some(p) = &spec.process {
                return Err(fail(ErrorKind::Grammar(format!("`process: {}` needs a sized field", p.name))));
            }
            read_kind(node, io, &spec.kind, spec, path, index, false)?
        }
        SizeSpec::Expr(size) => {
            let n = eval_usize(size, &scope(node, io, index)).map_err(&fail)?;
            let budget = io.substream(n).map_err(&fail)?;
            read_budget(node, budget, spec, path, index).map_err(Failure::contain)?
        }
        SizeSpec::Eos => {
            let n = io.remaining();
            let budget = io.substream(n).map_err(&fail)?;
            read_budget(node, budget, spec, path, index).map_err(Failure::contain)?
        }
        SizeSpec::Terminator { term, include, consume, eos_error } => {
            let raw = io.read_bytes_term(*term, *include, *consume, *eos_error).map_err(&fail)?;
            read_budget(node, raw.to_stream(), spec, path, index).map_err(Failure::contain)?
        }
    };
    if let Some(valid) = &spec.valid {
        let checked = {
            let sc = Scope::new(node, io).with_current(&value);
            validate::check(valid, &value, |e| eval(e, &sc))
        };
        if let Err(kind) = checked {
            let session = &node.session;
            if valid.informational {
                session.report(Severity::Info, path, start, io.is_derived(), DiagnosticKind::Error(kind));
            } else if session.options.is_permissive() && matches!(kind, ErrorKind::ValidationFailed { .. }) {
                session.report(Severity::Fatal, path, start, io.is_derived(), DiagnosticKind::Error(kind));
            } else {
                return Err(fail(kind).contain());
            }
        }
    }
    Ok(value)
}

/// Decode a field inside its budget, running the `process` transform first if any.
fn read_budget(
    node: &Rc<ParsedNode>,
    budget: Stream,
    spec: &FieldSpec,
    path: &str,
    index: Option<usize>,
) -> Result<Value, Failure> {
    let mut io = match &spec.process {
        None => budget,
        Some(p) => {
            let start = budget.absolute_pos();
            let fail = at(path, &budget, start);
            let session = &node.session;
            let transform = session.transforms.get(&p.name).ok_or_else(|| {
                fail(ErrorKind::TransformFailed { name: p.name.clone(), reason: "no such transform".into() })
            })?;
            let args = p
                .args
                .iter()
                .map(|a| eval(a, &scope(node, &budget, index)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(&fail)?;
            let mut budget = budget;
            let input = budget.read_bytes_full();
            let limit = session.options.limits.max_transform_output;
            let out = transform.apply(&input, &args, limit).map_err(|e| {
                fail(match e {
                    TransformError::TooLarge { limit } => {
                        ErrorKind::limit(format!("output of `{}`", p.name), limit as u64 + 1, limit as u64)
                    }
                    other => ErrorKind::TransformFailed { name: p.name.clone(), reason: other.to_string() },
                })
            })?;
            log::trace!("{}: `{}` {} -> {} byte(s)", path, p.name, input.len(), out.len());
            Stream::derived(out)
        }
    };
    read_kind(node, &mut io, &spec.kind, spec, path, index, true)
}

fn int_endian(grammar: &Grammar, type_id: TypeId, width: u8, endian: Option<Endian>) -> Result<Endian, ErrorKind> {
    if width == 1 {
        return Ok(Endian::Big);
    }
    endian.or_else(|| grammar.endian_for(type_id)).ok_or_else(|| {
        ErrorKind::Grammar(format!(
            "no endianness for a {}-byte value in `{}`: set `meta.endian` or use a le/be type",
            width,
            grammar.type_def(type_id).path
        ))
    })
}

fn read_kind(
    node: &Rc<ParsedNode>,
    io: &mut Stream,
    kind: &ValueKind,
    spec: &FieldSpec,
    path: &str,
    index: Option<usize>,
    budgeted: bool,
) -> Result<Value, Failure> {
    let session = &node.session;
    let grammar = &session.grammar;
    let start = io.absolute_pos();
    let fail = at(path, io, start);
    let needs_size = |what: &str| {
        fail(ErrorKind::Grammar(format!("{} field needs `size`, `size-eos` or `terminator`", what)))
    };
    match kind {
        ValueKind::Contents(expected) => {
            let actual = io.read_bytes(expected.len()).map_err(&fail)?;
            validate::check_contents(expected, &actual).map_err(|k| fail(k).contain())?;
            Ok(Value::Bytes(actual))
        }
        ValueKind::Int { width, signed, endian } => {
            let e = int_endian(grammar, node.type_id, *width, *endian).map_err(&fail)?;
            let v = io.read_int(*width, *signed, e).map_err(&fail)?;
            map_enum(node, spec, Value::from_int(v, *width, *signed), path, start, io.is_derived()).map_err(&fail)
        }
        ValueKind::Float { width, endian } => {
            let e = int_endian(grammar, node.type_id, *width, *endian).map_err(&fail)?;
            let v = io.read_float(*width, e).map_err(&fail)?;
            Ok(if *width == 4 { Value::Float(v as f32) } else { Value::Double(v) })
        }
        ValueKind::Bits { width, endian } => {
            let e = endian.unwrap_or_else(|| grammar.bit_endian_for(node.type_id));
            let v = io.read_bits(*width, e).map_err(&fail)?;
            if *width == 1 && spec.enum_ref.is_none() {
                return Ok(Value::Bool(v == 1));
            }
            map_enum(node, spec, Value::Int(v as i128), path, start, io.is_derived()).map_err(&fail)
        }
        ValueKind::Bytes => {
            if !budgeted {
                return Err(needs_size("raw bytes"));
            }
            Ok(Value::Bytes(io.read_bytes_full()))
        }
        ValueKind::Str { encoding, zero_terminated } => {
            if !budgeted {
                return Err(needs_size("string"));
            }
            let raw = if *zero_terminated {
                io.read_bytes_term(0, false, true, false).map_err(&fail)?
            } else {
                io.read_bytes_full()
            };
            let enc = encoding.as_deref().or_else(|| grammar.encoding_for(node.type_id)).unwrap_or("UTF-8");
            let (s, lossy) = decode_str(&raw, enc).map_err(&fail)?;
            if lossy {
                let kind = DiagnosticKind::LossyDecode { encoding: enc.to_string() };
                session.report(Severity::Warning, path, start, io.is_derived(), kind);
            }
            Ok(Value::Str(s))
        }
        ValueKind::User(name) => {
            let type_id = grammar.resolve_type(node.type_id, name).map_err(&fail)?;
            let child = ParsedNode::new(session, type_id, path.to_string(), io, budgeted, Some(node));
            match parse_node(&child, io) {
                Ok(()) => Ok(Value::Node(child)),
                Err(f) => Err(f.with_partial(Value::Node(child))),
            }
        }
        ValueKind::Switch(switch) => {
            let (discriminant, selected) = {
                let sc = scope(node, io, index);
                let d = eval(&switch.on, &sc).map_err(&fail)?;
                let m = select_case(switch, &d, |key| eval(key, &sc)).map_err(&fail)?;
                (d, m)
            };
            match selected {
                CaseMatch::Case(k) | CaseMatch::Default(k) => read_kind(node, io, k, spec, path, index, budgeted),
                CaseMatch::Unhandled => {
                    let discriminant = format!("{:?}", discriminant);
                    if budgeted && session.options.is_permissive() {
                        let blob = io.read_bytes_full();
                        session.report(
                            Severity::Warning,
                            path,
                            start,
                            io.is_derived(),
                            DiagnosticKind::OpaqueVariant { discriminant, len: blob.len() },
                        );
                        Ok(Value::Bytes(blob))
                    } else {
                        Err(fail(ErrorKind::UnhandledVariant { discriminant }))
                    }
                }
            }
        }
    }
}

/// Tag an integer with its enum, if the field names one. Unknown values are kept.
fn map_enum(
    node: &ParsedNode,
    spec: &FieldSpec,
    v: Value,
    path: &str,
    offset: usize,
    derived: bool,
) -> Result<Value, ErrorKind> {
    let Some(enum_name) = &spec.enum_ref else {
        return Ok(v);
    };
    let grammar = &node.session.grammar;
    let def = grammar.enum_def(grammar.resolve_enum(node.type_id, enum_name)?);
    let value = v.as_int().unwrap_or_default();
    let label = def.label(value).map(str::to_string);
    if label.is_none() {
        node.session.report(
            Severity::Info,
            path,
            offset,
            derived,
            DiagnosticKind::UnrecognizedEnum { enum_name: def.name.clone(), value },
        );
    }
    Ok(Value::Enum { enum_name: def.name.clone(), value, label })
}

/// Decode `raw` in `encoding`. The flag is set when invalid sequences were replaced.
pub(crate) fn decode_str(raw: &[u8], encoding: &str) -> Result<(String, bool), ErrorKind> {
    let norm = encoding.to_ascii_uppercase().replace('_', "-");
    match norm.as_str() {
        "UTF-8" | "UTF8" => match std::str::from_utf8(raw) {
            Ok(s) => Ok((s.to_string(), false)),
            Err(_) => Ok((String::from_utf8_lossy(raw).into_owned(), true)),
        },
        "ASCII" | "US-ASCII" => {
            let lossy = !raw.is_ascii();
            let s = raw.iter().map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' }).collect();
            Ok((s, lossy))
        }
        "ISO-8859-1" | "LATIN1" | "LATIN-1" => Ok((raw.iter().map(|&b| b as char).collect(), false)),
        "UTF-16LE" | "UTF-16BE" => {
            let le = norm.ends_with("LE");
            let units = raw.chunks_exact(2).map(|c| {
                if le {
                    u16::from_le_bytes([c[0], c[1]])
                } else {
                    u16::from_be_bytes([c[0], c[1]])
                }
            });
            let mut lossy = raw.len() % 2 != 0;
            let mut s: String = char::decode_utf16(units)
                .map(|r| {
                    r.unwrap_or_else(|_| {
                        lossy = true;
                        char::REPLACEMENT_CHARACTER
                    })
                })
                .collect();
            if raw.len() % 2 != 0 {
                s.push(char::REPLACEMENT_CHARACTER);
            }
            Ok((s, lossy))
        }
        _ => Err(ErrorKind::Grammar(format!("unsupported string encoding `{}`", encoding))),
    }
}
