//! Parsed structure tree.
//!
//! A [`ParsedNode`] is one type applied to a byte range. It owns its child nodes (through
//! [`Value::Node`] field values), keeps a cheap view of the stream it was read from, and holds
//! weak back-references to its parent and to the document root for scope resolution.
//! Interior mutability is only used while the node is being built and for memoized instances.
//!
//! Ownership runs strictly downward. A memoized instance that names a node the owner does not
//! own (an ancestor, a sibling, the node itself) keeps only a weak reference to it, and tree
//! walks follow owned children only.

use crate::ast::{TypeDef, TypeId};
use crate::diag::{Diagnostic, ParseError, Severity};
use crate::interp::Session;
use crate::stream::{ByteRange, Bytes, Stream};
use crate::value::Value;
use std::cell::{Cell, Ref, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

/// A parsed `seq` field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub value: Value,
    pub range: ByteRange,
}

/// Memo slot for an instance.
pub(crate) enum Slot {
    InProgress,
    Done(Result<Option<Held>, ParseError>),
}

/// A memoized instance value.
pub(crate) enum Held {
    Value(Value),
    Weak(Weak<ParsedNode>),
    List(Vec<Held>),
}

impl Held {
    pub(crate) fn hold(owner: &ParsedNode, v: Value) -> Held {
        match v {
            Value::Node(n) if !owner.is_ancestor_of(&n) => Held::Weak(Rc::downgrade(&n)),
            Value::List(items) => Held::List(items.into_iter().map(|i| Held::hold(owner, i)).collect()),
            other => Held::Value(other),
        }
    }

    /// `None` once a weakly held node has been dropped.
    pub(crate) fn get(&self) -> Option<Value> {
        match self {
            Held::Value(v) => Some(v.clone()),
            Held::Weak(w) => w.upgrade().map(Value::Node),
            Held::List(items) => items.iter().map(Held::get).collect::<Option<Vec<_>>>().map(Value::List),
        }
    }
}

pub struct ParsedNode {
    pub(crate) type_id: TypeId,
    type_name: String,
    path: String,
    io: Stream,
    start: usize,
    end: Cell<usize>,
    depth: usize,
    owns_stream: bool,
    complete: Cell<bool>,
    fields: RefCell<Vec<Field>>,
    pub(crate) instances: RefCell<HashMap<String, Slot>>,
    /// Alternate streams built for `io` expressions, keyed by expression.
    pub(crate) streams: RefCell<HashMap<String, Stream>>,
    parent: Option<Weak<ParsedNode>>,
    root: Weak<ParsedNode>,
    pub(crate) session: Rc<Session>,
}

impl ParsedNode {
    pub(crate) fn new(
        session: &Rc<Session>,
        type_id: TypeId,
        path: String,
        io: &Stream,
        owns_stream: bool,
        parent: Option<&Rc<ParsedNode>>,
    ) -> Rc<ParsedNode> {
        let type_name = session.grammar.type_def(type_id).name.clone();
        let start = io.absolute_pos();
        Rc::new_cyclic(|me| ParsedNode {
            type_id,
            type_name,
            path,
            io: io.clone(),
            start,
            end: Cell::new(start),
            depth: parent.map_or(1, |p| p.depth + 1),
            owns_stream,
            complete: Cell::new(false),
            fields: RefCell::new(Vec::new()),
            instances: RefCell::new(HashMap::new()),
            streams: RefCell::new(HashMap::new()),
            parent: parent.map(Rc::downgrade),
            root: match parent {
                Some(p) => p.root.clone(),
                None => me.clone(),
            },
            session: session.clone(),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Field path from the document root, e.g. `qcdt.entries[0]`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn type_def(&self) -> &TypeDef {
        self.session.grammar.type_def(self.type_id)
    }

    /// Bytes covered by this node's `seq` fields.
    pub fn range(&self) -> ByteRange {
        self.io.range(self.start, self.end.get())
    }

    /// The node's bytes, for handing to an external matcher.
    pub fn bytes(&self) -> Bytes {
        let r = self.range();
        self.io
            .slice(r.offset - self.io.base(), r.len)
            .map(|mut s| s.read_bytes_full())
            .unwrap_or_else(|_| Bytes::from_vec(Vec::new()))
    }

    /// Stream the node was read from, positioned at the end of its `seq`.
    pub fn io(&self) -> Stream {
        let mut s = self.io.clone();
        let _ = s.seek(self.end.get() - s.base());
        s
    }

    /// True when the node was given its own bounded stream (sized field or transform output).
    pub fn owns_stream(&self) -> bool {
        self.owns_stream
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Nesting depth: 1 for the root, one more than the parent otherwise.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True when `other` sits strictly below `self` in the tree.
    pub fn is_ancestor_of(&self, other: &ParsedNode) -> bool {
        let mut cur = other.parent();
        while let Some(p) = cur {
            if std::ptr::eq(Rc::as_ptr(&p), self) {
                return true;
            }
            cur = p.parent();
        }
        false
    }

    /// Nodes owned by `self`: node values of its fields and computed instances whose parent
    /// is `self`, each listed once.
    pub fn children(&self) -> Vec<Rc<ParsedNode>> {
        fn collect(
            v: &Value,
            owner: &ParsedNode,
            seen: &mut HashSet<*const ParsedNode>,
            out: &mut Vec<Rc<ParsedNode>>,
        ) {
            match v {
                Value::Node(n) => {
                    let owned = n.parent.as_ref().is_some_and(|p| std::ptr::eq(p.as_ptr(), owner));
                    if owned && seen.insert(Rc::as_ptr(n)) {
                        out.push(n.clone());
                    }
                }
                Value::List(items) => items.iter().for_each(|i| collect(i, owner, seen, out)),
                _ => {}
            }
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for f in self.fields().iter() {
            collect(&f.value, self, &mut seen, &mut out);
        }
        for (_, v) in self.resolved_instances() {
            collect(&v, self, &mut seen, &mut out);
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.complete.get()
    }

    pub fn fields(&self) -> Ref<'_, Vec<Field>> {
        self.fields.borrow()
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.borrow().iter().find(|f| f.name == name).map(|f| f.value.clone())
    }

    pub fn field_range(&self, name: &str) -> Option<ByteRange> {
        self.fields.borrow().iter().find(|f| f.name == name).map(|f| f.range)
    }

    pub fn parent(&self) -> Option<Rc<ParsedNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn root(&self) -> Option<Rc<ParsedNode>> {
        self.root.upgrade()
    }

    pub(crate) fn push_field(&self, field: Field) {
        self.fields.borrow_mut().push(field);
    }

    pub(crate) fn set_end(&self, absolute: usize) {
        self.end.set(absolute.max(self.start));
    }

    pub(crate) fn mark_complete(&self) {
        self.complete.set(true);
    }

    /// Instance values computed so far (no evaluation is triggered).
    pub fn resolved_instances(&self) -> Vec<(String, Value)> {
        let slots = self.instances.borrow();
        self.type_def()
            .instances
            .iter()
            .filter_map(|(name, _)| match slots.get(name) {
                Some(Slot::Done(Ok(Some(held)))) => held.get().map(|v| (name.clone(), v)),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Debug for ParsedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedNode")
            .field("type", &self.type_name)
            .field("path", &self.path)
            .field("range", &self.range())
            .field("complete", &self.complete.get())
            .field("fields", &*self.fields.borrow())
            .finish()
    }
}

/// Result of parsing one buffer: the (possibly partial) tree, its diagnostics, and the
/// error that aborted the parse, if any.
pub struct Document {
    root: Rc<ParsedNode>,
    session: Rc<Session>,
    error: Option<ParseError>,
}

impl Document {
    pub(crate) fn new(root: Rc<ParsedNode>, session: Rc<Session>, error: Option<ParseError>) -> Self {
        Document { root, session, error }
    }

    pub fn root(&self) -> &Rc<ParsedNode> {
        &self.root
    }

    /// Diagnostics in the order they were found, including any produced by instances
    /// evaluated after the parse.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.session.diagnostics()
    }

    /// The error that aborted the parse (strict mode, terminal errors, or unrecoverable
    /// failures in permissive mode).
    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    /// No abort and no fatal diagnostic anywhere in the tree.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
            && self.root.is_complete()
            && !self.session.diagnostics().iter().any(|d| d.severity == Severity::Fatal)
    }

    /// Number of bytes of the input buffer covered by the tree: the highest end offset of any
    /// node, field or computed instance read from the document itself.
    pub fn extent(&self) -> usize {
        fn bytes_end(v: &Value, max: &mut usize) {
            match v {
                Value::Bytes(b) if !b.is_derived() => *max = (*max).max(b.offset() + b.len()),
                Value::List(items) => items.iter().for_each(|i| bytes_end(i, max)),
                _ => {}
            }
        }
        let mut max = 0;
        self.walk(|n| {
            let r = n.range();
            if !r.derived {
                max = max.max(r.end());
            }
            for f in n.fields().iter() {
                if !f.range.derived {
                    max = max.max(f.range.end());
                }
                bytes_end(&f.value, &mut max);
            }
            for (_, v) in n.resolved_instances() {
                bytes_end(&v, &mut max);
            }
        });
        max
    }

    /// Evaluate every instance in the tree. Failures are recorded as diagnostics.
    pub fn resolve_instances(&self) {
        self.walk(|n| {
            let names: Vec<String> = n.type_def().instances.iter().map(|(k, _)| k.clone()).collect();
            for name in names {
                let _ = n.instance(&name);
            }
        });
    }

    /// Visit every node reachable through ownership, parents before children. `visit` runs
    /// before a node's children are collected, so instances it computes are walked too.
    fn walk(&self, mut visit: impl FnMut(&Rc<ParsedNode>)) {
        let mut seen = HashSet::new();
        let mut pending = vec![self.root.clone()];
        while let Some(n) = pending.pop() {
            if !seen.insert(Rc::as_ptr(&n)) {
                continue;
            }
            visit(&n);
            let mut children = n.children();
            children.reverse();
            pending.extend(children);
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("root", &self.root)
            .field("error", &self.error)
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}
