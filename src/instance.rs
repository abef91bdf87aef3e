//! Lazy instance resolver.
//!
//! Instances are computed on first access and memoized per node, errors included. A
//! positional instance seeks to `pos` in its stream (the node's own stream unless `io`
//! names another), parses there, and leaves the `seq` cursor untouched.

use crate::ast::{InstanceKind, InstanceSpec};
use crate::diag::{ErrorKind, ParseError};
use crate::eval::{eval, eval_bool, eval_usize, Scope};
use crate::expr::Expr;
use crate::interp::{read_repeated, Failure};
use crate::node::{Held, ParsedNode, Slot};
use crate::stream::Stream;
use crate::value::Value;
use std::rc::Rc;

impl ParsedNode {
    /// Value of instance `name`. `Ok(None)` when the instance's `if` condition is false.
    pub fn instance(self: &Rc<Self>, name: &str) -> Result<Option<Value>, ParseError> {
        let path = format!("{}.{}", self.path(), name);
        let here = self.range();
        let err = |kind: ErrorKind| -> Result<Option<Value>, ParseError> {
            Err(ParseError::new(kind, path.as_str(), here.offset).in_derived(here.derived))
        };
        match self.instances.borrow().get(name) {
            Some(Slot::Done(Ok(None))) => return Ok(None),
            Some(Slot::Done(Ok(Some(held)))) => {
                return match held.get() {
                    Some(v) => Ok(Some(v)),
                    None => err(ErrorKind::Expression(format!("node named by instance `{}` was dropped", name))),
                }
            }
            Some(Slot::Done(Err(e))) => return Err(e.clone()),
            Some(Slot::InProgress) => {
                return err(ErrorKind::Expression(format!("instance `{}` depends on itself", name)));
            }
            None => {}
        }
        let Some(spec) = self.type_def().instance(name) else {
            return err(ErrorKind::Expression(format!("`{}` has no instance `{}`", self.type_def().path, name)));
        };
        self.instances.borrow_mut().insert(name.to_string(), Slot::InProgress);
        let result = self.compute_instance(spec, &path).map_err(|mut f| {
            self.session.record(&mut f);
            f.error
        });
        let held = result.clone().map(|v| v.map(|v| Held::hold(self, v)));
        self.instances.borrow_mut().insert(name.to_string(), Slot::Done(held));
        result
    }

    fn compute_instance(self: &Rc<Self>, spec: &InstanceSpec, path: &str) -> Result<Option<Value>, Failure> {
        let here = self.io();
        let fail = |kind| Failure::new(kind, path, here.absolute_pos(), here.is_derived());
        if let Some(cond) = &spec.cond {
            if !eval_bool(cond, &Scope::new(self, &here)).map_err(fail)? {
                return Ok(None);
            }
        }
        match &spec.kind {
            InstanceKind::Value(e) => eval(e, &Scope::new(self, &here)).map(Some).map_err(fail),
            InstanceKind::Parse { pos, io, field } => {
                let mut stream = match io {
                    None => here.clone(),
                    Some(e) => self.alternate_stream(e, &here).map_err(fail)?,
                };
                let target = match pos {
                    Some(p) => eval_usize(p, &Scope::new(self, &stream)).map_err(fail)?,
                    None => 0,
                };
                stream.seek(target).map_err(fail)?;
                log::trace!("{} @ {:#x} (instance)", path, stream.absolute_pos());
                read_repeated(self, &mut stream, field, path).map(Some)
            }
        }
    }

    /// Stream named by an `io` expression, built on first use and shared by every instance
    /// of this node that names the same expression.
    fn alternate_stream(self: &Rc<Self>, e: &Expr, here: &Stream) -> Result<Stream, ErrorKind> {
        let key = format!("{:?}", e);
        if let Some(s) = self.streams.borrow().get(&key) {
            return Ok(s.clone());
        }
        let s = eval(e, &Scope::new(self, here)).and_then(stream_of)?;
        self.streams.borrow_mut().insert(key, s.clone());
        Ok(s)
    }
}

/// Stream named by an `io` expression: a node's stream, a stream, or bytes.
fn stream_of(v: Value) -> Result<Stream, ErrorKind> {
    match v {
        Value::Io(s) => Ok(s),
        Value::Node(n) => Ok(n.io()),
        Value::Bytes(b) => Ok(b.to_stream()),
        Value::List(items) => {
            let mut joined = Vec::new();
            for item in &items {
                match item {
                    Value::Bytes(b) => joined.extend_from_slice(b),
                    other => {
                        return Err(ErrorKind::Expression(format!(
                            "`io` list must hold bytes, found {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Stream::derived(joined))
        }
        other => Err(ErrorKind::Expression(format!("{} cannot be used as `io`", other.type_name()))),
    }
}
