//! Type registry: lexical resolution of type/enum names and `switch-on` case selection.
//!
//! Names resolve from the scope where the referencing field is *declared*: that type's own
//! nested definitions first, then each enclosing type outward to the root. Qualified names
//! (`outer::inner`) resolve their first segment lexically and descend from there.

use crate::ast::{EnumId, Grammar, SwitchSpec, TypeId, ValueKind};
use crate::diag::ErrorKind;
use crate::expr::Expr;
use crate::value::Value;

impl Grammar {
    pub fn resolve_type(&self, from: TypeId, name: &str) -> Result<TypeId, ErrorKind> {
        let mut segments = name.split("::");
        let first = segments.next().unwrap_or(name);
        let mut found = self.lookup_outward(from, |t| t.types.get(first).copied())
            .or_else(|| (self.root_type().name == first).then_some(self.root));
        for seg in segments {
            found = found.and_then(|id| self.type_def(id).types.get(seg).copied());
        }
        found.ok_or_else(|| ErrorKind::UnresolvedType { what: "type", name: name.to_string() })
    }

    pub fn resolve_enum(&self, from: TypeId, name: &str) -> Result<EnumId, ErrorKind> {
        let unresolved = || ErrorKind::UnresolvedType { what: "enum", name: name.to_string() };
        match name.rsplit_once("::") {
            Some((types, enum_name)) => {
                let owner = self.resolve_type(from, types).map_err(|_| unresolved())?;
                self.type_def(owner).enums.get(enum_name).copied().ok_or_else(unresolved)
            }
            None => self
                .lookup_outward(from, |t| t.enums.get(name).copied())
                .ok_or_else(unresolved),
        }
    }

    fn lookup_outward<T>(
        &self,
        from: TypeId,
        mut get: impl FnMut(&crate::ast::TypeDef) -> Option<T>,
    ) -> Option<T> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            let t = self.type_def(id);
            if let Some(v) = get(t) {
                return Some(v);
            }
            cur = t.scope;
        }
        None
    }
}

/// Outcome of matching a discriminant against a switch.
#[derive(Debug)]
pub(crate) enum CaseMatch<'g> {
    Case(&'g ValueKind),
    Default(&'g ValueKind),
    Unhandled,
}

/// Pick the first case whose key equals `discriminant`, else the default.
pub(crate) fn select_case<'g>(
    spec: &'g SwitchSpec,
    discriminant: &Value,
    mut eval_key: impl FnMut(&Expr) -> Result<Value, ErrorKind>,
) -> Result<CaseMatch<'g>, ErrorKind> {
    for (key, kind) in &spec.cases {
        if eval_key(key)? == *discriminant {
            return Ok(CaseMatch::Case(kind));
        }
    }
    Ok(match &spec.default {
        Some(kind) => CaseMatch::Default(kind),
        None => CaseMatch::Unhandled,
    })
}
