//! Scope collection.
//!
//! Uncaptured call scopes are freed as soon as their frame ends. A scope a
//! closure captured can only be freed once no value the engine still holds
//! leads back to it, which takes a trace: start from the roots, follow every
//! value to the scopes its functions close over, and sweep the rest.

use std::collections::HashSet;
use std::rc::Rc;

use crate::runtime::scope::{ScopeArena, ScopeId};
use crate::runtime::value::{FunctionBody, Value};

/// Marks scopes reachable from a set of roots.
pub struct ScopeTracer<'a> {
    arena: &'a ScopeArena,
    scopes: HashSet<ScopeId>,
    /// Reference values already traced, by address.
    seen: HashSet<usize>,
    pending: Vec<Value>,
}

impl<'a> ScopeTracer<'a> {
    pub fn new(arena: &'a ScopeArena) -> Self {
        ScopeTracer {
            arena,
            scopes: HashSet::new(),
            seen: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Marks `id`, its ancestors and everything bound in them.
    pub fn scope(&mut self, id: ScopeId) {
        let mut current = Some(id);
        while let Some(id) = current {
            if !self.scopes.insert(id) {
                return;
            }
            let Some(table) = self.arena.get(id) else {
                return;
            };
            self.pending.extend(table.iter().map(|(_, value)| value.clone()));
            current = table.parent();
        }
    }

    pub fn value(&mut self, value: &Value) {
        self.pending.push(value.clone());
    }

    pub fn values<'v>(&mut self, values: impl IntoIterator<Item = &'v Value>) {
        self.pending.extend(values.into_iter().cloned());
    }

    /// Traces everything queued and returns the reachable scopes.
    pub fn finish(mut self) -> HashSet<ScopeId> {
        while let Some(value) = self.pending.pop() {
            self.trace(&value);
        }
        self.scopes
    }

    fn first_visit(&mut self, address: usize) -> bool {
        self.seen.insert(address)
    }

    fn trace(&mut self, value: &Value) {
        match value {
            Value::Array(items) => {
                if self.first_visit(items.as_ptr() as usize) {
                    self.pending.extend(items.borrow().iter().cloned());
                }
            }
            Value::Tuple(items) => {
                if self.first_visit(items.as_ptr() as usize) {
                    self.pending.extend(items.iter().cloned());
                }
            }
            Value::Iterator(iter) => {
                if self.first_visit(iter.as_ptr() as usize) {
                    self.pending.extend(iter.borrow().items().iter().cloned());
                }
            }
            Value::Function(function) => {
                if self.first_visit(Rc::as_ptr(function) as usize) {
                    if let FunctionBody::Compiled(body) = &function.body {
                        self.scope(body.closure);
                    }
                    if let Some(receiver) = &function.receiver {
                        self.pending.push(receiver.clone());
                    }
                }
            }
            Value::Type(class) => {
                if self.first_visit(Rc::as_ptr(class) as usize) {
                    self.pending.extend(class.attribute_values());
                    self.pending.extend(class.bases.iter().cloned().map(Value::Type));
                }
            }
            Value::Object(object) => {
                if self.first_visit(Rc::as_ptr(object) as usize) {
                    self.pending.extend(object.attribute_values());
                    self.pending.push(Value::Type(object.class.clone()));
                }
            }
            Value::None
            | Value::Bool(_)
            | Value::Integer(_)
            | Value::Float(_)
            | Value::String(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Program;
    use crate::runtime::value::{CompiledBody, Function};

    fn closure_over(scope: ScopeId) -> Value {
        let body = CompiledBody {
            program: Rc::new(Program::default()),
            entry: 0,
            len: 0,
            arity: 0,
            closure: scope,
        };
        Value::Function(Rc::new(Function::compiled("f", body, false)))
    }

    #[test]
    fn test_functions_reach_their_closure_chain() {
        let mut arena = ScopeArena::default();
        let root = arena.allocate(None);
        let outer = arena.allocate(Some(root));
        let inner = arena.allocate(Some(outer));
        let unrelated = arena.allocate(Some(root));

        let mut tracer = ScopeTracer::new(&arena);
        tracer.value(&Value::array(vec![closure_over(inner)]));
        let reachable = tracer.finish();

        assert_eq!(reachable, HashSet::from([root, outer, inner]));
        assert!(!reachable.contains(&unrelated));
    }

    #[test]
    fn test_bindings_are_traced() {
        let mut arena = ScopeArena::default();
        let globals = arena.allocate(None);
        let captured = arena.allocate(Some(globals));
        arena
            .get_mut(globals)
            .unwrap()
            .set("f", Value::tuple(vec![closure_over(captured)]));

        let mut tracer = ScopeTracer::new(&arena);
        tracer.scope(globals);
        assert_eq!(tracer.finish(), HashSet::from([globals, captured]));
    }

    #[test]
    fn test_cycles_terminate() {
        let mut arena = ScopeArena::default();
        let scope = arena.allocate(None);
        let items = Value::array(vec![closure_over(scope)]);
        let Value::Array(cell) = &items else { unreachable!() };
        cell.borrow_mut().push(items.clone());

        let mut tracer = ScopeTracer::new(&arena);
        tracer.value(&items);
        assert_eq!(tracer.finish(), HashSet::from([scope]));

        cell.borrow_mut().clear();
    }
}
