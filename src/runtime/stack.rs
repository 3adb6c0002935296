use crate::runtime::runtime_error::{ErrorKind, RuntimeError, invalid_bytecode};

/// Default depth of both execution stacks: one slot per bit of a machine word.
pub const MAX_STACK_DEPTH: usize = usize::BITS as usize;

/// A stack with a hard depth limit. Pushing onto a full stack is an error,
/// never a silent truncation or a reallocation past the limit.
#[derive(Debug)]
pub struct BoundedStack<T> {
    name: &'static str,
    limit: usize,
    items: Vec<T>,
}

impl<T> BoundedStack<T> {
    pub fn new(name: &'static str, limit: usize) -> Self {
        BoundedStack {
            name,
            limit,
            items: Vec::new(),
        }
    }

    /// Seeds the stack without checking the limit.
    pub fn with_items(name: &'static str, limit: usize, items: Vec<T>) -> Self {
        BoundedStack { name, limit, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn push(&mut self, item: T) -> Result<(), RuntimeError> {
        if self.items.len() >= self.limit {
            return Err(ErrorKind::StackFull {
                stack: self.name,
                limit: self.limit,
            }
            .into());
        }
        self.items.push(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<T, RuntimeError> {
        self.items
            .pop()
            .ok_or_else(|| invalid_bytecode(format!("{} stack underflow", self.name)))
    }

    /// Pops `n` items; the first popped comes first in the result.
    pub fn pop_many(&mut self, n: usize) -> Result<Vec<T>, RuntimeError> {
        if n > self.items.len() {
            return Err(invalid_bytecode(format!(
                "{} stack underflow: need {}, have {}",
                self.name,
                n,
                self.items.len()
            )));
        }
        let mut popped = self.items.split_off(self.items.len() - n);
        popped.reverse();
        Ok(popped)
    }

    /// Drops everything above `len`, returning the removed items bottom-first.
    pub fn truncate(&mut self, len: usize) -> Vec<T> {
        if len >= self.items.len() {
            return Vec::new();
        }
        self.items.split_off(len)
    }
}
