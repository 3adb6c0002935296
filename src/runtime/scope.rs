//! Lexical scopes.
//!
//! Scopes live in an arena and refer to their parent by index, never by
//! ownership. A call's scope is released when the call returns unless a
//! closure captured it; capturing a scope pins its whole parent chain, so a
//! live closure can always resolve names outward. Captured scopes are freed
//! by [`ScopeArena::sweep`] once nothing reaches them.

use std::collections::{HashMap, HashSet};

use crate::runtime::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

/// Name to value bindings, optionally chained to an enclosing scope.
///
/// Objects and types use the same table for their attributes, without a parent.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Value>,
    parent: Option<ScopeId>,
}

impl SymbolTable {
    pub fn new(parent: Option<ScopeId>) -> Self {
        SymbolTable {
            symbols: HashMap::new(),
            parent,
        }
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.symbols.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.symbols.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.symbols.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.symbols.iter()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    captured: bool,
    table: Option<SymbolTable>,
}

impl Slot {
    fn vacate(&mut self) {
        self.table = None;
        self.captured = false;
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Debug, Default)]
pub struct ScopeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ScopeArena {
    pub fn allocate(&mut self, parent: Option<ScopeId>) -> ScopeId {
        let table = Some(SymbolTable::new(parent));
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.table = table;
            slot.captured = false;
            return ScopeId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            captured: false,
            table,
        });
        ScopeId {
            index,
            generation: 0,
        }
    }

    fn slot(&self, id: ScopeId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.table.is_some())
    }

    /// `None` once the scope has been released.
    pub fn get(&self, id: ScopeId) -> Option<&SymbolTable> {
        self.slot(id).and_then(|slot| slot.table.as_ref())
    }

    pub fn get_mut(&mut self, id: ScopeId) -> Option<&mut SymbolTable> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.table.as_mut())
    }

    /// Walks outward from `id` until `name` is found.
    pub fn lookup(&self, id: ScopeId, name: &str) -> Option<Value> {
        let mut current = Some(id);
        while let Some(id) = current {
            let table = self.get(id)?;
            if let Some(value) = table.get(name) {
                return Some(value.clone());
            }
            current = table.parent;
        }
        None
    }

    /// Keeps `id` and every ancestor alive past the frames that created them.
    pub fn capture(&mut self, id: ScopeId) {
        let mut current = Some(id);
        while let Some(id) = current {
            let Some(slot) = self
                .slots
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation)
            else {
                return;
            };
            if slot.captured {
                // Ancestors of a captured scope are captured already.
                return;
            }
            slot.captured = true;
            current = slot.table.as_ref().and_then(|table| table.parent);
        }
    }

    /// Frees an uncaptured scope. Returns whether the slot was reclaimed.
    pub fn release(&mut self, id: ScopeId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.captured || slot.table.is_none() {
            return false;
        }
        slot.vacate();
        self.free.push(id.index);
        self.live -= 1;
        true
    }

    /// Frees every live scope missing from `reachable`, captured or not.
    /// Returns how many were freed.
    pub fn sweep(&mut self, reachable: &HashSet<ScopeId>) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.table.is_none() {
                continue;
            }
            let id = ScopeId {
                index: index as u32,
                generation: slot.generation,
            };
            if reachable.contains(&id) {
                continue;
            }
            slot.vacate();
            self.free.push(id.index);
            freed += 1;
        }
        self.live -= freed;
        freed
    }

    /// Number of scopes currently allocated.
    pub fn live(&self) -> usize {
        self.live
    }
}
