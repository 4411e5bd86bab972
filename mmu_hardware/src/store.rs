use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use mmu_traits::{HwResult, PersistenceStore, StoredValue};

#[derive(Debug, Default)]
struct Slots {
    staged: HashMap<String, StoredValue>,
    durable: HashMap<String, StoredValue>,
    flushes: u32,
}

/// Volatile store; `flush` promotes staged values to the durable snapshot.
///
/// Clones share the same slots so a test can keep a handle while the
/// transport owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    slots: Rc<RefCell<Slots>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value as if it had been persisted by a previous run.
    pub fn with_value(self, key: &str, value: StoredValue) -> Self {
        {
            let mut s = self.slots.borrow_mut();
            s.staged.insert(key.to_string(), value.clone());
            s.durable.insert(key.to_string(), value);
        }
        self
    }

    pub fn durable(&self, key: &str) -> Option<StoredValue> {
        self.slots.borrow().durable.get(key).cloned()
    }

    pub fn flushes(&self) -> u32 {
        self.slots.borrow().flushes
    }
}

impl PersistenceStore for MemoryStore {
    fn get(&self, key: &str, default: StoredValue) -> StoredValue {
        self.slots.borrow().staged.get(key).cloned().unwrap_or(default)
    }

    fn set(&mut self, key: &str, value: StoredValue) {
        self.slots.borrow_mut().staged.insert(key.to_string(), value);
    }

    fn flush(&mut self) -> HwResult<()> {
        let mut s = self.slots.borrow_mut();
        let staged = s.staged.clone();
        s.durable = staged;
        s.flushes += 1;
        Ok(())
    }
}
