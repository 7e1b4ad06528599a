//! Handle tables
//!
//! A `HandleTable` maps small integers to resource records. Each resource
//! kind owns its own table and advances its counter by a distinct stride, so
//! port handles, process handles and watcher handles rarely share values
//! while debugging. Callers should only rely on uniqueness.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// A small integer naming a live resource. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-kind allocation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleKind {
    pub name: &'static str,
    pub stride: u32,
}

impl HandleKind {
    pub const PORT: HandleKind = HandleKind {
        name: "port",
        stride: 32771,
    };
    pub const PROCESS: HandleKind = HandleKind {
        name: "process",
        stride: 32779,
    };
    pub const LISTENER: HandleKind = HandleKind {
        name: "listener",
        stride: 32789,
    };
    pub const HASH: HandleKind = HandleKind {
        name: "hash",
        stride: 32797,
    };
    pub const WATCHER: HandleKind = HandleKind {
        name: "watcher",
        stride: 32801,
    };
}

struct Slots<T> {
    last: u32,
    entries: HashMap<u32, T>,
}

/// Internally synchronized handle table for one resource kind.
///
/// All operations take the same lock, so allocate, deallocate and lookup
/// are mutually exclusive across worker threads and the dispatch thread.
pub struct HandleTable<T> {
    kind: HandleKind,
    slots: Mutex<Slots<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: HandleKind) -> Self {
        Self::starting_at(kind, 0)
    }

    /// Create a table whose next probe starts one stride past `last`.
    pub fn starting_at(kind: HandleKind, last: u32) -> Self {
        Self {
            kind,
            slots: Mutex::new(Slots {
                last,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Store a record and return a handle no live record is using.
    ///
    /// Strides are odd, so probing visits every `u32` before repeating.
    pub fn allocate(&self, record: T) -> Handle {
        let mut slots = self.slots.lock();
        let mut candidate = slots.last;
        loop {
            candidate = candidate.wrapping_add(self.kind.stride);
            if candidate != 0 && !slots.entries.contains_key(&candidate) {
                break;
            }
        }
        slots.last = candidate;
        slots.entries.insert(candidate, record);
        log::trace!("allocated {} handle {}", self.kind.name, candidate);
        Handle(candidate)
    }

    /// Erase a handle, handing its record back to the caller.
    pub fn deallocate(&self, handle: Handle) -> Option<T> {
        let record = self.slots.lock().entries.remove(&handle.0);
        if record.is_some() {
            log::trace!("released {} handle {}", self.kind.name, handle);
        }
        record
    }

    /// Erase a handle only if its record still satisfies `matches`.
    pub fn remove_if(&self, handle: Handle, matches: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut slots = self.slots.lock();
        match slots.entries.get(&handle.0) {
            Some(record) if matches(record) => slots.entries.remove(&handle.0),
            _ => None,
        }
    }

    /// Borrow a record under the table lock.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slots.lock().entries.get(&handle.0).map(f)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.lock().entries.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().entries.is_empty()
    }
}

impl<T: Clone> HandleTable<T> {
    /// Copy of the record, or `None` for an unknown or erased handle.
    pub fn lookup(&self, handle: Handle) -> Option<T> {
        self.slots.lock().entries.get(&handle.0).cloned()
    }
}
