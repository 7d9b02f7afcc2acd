//! Per-mutator thread-local runs.
//!
//! Each registered mutator owns one slot per thread-local bracket. A slot
//! holds the run the mutator currently allocates from; its mutex is only
//! contended by revocation, so the owner's fast path never waits on other
//! mutators.

use crate::run::Run;
use crate::size_class::MAX_THREAD_LOCAL_BRACKET_IDX;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifier of a mutator thread, chosen by the embedder.
///
/// [`MutatorId::RESERVED`] marks runs without an owner and is rejected by
/// the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MutatorId(pub u64);

impl MutatorId {
    pub const RESERVED: Self = Self(u64::MAX);

    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 == Self::RESERVED.0
    }
}

/// Number of brackets served from thread-local runs.
pub const NUM_THREAD_LOCAL_BRACKETS: usize = MAX_THREAD_LOCAL_BRACKET_IDX + 1;

/// One mutator's thread-local runs, indexed by bracket.
#[derive(Debug)]
pub struct ThreadRuns {
    slots: Box<[Mutex<Option<Arc<Run>>>]>,
}

impl ThreadRuns {
    fn new() -> Self {
        Self {
            slots: (0..NUM_THREAD_LOCAL_BRACKETS).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Slot for bracket `idx`, which must be a thread-local bracket.
    #[must_use]
    pub fn slot(&self, idx: usize) -> &Mutex<Option<Arc<Run>>> {
        &self.slots[idx]
    }

    /// Number of brackets with a run currently installed.
    #[must_use]
    pub fn installed(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().is_some()).count()
    }
}

/// Registry of mutators that have allocated at least once.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: RwLock<HashMap<MutatorId, Arc<ThreadRuns>>>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutator's runs, registering it on first use.
    pub fn get_or_register(&self, id: MutatorId) -> Arc<ThreadRuns> {
        // Fast path: read lock.
        if let Some(runs) = self.threads.read().get(&id) {
            return Arc::clone(runs);
        }
        // Slow path: write lock.
        Arc::clone(
            self.threads
                .write()
                .entry(id)
                .or_insert_with(|| Arc::new(ThreadRuns::new())),
        )
    }

    #[must_use]
    pub fn get(&self, id: MutatorId) -> Option<Arc<ThreadRuns>> {
        self.threads.read().get(&id).cloned()
    }

    /// All registered mutators, in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(MutatorId, Arc<ThreadRuns>)> {
        let mut all: Vec<_> = self
            .threads
            .read()
            .iter()
            .map(|(id, runs)| (*id, Arc::clone(runs)))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn remove(&self, id: MutatorId) -> Option<Arc<ThreadRuns>> {
        self.threads.write().remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SizeClassTable;

    #[test]
    fn register_once() {
        let registry = ThreadRegistry::new();
        let a = registry.get_or_register(MutatorId(1));
        let b = registry.get_or_register(MutatorId(1));
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_register(MutatorId(0));
        assert_eq!(registry.len(), 2);
        let ids: Vec<u64> = registry.snapshot().iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn remove_forgets_thread() {
        let registry = ThreadRegistry::new();
        registry.get_or_register(MutatorId(9));
        assert!(registry.remove(MutatorId(9)).is_some());
        assert!(registry.get(MutatorId(9)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn slots_cover_thread_local_brackets() {
        let table = SizeClassTable::new(4096).unwrap();
        let runs = ThreadRuns::new();
        assert_eq!(runs.installed(), 0);
        *runs.slot(MAX_THREAD_LOCAL_BRACKET_IDX).lock() =
            Some(Arc::new(Run::new(10, 0, 0, *table.layout(10))));
        assert_eq!(runs.installed(), 1);
    }
}
