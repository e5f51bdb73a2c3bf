//! Handle-based resource registry for moor.
//!
//! Script code never holds references to host resources directly; it holds
//! integer handles into a [`Registry`]. The registry owns the values, hands
//! out ids, and serializes all access behind one mutex, so binding code can
//! be called from any thread without extra coordination.
//!
//! This crate is the dependency-minimal leaf of the workspace: no IO, no
//! threads, no logging. The background-run layer in `moor-runs` builds on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Integer handle referencing a value stored in a [`Registry`].
///
/// Handles are only meaningful to the registry that issued them; nothing
/// prevents presenting a handle to the wrong registry, which simply misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct HandleId(u32);

impl HandleId {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Storage for the new entry could not be reserved. Surfaced instead of
    /// aborting so the host can fail the one scripted call that hit it.
    #[error("registry storage could not be reserved for a new entry")]
    OutOfMemory,
}

struct RegistryInner<T> {
    next_id: u32,
    entries: HashMap<HandleId, T>,
}

impl<T> RegistryInner<T> {
    /// Allocate the next free id.
    ///
    /// Monotonic with wraparound at `u32::MAX`; after wrapping, probes
    /// forward past any id still occupied. Effectively O(1): the id space
    /// wraps at 2^32 before any reuse is possible.
    fn allocate_id(&mut self) -> HandleId {
        loop {
            let id = HandleId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Mutex-guarded map from [`HandleId`] to a caller-typed value, with unique
/// id allocation.
///
/// Every operation holds the registry's single mutex for its full duration,
/// including id allocation during insertion, so two concurrent callers never
/// observe the same id. Values are read back either by owned copy ([`get`])
/// or through a closure whose borrow cannot outlive the held lock
/// ([`with`] / [`with_mut`]).
///
/// [`get`]: Registry::get
/// [`with`]: Registry::with
/// [`with_mut`]: Registry::with_mut
pub struct Registry<T> {
    inner: Mutex<RegistryInner<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Registry<T> {
    /// Create an empty registry. Ids start at 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// A panicked lock holder must not wedge every later caller (the
    /// shutdown drain in particular), so poisoning is stripped.
    fn lock(&self) -> MutexGuard<'_, RegistryInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under a freshly allocated id and return the id.
    pub fn insert(&self, value: T) -> Result<HandleId, RegistryError> {
        self.insert_with(|_| value)
    }

    /// Allocate an id and store the value `build` constructs from it, all
    /// under one lock acquisition. For resources that need to know their
    /// own handle.
    pub fn insert_with(
        &self,
        build: impl FnOnce(HandleId) -> T,
    ) -> Result<HandleId, RegistryError> {
        let mut inner = self.lock();
        inner
            .entries
            .try_reserve(1)
            .map_err(|_| RegistryError::OutOfMemory)?;
        let id = inner.allocate_id();
        let value = build(id);
        inner.entries.insert(id, value);
        Ok(id)
    }

    /// Owned copy of the entry, or `None` if the id is not live.
    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<T>
    where
        T: Clone,
    {
        self.lock().entries.get(&id).cloned()
    }

    /// Run `f` against a shared borrow of the entry while the registry lock
    /// is held. Returns `None` without calling `f` if the id is not live.
    ///
    /// `f` must not call back into the same registry.
    pub fn with<R>(&self, id: HandleId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().entries.get(&id).map(f)
    }

    /// Run `f` against an exclusive borrow of the entry while the registry
    /// lock is held. This is the only way to mutate an entry in place.
    ///
    /// `f` must not call back into the same registry.
    pub fn with_mut<R>(&self, id: HandleId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock().entries.get_mut(&id).map(f)
    }

    /// Remove the entry if present and hand it back. Removing an id that is
    /// not live (including a second remove of the same id) is a no-op.
    pub fn remove(&self, id: HandleId) -> Option<T> {
        self.lock().entries.remove(&id)
    }

    /// Whether the id refers to a live entry.
    #[must_use]
    pub fn contains(&self, id: HandleId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// An arbitrary live id, or `None` when the registry is empty. Drives
    /// exhaustive pop-one-join-one drain loops.
    #[must_use]
    pub fn any_id(&self) -> Option<HandleId> {
        self.lock().entries.keys().next().copied()
    }

    /// Take every live entry in one lock acquisition.
    ///
    /// Entries inserted concurrently after the call are not included.
    #[must_use]
    pub fn drain(&self) -> Vec<(HandleId, T)> {
        self.lock().entries.drain().collect()
    }

    /// Take every live entry in one lock acquisition and invoke `f` once
    /// per entry. The callback runs after the lock is released, so it may
    /// re-enter this registry (e.g. to insert replacement entries).
    pub fn drain_with(&self, mut f: impl FnMut(HandleId, T)) {
        let drained = self.drain();
        for (id, value) in drained {
            f(id, value);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Position the id allocator, for exercising wraparound in tests.
    #[cfg(test)]
    fn set_next_id(&self, next_id: u32) {
        self.lock().next_id = next_id;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = Registry::new();
        let id = registry.insert(vec![1u8, 2, 3]).unwrap();
        assert_eq!(registry.get(id), Some(vec![1, 2, 3]));
    }

    #[test]
    fn default_entry_reads_back_as_default() {
        let registry = Registry::<[u8; 8]>::new();
        let id = registry.insert(<[u8; 8]>::default()).unwrap();
        assert_eq!(registry.get(id), Some([0u8; 8]));
    }

    #[test]
    fn insert_with_sees_the_returned_id() {
        let registry = Registry::new();
        let id = registry.insert_with(|id| id.value() as u64 * 10).unwrap();
        assert_eq!(registry.get(id), Some(u64::from(id.value()) * 10));
    }

    #[test]
    fn remove_then_get_misses() {
        let registry = Registry::new();
        let id = registry.insert("payload").unwrap();
        assert_eq!(registry.remove(id), Some("payload"));
        assert_eq!(registry.get(id), None);
        assert!(!registry.contains(id));
    }

    #[test]
    fn double_remove_is_a_noop() {
        let registry = Registry::new();
        let id = registry.insert(7u32).unwrap();
        assert_eq!(registry.remove(id), Some(7));
        assert_eq!(registry.remove(id), None);
    }

    #[test]
    fn get_on_unknown_id_misses() {
        let registry = Registry::<u32>::new();
        assert_eq!(registry.get(HandleId::new(42)), None);
        assert_eq!(registry.with(HandleId::new(42), |v| *v), None);
    }

    #[test]
    fn with_mut_mutates_in_place() {
        let registry = Registry::new();
        let id = registry.insert(vec![0u8; 4]).unwrap();
        registry.with_mut(id, |buf| buf[2] = 9).unwrap();
        assert_eq!(registry.get(id), Some(vec![0, 0, 9, 0]));
    }

    #[test]
    fn ids_are_monotonic_and_released_ids_are_not_reused() {
        let registry = Registry::new();
        let a = registry.insert(0u8).unwrap();
        let b = registry.insert(1u8).unwrap();
        let c = registry.insert(2u8).unwrap();
        assert_eq!((a.value(), b.value(), c.value()), (0, 1, 2));

        registry.remove(b);
        let d = registry.insert(3u8).unwrap();
        assert_ne!(d, a);
        assert_ne!(d, c);
        assert_eq!(d.value(), 3);
    }

    #[test]
    fn allocator_probes_past_occupied_ids_after_wraparound() {
        let registry = Registry::new();
        let early = registry.insert("early").unwrap();
        assert_eq!(early.value(), 0);

        registry.set_next_id(u32::MAX);
        let last = registry.insert("last").unwrap();
        assert_eq!(last.value(), u32::MAX);

        // next_id wrapped to 0, which is still occupied: the allocator must
        // skip it rather than hand out a duplicate.
        let wrapped = registry.insert("wrapped").unwrap();
        assert_eq!(wrapped.value(), 1);
        assert_eq!(registry.get(early), Some("early"));
    }

    #[test]
    fn concurrent_inserts_return_distinct_ids() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 64;

        let registry = Arc::new(Registry::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..PER_THREAD)
                        .map(|i| registry.insert(t * PER_THREAD + i).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} issued twice");
            }
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
        assert_eq!(registry.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn drain_with_visits_each_entry_exactly_once() {
        let registry = Registry::new();
        let mut expected = HashSet::new();
        for n in 0..5u32 {
            expected.insert(registry.insert(n).unwrap());
        }

        let mut visited = HashSet::new();
        registry.drain_with(|id, _value| {
            assert!(visited.insert(id), "entry {id} visited twice");
            assert!(expected.contains(&id));
        });

        assert_eq!(visited, expected);
        assert_eq!(registry.any_id(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_with_callback_may_reenter_the_registry() {
        let registry = Registry::new();
        registry.insert(1u32).unwrap();
        registry.insert(2u32).unwrap();

        // Re-entrant insert from the drain callback must not deadlock.
        registry.drain_with(|_, value| {
            if value == 1 {
                registry.insert(100).unwrap();
            }
        });

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dropping_a_drained_registry_is_clean() {
        let registry = Registry::new();
        let id = registry.insert(0u8).unwrap();
        registry.remove(id);
        assert!(registry.is_empty());
        drop(registry);
    }

    #[test]
    fn any_id_reports_some_live_id() {
        let registry = Registry::new();
        assert_eq!(registry.any_id(), None);
        let id = registry.insert(5u8).unwrap();
        assert_eq!(registry.any_id(), Some(id));
    }
}
