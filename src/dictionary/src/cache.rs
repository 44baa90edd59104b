// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cache slot lifecycle shared by every pooled, key-addressed,
//! storage-backed object in the dictionary.
//!
//! A [`CacheManager`] owns a bounded pool of slots. A slot is created empty,
//! bound to a key (either seeded with a value the caller already has, or
//! populated by reading through to storage), handed out as a shared instance
//! to every caller that resolves the same key, and released back to the pool.
//! Slots whose payload carries un-persisted state write it back through
//! [`CacheEntry::flush`] when evicted.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::error::DictionaryError;

/// The contract a cached object implements so a [`CacheManager`] can
/// allocate, populate, and recycle slots without knowing the concrete type.
///
/// `Ctx` is whatever a read-through or write-back needs: the catalog store
/// for descriptor caches, the caller's transaction for the sequence cache.
pub trait CacheEntry<Ctx: ?Sized>: Debug + Send + Sync + Sized {
    type Key: Ord + Clone + Debug;
    /// An already-materialized payload, for the seeded bind path.
    type Seed;

    /// Binds a slot to `key` with a value the caller already has (e.g. a
    /// descriptor it just inserted). Returns `None` if the seed is empty, in
    /// which case the cache retains nothing.
    fn bind_new(key: Self::Key, seed: Self::Seed) -> Option<Self>;

    /// Binds a slot to `key` by reading through to storage. Returns
    /// `Ok(None)` if the value does not exist; storage failures propagate
    /// verbatim and leave no slot behind.
    fn bind_by_key(key: &Self::Key, ctx: &Ctx) -> Result<Option<Self>, DictionaryError>;

    /// The currently bound key.
    fn key(&self) -> &Self::Key;

    /// Whether the payload carries state that must be written back before
    /// the slot can be discarded.
    fn is_dirty(&self) -> bool {
        false
    }

    /// Write-back hook invoked before eviction when [`is_dirty`] reports
    /// `true`. `for_removal` is `true` when the slot will not survive.
    ///
    /// [`is_dirty`]: CacheEntry::is_dirty
    fn flush(&self, ctx: &Ctx, for_removal: bool) -> Result<(), DictionaryError> {
        let _ = (ctx, for_removal);
        Ok(())
    }

    /// Hook invoked when the slot is detached from its key. Idempotent and
    /// infallible.
    fn release(&self) {}
}

#[derive(Debug)]
enum Slot<C> {
    /// A lookup is populating this key; concurrent lookups of the same key
    /// wait for it so all of them resolve to the same instance.
    Filling,
    Bound(BoundSlot<C>),
}

#[derive(Debug)]
struct BoundSlot<C> {
    entry: Arc<C>,
    /// Number of callers holding this slot; held slots are never evicted.
    holds: usize,
    last_used: u64,
}

#[derive(Debug)]
struct CacheState<K, C> {
    slots: BTreeMap<K, Slot<C>>,
    /// Monotonic use counter driving LRU eviction.
    tick: u64,
}

/// A bounded pool of key-addressed cache slots.
#[derive(Debug)]
pub struct CacheManager<K, C> {
    name: &'static str,
    capacity: usize,
    state: Mutex<CacheState<K, C>>,
    filled: Condvar,
}

enum Probe<C> {
    Hit(Arc<C>),
    Wait,
    Claimed,
}

impl<K: Ord + Clone + Debug, C> CacheManager<K, C> {
    pub fn new(name: &'static str, capacity: usize) -> CacheManager<K, C> {
        CacheManager {
            name,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                slots: BTreeMap::new(),
                tick: 0,
            }),
            filled: Condvar::new(),
        }
    }

    /// Finds the slot bound to `key`, reading through to storage on a miss.
    ///
    /// Every caller resolving the same key is handed the same instance. The
    /// returned hold must be paired with a [`release`]. The read-through runs
    /// outside the cache lock; a placeholder registered under the key first
    /// makes concurrent lookups of the key wait for it rather than racing a
    /// second read.
    ///
    /// [`release`]: CacheManager::release
    pub fn find<Ctx: ?Sized>(
        &self,
        key: &K,
        ctx: &Ctx,
    ) -> Result<Option<Arc<C>>, DictionaryError>
    where
        C: CacheEntry<Ctx, Key = K>,
    {
        let mut guard = self.state.lock().expect("lock poisoned");
        loop {
            guard.tick += 1;
            let tick = guard.tick;
            let probe = match guard.slots.get_mut(key) {
                Some(Slot::Bound(slot)) => {
                    slot.holds += 1;
                    slot.last_used = tick;
                    Probe::Hit(Arc::clone(&slot.entry))
                }
                Some(Slot::Filling) => Probe::Wait,
                None => Probe::Claimed,
            };
            match probe {
                Probe::Hit(entry) => return Ok(Some(entry)),
                Probe::Wait => {
                    guard = self.filled.wait(guard).expect("lock poisoned");
                }
                Probe::Claimed => {
                    guard.slots.insert(key.clone(), Slot::Filling);
                    break;
                }
            }
        }
        drop(guard);

        let bound = C::bind_by_key(key, ctx);

        let mut guard = self.state.lock().expect("lock poisoned");
        let out = match bound {
            Ok(Some(entry)) => {
                let entry = Arc::new(entry);
                let state = &mut *guard;
                state.tick += 1;
                state.slots.insert(
                    key.clone(),
                    Slot::Bound(BoundSlot {
                        entry: Arc::clone(&entry),
                        holds: 1,
                        last_used: state.tick,
                    }),
                );
                Ok(Some(entry))
            }
            Ok(None) => {
                guard.slots.remove(key);
                Ok(None)
            }
            Err(err) => {
                guard.slots.remove(key);
                Err(err)
            }
        };
        self.filled.notify_all();
        let victims = if out.is_ok() {
            self.evict_excess(&mut guard)
        } else {
            Vec::new()
        };
        drop(guard);
        self.retire(victims, ctx);
        out
    }

    /// Hit-only lookup: returns the bound slot without reading through.
    /// A `Some` return takes a hold that must be paired with a [`release`].
    ///
    /// [`release`]: CacheManager::release
    pub fn find_cached(&self, key: &K) -> Option<Arc<C>> {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.tick += 1;
        let tick = guard.tick;
        match guard.slots.get_mut(key) {
            Some(Slot::Bound(slot)) => {
                slot.holds += 1;
                slot.last_used = tick;
                Some(Arc::clone(&slot.entry))
            }
            _ => None,
        }
    }

    /// Seeds the cache with an already-materialized value (the `bind_new`
    /// path). Returns whether the value was retained; a key that is already
    /// bound or being filled keeps its existing slot.
    pub fn cache_new<Ctx: ?Sized>(&self, key: K, seed: C::Seed, ctx: &Ctx) -> bool
    where
        C: CacheEntry<Ctx, Key = K>,
    {
        let Some(entry) = C::bind_new(key.clone(), seed) else {
            return false;
        };
        let mut guard = self.state.lock().expect("lock poisoned");
        if guard.slots.contains_key(&key) {
            return false;
        }
        let state = &mut *guard;
        state.tick += 1;
        state.slots.insert(
            key,
            Slot::Bound(BoundSlot {
                entry: Arc::new(entry),
                holds: 0,
                last_used: state.tick,
            }),
        );
        let victims = self.evict_excess(&mut guard);
        drop(guard);
        self.retire(victims, ctx);
        true
    }

    /// Drops one hold on the slot bound to `key`.
    pub fn release(&self, key: &K) {
        let mut guard = self.state.lock().expect("lock poisoned");
        if let Some(Slot::Bound(slot)) = guard.slots.get_mut(key) {
            debug_assert!(slot.holds > 0, "release without a matching find");
            slot.holds = slot.holds.saturating_sub(1);
        }
    }

    /// Evicts every unheld slot, flushing dirty payloads first. Used for
    /// DDL-driven metadata invalidation.
    pub fn evict_all<Ctx: ?Sized>(&self, ctx: &Ctx)
    where
        C: CacheEntry<Ctx, Key = K>,
    {
        let mut guard = self.state.lock().expect("lock poisoned");
        let unheld: Vec<K> = guard
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Bound(bound) if bound.holds == 0 => Some(key.clone()),
                _ => None,
            })
            .collect();
        let mut victims = Vec::with_capacity(unheld.len());
        for key in unheld {
            if let Some(Slot::Bound(bound)) = guard.slots.remove(&key) {
                victims.push(bound.entry);
            }
        }
        drop(guard);
        debug!(cache = self.name, evicted = victims.len(), "cache cleared");
        self.retire(victims, ctx);
    }

    /// Number of bound slots, for introspection and tests.
    pub fn len(&self) -> usize {
        let guard = self.state.lock().expect("lock poisoned");
        guard
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Bound(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes least-recently-used unheld slots until the pool fits its
    /// capacity. Callers flush the returned victims outside the cache lock.
    fn evict_excess(&self, state: &mut CacheState<K, C>) -> Vec<Arc<C>> {
        let mut victims = Vec::new();
        loop {
            let bound = state
                .slots
                .values()
                .filter(|slot| matches!(slot, Slot::Bound(_)))
                .count();
            if bound <= self.capacity {
                break;
            }
            let lru = state
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Bound(bound) if bound.holds == 0 => {
                        Some((bound.last_used, key.clone()))
                    }
                    _ => None,
                })
                .min();
            let Some((_, key)) = lru else {
                // Everything is held; run over capacity rather than evict a
                // slot someone is using.
                break;
            };
            if let Some(Slot::Bound(bound)) = state.slots.remove(&key) {
                victims.push(bound.entry);
            }
        }
        victims
    }

    /// Flushes and detaches evicted slots. Write-back failures are logged,
    /// not propagated: the entry is already gone from the pool, and the cost
    /// of a lost flush is bounded (for sequences, a gap).
    fn retire<Ctx: ?Sized>(&self, victims: Vec<Arc<C>>, ctx: &Ctx)
    where
        C: CacheEntry<Ctx, Key = K>,
    {
        for entry in victims {
            if entry.is_dirty() {
                if let Err(err) = entry.flush(ctx, true) {
                    warn!(
                        cache = self.name,
                        key = ?entry.key(),
                        %err,
                        "failed to flush evicted cache entry",
                    );
                }
            }
            entry.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Counts read-throughs so tests can observe cache behavior.
    #[derive(Debug, Default)]
    struct TestStore {
        binds: AtomicUsize,
    }

    #[derive(Debug)]
    struct TestEntry {
        key: String,
        value: String,
    }

    impl CacheEntry<TestStore> for TestEntry {
        type Key = String;
        type Seed = String;

        fn bind_new(key: String, seed: String) -> Option<Self> {
            if seed.is_empty() {
                return None;
            }
            Some(TestEntry { key, value: seed })
        }

        fn bind_by_key(key: &String, ctx: &TestStore) -> Result<Option<Self>, DictionaryError> {
            ctx.binds.fetch_add(1, Ordering::SeqCst);
            if key.starts_with("missing") {
                return Ok(None);
            }
            Ok(Some(TestEntry {
                key: key.clone(),
                value: format!("loaded-{key}"),
            }))
        }

        fn key(&self) -> &String {
            &self.key
        }
    }

    #[test]
    fn find_reads_through_once() {
        let store = TestStore::default();
        let cache: CacheManager<String, TestEntry> = CacheManager::new("test", 8);

        let entry = cache.find(&"a".to_string(), &store).unwrap().unwrap();
        assert_eq!(entry.value, "loaded-a");
        cache.release(&"a".to_string());

        let again = cache.find(&"a".to_string(), &store).unwrap().unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        cache.release(&"a".to_string());
        assert_eq!(store.binds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_value_leaves_no_slot() {
        let store = TestStore::default();
        let cache: CacheManager<String, TestEntry> = CacheManager::new("test", 8);
        assert!(cache.find(&"missing-1".to_string(), &store).unwrap().is_none());
        assert!(cache.is_empty());
        // a second lookup reads through again
        assert!(cache.find(&"missing-1".to_string(), &store).unwrap().is_none());
        assert_eq!(store.binds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_seed_is_not_retained() {
        let store = TestStore::default();
        let cache: CacheManager<String, TestEntry> = CacheManager::new("test", 8);
        assert!(!cache.cache_new("a".to_string(), String::new(), &store));
        assert!(cache.is_empty());
        assert!(cache.cache_new("a".to_string(), "seeded".to_string(), &store));
        assert_eq!(cache.find_cached(&"a".to_string()).unwrap().value, "seeded");
        cache.release(&"a".to_string());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = TestStore::default();
        let cache: CacheManager<String, TestEntry> = CacheManager::new("test", 2);
        for key in ["a", "b"] {
            cache.find(&key.to_string(), &store).unwrap().unwrap();
            cache.release(&key.to_string());
        }
        // touch "a" so "b" is the LRU victim
        cache.find_cached(&"a".to_string()).unwrap();
        cache.release(&"a".to_string());

        cache.find(&"c".to_string(), &store).unwrap().unwrap();
        cache.release(&"c".to_string());

        assert!(cache.find_cached(&"a".to_string()).is_some());
        cache.release(&"a".to_string());
        assert!(cache.find_cached(&"b".to_string()).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn held_slots_survive_eviction() {
        let store = TestStore::default();
        let cache: CacheManager<String, TestEntry> = CacheManager::new("test", 1);
        let held = cache.find(&"a".to_string(), &store).unwrap().unwrap();
        // over capacity, but "a" is held and must survive
        cache.find(&"b".to_string(), &store).unwrap().unwrap();
        cache.release(&"b".to_string());
        assert!(cache.find_cached(&"a".to_string()).is_some());
        cache.release(&"a".to_string());
        drop(held);
    }

    #[test]
    fn concurrent_lookups_share_one_read_through() {
        let store = Arc::new(TestStore::default());
        let cache: Arc<CacheManager<String, TestEntry>> =
            Arc::new(CacheManager::new("test", 8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                let entry = cache.find(&"hot".to_string(), store.as_ref()).unwrap().unwrap();
                cache.release(&"hot".to_string());
                Arc::as_ptr(&entry) as usize
            }));
        }
        let pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.binds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn evict_all_spares_held_slots() {
        let store = TestStore::default();
        let cache: CacheManager<String, TestEntry> = CacheManager::new("test", 8);
        cache.find(&"held".to_string(), &store).unwrap().unwrap();
        cache.find(&"idle".to_string(), &store).unwrap().unwrap();
        cache.release(&"idle".to_string());

        cache.evict_all(&store);
        assert!(cache.find_cached(&"held".to_string()).is_some());
        cache.release(&"held".to_string());
        assert!(cache.find_cached(&"idle".to_string()).is_none());
        cache.release(&"held".to_string());
    }
}
