//! Bounded concurrent map with an explicit overflow policy
//!
//! Every shared table of the profiler (pending waits, pending holds, lock
//! statistics, init records, stacks) is one of these. Reads and updates of
//! existing keys only take a shard read lock; inserting a key takes that
//! shard's write lock. There is no global critical section.
//!
//! The capacity is enforced with an atomic reservation so concurrent inserts
//! can never push the table past it. When full, [`OverflowPolicy`] decides
//! whether the new key is refused or the oldest key is evicted. Evictions
//! are serialized, and a key found present never costs a row.

use clap::ValueEnum;
use crossbeam::queue::SegQueue;
use dashmap::mapref::entry::{Entry, VacantEntry};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// What a full table does with a new key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse new keys; existing keys keep accumulating
    #[default]
    RejectNew,
    /// Remove the oldest-inserted key to make room
    EvictOldest,
}

/// Result of [`BoundedMap::insert`]
#[derive(Debug, PartialEq, Eq)]
pub enum Insert<V> {
    /// The key was new
    New,
    /// The key existed; its previous value is returned
    Replaced(V),
    /// The table was full and the policy refused the key
    Rejected,
}

#[derive(Debug)]
struct Slot<V> {
    seq: u64,
    value: V,
}

/// Where a key lands once room for it is settled
enum Claim<'a, K, V> {
    Present(RefMut<'a, K, Slot<V>>),
    /// Capacity is already reserved for this entry
    Reserved(VacantEntry<'a, K, Slot<V>>),
}

/// Concurrent hash map with a hard capacity
#[derive(Debug)]
pub struct BoundedMap<K: Eq + Hash, V> {
    map: DashMap<K, Slot<V>>,
    /// Insertion order, only maintained under `EvictOldest`
    order: SegQueue<(K, u64)>,
    next_seq: AtomicU64,
    len: AtomicUsize,
    capacity: usize,
    policy: OverflowPolicy,
    evicting: Mutex<()>,
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a map holding at most `capacity` keys
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            map: DashMap::new(),
            order: SegQueue::new(),
            next_seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            capacity,
            policy,
            evicting: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite `key`
    pub fn insert(&self, key: K, value: V) -> Insert<V> {
        if let Some(mut slot) = self.map.get_mut(&key) {
            return Insert::Replaced(std::mem::replace(&mut slot.value, value));
        }
        match self.claim(key) {
            None => Insert::Rejected,
            // Lost a race with another inserter of the same key
            Some(Claim::Present(mut slot)) => {
                Insert::Replaced(std::mem::replace(&mut slot.value, value))
            }
            Some(Claim::Reserved(vacant)) => {
                self.fill(vacant, value);
                Insert::New
            }
        }
    }

    /// Insert `key` only if it is absent; returns `true` when present afterwards
    pub fn insert_if_absent(&self, key: K, init: impl FnOnce() -> V) -> bool {
        self.upsert_with(key, init, |_| ()).is_some()
    }

    /// Apply `update` to the value of `key`, creating it with `init` first if
    /// needed. Returns `None` when the key was absent and the table refused it.
    pub fn upsert_with<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&V) -> R,
    ) -> Option<R> {
        if let Some(slot) = self.map.get(&key) {
            return Some(update(&slot.value));
        }
        match self.claim(key)? {
            Claim::Present(slot) => Some(update(&slot.value)),
            Claim::Reserved(vacant) => {
                let slot = self.fill(vacant, init());
                Some(update(&slot.value))
            }
        }
    }

    /// Apply `read` to the value of an existing key
    pub fn with<R>(&self, key: &K, read: impl FnOnce(&V) -> R) -> Option<R> {
        self.map.get(key).map(|slot| read(&slot.value))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Remove `key`, returning its value
    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, slot)| {
            self.len.fetch_sub(1, Ordering::AcqRel);
            slot.value
        })
    }

    /// Copy out every entry; concurrent writers may or may not be reflected
    pub fn collect<T>(&self, mut project: impl FnMut(&K, &V) -> T) -> Vec<T> {
        self.map
            .iter()
            .map(|entry| project(entry.key(), &entry.value().value))
            .collect()
    }

    /// Find `key` or reserve room for it. Eviction only happens while the key
    /// is seen absent with the eviction lock held and no shard lock taken.
    fn claim(&self, key: K) -> Option<Claim<'_, K, V>> {
        match self.map.entry(key.clone()) {
            Entry::Occupied(occupied) => return Some(Claim::Present(occupied.into_ref())),
            Entry::Vacant(vacant) => {
                if self.try_reserve() {
                    return Some(Claim::Reserved(vacant));
                }
            }
        }
        if self.policy == OverflowPolicy::RejectNew {
            return None;
        }

        let _evicting = self.evicting.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match self.map.entry(key.clone()) {
                Entry::Occupied(occupied) => return Some(Claim::Present(occupied.into_ref())),
                Entry::Vacant(vacant) => {
                    if self.try_reserve() {
                        return Some(Claim::Reserved(vacant));
                    }
                }
            }
            if !self.evict_oldest() {
                return None;
            }
        }
    }

    fn try_reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    fn fill<'a>(&'a self, vacant: VacantEntry<'a, K, Slot<V>>, value: V) -> RefMut<'a, K, Slot<V>> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if self.policy == OverflowPolicy::EvictOldest {
            self.order.push((vacant.key().clone(), seq));
        }
        vacant.insert(Slot { seq, value })
    }

    fn evict_oldest(&self) -> bool {
        while let Some((key, seq)) = self.order.pop() {
            // Skip keys removed or re-inserted since they were queued
            if self.map.remove_if(&key, |_, slot| slot.seq == seq).is_some() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(seq, "evicted oldest key from full table");
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_and_replace() {
        let map = BoundedMap::new(4, OverflowPolicy::RejectNew);
        assert_eq!(map.insert(1u32, "a"), Insert::New);
        assert_eq!(map.insert(1u32, "b"), Insert::Replaced("a"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.with(&1, |v| *v), Some("b"));
    }

    #[test]
    fn test_reject_new_when_full() {
        let map = BoundedMap::new(2, OverflowPolicy::RejectNew);
        assert_eq!(map.insert(1u32, 10), Insert::New);
        assert_eq!(map.insert(2u32, 20), Insert::New);
        assert_eq!(map.insert(3u32, 30), Insert::Rejected);
        // Existing keys still update
        assert_eq!(map.insert(2u32, 21), Insert::Replaced(20));
        assert!(!map.contains_key(&3));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_evict_oldest_when_full() {
        let map = BoundedMap::new(2, OverflowPolicy::EvictOldest);
        map.insert(1u32, 10);
        map.insert(2u32, 20);
        assert_eq!(map.insert(3u32, 30), Insert::New);
        assert!(!map.contains_key(&1));
        assert!(map.contains_key(&2));
        assert!(map.contains_key(&3));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_evict_skips_removed_keys() {
        let map = BoundedMap::new(2, OverflowPolicy::EvictOldest);
        map.insert(1u32, 10);
        map.insert(2u32, 20);
        assert_eq!(map.remove(&1), Some(10));
        map.insert(3u32, 30);
        // Room was available, nothing evicted
        assert!(map.contains_key(&2));
        map.insert(4u32, 40);
        // Stale entry for key 1 is skipped, key 2 is the oldest live key
        assert!(!map.contains_key(&2));
        assert!(map.contains_key(&3));
        assert!(map.contains_key(&4));
    }

    #[test]
    fn test_upsert_with_creates_then_updates() {
        let map: BoundedMap<u32, AtomicU64> = BoundedMap::new(8, OverflowPolicy::RejectNew);
        for _ in 0..3 {
            map.upsert_with(5, || AtomicU64::new(0), |v| v.fetch_add(2, Ordering::Relaxed));
        }
        assert_eq!(map.with(&5, |v| v.load(Ordering::Relaxed)), Some(6));
    }

    #[test]
    fn test_upsert_rejected_returns_none() {
        let map: BoundedMap<u32, u64> = BoundedMap::new(1, OverflowPolicy::RejectNew);
        assert!(map.upsert_with(1, || 0, |_| ()).is_some());
        assert!(map.upsert_with(2, || 0, |_| ()).is_none());
    }

    #[test]
    fn test_remove_frees_capacity() {
        let map = BoundedMap::new(1, OverflowPolicy::RejectNew);
        map.insert(1u32, ());
        assert_eq!(map.insert(2u32, ()), Insert::Rejected);
        map.remove(&1);
        assert_eq!(map.insert(2u32, ()), Insert::New);
    }

    #[test]
    fn test_racing_inserts_of_one_key_evict_once() {
        let map = Arc::new(BoundedMap::new(16, OverflowPolicy::EvictOldest));
        for key in 0..16u32 {
            map.insert(key, 0u32);
        }
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    map.insert(999, t);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 16);
        assert!(map.contains_key(&999));
        // Only key 0 made room; every other original row survives
        assert!(!map.contains_key(&0));
        assert!((1..16u32).all(|key| map.contains_key(&key)));
    }

    #[test]
    fn test_concurrent_inserts_respect_capacity() {
        let map = Arc::new(BoundedMap::new(100, OverflowPolicy::RejectNew));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        map.insert(t * 1000 + i, i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 100);
        assert_eq!(map.collect(|k, _| *k).len(), 100);
    }
}
