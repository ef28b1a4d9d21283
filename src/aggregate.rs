//! Durable per-(thread, lock, call site) statistics

use crate::bounded::{BoundedMap, OverflowPolicy};
use crate::event::{CallSiteId, LockAddress, ThreadId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Key of a statistics row. `call_site` is the stack captured where the wait
/// ended, not where the lock was later released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LockKey {
    pub thread: ThreadId,
    pub lock: LockAddress,
    pub call_site: Option<CallSiteId>,
}

/// Cumulative statistics of one row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStat {
    pub wait_time_ns: u64,
    pub lock_time_ns: u64,
    pub enter_count: u64,
}

/// Row storage; each field is updated atomically on its own
#[derive(Debug, Default)]
struct LockStatCell {
    wait_time_ns: AtomicU64,
    lock_time_ns: AtomicU64,
    enter_count: AtomicU64,
}

impl LockStatCell {
    fn load(&self) -> LockStat {
        LockStat {
            wait_time_ns: self.wait_time_ns.load(Ordering::Relaxed),
            lock_time_ns: self.lock_time_ns.load(Ordering::Relaxed),
            enter_count: self.enter_count.load(Ordering::Relaxed),
        }
    }
}

/// Concurrent statistics table with a declared capacity
#[derive(Debug)]
pub struct AggregateStore {
    rows: BoundedMap<LockKey, LockStatCell>,
}

impl AggregateStore {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            rows: BoundedMap::new(capacity, policy),
        }
    }

    /// Add wait time to `key`, creating the row if needed.
    /// Returns `false` if the row did not exist and the table refused it.
    pub fn add_wait(&self, key: LockKey, amount_ns: u64) -> bool {
        self.rows
            .upsert_with(key, LockStatCell::default, |cell| {
                cell.wait_time_ns.fetch_add(amount_ns, Ordering::Relaxed);
            })
            .is_some()
    }

    /// Count one successful acquisition on `key`, creating the row if needed
    pub fn increment_enter_count(&self, key: LockKey) -> bool {
        self.rows
            .upsert_with(key, LockStatCell::default, |cell| {
                cell.enter_count.fetch_add(1, Ordering::Relaxed);
            })
            .is_some()
    }

    /// Add wait time and, when `acquired`, one enter in a single upsert
    pub fn record_wait(&self, key: LockKey, amount_ns: u64, acquired: bool) -> bool {
        self.rows
            .upsert_with(key, LockStatCell::default, |cell| {
                cell.wait_time_ns.fetch_add(amount_ns, Ordering::Relaxed);
                if acquired {
                    cell.enter_count.fetch_add(1, Ordering::Relaxed);
                }
            })
            .is_some()
    }

    /// Add hold time to an existing row. Never creates one: returns `false`
    /// and changes nothing when `key` is unknown.
    pub fn add_hold(&self, key: LockKey, amount_ns: u64) -> bool {
        self.rows
            .with(&key, |cell| {
                cell.lock_time_ns.fetch_add(amount_ns, Ordering::Relaxed);
            })
            .is_some()
    }

    pub fn get(&self, key: &LockKey) -> Option<LockStat> {
        self.rows.with(key, LockStatCell::load)
    }

    /// Copy of every row, ordered by key
    pub fn snapshot(&self) -> Vec<(LockKey, LockStat)> {
        let mut rows = self.rows.collect(|key, cell| (*key, cell.load()));
        rows.sort_unstable_by_key(|(key, _)| *key);
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rows.capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.rows.policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(thread: u32, lock: u64, site: u64) -> LockKey {
        LockKey {
            thread: ThreadId(thread),
            lock: LockAddress(lock),
            call_site: Some(CallSiteId(site)),
        }
    }

    #[test]
    fn test_add_wait_creates_row() {
        let store = AggregateStore::new(16, OverflowPolicy::RejectNew);
        assert!(store.add_wait(key(1, 0x100, 2), 500));
        assert!(store.add_wait(key(1, 0x100, 2), 250));
        assert!(store.increment_enter_count(key(1, 0x100, 2)));
        assert_eq!(
            store.get(&key(1, 0x100, 2)),
            Some(LockStat {
                wait_time_ns: 750,
                lock_time_ns: 0,
                enter_count: 1,
            })
        );
    }

    #[test]
    fn test_add_hold_requires_existing_row() {
        let store = AggregateStore::new(16, OverflowPolicy::RejectNew);
        assert!(!store.add_hold(key(1, 0x100, 2), 1_000));
        assert!(store.is_empty());

        store.record_wait(key(1, 0x100, 2), 10, true);
        assert!(store.add_hold(key(1, 0x100, 2), 1_000));
        assert_eq!(store.get(&key(1, 0x100, 2)).unwrap().lock_time_ns, 1_000);
    }

    #[test]
    fn test_record_wait_failed_attempt_skips_enter_count() {
        let store = AggregateStore::new(16, OverflowPolicy::RejectNew);
        store.record_wait(key(3, 0x10, 1), 40, false);
        let stat = store.get(&key(3, 0x10, 1)).unwrap();
        assert_eq!(stat.wait_time_ns, 40);
        assert_eq!(stat.enter_count, 0);
    }

    #[test]
    fn test_distinct_call_sites_are_distinct_rows() {
        let store = AggregateStore::new(16, OverflowPolicy::RejectNew);
        store.record_wait(key(1, 0x100, 1), 10, true);
        store.record_wait(key(1, 0x100, 2), 20, true);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let store = AggregateStore::new(16, OverflowPolicy::RejectNew);
        store.record_wait(key(2, 0x100, 1), 1, true);
        store.record_wait(key(1, 0x200, 1), 1, true);
        store.record_wait(key(1, 0x100, 1), 1, true);
        let keys: Vec<_> = store.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key(1, 0x100, 1), key(1, 0x200, 1), key(2, 0x100, 1)]);
    }

    #[test]
    fn test_rejected_row_reports_false() {
        let store = AggregateStore::new(1, OverflowPolicy::RejectNew);
        assert!(store.record_wait(key(1, 1, 1), 1, true));
        assert!(!store.record_wait(key(2, 1, 1), 1, true));
        assert!(store.get(&key(2, 1, 1)).is_none());
    }

    #[test]
    fn test_concurrent_updates_same_key() {
        let store = Arc::new(AggregateStore::new(16, OverflowPolicy::RejectNew));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        store.record_wait(key(1, 0x100, 1), 3, true);
                        store.add_hold(key(1, 0x100, 1), 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stat = store.get(&key(1, 0x100, 1)).unwrap();
        assert_eq!(stat.enter_count, 8_000);
        assert_eq!(stat.wait_time_ns, 24_000);
        assert_eq!(stat.lock_time_ns, 16_000);
    }
}
