//! Lock creation sites and interned call stacks

use crate::bounded::{BoundedMap, Insert, OverflowPolicy};
use crate::event::{CallSiteId, LockAddress};
use std::hash::Hasher;
use std::sync::Arc;

/// Maps lock addresses to the stack that created them and stack ids to their
/// frames. Both tables refuse new keys once full.
#[derive(Debug)]
pub struct StackRegistry {
    init_sites: BoundedMap<LockAddress, Option<CallSiteId>>,
    stacks: BoundedMap<CallSiteId, Arc<[u64]>>,
}

impl StackRegistry {
    pub fn new(max_locks: usize, max_stacks: usize) -> Self {
        Self {
            init_sites: BoundedMap::new(max_locks, OverflowPolicy::RejectNew),
            stacks: BoundedMap::new(max_stacks, OverflowPolicy::RejectNew),
        }
    }

    /// Upsert the creation site of `lock`; a reused address overwrites.
    /// Returns `false` when the table is full.
    pub fn record_init(&self, lock: LockAddress, call_site: Option<CallSiteId>) -> bool {
        !matches!(self.init_sites.insert(lock, call_site), Insert::Rejected)
    }

    /// Store the frames of `id` unless already known. Ids are reused by the
    /// capture side, so a second store for the same id is a no-op.
    pub fn record_stack(&self, id: CallSiteId, frames: &[u64]) -> bool {
        self.stacks.insert_if_absent(id, || Arc::from(frames))
    }

    /// Frames of a stack, innermost first
    pub fn frames(&self, id: CallSiteId) -> Option<Arc<[u64]>> {
        self.stacks.with(&id, Arc::clone)
    }

    /// Creation site of `lock`. The outer `Option` is whether the lock was
    /// seen being created at all; the inner one whether its stack was captured.
    pub fn init_site_of(&self, lock: LockAddress) -> Option<Option<CallSiteId>> {
        self.init_sites.with(&lock, |site| *site)
    }

    /// All init records, ordered by lock address
    pub fn init_records(&self) -> Vec<(LockAddress, Option<CallSiteId>)> {
        let mut records = self.init_sites.collect(|lock, site| (*lock, *site));
        records.sort_unstable_by_key(|(lock, _)| *lock);
        records
    }

    pub fn lock_count(&self) -> usize {
        self.init_sites.len()
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }
}

/// Stable id for a frame sequence (FNV-1a over the addresses)
///
/// Identical stacks always intern to the same id, which is what lets the
/// aggregate store merge rows captured on different invocations.
pub fn stack_id(frames: &[u64]) -> CallSiteId {
    let mut hasher = fnv::FnvHasher::default();
    for frame in frames {
        hasher.write(&frame.to_le_bytes());
    }
    CallSiteId(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_init_upserts() {
        let registry = StackRegistry::new(8, 8);
        assert!(registry.record_init(LockAddress(0x100), Some(CallSiteId(1))));
        assert_eq!(
            registry.init_site_of(LockAddress(0x100)),
            Some(Some(CallSiteId(1)))
        );
        // Address reused by a later creation
        registry.record_init(LockAddress(0x100), Some(CallSiteId(2)));
        assert_eq!(
            registry.init_site_of(LockAddress(0x100)),
            Some(Some(CallSiteId(2)))
        );
        assert_eq!(registry.lock_count(), 1);
    }

    #[test]
    fn test_unknown_lock_has_no_init_site() {
        let registry = StackRegistry::new(8, 8);
        assert_eq!(registry.init_site_of(LockAddress(0xdead)), None);
    }

    #[test]
    fn test_record_stack_is_idempotent() {
        let registry = StackRegistry::new(8, 8);
        registry.record_stack(CallSiteId(5), &[1, 2, 3]);
        registry.record_stack(CallSiteId(5), &[9, 9]);
        assert_eq!(registry.frames(CallSiteId(5)).as_deref(), Some(&[1, 2, 3][..]));
        assert_eq!(registry.stack_count(), 1);
    }

    #[test]
    fn test_init_records_sorted_by_address() {
        let registry = StackRegistry::new(8, 8);
        registry.record_init(LockAddress(0x300), None);
        registry.record_init(LockAddress(0x100), Some(CallSiteId(1)));
        registry.record_init(LockAddress(0x200), None);
        let addresses: Vec<_> = registry
            .init_records()
            .into_iter()
            .map(|(lock, _)| lock.0)
            .collect();
        assert_eq!(addresses, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn test_full_registry_rejects_new_locks() {
        let registry = StackRegistry::new(1, 1);
        assert!(registry.record_init(LockAddress(1), None));
        assert!(!registry.record_init(LockAddress(2), None));
        assert!(registry.record_stack(CallSiteId(1), &[1]));
        assert!(!registry.record_stack(CallSiteId(2), &[2]));
    }

    #[test]
    fn test_stack_id_is_deterministic() {
        assert_eq!(stack_id(&[1, 2, 3]), stack_id(&[1, 2, 3]));
        assert_ne!(stack_id(&[1, 2, 3]), stack_id(&[3, 2, 1]));
        assert_ne!(stack_id(&[1]), stack_id(&[1, 0]));
    }
}
