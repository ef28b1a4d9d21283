//! Transient correlation state
//!
//! A thread waiting for a lock has one [`PendingWait`]; a thread holding a
//! lock has one [`PendingHold`] per held lock. Both are consumed by the event
//! that closes them. Lookups return `Option` and callers drop the event on
//! `None`; a missing entry is never read as a zero duration.

use crate::bounded::{BoundedMap, Insert, OverflowPolicy};
use crate::event::{CallSiteId, LockAddress, ThreadId};

/// A thread that started acquiring `lock` at `start_ns`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWait {
    pub lock: LockAddress,
    pub start_ns: u64,
}

/// A lock acquired at `acquired_ns`, waited for at `call_site`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingHold {
    pub acquired_ns: u64,
    pub call_site: Option<CallSiteId>,
}

/// Outcome of opening a pending entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    New,
    /// An unconsumed entry for the same key was overwritten
    Overwrote,
    /// The table is full
    Rejected,
}

impl<V> From<Insert<V>> for Opened {
    fn from(insert: Insert<V>) -> Self {
        match insert {
            Insert::New => Opened::New,
            Insert::Replaced(_) => Opened::Overwrote,
            Insert::Rejected => Opened::Rejected,
        }
    }
}

#[derive(Debug)]
pub struct PendingState {
    waits: BoundedMap<ThreadId, PendingWait>,
    holds: BoundedMap<(ThreadId, LockAddress), PendingHold>,
}

impl PendingState {
    pub fn new(capacity: usize) -> Self {
        Self {
            waits: BoundedMap::new(capacity, OverflowPolicy::RejectNew),
            holds: BoundedMap::new(capacity, OverflowPolicy::RejectNew),
        }
    }

    /// Open the wait of `thread`; last write wins if one was already open
    pub fn begin_wait(&self, thread: ThreadId, lock: LockAddress, start_ns: u64) -> Opened {
        self.waits
            .insert(thread, PendingWait { lock, start_ns })
            .into()
    }

    pub fn take_wait(&self, thread: ThreadId) -> Option<PendingWait> {
        self.waits.remove(&thread)
    }

    pub fn begin_hold(
        &self,
        thread: ThreadId,
        lock: LockAddress,
        acquired_ns: u64,
        call_site: Option<CallSiteId>,
    ) -> Opened {
        self.holds
            .insert(
                (thread, lock),
                PendingHold {
                    acquired_ns,
                    call_site,
                },
            )
            .into()
    }

    pub fn take_hold(&self, thread: ThreadId, lock: LockAddress) -> Option<PendingHold> {
        self.holds.remove(&(thread, lock))
    }

    pub fn waiting(&self) -> usize {
        self.waits.len()
    }

    pub fn holding(&self) -> usize {
        self.holds.len()
    }
}
