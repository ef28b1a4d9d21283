//! Lock event correlation engine
//!
//! Consumes [`LockEvent`]s and drives the per-(thread, lock) state machine
//! `IDLE -> WAITING -> HELD -> IDLE`:
//!
//! - `AttemptStart` opens the thread's pending wait
//! - `AttemptEnd` closes it, accounts the wait, and on success opens a pending
//!   hold keyed by (thread, lock)
//! - `Release` closes the pending hold and accounts the hold time
//!
//! Every duration is the difference of two timestamps taken on the same
//! thread. Events whose other half is missing are dropped and counted, never
//! turned into synthetic durations. All handlers are non-blocking and safe to
//! call from many threads at once.

use crate::aggregate::{AggregateStore, LockKey};
use crate::config::ProfilerConfig;
use crate::correlation::{Opened, PendingState};
use crate::event::{CallSiteId, EventSink, LockAddress, LockEvent, ThreadId};
use crate::histogram::{HistogramId, Histograms};
use crate::registry::StackRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// What the engine did with one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// A lock creation site was stored
    InitRecorded,
    /// A pending wait was opened
    WaitOpened,
    /// A wait or hold duration was accounted
    Recorded,
    /// `AttemptEnd` without a pending wait for the thread
    MissedEntry,
    /// `Release` without a pending hold for the (thread, lock) pair
    MissedAcquire,
    /// Hold measured but the statistics row it belongs to is gone
    MissingStat,
    /// A bounded table refused a new key
    Rejected,
}

/// Counters for every correlation gap
#[derive(Debug, Default)]
struct DropCounters {
    missed_entry: AtomicU64,
    missed_acquire: AtomicU64,
    missing_stat: AtomicU64,
    overwritten_wait: AtomicU64,
    rejected: AtomicU64,
}

impl DropCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of the correlation-gap counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropStats {
    pub missed_entry: u64,
    pub missed_acquire: u64,
    pub missing_stat: u64,
    pub overwritten_wait: u64,
    pub rejected: u64,
}

impl DropStats {
    pub fn total(&self) -> u64 {
        self.missed_entry
            + self.missed_acquire
            + self.missing_stat
            + self.overwritten_wait
            + self.rejected
    }
}

/// Shared state of a profiling session
#[derive(Debug)]
pub struct LockProfiler {
    registry: StackRegistry,
    pending: PendingState,
    stats: AggregateStore,
    histograms: Histograms,
    drops: DropCounters,
}

impl LockProfiler {
    pub fn new(config: &ProfilerConfig) -> Self {
        let limits = &config.limits;
        Self {
            registry: StackRegistry::new(limits.max_locks, limits.max_stacks),
            pending: PendingState::new(limits.max_pending),
            stats: AggregateStore::new(limits.max_stats, limits.overflow),
            histograms: Histograms::new(),
            drops: DropCounters::default(),
        }
    }

    /// Feed one event through the state machine
    pub fn handle(&self, event: LockEvent) -> Correlation {
        match event {
            LockEvent::Init { lock, call_site } => self.on_init(lock, call_site),
            LockEvent::AttemptStart {
                thread,
                lock,
                timestamp_ns,
            } => self.on_attempt_start(thread, lock, timestamp_ns),
            LockEvent::AttemptEnd {
                thread,
                timestamp_ns,
                call_site,
                success,
            } => self.on_attempt_end(thread, timestamp_ns, call_site, success),
            LockEvent::Release {
                thread,
                lock,
                timestamp_ns,
            } => self.on_release(thread, lock, timestamp_ns),
        }
    }

    fn on_init(&self, lock: LockAddress, call_site: Option<CallSiteId>) -> Correlation {
        if self.registry.record_init(lock, call_site) {
            Correlation::InitRecorded
        } else {
            DropCounters::bump(&self.drops.rejected);
            Correlation::Rejected
        }
    }

    fn on_attempt_start(&self, thread: ThreadId, lock: LockAddress, now: u64) -> Correlation {
        match self.pending.begin_wait(thread, lock, now) {
            Opened::New => Correlation::WaitOpened,
            Opened::Overwrote => {
                // The earlier attempt's wait is lost; last write wins
                DropCounters::bump(&self.drops.overwritten_wait);
                tracing::trace!(thread = thread.0, "pending wait overwritten");
                Correlation::WaitOpened
            }
            Opened::Rejected => {
                DropCounters::bump(&self.drops.rejected);
                Correlation::Rejected
            }
        }
    }

    fn on_attempt_end(
        &self,
        thread: ThreadId,
        now: u64,
        call_site: Option<CallSiteId>,
        success: bool,
    ) -> Correlation {
        let Some(wait) = self.pending.take_wait(thread) else {
            DropCounters::bump(&self.drops.missed_entry);
            tracing::trace!(thread = thread.0, "attempt end without pending wait");
            return Correlation::MissedEntry;
        };

        let wait_time = now.saturating_sub(wait.start_ns);
        self.histograms.increment(HistogramId::Wait, wait_time);

        let key = LockKey {
            thread,
            lock: wait.lock,
            call_site,
        };
        let mut outcome = Correlation::Recorded;
        if !self.stats.record_wait(key, wait_time, success) {
            DropCounters::bump(&self.drops.rejected);
            outcome = Correlation::Rejected;
        }

        if success
            && self.pending.begin_hold(thread, wait.lock, now, call_site) == Opened::Rejected
        {
            DropCounters::bump(&self.drops.rejected);
            outcome = Correlation::Rejected;
        }
        outcome
    }

    fn on_release(&self, thread: ThreadId, lock: LockAddress, now: u64) -> Correlation {
        let Some(hold) = self.pending.take_hold(thread, lock) else {
            DropCounters::bump(&self.drops.missed_acquire);
            tracing::trace!(thread = thread.0, lock = lock.0, "release without pending hold");
            return Correlation::MissedAcquire;
        };

        let hold_time = now.saturating_sub(hold.acquired_ns);
        self.histograms.increment(HistogramId::Hold, hold_time);

        let key = LockKey {
            thread,
            lock,
            call_site: hold.call_site,
        };
        if self.stats.add_hold(key, hold_time) {
            Correlation::Recorded
        } else {
            DropCounters::bump(&self.drops.missing_stat);
            Correlation::MissingStat
        }
    }

    pub fn registry(&self) -> &StackRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &AggregateStore {
        &self.stats
    }

    pub fn histograms(&self) -> &Histograms {
        &self.histograms
    }

    pub fn pending(&self) -> &PendingState {
        &self.pending
    }

    pub fn drops(&self) -> DropStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DropStats {
            missed_entry: load(&self.drops.missed_entry),
            missed_acquire: load(&self.drops.missed_acquire),
            missing_stat: load(&self.drops.missing_stat),
            overwritten_wait: load(&self.drops.overwritten_wait),
            rejected: load(&self.drops.rejected),
        }
    }
}

impl Default for LockProfiler {
    fn default() -> Self {
        Self::new(&ProfilerConfig::default())
    }
}

impl EventSink for LockProfiler {
    fn on_event(&self, event: LockEvent) {
        self.handle(event);
    }

    fn on_stack(&self, id: CallSiteId, frames: &[u64]) {
        if !self.registry.record_stack(id, frames) {
            DropCounters::bump(&self.drops.rejected);
        }
    }
}
