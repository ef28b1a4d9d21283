//! Typed lock lifecycle events and the adapters that produce them
//!
//! The instrumentation backend reports raw hook invocations (entry of the
//! lock-create, lock-acquire and lock-release functions, and return of
//! lock-acquire). `translate` shapes each one into a [`LockEvent`] for the
//! correlation engine, capturing a call site where the event needs one.

use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Address of a lock instance in the target process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LockAddress(pub u64);

impl fmt::LowerHex for LockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Kernel thread id of the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an interned call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CallSiteId(pub u64);

/// A lock lifecycle event, as consumed by the correlation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// A lock was created at `call_site`
    Init {
        lock: LockAddress,
        call_site: Option<CallSiteId>,
    },
    /// `thread` started trying to acquire `lock`
    AttemptStart {
        thread: ThreadId,
        lock: LockAddress,
        timestamp_ns: u64,
    },
    /// The acquisition attempt of `thread` returned
    AttemptEnd {
        thread: ThreadId,
        timestamp_ns: u64,
        call_site: Option<CallSiteId>,
        success: bool,
    },
    /// `thread` released `lock`
    Release {
        thread: ThreadId,
        lock: LockAddress,
        timestamp_ns: u64,
    },
}

impl LockEvent {
    /// Thread the event belongs to (`None` for lock creation)
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            LockEvent::Init { .. } => None,
            LockEvent::AttemptStart { thread, .. }
            | LockEvent::AttemptEnd { thread, .. }
            | LockEvent::Release { thread, .. } => Some(*thread),
        }
    }
}

/// Hook points the instrumentation backend attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Entry of the lock-create function
    InitEntry,
    /// Entry of the lock-acquire function
    LockEntry,
    /// Return of the lock-acquire function
    LockReturn,
    /// Entry of the lock-release function
    UnlockEntry,
}

/// Register-level view of one hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookInvocation {
    pub point: HookPoint,
    pub thread: ThreadId,
    pub timestamp_ns: u64,
    /// First argument of the hooked function (the lock address on entry hooks)
    pub first_arg: u64,
    /// Return value (meaningful only for `LockReturn`)
    pub return_value: i64,
}

/// Captures the user stack of the thread that triggered a hook
pub trait StackCapture {
    /// Returns the interned id of the current stack, or `None` when the stack
    /// could not be read
    fn capture(&mut self) -> Option<CallSiteId>;
}

/// Receiver of translated events and the stacks they reference
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: LockEvent);
    fn on_stack(&self, id: CallSiteId, frames: &[u64]);
}

/// Shape a raw hook invocation into a typed event
///
/// Stacks are captured only for the events that record a call site.
pub fn translate(invocation: &HookInvocation, stacks: &mut dyn StackCapture) -> LockEvent {
    match invocation.point {
        HookPoint::InitEntry => LockEvent::Init {
            lock: LockAddress(invocation.first_arg),
            call_site: stacks.capture(),
        },
        HookPoint::LockEntry => LockEvent::AttemptStart {
            thread: invocation.thread,
            lock: LockAddress(invocation.first_arg),
            timestamp_ns: invocation.timestamp_ns,
        },
        HookPoint::LockReturn => LockEvent::AttemptEnd {
            thread: invocation.thread,
            timestamp_ns: invocation.timestamp_ns,
            call_site: stacks.capture(),
            success: invocation.return_value == 0,
        },
        HookPoint::UnlockEntry => LockEvent::Release {
            thread: invocation.thread,
            lock: LockAddress(invocation.first_arg),
            timestamp_ns: invocation.timestamp_ns,
        },
    }
}

/// Monotonic nanosecond clock anchored at session start
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the clock was created
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStack {
        id: Option<CallSiteId>,
        calls: usize,
    }

    impl StackCapture for FixedStack {
        fn capture(&mut self) -> Option<CallSiteId> {
            self.calls += 1;
            self.id
        }
    }

    fn invocation(point: HookPoint, return_value: i64) -> HookInvocation {
        HookInvocation {
            point,
            thread: ThreadId(7),
            timestamp_ns: 1_000,
            first_arg: 0x100,
            return_value,
        }
    }

    #[test]
    fn test_init_captures_call_site() {
        let mut stacks = FixedStack {
            id: Some(CallSiteId(9)),
            calls: 0,
        };
        let event = translate(&invocation(HookPoint::InitEntry, 0), &mut stacks);
        assert_eq!(
            event,
            LockEvent::Init {
                lock: LockAddress(0x100),
                call_site: Some(CallSiteId(9)),
            }
        );
        assert_eq!(stacks.calls, 1);
    }

    #[test]
    fn test_attempt_start_skips_stack_capture() {
        let mut stacks = FixedStack { id: None, calls: 0 };
        let event = translate(&invocation(HookPoint::LockEntry, 0), &mut stacks);
        assert_eq!(
            event,
            LockEvent::AttemptStart {
                thread: ThreadId(7),
                lock: LockAddress(0x100),
                timestamp_ns: 1_000,
            }
        );
        assert_eq!(stacks.calls, 0);
    }

    #[test]
    fn test_attempt_end_success_follows_return_value() {
        let mut stacks = FixedStack {
            id: Some(CallSiteId(3)),
            calls: 0,
        };
        let ok = translate(&invocation(HookPoint::LockReturn, 0), &mut stacks);
        let failed = translate(&invocation(HookPoint::LockReturn, 22), &mut stacks);
        assert!(matches!(ok, LockEvent::AttemptEnd { success: true, .. }));
        assert!(matches!(failed, LockEvent::AttemptEnd { success: false, .. }));
    }

    #[test]
    fn test_missing_stack_does_not_abort_event() {
        let mut stacks = FixedStack { id: None, calls: 0 };
        let event = translate(&invocation(HookPoint::LockReturn, 0), &mut stacks);
        assert_eq!(
            event,
            LockEvent::AttemptEnd {
                thread: ThreadId(7),
                timestamp_ns: 1_000,
                call_site: None,
                success: true,
            }
        );
    }

    #[test]
    fn test_release_carries_lock() {
        let mut stacks = FixedStack { id: None, calls: 0 };
        let event = translate(&invocation(HookPoint::UnlockEntry, 0), &mut stacks);
        assert_eq!(event.thread(), Some(ThreadId(7)));
        assert!(matches!(
            event,
            LockEvent::Release {
                lock: LockAddress(0x100),
                ..
            }
        ));
    }

    #[test]
    fn test_session_clock_is_monotonic() {
        let clock = SessionClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
