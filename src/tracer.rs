//! ptrace instrumentation of pthread mutex functions
//!
//! Attaches to every thread of the target with `PTRACE_SEIZE`, plants `int3`
//! breakpoints on the entry of the lock-create, lock-acquire and
//! lock-release functions, and on the return address of each in-flight
//! lock-acquire call. Every breakpoint hit becomes a [`HookInvocation`] that
//! is translated and handed to an [`EventSink`].
//!
//! Delivery is best-effort: while one thread single-steps over a
//! breakpoint, the original instruction is restored and other threads may run
//! past it unobserved. The correlation engine treats those as missed events.
//!
//! All ptrace calls must come from the thread that attached, so a `Tracer`
//! is created, run and detached on one dedicated thread.

use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result as ProfilerResult};
use crate::event::{
    translate, CallSiteId, EventSink, HookInvocation, HookPoint, SessionClock, StackCapture,
    ThreadId,
};
use crate::registry::stack_id;
use crate::stack_unwind::{unwind, ProcessMemory, RemoteMemory, UnwindStart};
use crate::symbols::ProcessSymbols;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const INT3: u8 = 0xcc;

/// Sleep between polls once the target has been quiet for a while
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Polls that only yield before falling back to `IDLE_POLL` sleeps
const IDLE_SPINS: u32 = 64;

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    point: HookPoint,
    original: u8,
}

/// Why the event loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Stop was requested
    Stopped,
    /// The target process exited with this status
    TargetExited(i32),
}

/// Live ptrace session on one target process
#[derive(Debug)]
pub struct Tracer {
    pid: Pid,
    threads: HashSet<Pid>,
    breakpoints: HashMap<u64, Breakpoint>,
    /// Breakpoints whose `int3` could not be put back after a step
    lost: HashSet<u64>,
    /// Return address and entry stack pointer of each in-flight lock call
    pending_returns: HashMap<Pid, (u64, u64)>,
    /// Signals observed while attaching, re-delivered on first resume
    deferred_signals: HashMap<Pid, Signal>,
    clock: SessionClock,
    stack_depth: usize,
}

impl Tracer {
    /// Resolve the hooked functions, seize every thread and plant breakpoints
    ///
    /// Symbol resolution happens before any thread is touched, so a failure
    /// leaves the target untouched.
    pub fn attach(pid: i32, config: &ProfilerConfig) -> ProfilerResult<Self> {
        let symbols = ProcessSymbols::new(pid, false)?;
        let hooks = &config.hooks;
        let mut entries = Vec::with_capacity(3);
        for (name, point) in [
            (&hooks.init, HookPoint::InitEntry),
            (&hooks.lock, HookPoint::LockEntry),
            (&hooks.unlock, HookPoint::UnlockEntry),
        ] {
            let address = symbols
                .find_symbol(name, &hooks.libraries)
                .ok_or_else(|| ProfilerError::SymbolNotFound {
                    pid,
                    symbol: name.clone(),
                })?;
            tracing::debug!("{} resolved to 0x{:x}", name, address);
            entries.push((address, point));
        }

        let mut tracer = Self {
            pid: Pid::from_raw(pid),
            threads: HashSet::new(),
            breakpoints: HashMap::new(),
            lost: HashSet::new(),
            pending_returns: HashMap::new(),
            deferred_signals: HashMap::new(),
            clock: SessionClock::new(),
            stack_depth: config.limits.stack_depth,
        };

        tracer.seize_all()?;

        let mut planted = Ok(());
        if let Some(tid) = tracer.threads.iter().next().copied() {
            for (address, point) in entries {
                if let Err(e) = tracer.plant(tid, address, point) {
                    planted = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = planted {
            if let Err(detach_error) = tracer.detach() {
                tracing::warn!("detach after failed attach: {:#}", detach_error);
            }
            return Err(e);
        }

        let threads: Vec<Pid> = tracer.threads.iter().copied().collect();
        for tid in threads {
            let signal = tracer.deferred_signals.remove(&tid);
            tracer.resume(tid, signal);
        }

        tracing::info!(
            pid,
            threads = tracer.threads.len(),
            breakpoints = tracer.breakpoints.len(),
            "attached"
        );
        Ok(tracer)
    }

    /// Seize and stop every thread, repeating until the thread list is stable
    fn seize_all(&mut self) -> ProfilerResult<()> {
        let pid = self.pid.as_raw();
        loop {
            let fresh: Vec<Pid> = list_threads(pid)?
                .into_iter()
                .filter(|tid| !self.threads.contains(tid))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for tid in fresh {
                let options =
                    ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_TRACEEXEC;
                match ptrace::seize(tid, options) {
                    Ok(()) => {}
                    // Thread exited after being listed
                    Err(Errno::ESRCH) if tid != self.pid => continue,
                    Err(e) => return Err(ProfilerError::from_attach(pid, tid.as_raw(), "seize", e)),
                }
                ptrace::interrupt(tid)
                    .map_err(|e| ProfilerError::from_attach(pid, tid.as_raw(), "interrupt", e))?;
                if self.wait_for_stop(tid) {
                    self.threads.insert(tid);
                }
            }
        }
        if self.threads.is_empty() {
            return Err(ProfilerError::ProcessNotFound { pid });
        }
        Ok(())
    }

    /// Block until `tid` reports a stop; returns `false` if it exited instead
    fn wait_for_stop(&mut self, tid: Pid) -> bool {
        loop {
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::PtraceEvent(..)) => return true,
                Ok(WaitStatus::Stopped(_, signal)) => {
                    self.deferred_signals.insert(tid, signal);
                    return true;
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return false,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Write `int3` at `address`, remembering the byte it replaces
    fn plant(&mut self, tid: Pid, address: u64, point: HookPoint) -> ProfilerResult<()> {
        let original = self.write_byte(tid, address, INT3)?;
        self.breakpoints.insert(address, Breakpoint { point, original });
        Ok(())
    }

    /// Replace the byte at `address`, returning the previous one
    fn write_byte(&self, tid: Pid, address: u64, byte: u8) -> ProfilerResult<u8> {
        let ptrace_error = |op, source| ProfilerError::Ptrace {
            op,
            tid: tid.as_raw(),
            source,
        };
        let word = ptrace::read(tid, address as ptrace::AddressType)
            .map_err(|e| ptrace_error("peek", e))?;
        let previous = (word & 0xff) as u8;
        let patched = (word & !0xff) | libc::c_long::from(byte);
        ptrace::write(tid, address as ptrace::AddressType, patched)
            .map_err(|e| ptrace_error("poke", e))?;
        Ok(previous)
    }

    /// Deliver events to `sink` until `stop` is set or the target exits
    pub fn run(&mut self, sink: &dyn EventSink, stop: &AtomicBool) -> Result<SessionEnd> {
        let any_thread = Pid::from_raw(-1);
        let mut idle = 0u32;
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(SessionEnd::Stopped);
            }

            let status = match waitpid(any_thread, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(SessionEnd::TargetExited(0)),
                Err(e) => return Err(e).context("Failed to waitpid"),
            };

            if status == WaitStatus::StillAlive {
                if idle < IDLE_SPINS {
                    idle += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(IDLE_POLL);
                }
                continue;
            }
            idle = 0;

            match status {
                WaitStatus::Stopped(tid, Signal::SIGTRAP) => self.on_trap(tid, sink),
                WaitStatus::Stopped(tid, signal) => self.resume(tid, Some(signal)),
                WaitStatus::PtraceEvent(tid, _, event) => {
                    if event == libc::PTRACE_EVENT_CLONE {
                        match ptrace::getevent(tid) {
                            Ok(child) => {
                                let child = Pid::from_raw(child as i32);
                                tracing::debug!(parent = tid.as_raw(), child = child.as_raw(), "thread created");
                                self.threads.insert(child);
                            }
                            Err(e) => tracing::warn!("PTRACE_GETEVENTMSG on {}: {}", tid, e),
                        }
                    } else if event == libc::PTRACE_EVENT_EXEC {
                        // The old image and every planted int3 are gone
                        tracing::warn!(pid = self.pid.as_raw(), "target called execve; instrumentation lost");
                        self.breakpoints.clear();
                        self.lost.clear();
                        self.pending_returns.clear();
                        self.threads.retain(|thread| *thread == tid);
                    }
                    // New threads start in an event stop too
                    self.threads.insert(tid);
                    self.resume(tid, None);
                }
                WaitStatus::Exited(tid, code) => {
                    self.forget(tid);
                    if tid == self.pid {
                        return Ok(SessionEnd::TargetExited(code));
                    }
                }
                WaitStatus::Signaled(tid, signal, _) => {
                    self.forget(tid);
                    if tid == self.pid {
                        return Ok(SessionEnd::TargetExited(128 + signal as i32));
                    }
                }
                _ => {}
            }
        }
    }

    fn on_trap(&mut self, tid: Pid, sink: &dyn EventSink) {
        self.replant_lost(tid);

        let mut regs = match ptrace::getregs(tid) {
            Ok(regs) => regs,
            Err(_) => {
                self.forget(tid);
                return;
            }
        };
        let address = regs.rip.wrapping_sub(1);
        let Some(breakpoint) = self.breakpoints.get(&address).copied() else {
            // Not ours: the target's own SIGTRAP
            self.resume(tid, Some(Signal::SIGTRAP));
            return;
        };
        let timestamp_ns = self.clock.now_ns();
        regs.rip = address;

        self.dispatch(tid, breakpoint.point, &regs, timestamp_ns, sink);
        self.step_over(tid, &regs, address, breakpoint.original);
    }

    fn dispatch(
        &mut self,
        tid: Pid,
        point: HookPoint,
        regs: &libc::user_regs_struct,
        timestamp_ns: u64,
        sink: &dyn EventSink,
    ) {
        let memory = ProcessMemory::new(tid);
        match point {
            HookPoint::LockEntry => match memory.read_u64(regs.rsp) {
                Ok(return_address) if self.watch_return(tid, return_address) => {
                    self.pending_returns.insert(tid, (return_address, regs.rsp));
                }
                _ => tracing::debug!(tid = tid.as_raw(), "lock return not watchable"),
            },
            HookPoint::LockReturn => {
                // Only the return of this thread's own call counts; code may
                // also jump to the address after a call site
                let matches = self
                    .pending_returns
                    .get(&tid)
                    .is_some_and(|&(ret, sp)| ret == regs.rip && regs.rsp == sp.wrapping_add(8));
                if !matches {
                    return;
                }
                self.pending_returns.remove(&tid);
            }
            HookPoint::InitEntry | HookPoint::UnlockEntry => {}
        }

        let invocation = HookInvocation {
            point,
            thread: ThreadId(tid.as_raw() as u32),
            timestamp_ns,
            first_arg: regs.rdi,
            // int return value: upper half of rax is unspecified
            return_value: i64::from(regs.rax as u32 as i32),
        };
        let mut stack = RemoteStack {
            memory,
            start: UnwindStart {
                ip: regs.rip,
                sp: regs.rsp,
                fp: regs.rbp,
                at_function_entry: point != HookPoint::LockReturn,
            },
            max_depth: self.stack_depth,
            sink,
        };
        sink.on_event(translate(&invocation, &mut stack));
    }

    /// Make sure a breakpoint sits on `address` to observe the lock return
    fn watch_return(&mut self, tid: Pid, address: u64) -> bool {
        if self.breakpoints.contains_key(&address) {
            return true;
        }
        match self.plant(tid, address, HookPoint::LockReturn) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("cannot watch return address 0x{:x}: {}", address, e);
                false
            }
        }
    }

    /// Execute the original instruction under `int3` and re-arm it
    fn step_over(&mut self, tid: Pid, regs: &libc::user_regs_struct, address: u64, original: u8) {
        let stepped = ptrace::setregs(tid, *regs).is_ok()
            && self.write_byte(tid, address, original).is_ok()
            && self.single_step(tid);

        if !stepped {
            self.lost.insert(address);
            return;
        }
        if let Err(e) = self.write_byte(tid, address, INT3) {
            tracing::warn!("re-arming 0x{:x}: {}", address, e);
            self.lost.insert(address);
        }
        self.resume(tid, None);
    }

    fn single_step(&mut self, tid: Pid) -> bool {
        let mut signal = None;
        loop {
            if ptrace::step(tid, signal).is_err() {
                self.forget(tid);
                return false;
            }
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => return true,
                // A signal arrived first; deliver it and keep stepping
                Ok(WaitStatus::Stopped(_, other)) => signal = Some(other),
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    self.forget(tid);
                    return false;
                }
                Ok(_) | Err(Errno::EINTR) => signal = None,
                Err(_) => {
                    self.forget(tid);
                    return false;
                }
            }
        }
    }

    /// Put back breakpoints whose re-arm failed, using a stopped thread
    fn replant_lost(&mut self, tid: Pid) {
        if self.lost.is_empty() {
            return;
        }
        let lost: Vec<u64> = self.lost.drain().collect();
        for address in lost {
            if self.write_byte(tid, address, INT3).is_err() {
                self.lost.insert(address);
            }
        }
    }

    fn resume(&mut self, tid: Pid, signal: Option<Signal>) {
        match ptrace::cont(tid, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => self.forget(tid),
            Err(e) => tracing::warn!("PTRACE_CONT on {}: {}", tid, e),
        }
    }

    fn forget(&mut self, tid: Pid) {
        self.threads.remove(&tid);
        self.pending_returns.remove(&tid);
    }

    /// Remove every breakpoint and let all threads run untraced
    ///
    /// Threads caught on an `int3` are rewound so they re-execute the
    /// restored instruction.
    pub fn detach(&mut self) -> Result<()> {
        let mut queue: VecDeque<Pid> = self.threads.iter().copied().collect();
        let mut stopped: Vec<(Pid, Option<Signal>, bool)> = Vec::new();
        let mut seen: HashSet<Pid> = HashSet::new();

        while let Some(tid) = queue.pop_front() {
            if !seen.insert(tid) {
                continue;
            }
            match ptrace::interrupt(tid) {
                Ok(()) => {}
                Err(Errno::ESRCH) => continue,
                Err(e) => {
                    tracing::warn!("PTRACE_INTERRUPT on {}: {}", tid, e);
                    continue;
                }
            }
            loop {
                match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                        stopped.push((tid, None, true));
                        break;
                    }
                    Ok(WaitStatus::Stopped(_, signal)) => {
                        stopped.push((tid, Some(signal), false));
                        break;
                    }
                    Ok(WaitStatus::PtraceEvent(_, _, event)) => {
                        if event == libc::PTRACE_EVENT_CLONE {
                            if let Ok(child) = ptrace::getevent(tid) {
                                queue.push_back(Pid::from_raw(child as i32));
                            }
                        }
                        stopped.push((tid, None, false));
                        break;
                    }
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }
        }

        if let Some(&(tid, _, _)) = stopped.first() {
            let breakpoints: Vec<(u64, u8)> = self
                .breakpoints
                .iter()
                .map(|(address, bp)| (*address, bp.original))
                .collect();
            for (address, original) in breakpoints {
                if let Err(e) = self.write_byte(tid, address, original) {
                    tracing::warn!("restoring 0x{:x}: {}", address, e);
                }
            }
        }

        for (tid, mut signal, trapped) in stopped {
            if trapped {
                match ptrace::getregs(tid) {
                    Ok(mut regs) if self.breakpoints.contains_key(&regs.rip.wrapping_sub(1)) => {
                        regs.rip -= 1;
                        if let Err(e) = ptrace::setregs(tid, regs) {
                            tracing::warn!("rewinding {}: {}", tid, e);
                        }
                    }
                    _ => signal = Some(Signal::SIGTRAP),
                }
            }
            if let Err(e) = ptrace::detach(tid, signal) {
                tracing::debug!("PTRACE_DETACH on {}: {}", tid, e);
            }
        }

        let removed = self.breakpoints.len();
        self.breakpoints.clear();
        self.threads.clear();
        self.pending_returns.clear();
        tracing::info!(pid = self.pid.as_raw(), breakpoints = removed, "detached");
        Ok(())
    }
}

/// Stack capture for a thread stopped at a breakpoint
struct RemoteStack<'a> {
    memory: ProcessMemory,
    start: UnwindStart,
    max_depth: usize,
    sink: &'a dyn EventSink,
}

impl StackCapture for RemoteStack<'_> {
    fn capture(&mut self) -> Option<CallSiteId> {
        let frames = unwind(&self.memory, self.start, self.max_depth);
        if frames.is_empty() {
            return None;
        }
        let id = stack_id(&frames);
        self.sink.on_stack(id, &frames);
        Some(id)
    }
}

/// Thread ids listed under `/proc/<pid>/task`
pub fn list_threads(pid: i32) -> ProfilerResult<Vec<Pid>> {
    let task_dir = std::path::PathBuf::from(format!("/proc/{}/task", pid));
    let entries = std::fs::read_dir(&task_dir).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ProfilerError::ProcessNotFound { pid }
        } else {
            ProfilerError::Io {
                path: task_dir.clone(),
                source,
            }
        }
    })?;
    let mut threads: Vec<Pid> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect();
    threads.sort_by_key(|tid| tid.as_raw());
    Ok(threads)
}
