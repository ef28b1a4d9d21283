//! One profiling session: attach, report periodically, detach
//!
//! The tracer runs on its own thread because every ptrace request has to come
//! from the thread that attached. The calling thread reports on the
//! configured interval until the duration elapses, the target exits, or
//! SIGINT/SIGTERM arrives. Breakpoints are always removed before returning.

use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::profiler::LockProfiler;
use crate::report::Reporter;
use crate::symbols::ProcessSymbols;
use crate::tracer::{SessionEnd, Tracer};
use anyhow::{Context, Result};
use crossbeam::channel::{self, RecvTimeoutError};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest the reporter sleeps before re-checking for shutdown
const WAIT_SLICE: Duration = Duration::from_millis(100);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

/// Route SIGINT and SIGTERM to a clean detach
fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {} handler", signal))?;
    }
    Ok(())
}

/// Why the reporting loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Duration elapsed or a shutdown signal arrived
    Stopped,
    /// The target exited with this status
    TargetExited(i32),
}

enum Wake {
    Report,
    Finished(SessionOutcome),
}

/// Profile `pid` until stopped, writing report passes to `out`
pub fn run(pid: i32, config: &ProfilerConfig, out: &mut dyn Write) -> Result<SessionOutcome> {
    install_signal_handlers()?;

    let profiler = Arc::new(LockProfiler::new(config));
    let stop = Arc::new(AtomicBool::new(false));
    let (attach_tx, attach_rx) = channel::bounded::<Result<(), ProfilerError>>(1);
    let (end_tx, end_rx) = channel::bounded::<SessionEnd>(1);

    let tracer_thread = {
        let profiler = Arc::clone(&profiler);
        let stop = Arc::clone(&stop);
        let config = config.clone();
        thread::Builder::new()
            .name("lockstat-tracer".to_string())
            .spawn(move || -> Result<()> {
                let mut tracer = match Tracer::attach(pid, &config) {
                    Ok(tracer) => tracer,
                    Err(e) => {
                        let _ = attach_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let _ = attach_tx.send(Ok(()));

                let outcome = tracer.run(profiler.as_ref(), &stop);
                let detached = tracer.detach();
                let end = outcome?;
                detached?;
                let _ = end_tx.send(end);
                Ok(())
            })
            .context("Failed to spawn tracer thread")?
    };

    match attach_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = tracer_thread.join();
            return Err(e.into());
        }
        Err(_) => {
            return Err(join_error(tracer_thread)
                .unwrap_or_else(|| anyhow::anyhow!("Tracer thread exited while attaching")));
        }
    }
    eprintln!("[lockstat: Attached to process {}]", pid);

    let mut symbols = ProcessSymbols::new(pid, config.source)?;
    let mut reporter = Reporter::new(config.format);
    let deadline = config.duration().map(|duration| Instant::now() + duration);

    let outcome = loop {
        let next = Instant::now() + config.interval();
        match wait_until(next, deadline, &end_rx) {
            Wake::Report => reporter
                .pass(&profiler, &mut symbols, out)
                .context("Failed to write report")?,
            Wake::Finished(outcome) => break outcome,
        }
    };

    stop.store(true, Ordering::Release);
    if let Some(e) = join_error(tracer_thread) {
        return Err(e);
    }
    // The tracer may have finished before the loop noticed
    let outcome = match (outcome, end_rx.try_recv()) {
        (SessionOutcome::Stopped, Ok(SessionEnd::TargetExited(code))) => {
            SessionOutcome::TargetExited(code)
        }
        (outcome, _) => outcome,
    };

    let drops = profiler.drops();
    tracing::debug!(
        missed_entry = drops.missed_entry,
        missed_acquire = drops.missed_acquire,
        missing_stat = drops.missing_stat,
        overwritten_wait = drops.overwritten_wait,
        rejected = drops.rejected,
        "correlation gaps"
    );

    // Final pass so short sessions still report
    reporter
        .pass(&profiler, &mut symbols, out)
        .context("Failed to write report")?;
    eprintln!("[lockstat: Detached from process {}]", pid);
    Ok(outcome)
}

/// Sleep until `next`, waking early for shutdown, target exit or the deadline
fn wait_until(
    next: Instant,
    deadline: Option<Instant>,
    end_rx: &channel::Receiver<SessionEnd>,
) -> Wake {
    loop {
        if SHUTDOWN.load(Ordering::Acquire) {
            tracing::info!("shutdown requested");
            return Wake::Finished(SessionOutcome::Stopped);
        }
        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            return Wake::Finished(SessionOutcome::Stopped);
        }
        if now >= next {
            return Wake::Report;
        }

        let mut slice = next.saturating_duration_since(now).min(WAIT_SLICE);
        if let Some(deadline) = deadline {
            slice = slice.min(deadline.saturating_duration_since(now));
        }
        match end_rx.recv_timeout(slice) {
            Ok(SessionEnd::TargetExited(code)) => {
                tracing::info!(code, "target exited");
                return Wake::Finished(SessionOutcome::TargetExited(code));
            }
            Ok(SessionEnd::Stopped) => return Wake::Finished(SessionOutcome::Stopped),
            Err(RecvTimeoutError::Timeout) => {}
            // Tracer thread is gone; its error surfaces on join
            Err(RecvTimeoutError::Disconnected) => {
                return Wake::Finished(SessionOutcome::Stopped)
            }
        }
    }
}

fn join_error(handle: thread::JoinHandle<Result<()>>) -> Option<anyhow::Error> {
    match handle.join() {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => Some(anyhow::anyhow!("Tracer thread panicked")),
    }
}
