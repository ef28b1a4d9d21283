//! Periodic contention reports
//!
//! A [`Report`] is a read-only snapshot of the profiler: the recorded lock
//! creation sites, every statistics row grouped by thread, and both
//! histograms. Taking one never clears or resets anything, so each pass is
//! cumulative since attach.

use crate::aggregate::LockStat;
use crate::cli::OutputFormat;
use crate::event::{CallSiteId, LockAddress, ThreadId};
use crate::histogram::{HistogramId, HistogramSnapshot};
use crate::json_output::JsonReport;
use crate::profiler::{DropStats, LockProfiler};
use crate::registry::StackRegistry;
use crate::symbols::SymbolResolver;
use std::collections::HashMap;
use std::io::{self, Write};

/// Printed in place of frames when a stack was never captured or stored
pub const MISSING_STACK: &str = "[missing stack]";

/// One resolved stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u64,
    pub symbol: String,
}

/// A recorded lock creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRecord {
    pub lock: LockAddress,
    /// `#N`, numbered from 1 in address order
    pub display_id: String,
    pub stack: Option<Vec<Frame>>,
}

/// One statistics row as reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub lock: LockAddress,
    /// Display id of the creation site, or the decoded lock address
    pub description: String,
    pub call_site: Option<CallSiteId>,
    pub stat: LockStat,
    pub stack: Option<Vec<Frame>>,
}

/// Rows of one thread, most waited-on first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSection {
    pub thread: ThreadId,
    pub locks: Vec<LockRow>,
}

/// Snapshot rendered by one reporting pass
#[derive(Debug, Clone)]
pub struct Report {
    pub init_records: Vec<InitRecord>,
    pub threads: Vec<ThreadSection>,
    pub wait: HistogramSnapshot,
    pub hold: HistogramSnapshot,
    pub drops: DropStats,
}

impl Report {
    /// Snapshot `profiler`, resolving every address through `symbols`
    pub fn collect(profiler: &LockProfiler, symbols: &dyn SymbolResolver) -> Self {
        let registry = profiler.registry();
        let resolve = |id: Option<CallSiteId>| resolve_stack(registry, symbols, id);

        let mut display_ids: HashMap<LockAddress, String> = HashMap::new();
        let init_records: Vec<InitRecord> = registry
            .init_records()
            .into_iter()
            .enumerate()
            .map(|(index, (lock, call_site))| {
                let display_id = format!("#{}", index + 1);
                display_ids.insert(lock, display_id.clone());
                InitRecord {
                    lock,
                    display_id,
                    stack: resolve(call_site),
                }
            })
            .collect();

        // Snapshot is sorted by key, so each thread's rows are contiguous
        let mut threads: Vec<ThreadSection> = Vec::new();
        for (key, stat) in profiler.stats().snapshot() {
            let row = LockRow {
                lock: key.lock,
                description: display_ids
                    .get(&key.lock)
                    .cloned()
                    .unwrap_or_else(|| symbols.decode(key.lock.0)),
                call_site: key.call_site,
                stat,
                stack: resolve(key.call_site),
            };
            match threads.last_mut() {
                Some(section) if section.thread == key.thread => section.locks.push(row),
                _ => threads.push(ThreadSection {
                    thread: key.thread,
                    locks: vec![row],
                }),
            }
        }
        for section in &mut threads {
            section
                .locks
                .sort_by(|a, b| b.stat.wait_time_ns.cmp(&a.stat.wait_time_ns));
        }

        let histograms = profiler.histograms();
        Self {
            init_records,
            threads,
            wait: histograms.snapshot(HistogramId::Wait),
            hold: histograms.snapshot(HistogramId::Hold),
            drops: profiler.drops(),
        }
    }

    /// Render in the text layout
    pub fn write_text(&self, out: &mut dyn Write) -> io::Result<()> {
        for record in &self.init_records {
            writeln!(
                out,
                "init stack for lock {:x} ({})",
                record.lock, record.display_id
            )?;
            write_stack(out, record.stack.as_deref())?;
            writeln!(out)?;
        }

        for section in &self.threads {
            writeln!(out, "thread {}", section.thread)?;
            for row in &section.locks {
                writeln!(
                    out,
                    "\tlock {} ::: wait time {:.2}us ::: hold time {:.2}us ::: enter count {}",
                    row.description,
                    nanos_to_micros(row.stat.wait_time_ns),
                    nanos_to_micros(row.stat.lock_time_ns),
                    row.stat.enter_count
                )?;
                write_stack(out, row.stack.as_deref())?;
                writeln!(out)?;
            }
        }

        self.wait.render(HistogramId::Wait.label(), out)?;
        self.hold.render(HistogramId::Hold.label(), out)?;
        Ok(())
    }
}

fn resolve_stack(
    registry: &StackRegistry,
    symbols: &dyn SymbolResolver,
    id: Option<CallSiteId>,
) -> Option<Vec<Frame>> {
    let frames = registry.frames(id?)?;
    Some(
        frames
            .iter()
            .map(|&address| Frame {
                address,
                symbol: symbols.decode(address),
            })
            .collect(),
    )
}

fn write_stack(out: &mut dyn Write, stack: Option<&[Frame]>) -> io::Result<()> {
    match stack {
        Some(frames) => {
            for frame in frames {
                writeln!(out, "\t\t{:>16} ({:x})", frame.symbol, frame.address)?;
            }
        }
        None => writeln!(out, "\t\t{}", MISSING_STACK)?,
    }
    Ok(())
}

pub(crate) fn nanos_to_micros(ns: u64) -> f64 {
    ns as f64 / 1000.0
}

/// Runs reporting passes in the configured format
#[derive(Debug)]
pub struct Reporter {
    format: OutputFormat,
    passes: u64,
}

impl Reporter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            passes: 0,
        }
    }

    /// Number of passes emitted so far
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Refresh code ranges, snapshot the profiler and write one report
    ///
    /// A failed refresh only degrades symbol names; it never skips the pass.
    pub fn pass(
        &mut self,
        profiler: &LockProfiler,
        symbols: &mut dyn SymbolResolver,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        if let Err(e) = symbols.refresh_code_ranges() {
            tracing::warn!("refreshing code ranges: {}", e);
        }
        let report = Report::collect(profiler, &*symbols);
        self.passes += 1;
        tracing::debug!(
            pass = self.passes,
            threads = report.threads.len(),
            locks = report.init_records.len(),
            dropped = report.drops.total(),
            "report pass"
        );

        match self.format {
            OutputFormat::Text => report.write_text(out)?,
            OutputFormat::Json => {
                let json = JsonReport::from_report(&report, self.passes);
                serde_json::to_writer(&mut *out, &json)?;
                writeln!(out)?;
            }
        }
        out.flush()
    }
}
