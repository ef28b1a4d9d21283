//! JSON output format for report passes
//!
//! `--format json` writes one document per pass, newline-delimited.

use crate::event::{CallSiteId, LockAddress, ThreadId};
use crate::histogram::{bucket_range, HistogramSnapshot};
use crate::profiler::DropStats;
use crate::report::{nanos_to_micros, Frame, Report};
use serde::{Deserialize, Serialize};

/// One resolved stack frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonFrame {
    /// Instruction address, hex formatted
    pub address: String,
    pub symbol: String,
}

/// A recorded lock creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonInitRecord {
    /// Lock address, hex formatted
    pub lock: String,
    pub id: String,
    /// Creation stack (absent when it was never captured)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<JsonFrame>>,
}

/// One (thread, lock, call site) row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLockRow {
    pub lock: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_site: Option<u64>,
    pub wait_time_us: f64,
    pub hold_time_us: f64,
    pub enter_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<JsonFrame>>,
}

/// All rows of one thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonThread {
    pub thread: u32,
    pub locks: Vec<JsonLockRow>,
}

/// A non-empty histogram bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonBucket {
    pub bucket: usize,
    pub low_us: u64,
    pub high_us: u64,
    pub count: u64,
}

/// Correlation gap counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonDrops {
    pub missed_entry: u64,
    pub missed_acquire: u64,
    pub missing_stat: u64,
    pub overwritten_wait: u64,
    pub rejected: u64,
}

/// Root JSON document of one pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    /// Pass number, from 1
    pub pass: u64,
    pub init_records: Vec<JsonInitRecord>,
    pub threads: Vec<JsonThread>,
    pub wait_histogram: Vec<JsonBucket>,
    pub hold_histogram: Vec<JsonBucket>,
    pub drops: JsonDrops,
}

impl JsonReport {
    pub fn from_report(report: &Report, pass: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "lockstat-json-v1".to_string(),
            pass,
            init_records: report
                .init_records
                .iter()
                .map(|record| JsonInitRecord {
                    lock: hex(record.lock),
                    id: record.display_id.clone(),
                    stack: record.stack.as_deref().map(frames),
                })
                .collect(),
            threads: report
                .threads
                .iter()
                .map(|section| JsonThread {
                    thread: thread_id(section.thread),
                    locks: section
                        .locks
                        .iter()
                        .map(|row| JsonLockRow {
                            lock: hex(row.lock),
                            description: row.description.clone(),
                            call_site: row.call_site.map(|CallSiteId(id)| id),
                            wait_time_us: nanos_to_micros(row.stat.wait_time_ns),
                            hold_time_us: nanos_to_micros(row.stat.lock_time_ns),
                            enter_count: row.stat.enter_count,
                            stack: row.stack.as_deref().map(frames),
                        })
                        .collect(),
                })
                .collect(),
            wait_histogram: buckets(&report.wait),
            hold_histogram: buckets(&report.hold),
            drops: drops(report.drops),
        }
    }
}

fn hex(lock: LockAddress) -> String {
    format!("0x{:x}", lock)
}

fn thread_id(ThreadId(tid): ThreadId) -> u32 {
    tid
}

fn frames(stack: &[Frame]) -> Vec<JsonFrame> {
    stack
        .iter()
        .map(|frame| JsonFrame {
            address: format!("0x{:x}", frame.address),
            symbol: frame.symbol.clone(),
        })
        .collect()
}

fn buckets(snapshot: &HistogramSnapshot) -> Vec<JsonBucket> {
    snapshot
        .nonzero()
        .map(|(bucket, count)| {
            let (low_us, high_us) = bucket_range(bucket);
            JsonBucket {
                bucket,
                low_us,
                high_us,
                count,
            }
        })
        .collect()
}

fn drops(stats: DropStats) -> JsonDrops {
    JsonDrops {
        missed_entry: stats.missed_entry,
        missed_acquire: stats.missed_acquire,
        missing_stat: stats.missing_stat,
        overwritten_wait: stats.overwritten_wait,
        rejected: stats.rejected,
    }
}
