//! Log2 duration histograms
//!
//! Bucket `b` counts durations in `[2^b, 2^(b+1))` microseconds. Durations
//! under one microsecond clamp into bucket 0. Buckets are plain atomic
//! counters, so concurrent increments never contend on a lock.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of buckets; covers every `u64` microsecond value
pub const BUCKET_COUNT: usize = 64;

/// Width of the distribution bar in rendered tables
const BAR_WIDTH: u64 = 40;

/// Bucket index for a duration in nanoseconds: `floor(log2(ns / 1000))`
pub fn bucket_index(duration_ns: u64) -> usize {
    let micros = duration_ns / 1000;
    if micros == 0 {
        0
    } else {
        micros.ilog2() as usize
    }
}

/// Inclusive microsecond range covered by `bucket` for display
pub fn bucket_range(bucket: usize) -> (u64, u64) {
    if bucket == 0 {
        return (0, 1);
    }
    let low = 1u64 << bucket;
    let high = low.saturating_sub(1).saturating_add(low);
    (low, high)
}

/// Concurrent log2 histogram
#[derive(Debug)]
pub struct Log2Histogram {
    buckets: [AtomicU64; BUCKET_COUNT],
}

impl Log2Histogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count one duration; returns the bucket it landed in
    pub fn record(&self, duration_ns: u64) -> usize {
        let bucket = bucket_index(duration_ns);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        bucket
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            counts: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

impl Default for Log2Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Which of the two profiler histograms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistogramId {
    Wait,
    Hold,
}

impl HistogramId {
    /// Column label used when rendering
    pub fn label(&self) -> &'static str {
        match self {
            HistogramId::Wait => "wait time (us)",
            HistogramId::Hold => "hold time (us)",
        }
    }
}

/// The wait and hold histograms of a profiling session
#[derive(Debug, Default)]
pub struct Histograms {
    wait: Log2Histogram,
    hold: Log2Histogram,
}

impl Histograms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, id: HistogramId, duration_ns: u64) -> usize {
        self.get(id).record(duration_ns)
    }

    pub fn snapshot(&self, id: HistogramId) -> HistogramSnapshot {
        self.get(id).snapshot()
    }

    fn get(&self, id: HistogramId) -> &Log2Histogram {
        match id {
            HistogramId::Wait => &self.wait,
            HistogramId::Hold => &self.hold,
        }
    }
}

/// Point-in-time copy of a histogram's buckets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    counts: [u64; BUCKET_COUNT],
}

impl HistogramSnapshot {
    pub fn count(&self, bucket: usize) -> u64 {
        self.counts.get(bucket).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Non-empty buckets as `(bucket, count)`, ascending
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(bucket, count)| (bucket, *count))
    }

    /// Highest bucket with a non-zero count
    pub fn max_bucket(&self) -> Option<usize> {
        self.counts.iter().rposition(|count| *count > 0)
    }

    /// Render as a log-scale table, one row per bucket up to the highest
    /// non-empty one
    pub fn render(&self, label: &str, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "     {:<19} : count     distribution", label)?;
        let Some(max_bucket) = self.max_bucket() else {
            return Ok(());
        };
        let max_count = self.counts.iter().copied().max().unwrap_or(0);
        for bucket in 0..=max_bucket {
            let (low, high) = bucket_range(bucket);
            let count = self.counts[bucket];
            writeln!(
                out,
                "{:>10} -> {:<10} : {:<8} |{:<width$}|",
                low,
                high,
                count,
                stars(count, max_count),
                width = BAR_WIDTH as usize
            )?;
        }
        Ok(())
    }
}

fn stars(count: u64, max_count: u64) -> String {
    if max_count == 0 {
        return String::new();
    }
    let n = (u128::from(count) * u128::from(BAR_WIDTH) / u128::from(max_count)) as usize;
    "*".repeat(n.min(BAR_WIDTH as usize))
}
