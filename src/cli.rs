//! CLI argument parsing for lockstat

use crate::bounded::OverflowPolicy;
use crate::config::ProfilerConfig;
use crate::error::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Output format for report passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// One JSON document per report pass
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "lockstat")]
#[command(version)]
#[command(about = "Live pthread mutex contention profiler", long_about = None)]
pub struct Cli {
    /// Process id of the target process
    #[arg(value_name = "PID")]
    pub pid: Option<i32>,

    /// Seconds between report passes (default: 5)
    #[arg(short = 'i', long = "interval", value_name = "SECS")]
    pub interval: Option<u64>,

    /// Stop profiling after this many seconds
    #[arg(short = 'd', long = "duration", value_name = "SECS")]
    pub duration: Option<u64>,

    /// Report format
    #[arg(long = "format", value_enum)]
    pub format: Option<OutputFormat>,

    /// Maximum number of (thread, lock, call site) rows kept
    #[arg(long = "max-stats", value_name = "N")]
    pub max_stats: Option<usize>,

    /// Policy applied to new rows once --max-stats is reached
    #[arg(long = "overflow", value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Maximum frames captured per stack
    #[arg(long = "stack-depth", value_name = "N")]
    pub stack_depth: Option<usize>,

    /// Show source file:line for stack frames using DWARF debug info
    #[arg(short, long)]
    pub source: bool,

    /// Load settings from a TOML file (flags override file values)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Build the session configuration: file (if any), then flag overrides
    pub fn to_config(&self) -> Result<ProfilerConfig> {
        let mut config = match &self.config {
            Some(path) => ProfilerConfig::from_file(path)?,
            None => ProfilerConfig::default(),
        };
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if self.duration.is_some() {
            config.duration_secs = self.duration;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(max_stats) = self.max_stats {
            config.limits.max_stats = max_stats;
        }
        if let Some(overflow) = self.overflow {
            config.limits.overflow = overflow;
        }
        if let Some(depth) = self.stack_depth {
            config.limits.stack_depth = depth;
        }
        if self.source {
            config.source = true;
        }
        config.validate()?;
        Ok(config)
    }
}
