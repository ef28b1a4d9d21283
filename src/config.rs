//! Session configuration
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes. Command-line flags are applied on top of the file.
//!
//! # Example TOML
//! ```toml
//! interval_secs = 10
//! format = "json"
//!
//! [limits]
//! max_stats = 50000
//! overflow = "evict-oldest"
//!
//! [hooks]
//! libraries = ["libpthread.so", "libc.so"]
//! ```

use crate::bounded::OverflowPolicy;
use crate::cli::OutputFormat;
use crate::error::{ProfilerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Capacities of the shared tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum (thread, lock, call site) statistics rows
    pub max_stats: usize,
    /// What happens to a new row once `max_stats` is reached
    pub overflow: OverflowPolicy,
    /// Maximum concurrently pending waits, and separately pending holds
    pub max_pending: usize,
    /// Maximum distinct lock creation records
    pub max_locks: usize,
    /// Maximum distinct interned stacks
    pub max_stacks: usize,
    /// Maximum frames captured per stack
    pub stack_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_stats: 10240,
            overflow: OverflowPolicy::RejectNew,
            max_pending: 10240,
            max_locks: 10240,
            max_stacks: 4096,
            stack_depth: 127,
        }
    }
}

/// Functions to instrument and where to look for them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSymbols {
    pub init: String,
    pub lock: String,
    pub unlock: String,
    /// Substrings of mapped library paths searched first, in order
    pub libraries: Vec<String>,
}

impl Default for HookSymbols {
    fn default() -> Self {
        Self {
            init: "pthread_mutex_init".to_string(),
            lock: "pthread_mutex_lock".to_string(),
            unlock: "pthread_mutex_unlock".to_string(),
            libraries: vec!["libpthread.so".to_string(), "libc.so".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Seconds between report passes
    pub interval_secs: u64,
    /// Stop after this many seconds; run until terminated when unset
    pub duration_secs: Option<u64>,
    pub format: OutputFormat,
    /// Resolve file:line for stack frames from DWARF debug info
    pub source: bool,
    pub limits: Limits,
    pub hooks: HookSymbols,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            duration_secs: None,
            format: OutputFormat::Text,
            source: false,
            limits: Limits::default(),
            hooks: HookSymbols::default(),
        }
    }
}

impl ProfilerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ProfilerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(ProfilerError::InvalidConfig(
                "interval_secs must be at least 1".to_string(),
            ));
        }
        let limits = &self.limits;
        for (name, value) in [
            ("max_stats", limits.max_stats),
            ("max_pending", limits.max_pending),
            ("max_locks", limits.max_locks),
            ("max_stacks", limits.max_stacks),
            ("stack_depth", limits.stack_depth),
        ] {
            if value == 0 {
                return Err(ProfilerError::InvalidConfig(format!(
                    "limits.{} must be greater than 0",
                    name
                )));
            }
        }
        let hooks = &self.hooks;
        if hooks.init.is_empty() || hooks.lock.is_empty() || hooks.unlock.is_empty() {
            return Err(ProfilerError::InvalidConfig(
                "hook symbol names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}
