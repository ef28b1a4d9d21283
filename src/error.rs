//! Error types for attaching to and reading from a target process

use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a profiling session before or while attaching
#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Process {pid} not found")]
    ProcessNotFound { pid: i32 },

    #[error("Permission denied attaching to process {pid} (needs CAP_SYS_PTRACE or kernel.yama.ptrace_scope=0)")]
    PermissionDenied { pid: i32 },

    #[error("Symbol {symbol} not found in any library mapped by process {pid}")]
    SymbolNotFound { pid: i32, symbol: String },

    #[error("ptrace {op} failed on thread {tid}: {source}")]
    Ptrace {
        op: &'static str,
        tid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse object file {}: {source}", path.display())]
    Object {
        path: PathBuf,
        #[source]
        source: object::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ProfilerError {
    /// Map a ptrace failure on `tid` of process `pid`, turning the errno values
    /// that mean "no such process" or "not allowed" into their own variants
    pub fn from_attach(pid: i32, tid: i32, op: &'static str, source: nix::Error) -> Self {
        match source {
            nix::Error::ESRCH if tid == pid => ProfilerError::ProcessNotFound { pid },
            nix::Error::EPERM => ProfilerError::PermissionDenied { pid },
            source => ProfilerError::Ptrace { op, tid, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
