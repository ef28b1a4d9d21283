//! Lockstat - live pthread mutex contention profiler
//!
//! Attaches to a running process, instruments its mutex create, acquire and
//! release functions, and periodically reports per-thread wait and hold times
//! for each lock and call site together with log2 latency histograms.
//!
//! The correlation engine ([`profiler::LockProfiler`]) does not depend on the
//! instrumentation backend; it implements [`event::EventSink`] and can be fed
//! synthetic events directly.

pub mod aggregate;
pub mod bounded;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod dwarf;
pub mod error;
pub mod event;
pub mod histogram;
pub mod json_output;
pub mod profiler;
pub mod registry;
pub mod report;
pub mod session;
pub mod stack_unwind;
pub mod symbols;
pub mod tracer;
