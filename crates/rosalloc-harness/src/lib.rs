//! Stress and conformance harness for rosalloc.
//!
//! Drives multi-mutator workloads against [`rosalloc_core::RosAlloc`],
//! records every phase as structured JSONL and validates such logs.

#![forbid(unsafe_code)]

pub mod error;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, SharedBuffer};
pub use workload::{WorkloadConfig, WorkloadReport, run_workload};
