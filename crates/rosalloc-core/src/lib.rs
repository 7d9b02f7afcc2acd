//! # rosalloc-core
//!
//! A concurrent runs-of-slots allocator for a garbage-collected runtime.
//!
//! Small requests (up to 2 KiB) are rounded to one of 34 size brackets and
//! served from runs: page groups sliced into equal slots and tracked by
//! bitmaps. Small brackets allocate from per-mutator thread-local runs;
//! larger brackets share one current run per bracket. Larger requests take
//! whole pages. A collector reclaims garbage in batches with
//! [`RosAlloc::bulk_free`] and revokes thread-local runs before tracing.
//!
//! Addresses are logical: the allocator manages the layout of a region it
//! never dereferences. The embedder owns the memory and is notified of
//! footprint changes through [`PageBacking`].

#![forbid(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod page_map;
pub mod release;
pub mod run;
pub mod size_class;
pub mod thread_cache;

pub use allocator::{Allocation, RosAlloc, RunCensus};
pub use config::RosAllocConfig;
pub use error::AllocError;
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use metrics::MetricsSnapshot;
pub use release::{BackingEvent, NoopBacking, PageBacking, PageReleaseMode, RecordingBacking};
pub use thread_cache::MutatorId;
