use rosalloc_core::AllocError;
use thiserror::Error;

/// Failures surfaced by harness commands.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocator: {0}")]
    Alloc(#[from] AllocError),
    #[error("invalid workload: {0}")]
    InvalidWorkload(String),
    #[error("mutator {0} panicked")]
    MutatorPanicked(u64),
}
