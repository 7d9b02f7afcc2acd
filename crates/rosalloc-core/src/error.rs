//! Allocator error taxonomy.
//!
//! The allocator is a trusted runtime component: callers either recover from
//! [`AllocError::OutOfMemory`] (typically by collecting) or treat the other
//! variants as fatal programming errors.

use thiserror::Error;

/// Errors reported by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The region cannot grow to satisfy a page request within its limit.
    #[error(
        "region exhausted: requested {requested} bytes (footprint {footprint}, limit {capacity})"
    )]
    OutOfMemory {
        requested: usize,
        footprint: usize,
        capacity: usize,
    },
    /// The address is not the start of a live allocation.
    #[error("invalid free of {addr:#x}: {reason}")]
    InvalidFree { addr: usize, reason: &'static str },
    /// Allocator metadata is inconsistent (use-after-free or overrun elsewhere).
    #[error("corrupted allocator metadata at page {page}: {detail}")]
    Corruption { page: usize, detail: String },
    /// Rejected configuration or region geometry.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AllocError {
    /// Returns true for the recoverable out-of-memory condition.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = AllocError::OutOfMemory {
            requested: 8192,
            footprint: 4096,
            capacity: 8192,
        };
        let text = err.to_string();
        assert!(text.contains("8192"));
        assert!(text.contains("footprint 4096"));
        assert!(err.is_out_of_memory());

        let err = AllocError::InvalidFree {
            addr: 0x1000,
            reason: "not an object start",
        };
        assert_eq!(
            err.to_string(),
            "invalid free of 0x1000: not an object start"
        );
        assert!(!err.is_out_of_memory());
    }
}
