//! Page release policy and the backing-store hooks.
//!
//! The allocator manages logical addresses; the embedder owns the actual
//! memory. [`PageBacking`] is the seam through which the region reports
//! growth, shrinkage, and pages whose contents may be discarded.

use parking_lot::Mutex;
use serde::Serialize;

/// When free pages are handed back to the backing store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageReleaseMode {
    /// Never release.
    None,
    /// Release free runs touching the end of the region.
    End,
    /// Release free runs at least as large as the threshold.
    Size,
    /// Release free runs that are both at the end and at least the threshold.
    #[default]
    SizeAndEnd,
    /// Release every free run.
    All,
}

impl PageReleaseMode {
    /// Parse from string (case-insensitive). Unknown values fall back to the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "never" | "off" => Self::None,
            "end" => Self::End,
            "size" => Self::Size,
            "size_and_end" | "sizeandend" | "size-and-end" | "default" => Self::SizeAndEnd,
            "all" | "always" => Self::All,
            _ => Self::default(),
        }
    }

    /// Decides whether a free run of `bytes` should be released.
    ///
    /// `at_end` is true when the run is the last one below the footprint.
    #[must_use]
    pub const fn should_release(self, bytes: usize, threshold: usize, at_end: bool) -> bool {
        match self {
            Self::None => false,
            Self::End => at_end,
            Self::Size => bytes >= threshold,
            Self::SizeAndEnd => at_end && bytes >= threshold,
            Self::All => true,
        }
    }

    /// True when every free run is released regardless of size or position.
    #[must_use]
    pub const fn releases_all(self) -> bool {
        matches!(self, Self::All)
    }
}

/// Receiver of page-level lifecycle notifications.
///
/// Addresses are logical; `bytes` are always page multiples. Implementations
/// must not call back into the allocator.
pub trait PageBacking: Send + Sync {
    /// The footprint grew: `[addr, addr + bytes)` is now in use.
    fn grow(&self, addr: usize, bytes: usize);

    /// The footprint shrank: `[addr, addr + bytes)` is no longer in use.
    fn shrink(&self, addr: usize, bytes: usize);

    /// `[addr, addr + bytes)` is free and may be discarded. The next owner
    /// reads it as zero.
    fn release(&self, addr: usize, bytes: usize);
}

/// Backing that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBacking;

impl PageBacking for NoopBacking {
    fn grow(&self, _addr: usize, _bytes: usize) {}
    fn shrink(&self, _addr: usize, _bytes: usize) {}
    fn release(&self, _addr: usize, _bytes: usize) {}
}

/// A single backing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackingEvent {
    Grow { addr: usize, bytes: usize },
    Shrink { addr: usize, bytes: usize },
    Release { addr: usize, bytes: usize },
}

/// Backing that records every notification, for tests and the harness.
#[derive(Debug, Default)]
pub struct RecordingBacking {
    events: Mutex<Vec<BackingEvent>>,
}

impl RecordingBacking {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<BackingEvent> {
        self.events.lock().clone()
    }

    /// Removes and returns recorded events.
    pub fn take_events(&self) -> Vec<BackingEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Total bytes passed to [`PageBacking::release`].
    #[must_use]
    pub fn released_bytes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .map(|e| match e {
                BackingEvent::Release { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum()
    }
}

impl PageBacking for RecordingBacking {
    fn grow(&self, addr: usize, bytes: usize) {
        self.events.lock().push(BackingEvent::Grow { addr, bytes });
    }

    fn shrink(&self, addr: usize, bytes: usize) {
        self.events.lock().push(BackingEvent::Shrink { addr, bytes });
    }

    fn release(&self, addr: usize, bytes: usize) {
        self.events.lock().push(BackingEvent::Release { addr, bytes });
    }
}
