//! Structured allocator lifecycle log.
//!
//! Slow-path decisions (run refills, page growth, revocation, trimming,
//! rejected frees) are recorded as [`AllocatorLogRecord`]s in a bounded ring.
//! Fast-path slot allocations are never logged.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    /// Parse from string (case-insensitive). Unknown values yield `Info`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision id, unique per allocator.
    pub decision_id: u64,
    /// Correlation id: `rosalloc::<symbol>::<decision_id:016x>`.
    pub trace_id: String,
    pub level: AllocatorLogLevel,
    /// Public operation that triggered the event (`allocate`, `bulk_free`, ...).
    pub symbol: &'static str,
    /// Event kind (`run_refill`, `footprint_grow`, ...).
    pub event: &'static str,
    /// Logical address involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<usize>,
    /// Byte count involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Bracket index, if the event concerns a run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bracket: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Region footprint when the record was taken.
    pub footprint: usize,
}

/// One event before it is stamped with ids.
#[derive(Debug, Clone)]
pub(crate) struct LogEvent {
    pub level: AllocatorLogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub addr: Option<usize>,
    pub size: Option<usize>,
    pub bracket: Option<usize>,
    pub outcome: &'static str,
    pub details: String,
}

impl LogEvent {
    pub fn new(level: AllocatorLogLevel, symbol: &'static str, event: &'static str) -> Self {
        Self {
            level,
            symbol,
            event,
            addr: None,
            size: None,
            bracket: None,
            outcome: "ok",
            details: String::new(),
        }
    }

    pub fn addr(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn bracket(mut self, idx: usize) -> Self {
        self.bracket = Some(idx);
        self
    }

    pub fn outcome(mut self, outcome: &'static str) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded, level-filtered ring of lifecycle records.
#[derive(Debug)]
pub struct LifecycleLog {
    next_decision_id: AtomicU64,
    min_level: AllocatorLogLevel,
    capacity: usize,
    records: Mutex<VecDeque<AllocatorLogRecord>>,
}

impl LifecycleLog {
    #[must_use]
    pub fn new(min_level: AllocatorLogLevel, capacity: usize) -> Self {
        Self {
            next_decision_id: AtomicU64::new(1),
            min_level,
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Whether records at `level` are kept.
    #[must_use]
    pub fn enabled(&self, level: AllocatorLogLevel) -> bool {
        self.capacity > 0 && level >= self.min_level
    }

    pub(crate) fn record(&self, event: LogEvent, footprint: usize) {
        if !self.enabled(event.level) {
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("rosalloc::{}::{:016x}", event.symbol, decision_id);
        let record = AllocatorLogRecord {
            decision_id,
            trace_id,
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            addr: event.addr,
            size: event.size,
            bracket: event.bracket,
            outcome: event.outcome,
            details: event.details,
            footprint,
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Copy of the retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AllocatorLogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Removes and returns the retained records, oldest first.
    pub fn drain(&self) -> Vec<AllocatorLogRecord> {
        self.records.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(level: AllocatorLogLevel, event: &'static str) -> LogEvent {
        LogEvent::new(level, "allocate", event)
    }

    #[test]
    fn level_filter_and_trace_ids() {
        let log = LifecycleLog::new(AllocatorLogLevel::Info, 16);
        log.record(ev(AllocatorLogLevel::Debug, "dropped"), 0);
        log.record(ev(AllocatorLogLevel::Info, "kept").addr(0x2000).size(64).bracket(3), 8192);
        log.record(ev(AllocatorLogLevel::Error, "kept_too").outcome("denied"), 8192);

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "kept");
        assert_eq!(records[0].decision_id, 1);
        assert_eq!(records[0].trace_id, "rosalloc::allocate::0000000000000001");
        assert_eq!(records[0].bracket, Some(3));
        assert_eq!(records[1].outcome, "denied");
        assert_eq!(records[1].footprint, 8192);
    }

    #[test]
    fn ring_drops_oldest() {
        let log = LifecycleLog::new(AllocatorLogLevel::Trace, 3);
        for _ in 0..5 {
            log.record(ev(AllocatorLogLevel::Trace, "tick"), 0);
        }
        let ids: Vec<u64> = log.drain().iter().map(|r| r.decision_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn zero_capacity_disables_logging() {
        let log = LifecycleLog::new(AllocatorLogLevel::Trace, 0);
        assert!(!log.enabled(AllocatorLogLevel::Error));
        log.record(ev(AllocatorLogLevel::Error, "ignored"), 0);
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn records_serialize_without_empty_fields() {
        let log = LifecycleLog::new(AllocatorLogLevel::Trace, 4);
        log.record(ev(AllocatorLogLevel::Warn, "footprint_grow").size(4096), 4096);
        let json = serde_json::to_string(&log.snapshot()[0]).unwrap();
        assert!(json.contains("\"level\":\"warn\""));
        assert!(json.contains("\"size\":4096"));
        assert!(!json.contains("\"addr\""));
    }

    #[test]
    fn parse_levels() {
        assert_eq!(AllocatorLogLevel::from_str_loose("TRACE"), AllocatorLogLevel::Trace);
        assert_eq!(AllocatorLogLevel::from_str_loose("warning"), AllocatorLogLevel::Warn);
        assert_eq!(AllocatorLogLevel::from_str_loose("nope"), AllocatorLogLevel::Info);
    }
}
