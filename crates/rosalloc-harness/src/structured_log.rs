//! Structured JSONL logging for harness runs.
//!
//! Every line is one JSON object with the required fields
//! `timestamp`, `trace_id`, `level` and `event`. Allocator lifecycle records
//! are forwarded into the same stream so a single file tells the story of a
//! stress run.

use rosalloc_core::{AllocatorLogLevel, AllocatorLogRecord};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Harness log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<AllocatorLogLevel> for LogLevel {
    fn from(level: AllocatorLogLevel) -> Self {
        match level {
            AllocatorLogLevel::Trace => Self::Trace,
            AllocatorLogLevel::Debug => Self::Debug,
            AllocatorLogLevel::Info => Self::Info,
            AllocatorLogLevel::Warn => Self::Warn,
            AllocatorLogLevel::Error => Self::Error,
        }
    }
}

/// Result of a harness phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
}

/// Where a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Emitted by the harness itself.
    Harness,
    /// Forwarded allocator lifecycle record.
    Allocator,
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

/// One structured log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<Source>,
    /// Allocator operation involved (`allocate`, `bulk_free`, ...).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub release_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mutator: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub addr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bracket: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub footprint: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a minimal entry with only the required fields.
    #[must_use]
    pub fn new(trace_id: &str, level: LogLevel, event: &str) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.to_string(),
            level,
            event: event.to_string(),
            run_id: None,
            source: None,
            symbol: None,
            release_mode: None,
            mutator: None,
            addr: None,
            size: None,
            bracket: None,
            footprint: None,
            outcome: None,
            duration_ms: None,
            details: None,
        }
    }

    /// Convert an allocator lifecycle record. The allocator's own trace id is
    /// kept so lines can be correlated with [`AllocatorLogRecord::decision_id`].
    #[must_use]
    pub fn from_lifecycle(record: &AllocatorLogRecord) -> Self {
        let mut entry = Self::new(&record.trace_id, record.level.into(), record.event)
            .with_source(Source::Allocator)
            .with_symbol(record.symbol)
            .with_footprint(record.footprint);
        entry.addr = record.addr;
        entry.size = record.size;
        entry.bracket = record.bracket;
        entry.details = Some(serde_json::json!({
            "decision_id": record.decision_id,
            "outcome": record.outcome,
            "details": record.details,
        }));
        entry
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    #[must_use]
    pub fn with_release_mode(mut self, mode: &str) -> Self {
        self.release_mode = Some(mode.to_string());
        self
    }

    #[must_use]
    pub fn with_mutator(mut self, mutator: u64) -> Self {
        self.mutator = Some(mutator);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_footprint(mut self, footprint: usize) -> Self {
        self.footprint = Some(footprint);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// LogEmitter
// ---------------------------------------------------------------------------

/// Writes [`LogEntry`] lines and stamps them with sequential trace ids.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    seq: u64,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(
            Box::new(std::io::BufWriter::new(file)),
            run_id,
        ))
    }

    /// Create an emitter over any writer.
    #[must_use]
    pub fn to_writer(writer: Box<dyn Write + Send>, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    /// Create an emitter over a [`SharedBuffer`] (for tests and in-process use).
    #[must_use]
    pub fn to_buffer(buffer: &SharedBuffer, run_id: &str) -> Self {
        Self::to_writer(Box::new(buffer.clone()), run_id)
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("rosalloc-harness::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a bare entry with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(&trace_id, level, event)
            .with_run_id(&self.run_id)
            .with_source(Source::Harness);
        self.write_line(&entry)?;
        Ok(entry)
    }

    /// Emit a fully-populated entry, filling in trace id, run id and source
    /// when absent.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        if entry.source.is_none() {
            entry.source = Some(Source::Harness);
        }
        self.write_line(&entry)
    }

    /// Forward allocator lifecycle records. Returns how many were written.
    pub fn forward_lifecycle(&mut self, records: &[AllocatorLogRecord]) -> std::io::Result<usize> {
        for record in records {
            self.emit_entry(LogEntry::from_lifecycle(record))?;
        }
        Ok(records.len())
    }

    fn write_line(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Cloneable in-memory sink.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut bytes = self.0.lock().unwrap_or_else(|e| e.into_inner());
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_OUTCOMES: [&str; 4] = ["pass", "fail", "skip", "error"];
const VALID_SOURCES: [&str; 2] = ["harness", "allocator"];

/// Validate a single JSONL line.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            errors.push(LogValidationError {
                line_number,
                field: "<json>".to_string(),
                message: format!("invalid JSON: {e}"),
            });
            return Err(errors);
        }
    };

    let Some(obj) = value.as_object() else {
        errors.push(LogValidationError {
            line_number,
            field: "<root>".to_string(),
            message: "expected a JSON object".to_string(),
        });
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.get(field).is_some_and(serde_json::Value::is_string) {
            errors.push(LogValidationError {
                line_number,
                field: field.to_string(),
                message: "required string field missing".to_string(),
            });
        }
    }

    let enum_fields: [(&str, &[&str]); 3] = [
        ("level", &VALID_LEVELS),
        ("outcome", &VALID_OUTCOMES),
        ("source", &VALID_SOURCES),
    ];
    for (field, allowed) in enum_fields {
        if let Some(value) = obj.get(field).and_then(|v| v.as_str())
            && !allowed.contains(&value)
        {
            errors.push(LogValidationError {
                line_number,
                field: field.to_string(),
                message: format!("invalid {field}: '{value}'"),
            });
        }
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id.contains("::")
    {
        errors.push(LogValidationError {
            line_number,
            field: "trace_id".to_string(),
            message: format!("trace_id should be '::'-separated, got: '{trace_id}'"),
        });
    }

    // Allocator records must say which operation produced them.
    if obj.get("source").and_then(|v| v.as_str()) == Some("allocator")
        && !obj.get("symbol").is_some_and(serde_json::Value::is_string)
    {
        errors.push(LogValidationError {
            line_number,
            field: "symbol".to_string(),
            message: "allocator records must carry the originating symbol".to_string(),
        });
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<deserialization>".to_string(),
            message: format!("failed to deserialize: {e}"),
        }]
    })
}

/// Validate a whole JSONL document. Returns the non-empty line count and
/// every error found.
#[must_use]
pub fn validate_log_text(content: &str) -> (usize, Vec<LogValidationError>) {
    let mut all_errors = Vec::new();
    let mut line_count = 0;
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }
    (line_count, all_errors)
}

/// Validate a JSONL file.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(validate_log_text(&content))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    // Approximate calendar fields; ordering and time of day are exact.
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        1970 + secs / 31_557_600,
        (secs % 31_557_600) / 2_629_800 + 1,
        (secs % 2_629_800) / 86400 + 1,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        millis,
    )
}
