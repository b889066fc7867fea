// crates/snapkeep-core/src/events.rs
// ============================================================================
// Module: Structured Events
// Description: JSON-line event payloads and pluggable sinks.
// Purpose: Emit structured logs without binding to a logging provider.
// Dependencies: serde, serde_json, time
// ============================================================================

//! ## Overview
//! Components log through an [`EventLog`], which stamps each [`LogEvent`]
//! with the injected clock and hands it to an [`EventSink`]. Sinks write one
//! JSON object per line (stderr or an append-only file), drop everything,
//! or keep events in memory for assertions. Provider-specific formatting is
//! left to whatever consumes the lines.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::clock::rfc3339;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Event severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Per-attempt detail.
    Debug,
    /// Normal progress.
    #[default]
    Info,
    /// Recoverable trouble (retries, best-effort steps that failed).
    Warn,
    /// Failed operations.
    Error,
}

/// One structured log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Severity.
    pub level: Level,
    /// RFC 3339 timestamp from the injected clock.
    pub timestamp: String,
    /// Emitting component.
    pub component: &'static str,
    /// Event-specific fields.
    #[serde(flatten)]
    pub fields: BTreeMap<&'static str, Value>,
}

impl LogEvent {
    /// Returns a field value by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

// ============================================================================
// SECTION: Sink Trait
// ============================================================================

/// Destination for structured events.
pub trait EventSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: &LogEvent);
}

/// Sink that writes JSON lines to stderr.
pub struct StderrEventSink;

impl EventSink for StderrEventSink {
    fn record(&self, event: &LogEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Sink that appends JSON lines to a file.
pub struct FileEventSink {
    /// Append-only file handle.
    file: Mutex<std::fs::File>,
}

impl FileEventSink {
    /// Opens `path` in append mode, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for FileEventSink {
    fn record(&self, event: &LogEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// Sink that drops every event.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: &LogEvent) {}
}

/// Sink that keeps events in memory.
#[derive(Default)]
pub struct MemoryEventSink {
    /// Recorded events in arrival order.
    events: Mutex<Vec<LogEvent>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event.
    #[must_use]
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Counts recorded events named `event`.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|recorded| recorded.event == event)
            .count()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: &LogEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
    }
}

/// Sink wrapper that drops events below a minimum level.
pub struct LevelFilterSink {
    /// Wrapped sink.
    inner: Arc<dyn EventSink>,
    /// Lowest level forwarded.
    min_level: Level,
}

impl LevelFilterSink {
    /// Wraps `inner`, forwarding events at `min_level` or above.
    #[must_use]
    pub fn new(inner: Arc<dyn EventSink>, min_level: Level) -> Self {
        Self {
            inner,
            min_level,
        }
    }
}

impl EventSink for LevelFilterSink {
    fn record(&self, event: &LogEvent) {
        if event.level >= self.min_level {
            self.inner.record(event);
        }
    }
}

// ============================================================================
// SECTION: Event Log Handle
// ============================================================================

/// Cloneable logging handle bound to a sink, a clock, and a component name.
#[derive(Clone)]
pub struct EventLog {
    /// Destination sink.
    sink: Arc<dyn EventSink>,
    /// Timestamp source.
    clock: Arc<dyn Clock>,
    /// Component label attached to each event.
    component: &'static str,
}

impl EventLog {
    /// Creates a handle.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sink,
            clock,
            component: "snapkeep",
        }
    }

    /// Handle that drops everything; for callers that do not care.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopEventSink), Arc::new(SystemClock))
    }

    /// Returns a handle that labels events with `component`.
    #[must_use]
    pub fn component(&self, component: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            clock: Arc::clone(&self.clock),
            component,
        }
    }

    /// Returns the clock used for timestamps.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Starts a debug event.
    #[must_use]
    pub fn debug(&self, event: &'static str) -> PendingEvent<'_> {
        self.start(Level::Debug, event)
    }

    /// Starts an info event.
    #[must_use]
    pub fn info(&self, event: &'static str) -> PendingEvent<'_> {
        self.start(Level::Info, event)
    }

    /// Starts a warning event.
    #[must_use]
    pub fn warn(&self, event: &'static str) -> PendingEvent<'_> {
        self.start(Level::Warn, event)
    }

    /// Starts an error event.
    #[must_use]
    pub fn error(&self, event: &'static str) -> PendingEvent<'_> {
        self.start(Level::Error, event)
    }

    /// Builds an event stamped with the current clock time.
    fn start(&self, level: Level, event: &'static str) -> PendingEvent<'_> {
        PendingEvent {
            log: self,
            event: LogEvent {
                event,
                level,
                timestamp: rfc3339(self.clock.now()),
                component: self.component,
                fields: BTreeMap::new(),
            },
        }
    }
}

/// Event under construction; call [`PendingEvent::emit`] to record it.
#[must_use = "events are only recorded by calling emit()"]
pub struct PendingEvent<'a> {
    /// Handle the event will be emitted through.
    log: &'a EventLog,
    /// Event payload.
    event: LogEvent,
}

impl PendingEvent<'_> {
    /// Adds a field.
    pub fn field(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.event.fields.insert(name, value.into());
        self
    }

    /// Adds an error field rendered with `Display`.
    pub fn error(self, error: &dyn std::fmt::Display) -> Self {
        self.field("error", error.to_string())
    }

    /// Records the event.
    pub fn emit(self) {
        self.log.sink.record(&self.event);
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions.")]

    use time::macros::datetime;

    use super::*;
    use crate::clock::ManualClock;

    fn memory_log() -> (Arc<MemoryEventSink>, EventLog) {
        let sink = Arc::new(MemoryEventSink::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-02-03 04:05:06 UTC)));
        let log = EventLog::new(sink.clone(), clock).component("snapshot");
        (sink, log)
    }

    #[test]
    fn events_carry_clock_time_and_fields() {
        let (sink, log) = memory_log();
        log.info("snapshot_attempt").field("attempt", 2_u32).field("path", "a.sqlite").emit();
        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.timestamp, "2026-02-03T04:05:06Z");
        assert_eq!(event.component, "snapshot");
        assert_eq!(event.field("attempt"), Some(&Value::from(2_u32)));
        let line = serde_json::to_value(event).unwrap();
        assert_eq!(line["event"], "snapshot_attempt");
        assert_eq!(line["level"], "info");
        assert_eq!(line["path"], "a.sqlite");
    }

    #[test]
    fn level_filter_drops_lower_levels() {
        let memory = Arc::new(MemoryEventSink::new());
        let filtered = Arc::new(LevelFilterSink::new(memory.clone(), Level::Warn));
        let log = EventLog::new(filtered, Arc::new(SystemClock));
        log.debug("noise").emit();
        log.info("progress").emit();
        log.warn("retry").emit();
        log.error("failed").emit();
        assert_eq!(memory.events().len(), 2);
        assert_eq!(memory.count("retry"), 1);
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("events.jsonl");
        let sink = Arc::new(FileEventSink::new(&path).unwrap());
        let log = EventLog::new(sink, Arc::new(SystemClock));
        log.info("one").emit();
        log.warn("two").field("attempt", 1_u32).emit();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> =
            text.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["event"], "two");
        assert_eq!(lines[1]["attempt"], 1);
    }
}
