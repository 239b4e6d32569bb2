//! Log capture: ring-buffer tracing layer for the runtime's log lines.
//!
//! Keeps the last N events emitted by the termhost crates so that the
//! `logs` shell command can show them without scrolling back through
//! stderr.

use std::collections::VecDeque;
use std::sync::{LazyLock, Mutex, PoisonError};

use serde::Serialize;
use termhost_runtime::{Command, CommandContext, RuntimeError};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Default ring buffer capacity (how many log entries to keep).
const DEFAULT_CAPACITY: usize = 500;

/// Entries shown by `logs` when no count is given.
const DEFAULT_SHOWN: usize = 20;

/// Global log buffer, shared by the tracing layer and the `logs` command.
pub static LOG_BUFFER: LazyLock<LogBuffer> = LazyLock::new(|| LogBuffer::new(DEFAULT_CAPACITY));

/// A single captured log entry.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub timestamp: String,
    /// "DEBUG", "INFO", "WARN" or "ERROR"
    pub level: String,
    /// Module path (e.g. "termhost_runtime::plugins")
    pub target: String,
    pub message: String,
    /// Structured fields as key=value pairs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl LogEntry {
    /// One-line rendering used by the shell.
    pub fn render(&self) -> String {
        let mut line = format!("{} {:<5} {}: {}", self.timestamp, self.level, self.target, self.message);
        if !self.fields.is_empty() {
            line.push(' ');
            line.push_str(&self.fields.join(" "));
        }
        line
    }
}

/// Thread-safe ring buffer of log entries.
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push a new entry, evicting the oldest if at capacity.
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries oldest first, optionally filtered by level and limited to
    /// the most recent `limit`.
    pub fn entries(&self, level_filter: Option<&str>, limit: Option<usize>) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&LogEntry> = entries
            .iter()
            .filter(|e| level_filter.map_or(true, |lvl| e.level.eq_ignore_ascii_case(lvl)))
            .collect();
        let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Visitor that extracts the message and structured fields from an event.
#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Vec<String>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
            if self.message.len() >= 2 && self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.push(format!("{}={}", field.name(), value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.push(format!("{}={}", field.name(), value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.push(format!("{}={}", field.name(), value));
    }
}

/// Target prefixes captured by [`LogLayer`].
const CAPTURED_TARGETS: &[&str] = &["termhost_runtime", "termhost_cli", "termhost"];

fn should_capture(target: &str) -> bool {
    CAPTURED_TARGETS
        .iter()
        .any(|prefix| target.starts_with(prefix))
}

/// Tracing layer that copies termhost events into a [`LogBuffer`].
pub struct LogLayer {
    buffer: &'static LogBuffer,
}

impl LogLayer {
    /// A layer backed by the global [`LOG_BUFFER`].
    pub fn new() -> Self {
        Self {
            buffer: &LOG_BUFFER,
        }
    }
}

impl Default for LogLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for LogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if !should_capture(target) || *metadata.level() == Level::TRACE {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        self.buffer.push(LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: metadata.level().to_string(),
            target: target.to_string(),
            message: collector.message,
            fields: collector.fields,
        });
    }
}

// ── Shell command ───────────────────────────────────────────────

/// `logs [level] [count]`: show captured log lines.
pub struct LogsCommand {
    buffer: &'static LogBuffer,
}

impl LogsCommand {
    pub fn new(buffer: &'static LogBuffer) -> Self {
        Self { buffer }
    }
}

impl Command for LogsCommand {
    fn name(&self) -> &str {
        "logs"
    }

    fn description(&self) -> &str {
        "Show recent runtime log lines"
    }

    fn usage(&self) -> &str {
        "logs [level] [count] | logs clear"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), RuntimeError> {
        let mut level = None;
        let mut limit = DEFAULT_SHOWN;
        for arg in ctx.args() {
            if arg == "clear" {
                self.buffer.clear();
                ctx.set_result("log buffer cleared");
                return Ok(());
            }
            match arg.parse::<usize>() {
                Ok(n) => limit = n,
                Err(_) => level = Some(arg.clone()),
            }
        }

        let entries = self.buffer.entries(level.as_deref(), Some(limit));
        if entries.is_empty() {
            ctx.set_result("no log entries");
        } else {
            let lines: Vec<String> = entries.iter().map(LogEntry::render).collect();
            ctx.set_result(lines.join("\n"));
        }
        Ok(())
    }
}
