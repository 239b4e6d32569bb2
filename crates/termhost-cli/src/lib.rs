//! Terminal host for the termhost runtime: a line shell over stdin plus an
//! in-memory log buffer for the runtime's own tracing output.

pub mod log_buffer;
pub mod shell;

pub use log_buffer::{LogBuffer, LogEntry, LogLayer, LogsCommand, LOG_BUFFER};
pub use shell::{describe_event, parse_line, print_events, Line, Shell};
