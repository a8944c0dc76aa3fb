//! Output demultiplexing.
//!
//! A single dedicated loop (owned by the session) feeds every notification
//! through [`OutputDemux`], which splits the stream into its two consumers:
//! program standard output goes to a [`ConsoleSink`] as timestamped log
//! records, hub status reports are published on a watch channel the
//! application is free to ignore. Notification order as delivered by the
//! transport is preserved; nothing here reorders or acknowledges.

use crate::protocol::{Event, StatusReport};
use log::{debug, trace};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;

/// Severity of a console log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Routine output.
    Info,
    /// An operation completed.
    Success,
    /// Something degraded but survivable.
    Warning,
    /// An operation failed.
    Error,
}

/// One line destined for the user-visible console.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// When the record was produced.
    pub timestamp: SystemTime,
    /// Record severity.
    pub severity: Severity,
    /// Record text, one line, no trailing newline.
    pub text: String,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            severity,
            text: text.into(),
        }
    }
}

/// Consumer of console log records.
pub trait ConsoleSink: Send + Sync {
    /// Deliver one record. Must not block on unrelated work.
    fn log(&self, record: LogRecord);
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConsole;

impl ConsoleSink for NullConsole {
    fn log(&self, _record: LogRecord) {}
}

/// Routes decoded notification events to their consumers.
pub struct OutputDemux {
    console: Arc<dyn ConsoleSink>,
    status_tx: watch::Sender<Option<StatusReport>>,
    /// Undecodable UTF-8 tail carried to the next notification.
    pending: Vec<u8>,
    /// Current incomplete output line.
    line: String,
    program_was_running: bool,
}

impl OutputDemux {
    /// Create a demultiplexer writing to the given sinks.
    pub fn new(console: Arc<dyn ConsoleSink>, status_tx: watch::Sender<Option<StatusReport>>) -> Self {
        Self {
            console,
            status_tx,
            pending: Vec::new(),
            line: String::new(),
            program_was_running: false,
        }
    }

    /// Handle one raw notification payload.
    pub fn handle_notification(&mut self, raw: &[u8]) {
        match Event::decode(raw) {
            Some(Event::Stdout(bytes)) => {
                self.pending.extend_from_slice(&bytes);
                let text = drain_utf8_lossy(&mut self.pending);
                self.push_text(&text);
            },
            Some(Event::Status(report)) => self.handle_status(report),
            Some(Event::Unrecognized { tag, payload }) => {
                trace!(
                    "Dropping unrecognized event 0x{tag:02X} ({} bytes)",
                    payload.len()
                );
            },
            None => trace!("Dropping empty notification"),
        }
    }

    fn handle_status(&mut self, report: StatusReport) {
        let running = report.program_running();
        if running != self.program_was_running {
            debug!(
                "User program {}",
                if running { "started" } else { "stopped" }
            );
            if !running {
                // Emit whatever the program printed without a final newline
                self.flush();
            }
            self.program_was_running = running;
        }
        self.status_tx.send_replace(Some(report));
    }

    fn push_text(&mut self, text: &str) {
        for ch in clean_output_text(text).chars() {
            if ch == '\n' {
                self.emit_line();
            } else {
                self.line.push(ch);
            }
        }
    }

    fn emit_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        self.console
            .log(LogRecord::new(Severity::Info, line.trim_end()));
    }

    /// Emit any buffered partial line. Called on program end and teardown.
    pub fn flush(&mut self) {
        if !self.line.is_empty() {
            self.emit_line();
        }
    }
}

/// Drain buffered bytes into displayable UTF-8 text without stalling on
/// invalid bytes.
///
/// Valid UTF-8 is taken as-is; invalid sequences become the replacement char
/// and decoding continues; an incomplete trailing sequence stays in `buffer`
/// for the next notification.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                return output;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                let Some(invalid_len) = err.error_len() else {
                    // Incomplete sequence at the end: keep it buffered
                    buffer.drain(..valid_up_to);
                    return output;
                };

                output.push('\u{FFFD}');
                let drain_to = (valid_up_to + invalid_len).min(buffer.len());
                buffer.drain(..drain_to);
            },
        }
    }
}

/// Strip protocol noise from decoded output text.
///
/// Control characters below 0x20 (other than `\n` and `\t`) and in the
/// 0x7F-0x9F range are not program output; they are dropped. CRLF and lone
/// CR both normalize to `\n`.
pub fn clean_output_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut out = String::with_capacity(normalized.len());
    for ch in normalized.chars() {
        match ch {
            '\n' | '\t' => out.push(ch),
            '\r' => out.push('\n'),
            c if c.is_control() => {},
            c => out.push(c),
        }
    }
    out
}
