//! Per-execution diagnostic channel.
//!
//! A [`DiagnosticChannel`] is opened for exactly one evaluation and lives in
//! that evaluation's `OpState`. The script's `console` object writes to it
//! through `op_evalgate_log`; nothing here touches process-wide logging state
//! beyond forwarding each record to `tracing`.

use serde::Serialize;

/// `tracing` target for diagnostics forwarded from evaluated scripts.
pub const JS_LOG_TARGET: &str = "evalgate::sandbox::js";

/// Default cap on captured records per execution.
pub const DEFAULT_MAX_LOG_RECORDS: usize = 1000;

/// Severity of a captured record.
///
/// `Info` is written as `"log"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    /// `console.log`, `console.info`, `console.debug`.
    #[serde(rename = "log")]
    Info,
    /// `console.error`, `console.warn`.
    #[serde(rename = "error")]
    Error,
}

/// One line of diagnostic output captured from the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Space-joined rendering of the console call's arguments.
    pub message: String,
}

impl LogRecord {
    /// Build a record.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Append-only record sink scoped to a single execution.
#[derive(Debug)]
pub struct DiagnosticChannel {
    tag: Option<String>,
    records: Vec<LogRecord>,
    max_records: usize,
    dropped: usize,
}

impl DiagnosticChannel {
    /// Open a channel, optionally tagging forwarded output with `tag`.
    pub fn open(tag: Option<String>, max_records: usize) -> Self {
        Self {
            tag,
            records: Vec::new(),
            max_records,
            dropped: 0,
        }
    }

    /// Append a record and forward it to the host log.
    ///
    /// Records past `max_records` are forwarded but not retained.
    pub fn record(&mut self, level: LogLevel, message: String) {
        self.forward(level, &message);
        if self.records.len() < self.max_records {
            self.records.push(LogRecord { level, message });
        } else {
            self.dropped += 1;
        }
    }

    /// Close the channel and hand back its records.
    ///
    /// If any records were dropped, a single trailing error record says how many.
    pub fn finish(mut self) -> Vec<LogRecord> {
        if self.dropped > 0 {
            self.records.push(LogRecord::new(
                LogLevel::Error,
                format!(
                    "log output truncated: {} further records dropped (max {})",
                    self.dropped, self.max_records
                ),
            ));
        }
        self.records
    }

    fn forward(&self, level: LogLevel, message: &str) {
        match (level, self.tag.as_deref()) {
            (LogLevel::Info, Some(tag)) => tracing::info!(target: JS_LOG_TARGET, "[{tag}] {message}"),
            (LogLevel::Info, None) => tracing::info!(target: JS_LOG_TARGET, "{message}"),
            (LogLevel::Error, Some(tag)) => tracing::error!(target: JS_LOG_TARGET, "[{tag}] {message}"),
            (LogLevel::Error, None) => tracing::error!(target: JS_LOG_TARGET, "{message}"),
        }
    }
}
