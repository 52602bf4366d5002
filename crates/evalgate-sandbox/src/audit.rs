//! Audit logging for sandbox executions.
//!
//! Every sandbox execution emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash and byte size of the code (never raw code in logs)
//! - Correlation tag, variable count and captured log count
//! - Duration, result size and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::fmt::Write as _;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TIMEOUT;
use crate::outcome::{ExecutionResponse, Outcome};
use crate::request::ExecutionRequest;

/// A complete audit record for a single sandbox execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// ISO-8601 timestamp of when execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// Size of the submitted code in bytes.
    pub code_size: usize,
    /// Caller-supplied correlation tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Number of variables supplied.
    pub variable_count: usize,
    /// Number of log records returned.
    pub log_count: usize,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the serialized return value in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of a sandbox execution.
///
/// Failures carry only their `errorType`: thrown messages may echo
/// caller data and are kept out of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Execution completed successfully.
    Success,
    /// Execution failed.
    Failure {
        /// The reported `errorType`.
        error_type: String,
    },
    /// Execution was terminated due to timeout.
    Timeout,
}

impl AuditOutcome {
    fn label(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::Timeout => "timeout",
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Builder for constructing audit entries around an execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_size: usize,
    tag: Option<String>,
    variable_count: usize,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for a request.
    pub fn new(request: &ExecutionRequest) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(&request.code),
            code_size: request.code.len(),
            tag: request.tag.clone(),
            variable_count: request.variables.len(),
            start: Instant::now(),
        }
    }

    /// The execution ID this entry will carry.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Finalize the audit entry with the execution response.
    pub fn finish(self, response: &ExecutionResponse) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match &response.outcome {
            Outcome::Success { retval } => {
                let size = retval
                    .as_ref()
                    .and_then(|v| serde_json::to_string(v).ok())
                    .map_or(0, |s| s.len());
                (size, AuditOutcome::Success)
            }
            Outcome::Failure { error_type, .. } if error_type == TIMEOUT => (0, AuditOutcome::Timeout),
            Outcome::Failure { error_type, .. } => (
                0,
                AuditOutcome::Failure {
                    error_type: error_type.clone(),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_size: self.code_size,
            tag: self.tag,
            variable_count: self.variable_count,
            log_count: response.logs.len(),
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via the [`tracing`] framework.
///
/// Audit entries are logged at `INFO` level with `audit = true` for easy
/// filtering.
///
/// Use `RUST_LOG=evalgate=info` to capture all audit events.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let error_type = match &entry.outcome {
            AuditOutcome::Failure { error_type } => error_type.as_str(),
            _ => "",
        };
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            code_hash = %entry.code_hash,
            code_size = entry.code_size,
            tag = entry.tag.as_deref().unwrap_or_default(),
            variables = entry.variable_count,
            logs = entry.log_count,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            outcome = entry.outcome.label(),
            error_type,
            "audit"
        );
    }
}
