//! Error types for the evalgate sandbox.
//!
//! Every [`SandboxError`] maps to a stable `errorType` string via
//! [`SandboxError::error_type`]. Errors thrown by the evaluated script itself
//! never become a `SandboxError`; they are classified inside the isolate and
//! reported verbatim (see [`crate::outcome`]).

use thiserror::Error;

/// `errorType` for a request body that is not a valid execution request.
pub const DECODING: &str = "decoding";
/// `errorType` for a return value or response that cannot be encoded as JSON.
pub const SERIALIZATION: &str = "serialization";
/// `errorType` for deadline exceedance and never-settling asynchronous results.
pub const TIMEOUT: &str = "timeout";
/// `errorType` for submitted code over the configured size.
pub const CODE_TOO_LARGE: &str = "code_too_large";
/// `errorType` for a serialized return value over the configured size.
pub const OUTPUT_TOO_LARGE: &str = "output_too_large";
/// `errorType` for V8 heap exhaustion.
pub const HEAP_LIMIT: &str = "heap_limit";
/// `errorType` for a request rejected because too many isolates are live.
pub const CONCURRENCY_LIMIT: &str = "concurrency_limit";
/// `errorType` for an exception that escaped the evaluation chain (timer callbacks, detached promises).
pub const UNCAUGHT: &str = "uncaught";
/// `errorType` for host-side failures unrelated to the submitted code.
pub const INTERNAL: &str = "internal";

/// Errors that can occur during sandbox execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Serialized return value exceeds the configured maximum size.
    #[error("return value exceeds maximum size of {max} bytes (got {actual})")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Execution timed out (async event loop or CPU-bound watchdog).
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The script returned a promise that can never settle: the event loop
    /// drained with no pending work and no result.
    #[error("asynchronous result never settled")]
    NeverSettled,

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// An exception surfaced from the event loop outside the evaluation chain.
    #[error("uncaught exception: {message}")]
    Uncaught {
        /// The exception as reported by the runtime.
        message: String,
    },

    /// Result or request serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic host-side execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl SandboxError {
    /// The `errorType` reported to the caller for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::CodeTooLarge { .. } => CODE_TOO_LARGE,
            Self::OutputTooLarge { .. } => OUTPUT_TOO_LARGE,
            Self::Timeout { .. } | Self::NeverSettled => TIMEOUT,
            Self::HeapLimitExceeded => HEAP_LIMIT,
            Self::ConcurrencyLimit { .. } => CONCURRENCY_LIMIT,
            Self::Uncaught { .. } => UNCAUGHT,
            Self::Serialization(_) => SERIALIZATION,
            Self::Execution(_) => INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_share_one_error_type() {
        assert_eq!(SandboxError::Timeout { timeout_ms: 10 }.error_type(), "timeout");
        assert_eq!(SandboxError::NeverSettled.error_type(), "timeout");
    }

    #[test]
    fn serde_errors_classify_as_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = SandboxError::from(err);
        assert_eq!(err.error_type(), SERIALIZATION);
        assert!(err.to_string().starts_with("serialization failed"));
    }

    #[test]
    fn host_failures_are_internal() {
        let err = SandboxError::Execution(anyhow::anyhow!("thread spawn failed"));
        assert_eq!(err.error_type(), INTERNAL);
    }

    #[test]
    fn limit_messages_carry_sizes() {
        let err = SandboxError::CodeTooLarge { max: 10, actual: 12 };
        assert_eq!(err.to_string(), "code exceeds maximum size of 10 bytes (got 12)");
        assert_eq!(err.error_type(), CODE_TOO_LARGE);
    }
}
