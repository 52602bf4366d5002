//! Execution outcomes and the JSON response document.
//!
//! The isolate reports its result as a JSON envelope: `{"ok": value}` on
//! success (with `ok` absent when the script produced `undefined`) or
//! `{"error": message, "errorType": kind}` when a value was thrown. This
//! module decodes that envelope into an [`Outcome`] and encodes the final
//! [`ExecutionResponse`].

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

use crate::console::LogRecord;
use crate::error::{SandboxError, SERIALIZATION};

/// The result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The script produced a value. `None` means `undefined`, which is
    /// omitted from the response.
    Success {
        /// The JSON-encoded return value.
        retval: Option<Value>,
    },
    /// The script threw, or the host failed on its behalf.
    Failure {
        /// Human-readable rendering of the thrown value.
        error: String,
        /// Category of the thrown value, passed through verbatim.
        error_type: String,
    },
}

impl Outcome {
    /// A failure with the given message and kind.
    pub fn failure(error: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            error_type: error_type.into(),
        }
    }

    /// Whether this is the `Success` variant.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The `errorType` of a failure.
    pub fn error_type(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error_type, .. } => Some(error_type),
        }
    }

    /// Decode the envelope written by the isolate.
    ///
    /// Rejects envelopes over `max_output_size` bytes before parsing.
    pub fn from_envelope(envelope: &str, max_output_size: usize) -> Result<Self, SandboxError> {
        if envelope.len() > max_output_size {
            return Err(SandboxError::OutputTooLarge {
                max: max_output_size,
                actual: envelope.len(),
            });
        }

        let envelope: Value = serde_json::from_str(envelope)?;

        if let Some(error) = envelope.get("error") {
            let error = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let error_type = envelope
                .get("errorType")
                .and_then(Value::as_str)
                .unwrap_or("undefined");
            return Ok(Self::failure(error, error_type));
        }

        Ok(Self::Success {
            retval: envelope.get("ok").cloned(),
        })
    }
}

impl From<SandboxError> for Outcome {
    fn from(err: SandboxError) -> Self {
        Self::failure(err.to_string(), err.error_type())
    }
}

/// The single artifact returned for a request: the outcome merged with the
/// captured diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResponse {
    /// Success or failure.
    pub outcome: Outcome,
    /// Captured diagnostics in emission order.
    pub logs: Vec<LogRecord>,
}

impl ExecutionResponse {
    /// Build a response.
    pub fn new(outcome: Outcome, logs: Vec<LogRecord>) -> Self {
        Self { outcome, logs }
    }

    /// A failure response with no captured logs.
    pub fn failure(error: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self::new(Outcome::failure(error, error_type), Vec::new())
    }

    /// Whether the outcome is a success.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Encode as the flat JSON response body.
    ///
    /// Never fails: if encoding errors, a `serialization` failure document
    /// is produced instead.
    pub fn to_json_bytes(&self) -> Vec<u8> {
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "response encoding failed");
                serde_json::json!({
                    "error": format!("response encoding failed: {e}"),
                    "errorType": SERIALIZATION,
                    "logs": serde_json::to_value(&self.logs).unwrap_or_default(),
                })
                .to_string()
                .into_bytes()
            }
        }
    }
}

impl Serialize for ExecutionResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match &self.outcome {
            Outcome::Success { retval: Some(value) } => map.serialize_entry("retval", value)?,
            Outcome::Success { retval: None } => {}
            Outcome::Failure { error, error_type } => {
                map.serialize_entry("error", error)?;
                map.serialize_entry("errorType", error_type)?;
            }
        }
        map.serialize_entry("logs", &self.logs)?;
        map.end()
    }
}
