//! The execution request accepted by the evaluator.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A snippet of script plus the named inputs it runs against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Script body, evaluated as a statement sequence.
    pub code: String,

    /// Named inputs. Each entry whose key is a plain identifier is bound by
    /// name; all of them are reachable through the `variables` binding.
    #[serde(default, deserialize_with = "null_as_default")]
    pub variables: Map<String, Value>,

    /// Correlation label prefixed to forwarded diagnostics.
    #[serde(default)]
    pub tag: Option<String>,

    /// Caller-supplied key/value pairs exposed to the script as a frozen `env` object.
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: BTreeMap<String, String>,
}

impl ExecutionRequest {
    /// A request with the given code and no inputs.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    /// Set the variables.
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Set the correlation tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Set the env pairs.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_request() {
        let request: ExecutionRequest = serde_json::from_str(
            r#"{"code":"x + 1","variables":{"x":1},"tag":"run_id=7","env":{"KEY":"v"}}"#,
        )
        .unwrap();
        assert_eq!(request.code, "x + 1");
        assert_eq!(request.variables["x"], 1);
        assert_eq!(request.tag.as_deref(), Some("run_id=7"));
        assert_eq!(request.env["KEY"], "v");
    }

    #[test]
    fn optional_fields_default() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{"code":"1","variables":null,"env":null}"#).unwrap();
        assert!(request.variables.is_empty());
        assert!(request.env.is_empty());
        assert!(request.tag.is_none());

        let request: ExecutionRequest = serde_json::from_str(r#"{"code":"1"}"#).unwrap();
        assert!(request.variables.is_empty());
    }

    #[test]
    fn missing_code_is_rejected() {
        assert!(serde_json::from_str::<ExecutionRequest>(r#"{"variables":{}}"#).is_err());
        assert!(serde_json::from_str::<ExecutionRequest>(r#""just a string""#).is_err());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{"code":"1","extra":true}"#).unwrap();
        assert_eq!(request.code, "1");
    }
}
