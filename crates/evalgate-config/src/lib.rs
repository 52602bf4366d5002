#![warn(missing_docs)]

//! # evalgate-config
//!
//! Configuration loading for the evalgate code execution endpoint.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every section is optional; absent values fall back to defaults.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//! max_body_kb = 1024
//!
//! [auth]
//! token_env = "EVALGATE_AUTH_TOKEN"
//!
//! [sandbox]
//! timeout_ms = 5000
//! max_heap_mb = 64
//! max_concurrent = 16
//!
//! [audit]
//! enabled = true
//! path = "/var/log/evalgate/audit.jsonl"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default listen address.
pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Default environment variable holding the shared secret.
pub const DEFAULT_TOKEN_ENV: &str = "EVALGATE_AUTH_TOKEN";

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level evalgate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvalgateConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Where the shared secret comes from.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Audit trail settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: String,

    /// Maximum request body size in kilobytes.
    pub max_body_kb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            max_body_kb: 1024,
        }
    }
}

impl ServerConfig {
    /// The parsed listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server.bind '{}': {e}", self.bind)))
    }

    /// `max_body_kb` in bytes.
    pub fn max_body_bytes(&self) -> Result<usize, ConfigError> {
        scaled("server.max_body_kb", self.max_body_kb, KB)
    }
}

/// Shared-secret lookup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the environment variable holding the shared secret.
    pub token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: DEFAULT_TOKEN_ENV.to_string(),
        }
    }
}

/// Sandbox configuration overrides.
///
/// Unset fields keep the sandbox defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Execution timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent sandbox executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum code size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum serialized return value size in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,

    /// Maximum captured log records per execution.
    #[serde(default)]
    pub max_log_records: Option<usize>,
}

impl SandboxOverrides {
    /// `max_heap_mb` in bytes.
    pub fn max_heap_bytes(&self) -> Result<Option<usize>, ConfigError> {
        self.max_heap_mb
            .map(|mb| scaled("sandbox.max_heap_mb", mb, MB))
            .transpose()
    }

    /// `max_code_kb` in bytes.
    pub fn max_code_bytes(&self) -> Result<Option<usize>, ConfigError> {
        self.max_code_kb
            .map(|kb| scaled("sandbox.max_code_kb", kb, KB))
            .transpose()
    }

    /// `max_output_kb` in bytes.
    pub fn max_output_bytes(&self) -> Result<Option<usize>, ConfigError> {
        self.max_output_kb
            .map(|kb| scaled("sandbox.max_output_kb", kb, KB))
            .transpose()
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Emit an audit entry per execution.
    pub enabled: bool,

    /// Append entries as JSON lines to this file instead of the tracing log.
    pub path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl EvalgateConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EvalgateConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind_addr()?;

        if self.server.max_body_kb == 0 {
            return Err(ConfigError::Invalid("server.max_body_kb must be > 0".into()));
        }
        self.server.max_body_bytes()?;

        if self.auth.token_env.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.token_env must not be empty".into()));
        }

        let sandbox = &self.sandbox;
        let limits = [
            ("timeout_ms", sandbox.timeout_ms.map(|v| v as usize)),
            ("max_heap_mb", sandbox.max_heap_mb),
            ("max_concurrent", sandbox.max_concurrent),
            ("max_code_kb", sandbox.max_code_kb),
            ("max_output_kb", sandbox.max_output_kb),
            ("max_log_records", sandbox.max_log_records),
        ];
        for (name, value) in limits {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("sandbox.{name} must be > 0")));
            }
        }
        sandbox.max_heap_bytes()?;
        sandbox.max_code_bytes()?;
        sandbox.max_output_bytes()?;

        if self.audit.path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            return Err(ConfigError::Invalid("audit.path must not be empty".into()));
        }

        Ok(())
    }
}

fn scaled(name: &str, value: usize, unit: usize) -> Result<usize, ConfigError> {
    value
        .checked_mul(unit)
        .ok_or_else(|| ConfigError::Invalid(format!("{name} = {value} is too large")))
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_toml_uses_defaults() {
        let config = EvalgateConfig::from_toml("").unwrap();
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert_eq!(config.server.max_body_kb, 1024);
        assert_eq!(config.auth.token_env, DEFAULT_TOKEN_ENV);
        assert!(config.audit.enabled);
        assert!(config.audit.path.is_none());
        assert!(config.sandbox.timeout_ms.is_none());
        assert!(config.sandbox.max_concurrent.is_none());
    }

    #[test]
    fn config_parses_full_example() {
        let toml = r#"
            [server]
            bind = "127.0.0.1:9000"
            max_body_kb = 256

            [auth]
            token_env = "MY_SECRET"

            [sandbox]
            timeout_ms = 2500
            max_heap_mb = 128
            max_concurrent = 4
            max_code_kb = 32
            max_output_kb = 512
            max_log_records = 50

            [audit]
            enabled = false
            path = "/tmp/evalgate-audit.jsonl"
        "#;

        let config = EvalgateConfig::from_toml(toml).unwrap();
        assert_eq!(config.server.bind_addr().unwrap().port(), 9000);
        assert_eq!(config.server.max_body_kb, 256);
        assert_eq!(config.auth.token_env, "MY_SECRET");
        assert_eq!(config.sandbox.timeout_ms, Some(2500));
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(config.sandbox.max_concurrent, Some(4));
        assert_eq!(config.sandbox.max_code_kb, Some(32));
        assert_eq!(config.sandbox.max_output_kb, Some(512));
        assert_eq!(config.sandbox.max_log_records, Some(50));
        assert!(!config.audit.enabled);
        assert_eq!(config.audit.path, Some(PathBuf::from("/tmp/evalgate-audit.jsonl")));
        assert_eq!(config.server.max_body_bytes().unwrap(), 256 * 1024);
        assert_eq!(config.sandbox.max_heap_bytes().unwrap(), Some(128 * 1024 * 1024));
        assert_eq!(config.sandbox.max_code_bytes().unwrap(), Some(32 * 1024));
        assert_eq!(config.sandbox.max_output_bytes().unwrap(), Some(512 * 1024));
    }

    #[test]
    fn config_partial_section_keeps_other_defaults() {
        let config = EvalgateConfig::from_toml("[server]\nmax_body_kb = 8").unwrap();
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert_eq!(config.server.max_body_kb, 8);
    }

    #[test]
    fn config_rejects_bad_bind_address() {
        let err = EvalgateConfig::from_toml("[server]\nbind = \"not-an-address\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("server.bind"));
    }

    #[test]
    fn config_rejects_zero_limits() {
        for field in ["timeout_ms", "max_heap_mb", "max_concurrent", "max_code_kb", "max_output_kb", "max_log_records"] {
            let toml = format!("[sandbox]\n{field} = 0");
            let err = EvalgateConfig::from_toml(&toml).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }

        let err = EvalgateConfig::from_toml("[server]\nmax_body_kb = 0").unwrap_err();
        assert!(err.to_string().contains("max_body_kb"));
    }

    #[test]
    fn config_rejects_sizes_that_overflow_bytes() {
        let huge = usize::MAX / 1024 + 1;
        for field in ["max_heap_mb", "max_code_kb", "max_output_kb"] {
            let toml = format!("[sandbox]\n{field} = {huge}");
            let err = EvalgateConfig::from_toml(&toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{field}: {err}");
            assert!(err.to_string().contains(field), "{field}: {err}");
        }

        let err = EvalgateConfig::from_toml(&format!("[server]\nmax_body_kb = {huge}")).unwrap_err();
        assert!(err.to_string().contains("max_body_kb"), "{err}");
    }

    #[test]
    fn config_rejects_empty_audit_path() {
        let err = EvalgateConfig::from_toml("[audit]\npath = \"\"").unwrap_err();
        assert!(err.to_string().contains("audit.path"), "{err}");
    }

    #[test]
    fn config_rejects_empty_token_env() {
        let err = EvalgateConfig::from_toml("[auth]\ntoken_env = \"\"").unwrap_err();
        assert!(err.to_string().contains("token_env"));
    }

    #[test]
    fn config_rejects_malformed_toml() {
        let err = EvalgateConfig::from_toml("[server\nbind = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("EVALGATE_TEST_PORT", "7777");
        let toml = r#"
            [server]
            bind = "127.0.0.1:${EVALGATE_TEST_PORT}"
        "#;

        let config = EvalgateConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7777");
        std::env::remove_var("EVALGATE_TEST_PORT");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = std::env::temp_dir().join("evalgate-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("evalgate.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            timeout_ms = 100
        "#,
        )
        .unwrap();

        let config = EvalgateConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(100));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let err = EvalgateConfig::from_file(Path::new("/nonexistent/evalgate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("token = \"${EVALGATE_DEFINITELY_UNSET_VAR}\"");
        assert_eq!(result, "token = \"${EVALGATE_DEFINITELY_UNSET_VAR}\"");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        let input = "plain text with $dollar but no braces";
        assert_eq!(expand_env_vars(input), input);
    }
}
