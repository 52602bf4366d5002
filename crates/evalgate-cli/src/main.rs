#![warn(missing_docs)]

//! evalgate: authenticated remote JavaScript evaluation.
//!
//! POST a snippet and its variables, get back the value and the console output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use evalgate_config::{AuditConfig, AuthConfig, ConfigError, EvalgateConfig};
use evalgate_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, NoopAuditLogger, TracingAuditLogger};
use evalgate_sandbox::{EvalMetrics, SandboxConfig, SandboxExecutor};
use evalgate_server::{AuthToken, EvalServer};
use prometheus_client::registry::Registry;
use tracing_subscriber::EnvFilter;

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(
    overrides: &evalgate_config::SandboxOverrides,
) -> Result<SandboxConfig, ConfigError> {
    let mut config = SandboxConfig::default();
    if let Some(timeout) = overrides.timeout_ms {
        config.timeout = Duration::from_millis(timeout);
    }
    if let Some(heap) = overrides.max_heap_bytes()? {
        config.max_heap_size = heap;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(code) = overrides.max_code_bytes()? {
        config.max_code_size = code;
    }
    if let Some(output) = overrides.max_output_bytes()? {
        config.max_output_size = output;
    }
    if let Some(records) = overrides.max_log_records {
        config.max_log_records = records;
    }
    Ok(config)
}

/// Pick the audit backend: disabled, a JSON lines file, or the tracing log.
async fn build_audit_logger(audit: &AuditConfig) -> Result<Arc<dyn AuditLogger>> {
    if !audit.enabled {
        return Ok(Arc::new(NoopAuditLogger));
    }
    match &audit.path {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            tracing::info!(path = %path.display(), "writing audit log");
            Ok(Arc::new(JsonLinesAuditLogger::new(file)))
        }
        None => Ok(Arc::new(TracingAuditLogger)),
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `EVALGATE_CONFIG` environment variable
/// 2. `./evalgate.toml` in the current directory
/// 3. None (no config file found, not an error)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("EVALGATE_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("evalgate.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

/// Read the shared secret named by `auth.token_env`.
fn load_token(auth: &AuthConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<AuthToken> {
    let secret = lookup(&auth.token_env)
        .with_context(|| format!("shared secret not set: export {}", auth.token_env))?;
    AuthToken::new(secret).with_context(|| {
        format!("shared secret in {} is empty or contains whitespace", auth.token_env)
    })
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("received shutdown signal, stopping gracefully");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version / -V before anything else
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("evalgate {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load config
    let config = match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            EvalgateConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::info!("no config file found, using defaults");
            EvalgateConfig::default()
        }
    };

    let token = load_token(&config.auth, |name| std::env::var(name).ok())?;
    let addr = config.server.bind_addr()?;
    let sandbox_config = build_sandbox_config(&config.sandbox)?;

    tracing::info!(
        timeout_ms = sandbox_config.timeout.as_millis() as u64,
        max_concurrent = sandbox_config.max_concurrent,
        max_heap_mb = sandbox_config.max_heap_size / (1024 * 1024),
        audit = config.audit.enabled,
        "sandbox configured"
    );

    let audit_logger = build_audit_logger(&config.audit).await?;

    let mut registry = Registry::default();
    let metrics = Arc::new(EvalMetrics::new(&mut registry));

    let executor = Arc::new(
        SandboxExecutor::with_audit_logger(sandbox_config, audit_logger).with_metrics(metrics.clone()),
    );

    EvalServer::new(executor, token)
        .with_max_body_size(config.server.max_body_bytes()?)
        .with_metrics(Arc::new(registry), metrics)
        .serve(addr, shutdown_signal())
        .await
        .with_context(|| format!("server on {addr} failed"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalgate_sandbox::ExecutionRequest;

    #[test]
    fn build_sandbox_config_defaults() {
        let overrides = evalgate_config::SandboxOverrides::default();
        let config = build_sandbox_config(&overrides).unwrap();
        let default = SandboxConfig::default();
        assert_eq!(config.timeout, default.timeout);
        assert_eq!(config.max_heap_size, default.max_heap_size);
        assert_eq!(config.max_concurrent, default.max_concurrent);
        assert_eq!(config.max_code_size, default.max_code_size);
        assert_eq!(config.max_output_size, default.max_output_size);
        assert_eq!(config.max_log_records, default.max_log_records);
    }

    #[test]
    fn build_sandbox_config_applies_units() {
        let config = EvalgateConfig::from_toml(
            r#"
            [sandbox]
            timeout_ms = 1500
            max_heap_mb = 32
            max_concurrent = 2
            max_code_kb = 8
            max_output_kb = 16
            max_log_records = 10
        "#,
        )
        .unwrap();
        let sandbox = build_sandbox_config(&config.sandbox).unwrap();
        assert_eq!(sandbox.timeout, Duration::from_millis(1500));
        assert_eq!(sandbox.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(sandbox.max_concurrent, 2);
        assert_eq!(sandbox.max_code_size, 8 * 1024);
        assert_eq!(sandbox.max_output_size, 16 * 1024);
        assert_eq!(sandbox.max_log_records, 10);
    }

    #[test]
    fn build_sandbox_config_rejects_overflowing_sizes() {
        let overrides = evalgate_config::SandboxOverrides {
            max_heap_mb: Some(usize::MAX),
            ..Default::default()
        };
        let err = build_sandbox_config(&overrides).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn load_token_reads_named_variable() {
        let auth = AuthConfig {
            token_env: "MY_TOKEN".into(),
        };
        let token = load_token(&auth, |name| (name == "MY_TOKEN").then(|| "abc".to_string()));
        assert!(token.is_ok());
    }

    #[test]
    fn load_token_rejects_missing_or_empty_secret() {
        let auth = AuthConfig::default();

        let err = load_token(&auth, |_| None).unwrap_err();
        assert!(err.to_string().contains("EVALGATE_AUTH_TOKEN"), "{err}");

        let err = load_token(&auth, |_| Some("   ".into())).unwrap_err();
        assert!(err.to_string().contains("empty"), "{err}");

        let err = load_token(&auth, |_| Some("two words".into())).unwrap_err();
        assert!(err.to_string().contains("whitespace"), "{err}");
    }

    #[tokio::test]
    async fn audit_log_file_receives_json_lines() {
        let dir = std::env::temp_dir().join(format!("evalgate-audit-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("audit.jsonl");
        let audit = AuditConfig {
            enabled: true,
            path: Some(path.clone()),
        };

        let logger = build_audit_logger(&audit).await.unwrap();
        let executor = SandboxExecutor::with_audit_logger(SandboxConfig::default(), logger);
        executor
            .execute(ExecutionRequest::new("throw 'sk-secret'").with_tag("run_id=7"))
            .await;

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1, "{written}");
        assert!(written.contains(r#""tag":"run_id=7""#), "{written}");
        assert!(written.contains(r#""error_type":"string""#), "{written}");
        assert!(!written.contains("sk-secret"), "{written}");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn audit_log_path_must_be_openable() {
        let audit = AuditConfig {
            enabled: true,
            path: Some(PathBuf::from("/nonexistent-evalgate-dir/audit.jsonl")),
        };
        let err = build_audit_logger(&audit).await.err().unwrap();
        assert!(err.to_string().contains("failed to open audit log"), "{err}");
    }
}
