#![warn(missing_docs)]

//! # evalgate-server
//!
//! HTTP surface for the evalgate code execution endpoint.
//!
//! - `POST /`: authenticate, decode an [`ExecutionRequest`], evaluate it and
//!   respond with the JSON outcome (200 on success, 500 on failure)
//! - `GET /health`: liveness probe
//! - `GET /metrics`: Prometheus text exposition, when a registry is attached
//!
//! Every request that passes authentication ends in a well-formed JSON
//! document; nothing a caller sends can make the handler fail without one.

pub mod auth;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use evalgate_sandbox::error::DECODING;
use evalgate_sandbox::{EvalMetrics, ExecutionRequest, ExecutionResponse, SandboxExecutor};
use prometheus_client::registry::Registry;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use auth::AuthToken;

/// Default maximum request body size (1 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";
const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// The evalgate HTTP server.
#[derive(Clone)]
pub struct EvalServer {
    executor: Arc<SandboxExecutor>,
    token: AuthToken,
    max_body_size: usize,
    metrics: Option<Arc<EvalMetrics>>,
    registry: Option<Arc<Registry>>,
}

impl EvalServer {
    /// Create a server that evaluates with `executor` and admits callers
    /// presenting `token`.
    pub fn new(executor: Arc<SandboxExecutor>, token: AuthToken) -> Self {
        Self {
            executor,
            token,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            metrics: None,
            registry: None,
        }
    }

    /// Set the maximum request body size in bytes.
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Expose `registry` at `GET /metrics` and count decoding failures in `metrics`.
    ///
    /// The executor records its own executions; attach the same `metrics` to it.
    pub fn with_metrics(mut self, registry: Arc<Registry>, metrics: Arc<EvalMetrics>) -> Self {
        self.registry = Some(registry);
        self.metrics = Some(metrics);
        self
    }

    /// Build the axum router with all routes and middleware.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(execute_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Listen on `addr` until `shutdown` resolves.
    pub async fn serve(
        self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "evalgate listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// `POST /`: auth, then decode, then evaluate, then respond.
async fn execute_handler(State(server): State<EvalServer>, request: Request) -> Response {
    if !server.token.authorize(request.headers()) {
        tracing::warn!("execute: unauthorized");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let execution = match decode_request(request.into_body(), server.max_body_size).await {
        Ok(execution) => execution,
        Err(message) => {
            tracing::warn!(error = %message, "execute: undecodable request");
            if let Some(metrics) = &server.metrics {
                metrics.record_error(DECODING);
            }
            return json_response(&ExecutionResponse::failure(message, DECODING));
        }
    };

    let response = server.executor.execute(execution).await;
    json_response(&response)
}

async fn decode_request(body: Body, limit: usize) -> Result<ExecutionRequest, String> {
    let bytes = to_bytes(body, limit)
        .await
        .map_err(|e| format!("failed to read request body: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid request body: {e}"))
}

fn json_response(response: &ExecutionResponse) -> Response {
    let status = if response.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
        response.to_json_bytes(),
    )
        .into_response()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(server): State<EvalServer>) -> Response {
    let Some(registry) = &server.registry else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut buffer = String::new();
    match prometheus_client::encoding::text::encode(&mut buffer, registry) {
        Ok(()) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], buffer).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
