#![warn(missing_docs)]

//! # evalgate-sandbox
//!
//! Remote script evaluator core for evalgate.
//!
//! Evaluates caller-supplied JavaScript in a deno_core isolate with no
//! filesystem, network, or host environment access, binds the caller's
//! variables by name, captures console output into a per-execution
//! diagnostic channel, and reports a JSON-serializable [`Outcome`].
//!
//! ## Security model
//!
//! - **V8 isolate**: Same process-level isolation as Chrome tabs
//! - **No ambient capabilities**: The only host bridge is logging, timers and result reporting
//! - **Fresh runtime per call**: No state leakage between executions
//! - **Timeout enforcement**: Execution killed after configurable deadline
//! - **Heap and output limits**: Runaway allocations and oversized results are rejected
//!
//! ```no_run
//! # async fn demo() {
//! use evalgate_sandbox::{ExecutionRequest, SandboxConfig, SandboxExecutor};
//!
//! let executor = SandboxExecutor::new(SandboxConfig::default());
//! let response = executor
//!     .execute(ExecutionRequest::new("console.log('hi'); 40 + 2"))
//!     .await;
//! assert!(response.is_success());
//! # }
//! ```

pub mod audit;
pub mod console;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod ops;
pub mod outcome;
pub mod request;
pub mod validator;

pub use console::{DiagnosticChannel, LogLevel, LogRecord};
pub use error::SandboxError;
pub use executor::{SandboxConfig, SandboxExecutor};
pub use metrics::EvalMetrics;
pub use outcome::{ExecutionResponse, Outcome};
pub use request::ExecutionRequest;
