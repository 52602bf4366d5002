//! Sandbox executor: creates fresh V8 isolates and evaluates submitted code.
//!
//! Each execution gets a brand new runtime. No state leaks between calls.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::console::{DiagnosticChannel, LogRecord, DEFAULT_MAX_LOG_RECORDS};
use crate::error::SandboxError;
use crate::metrics::EvalMetrics;
use crate::ops::{evalgate_ext, ExecutionResult};
use crate::outcome::{ExecutionResponse, Outcome};
use crate::request::ExecutionRequest;
use crate::validator::{bindable_names, validate_code, RESERVED_BINDINGS};

/// Host handles bound to `undefined` in the evaluation scope.
pub const SHADOWED_GLOBALS: &[&str] = &[
    "Deno",
    "globalThis",
    "window",
    "self",
    "document",
    "process",
    "require",
    "module",
    "exports",
    "global",
];

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum wall-clock time for one evaluation.
    pub timeout: Duration,
    /// Maximum size of submitted code in bytes.
    pub max_code_size: usize,
    /// Maximum size of the serialized return value in bytes.
    pub max_output_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent sandbox executions.
    pub max_concurrent: usize,
    /// Maximum captured log records per execution.
    pub max_log_records: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_code_size: 64 * 1024,        // 64 KB
            max_output_size: 1024 * 1024,    // 1 MB
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 16,
            max_log_records: DEFAULT_MAX_LOG_RECORDS,
        }
    }
}

/// The sandbox executor. Creates fresh V8 isolates for each execution.
///
/// This is `Send + Sync` safe; all V8 operations are dispatched to a
/// dedicated thread internally. A concurrency semaphore limits the number
/// of simultaneous V8 isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
    metrics: Option<Arc<EvalMetrics>>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a new sandbox executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
            metrics: None,
        }
    }

    /// Record executions into the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<EvalMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The executor's configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Evaluate a request in a fresh isolate.
    ///
    /// Never fails: every error is folded into the returned response's outcome,
    /// and the logs captured up to that point are attached.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResponse {
        let audit_builder = AuditEntryBuilder::new(&request);
        let execution_id = audit_builder.execution_id().to_string();
        tracing::info!(
            execution_id = %execution_id,
            code_len = request.code.len(),
            variables = request.variables.len(),
            tag = request.tag.as_deref().unwrap_or_default(),
            "execute: starting"
        );

        let start = Instant::now();

        let response = self.execute_isolated(request).await;

        if let Some(metrics) = &self.metrics {
            metrics.record(&response.outcome, start.elapsed().as_secs_f64());
        }
        let entry = audit_builder.finish(&response);
        self.audit_logger.log(&entry).await;

        match &response.outcome {
            Outcome::Success { .. } => {
                tracing::info!(execution_id = %execution_id, logs = response.logs.len(), "execute: complete")
            }
            Outcome::Failure { error_type, .. } => tracing::warn!(
                execution_id = %execution_id,
                error_type = %error_type,
                logs = response.logs.len(),
                "execute: failed"
            ),
        }

        response
    }

    async fn execute_isolated(&self, request: ExecutionRequest) -> ExecutionResponse {
        if let Err(e) = validate_code(&request.code, Some(self.config.max_code_size)) {
            return ExecutionResponse::new(e.into(), Vec::new());
        }

        let Ok(_permit) = self.semaphore.clone().try_acquire_owned() else {
            let err = SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            };
            return ExecutionResponse::new(err.into(), Vec::new());
        };

        let config = self.config.clone();

        // V8 isolates are !Send, run everything on a dedicated thread
        let (tx, rx) = tokio::sync::oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("evalgate-isolate".into())
            .spawn(move || {
                let response = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(run_evaluation(&config, &request)),
                    Err(e) => ExecutionResponse::new(SandboxError::Execution(e.into()).into(), Vec::new()),
                };
                if tx.send(response).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            });

        if let Err(e) = spawned {
            return ExecutionResponse::new(SandboxError::Execution(e.into()).into(), Vec::new());
        }

        rx.await.unwrap_or_else(|_| {
            let err = SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked"));
            ExecutionResponse::new(err.into(), Vec::new())
        })
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. Uses AtomicBool so the callback
    /// can use a shared `&` reference instead of `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `run_user_code`,
    // which removes this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Evaluate one request on the current thread (must be called from a
/// dedicated thread, not the main tokio runtime).
pub async fn run_evaluation(config: &SandboxConfig, request: &ExecutionRequest) -> ExecutionResponse {
    let mut runtime = create_runtime(config, request.tag.clone());

    let outcome = match evaluate_in_runtime(&mut runtime, config, request).await {
        Ok(outcome) => outcome,
        Err(e) => e.into(),
    };

    ExecutionResponse::new(outcome, take_logs(&mut runtime))
}

async fn evaluate_in_runtime(
    runtime: &mut JsRuntime,
    config: &SandboxConfig,
    request: &ExecutionRequest,
) -> Result<Outcome, SandboxError> {
    runtime
        .execute_script("[evalgate:bootstrap]", BOOTSTRAP)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;

    let invocation = build_invocation(request)?;
    run_user_code(runtime, invocation, config).await
}

/// Create a fresh JsRuntime with the evalgate extension, V8 heap limits and
/// a diagnostic channel for this execution.
pub(crate) fn create_runtime(config: &SandboxConfig, tag: Option<String>) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![evalgate_ext::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    });

    runtime
        .op_state()
        .borrow_mut()
        .put(DiagnosticChannel::open(tag, config.max_log_records));

    runtime
}

/// Bootstrap: capture ops in closures, install timers, expose a one-shot
/// `__evalgate` handle for the invocation script, and delete the runtime's
/// own globals (`Deno`, `__bootstrap`, `console`).
const BOOTSTRAP: &str = r#"
((ops) => {
    const logOp = ops.op_evalgate_log;
    const setResultOp = ops.op_evalgate_set_result;
    const sleepOp = ops.op_evalgate_sleep;

    const stringify = JSON.stringify;
    const parse = JSON.parse;
    const freeze = Object.freeze;
    const keys = Object.keys;
    const getPrototypeOf = Object.getPrototypeOf;
    const isArray = Array.isArray;
    const NativePromise = Promise;
    const NativeError = Error;
    const NativeDate = Date;
    const NativeRegExp = RegExp;
    const NativeMap = Map;
    const NativeSet = Set;
    const IDENTIFIER = /^[A-Za-z_$][A-Za-z0-9_$]*$/;
    const MAX_DEPTH = 4;

    const inspectValue = (value, depth, seen) => {
        switch (typeof value) {
            case "string":
                return depth === 0 ? value : stringify(value);
            case "number":
                return Object.is(value, -0) ? "-0" : String(value);
            case "bigint":
                return `${value}n`;
            case "boolean":
            case "undefined":
                return String(value);
            case "symbol":
                return value.toString();
            case "function":
                return value.name ? `[Function: ${value.name}]` : "[Function (anonymous)]";
        }
        if (value === null) return "null";
        if (seen.includes(value)) return "[Circular]";
        if (value instanceof NativeError) {
            return value.stack || `${value.name}: ${value.message}`;
        }
        if (value instanceof NativeDate) {
            return isNaN(value.getTime()) ? "Invalid Date" : value.toISOString();
        }
        if (value instanceof NativeRegExp) return String(value);
        if (value instanceof NativePromise) return "Promise {}";
        if (depth >= MAX_DEPTH) return isArray(value) ? "[Array]" : "[Object]";

        const nested = [...seen, value];
        const child = (v) => inspectValue(v, depth + 1, nested);
        if (isArray(value)) {
            return value.length === 0 ? "[]" : `[ ${value.map(child).join(", ")} ]`;
        }
        if (value instanceof NativeMap) {
            const entries = [...value].map(([k, v]) => `${child(k)} => ${child(v)}`);
            return entries.length === 0 ? "Map(0) {}" : `Map(${value.size}) { ${entries.join(", ")} }`;
        }
        if (value instanceof NativeSet) {
            const entries = [...value].map(child);
            return entries.length === 0 ? "Set(0) {}" : `Set(${value.size}) { ${entries.join(", ")} }`;
        }

        const proto = getPrototypeOf(value);
        let prefix = "";
        if (proto === null) {
            prefix = "[Object: null prototype] ";
        } else if (proto.constructor && proto.constructor.name && proto.constructor.name !== "Object") {
            prefix = `${proto.constructor.name} `;
        }
        const fields = keys(value).map(
            (k) => `${IDENTIFIER.test(k) ? k : stringify(k)}: ${child(value[k])}`
        );
        return fields.length === 0 ? `${prefix}{}` : `${prefix}{ ${fields.join(", ")} }`;
    };

    const inspect = (value) => {
        try {
            return inspectValue(value, 0, []);
        } catch {
            try {
                return String(value);
            } catch {
                return "[object]";
            }
        }
    };

    const render = (value) => (typeof value === "string" ? value : inspect(value));
    const format = (args) => args.map(render).join(" ");

    const makeConsole = () => {
        const info = (...args) => logOp(false, format(args));
        const error = (...args) => logOp(true, format(args));
        return freeze({ log: info, info, debug: info, error, warn: error });
    };

    const activeTimers = new NativeSet();
    let nextTimerId = 1;
    globalThis.setTimeout = (callback, delay, ...args) => {
        const id = nextTimerId++;
        const millis = Math.min(Math.max(Math.floor(Number(delay)) || 0, 0), 0x7fffffff);
        activeTimers.add(id);
        sleepOp(millis).then(() => {
            if (!activeTimers.delete(id)) return;
            try {
                callback(...args);
            } catch (e) {
                logOp(true, `Uncaught ${render(e)}`);
            }
        });
        return id;
    };
    globalThis.clearTimeout = (id) => {
        activeTimers.delete(id);
    };

    const encode = (retval) => {
        try {
            return stringify({ ok: retval });
        } catch (e) {
            const message = e instanceof NativeError ? e.message : render(e);
            return stringify({ error: message, errorType: "serialization" });
        }
    };

    const run = (evaluate, shadowCount, names, variablesJson, envJson) => {
        const variables = parse(variablesJson);
        const env = freeze(parse(envJson));
        const args = [];
        for (let i = 0; i < shadowCount; i++) args.push(undefined);
        args.push(variables, makeConsole(), env);
        for (const name of names) args.push(variables[name]);

        (async () => {
            let envelope;
            try {
                let retval = evaluate(...args);
                if (typeof retval === "function") {
                    retval = retval(variables);
                }
                if (retval instanceof NativePromise) {
                    retval = await retval;
                }
                envelope = encode(retval);
            } catch (e) {
                envelope = stringify({ error: render(e), errorType: typeof e });
            }
            setResultOp(envelope);
        })();
    };

    const api = freeze({ run });
    Object.defineProperty(globalThis, "__evalgate", {
        configurable: true,
        get() {
            delete globalThis.__evalgate;
            return api;
        },
    });

    // deno_core's own handles: `__bootstrap.core` reaches every op, and its
    // `console` prints to host stdout.
    delete globalThis.__bootstrap;
    delete globalThis.console;
    delete globalThis.Deno;
})(Deno.core.ops);
"#;

/// Build the invocation script for one request.
///
/// The submitted code runs through a direct `eval` inside a strict function
/// whose parameters are the only non-intrinsic names it can resolve: the
/// shadowed host handles (bound to `undefined`), `variables`, `console`,
/// `env`, and each bindable variable. The code is embedded as a JSON string
/// literal and never spliced into the script text.
fn build_invocation(request: &ExecutionRequest) -> Result<String, SandboxError> {
    let names = bindable_names(&request.variables);
    let shadowed: Vec<&str> = SHADOWED_GLOBALS
        .iter()
        .copied()
        .filter(|global| !names.contains(global))
        .collect();

    let mut params = shadowed.clone();
    params.extend_from_slice(RESERVED_BINDINGS);
    params.extend_from_slice(&names);

    let code = serde_json::to_string(&request.code)?;
    let variables = serde_json::to_string(&serde_json::to_string(&request.variables)?)?;
    let env = serde_json::to_string(&serde_json::to_string(&request.env)?)?;
    let names = serde_json::to_string(&names)?;

    Ok(format!(
        r#"__evalgate.run(
    function ({params}) {{
        "use strict";
        return eval({code});
    }},
    {shadow_count},
    {names},
    {variables},
    {env}
);"#,
        params = params.join(", "),
        shadow_count = shadowed.len(),
    ))
}

/// Run the invocation script and drive the event loop until the result is
/// reported, the loop drains, or the deadline passes.
///
/// Sets up a CPU watchdog thread and near-heap-limit callback before running
/// user code. The watchdog terminates V8 execution if the timeout elapses
/// (handles CPU-bound infinite loops). The heap callback terminates execution
/// if V8 approaches the heap limit.
async fn run_user_code(
    runtime: &mut JsRuntime,
    invocation: String,
    config: &SandboxConfig,
) -> Result<Outcome, SandboxError> {
    // --- Set up heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- Set up CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let deadline = tokio::time::Instant::now() + timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    // --- Execute user code ---
    let exec_error = match runtime.execute_script("[evalgate:execute]", invocation) {
        // The event loop gets whatever the synchronous part left of the budget.
        Ok(_) => match tokio::time::timeout_at(deadline, drive_until_settled(runtime)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => {
                timed_out.store(true, Ordering::SeqCst);
                None
            }
        },
        Err(e) => Some(e.to_string()),
    };

    // --- Cleanup: cancel watchdog and wait for it to exit ---
    // The watchdog must be done before the runtime drops, and the heap
    // callback must be gone before `heap_state` drops.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    // --- Check causes in priority order ---
    // Termination cannot be caught by script, so a stored result is always complete.
    if let Some(envelope) = take_result(runtime) {
        return Outcome::from_envelope(&envelope, config.max_output_size);
    }

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(SandboxError::HeapLimitExceeded);
    }

    if timed_out.load(Ordering::SeqCst) {
        return Err(SandboxError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }

    if let Some(message) = exec_error {
        return Err(SandboxError::Uncaught { message });
    }

    Err(SandboxError::NeverSettled)
}

/// Poll the event loop until a result is stored or no work remains.
///
/// Pending timers left behind after the result is stored are abandoned with
/// the runtime.
async fn drive_until_settled(runtime: &mut JsRuntime) -> Result<(), String> {
    std::future::poll_fn(|cx| {
        if has_result(runtime) {
            return Poll::Ready(Ok(()));
        }
        match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
            Poll::Ready(result) => Poll::Ready(result.map_err(|e| e.to_string())),
            Poll::Pending if has_result(runtime) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

fn has_result(runtime: &mut JsRuntime) -> bool {
    runtime.op_state().borrow().has::<ExecutionResult>()
}

fn take_result(runtime: &mut JsRuntime) -> Option<String> {
    let state = runtime.op_state();
    let mut state = state.borrow_mut();
    state.try_take::<ExecutionResult>().map(|r| r.0)
}

fn take_logs(runtime: &mut JsRuntime) -> Vec<LogRecord> {
    let state = runtime.op_state();
    let mut state = state.borrow_mut();
    state
        .try_take::<DiagnosticChannel>()
        .map(DiagnosticChannel::finish)
        .unwrap_or_default()
}
