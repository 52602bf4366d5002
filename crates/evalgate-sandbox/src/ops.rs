//! deno_core op definitions for the evalgate sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::time::Duration;

use deno_core::op2;
use deno_core::OpState;

use crate::console::{DiagnosticChannel, LogLevel};

/// Append a console record to this execution's diagnostic channel.
#[op2(fast)]
pub fn op_evalgate_log(state: &mut OpState, is_error: bool, #[string] message: &str) {
    let level = if is_error {
        LogLevel::Error
    } else {
        LogLevel::Info
    };
    if let Some(channel) = state.try_borrow_mut::<DiagnosticChannel>() {
        channel.record(level, message.to_string());
    }
}

/// Store the result envelope in OpState. Only the first call counts.
#[op2(fast)]
pub fn op_evalgate_set_result(state: &mut OpState, #[string] json: &str) {
    if !state.has::<ExecutionResult>() {
        state.put(ExecutionResult(json.to_string()));
    }
}

/// Resolve after `millis` milliseconds. Backs `setTimeout`.
#[op2(async)]
pub async fn op_evalgate_sleep(#[smi] millis: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(millis))).await;
}

/// Wrapper for the result envelope stored in OpState.
pub struct ExecutionResult(pub String);

deno_core::extension!(
    evalgate_ext,
    ops = [op_evalgate_log, op_evalgate_set_result, op_evalgate_sleep],
);
