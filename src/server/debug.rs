//! Tools for exercising the transport: delays, crashes, stray output
//!
//! Only registered with `toolbridge serve --debug-tools`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{parse_params, ToolContext, ToolHandler, ToolRegistry};
use crate::worker::protocol::ToolFailure;

pub fn register_debug_tools(registry: &mut ToolRegistry) {
    registry
        .register("sleep", SleepTool)
        .register("exit", ExitTool)
        .register("emit", EmitTool)
        .register("fail", FailTool);
}

/// `{ms, value}`: wait `ms` milliseconds, then answer with `value`.
pub struct SleepTool;

#[derive(Deserialize)]
struct SleepParams {
    #[serde(default)]
    ms: u64,
    #[serde(default)]
    value: Value,
}

#[async_trait]
impl ToolHandler for SleepTool {
    async fn call(&self, params: Value, _ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: SleepParams = parse_params(params)?;
        tokio::time::sleep(Duration::from_millis(params.ms)).await;
        if params.value.is_null() {
            Ok(json!({ "slept_ms": params.ms }))
        } else {
            Ok(params.value)
        }
    }
}

/// `{code}`: log a diagnostic line and exit without answering.
pub struct ExitTool;

#[derive(Deserialize)]
struct ExitParams {
    #[serde(default = "default_exit_code")]
    code: i32,
}

fn default_exit_code() -> i32 {
    1
}

#[async_trait]
impl ToolHandler for ExitTool {
    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: ExitParams = parse_params(params)?;
        tracing::error!("Exit requested by client, terminating with code {}", params.code);
        ctx.request_exit(params.code);
        std::future::pending().await
    }
}

/// `{lines, value}`: write each of `lines` verbatim to stdout, then answer.
pub struct EmitTool;

#[derive(Deserialize)]
struct EmitParams {
    #[serde(default)]
    lines: Vec<String>,
    #[serde(default)]
    value: Value,
}

#[async_trait]
impl ToolHandler for EmitTool {
    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: EmitParams = parse_params(params)?;
        for line in params.lines {
            ctx.emit_raw(line).await;
        }
        Ok(params.value)
    }
}

/// `{message, code}`: answer with a tool error.
pub struct FailTool;

#[derive(Deserialize)]
struct FailParams {
    #[serde(default = "default_failure")]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

fn default_failure() -> String {
    "Requested failure".to_string()
}

#[async_trait]
impl ToolHandler for FailTool {
    async fn call(&self, params: Value, _ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let params: FailParams = parse_params(params)?;
        let failure = ToolFailure::new(params.message);
        Err(match params.code {
            Some(code) => failure.with_code(code),
            None => failure,
        })
    }
}
