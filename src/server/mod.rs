//! Stdio tool server, the worker side of the transport
//!
//! Reads one JSON request per line from the input stream, runs each on its
//! own task and writes exactly one response line per request. Responses can
//! therefore leave in a different order than their requests arrived.

pub mod debug;
pub mod tools;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::worker::protocol::{Request, Response, ToolFailure, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::worker::reader::{decode_line, preview};

/// Lines waiting for the stdout writer.
const OUTPUT_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error on server stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output writer task failed: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

/// Handle given to tools for side effects on the server itself.
#[derive(Clone)]
pub struct ToolContext {
    output: mpsc::Sender<String>,
    exit: Arc<watch::Sender<Option<i32>>>,
}

impl ToolContext {
    /// Write a raw line to the output stream, outside the response protocol.
    pub async fn emit_raw(&self, line: impl Into<String>) {
        let _ = self.output.send(line.into()).await;
    }

    /// Stop serving and exit with `code` without answering pending requests.
    pub fn request_exit(&self, code: i32) {
        self.exit.send_replace(Some(code));
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolFailure>;
}

/// Deserialize tool arguments, reporting failures as invalid params.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ToolFailure> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| ToolFailure::new(format!("Invalid params: {e}")).with_code(INVALID_PARAMS))
}

/// Tools served by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: impl ToolHandler + 'static) -> &mut Self {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run one request to completion and build its response.
    pub async fn dispatch(&self, request: Request, ctx: &ToolContext) -> Response {
        let Some(handler) = self.handlers.get(&request.method) else {
            tracing::warn!("Request {} names unknown tool '{}'", request.id, request.method);
            return Response::error(
                request.id,
                ToolFailure::new(format!("Unknown tool: {}", request.method))
                    .with_code(METHOD_NOT_FOUND),
            );
        };

        tracing::info!("Tool '{}' called (request {})", request.method, request.id);
        match handler.call(request.params, ctx).await {
            Ok(result) => Response::result(request.id, result),
            Err(failure) => {
                tracing::warn!(
                    "Tool '{}' failed for request {}: {}",
                    request.method,
                    request.id,
                    failure
                );
                Response::error(request.id, failure)
            }
        }
    }
}

/// What a finished serve loop did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServeSummary {
    pub requests: usize,
    pub skipped: usize,
    /// Set when a tool asked the server to exit
    pub exit_code: Option<i32>,
}

async fn write_lines<W>(mut output: W, mut lines: mpsc::Receiver<String>) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(mut line) = lines.recv().await {
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
        written += 1;
    }
    Ok(written)
}

/// Serve requests from `input` until it ends or a tool requests an exit.
///
/// On end of input, requests already running are allowed to finish.
pub async fn serve<R, W>(
    input: R,
    output: W,
    registry: Arc<ToolRegistry>,
) -> Result<ServeSummary, ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
    let writer = tokio::spawn(write_lines(output, output_rx));
    let (exit_tx, mut exit_rx) = watch::channel(None);
    let ctx = ToolContext {
        output: output_tx,
        exit: Arc::new(exit_tx),
    };

    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    let mut tasks = JoinSet::new();
    let mut summary = ServeSummary::default();

    loop {
        buf.clear();
        tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => {
                if read? == 0 {
                    break;
                }
                let Some(line) = decode_line(&buf) else {
                    continue;
                };
                let request: Request = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!("Skipping unparseable request ({}): {}", e, preview(&line));
                        summary.skipped += 1;
                        continue;
                    }
                };
                summary.requests += 1;
                let registry = Arc::clone(&registry);
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let response = registry.dispatch(request, &ctx).await;
                    match response.to_line() {
                        Ok(line) => ctx.emit_raw(line.trim_end()).await,
                        Err(e) => tracing::error!("Failed to encode response {}: {}", response.id, e),
                    }
                });
                while tasks.try_join_next().is_some() {}
            }
            _ = exit_rx.changed() => {
                summary.exit_code = *exit_rx.borrow();
                return Ok(summary);
            }
        }
    }

    tracing::info!("Input closed, waiting for {} running requests", tasks.len());
    loop {
        tokio::select! {
            next = tasks.join_next() => {
                if next.is_none() {
                    break;
                }
            }
            _ = exit_rx.changed() => {
                summary.exit_code = *exit_rx.borrow();
                return Ok(summary);
            }
        }
    }

    drop(ctx);
    writer.await??;
    tracing::info!(
        "Server finished: {} requests, {} skipped lines",
        summary.requests,
        summary.skipped
    );
    Ok(summary)
}
