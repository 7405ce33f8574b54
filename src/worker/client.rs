//! Call orchestration: the public entry point for invoking worker tools

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::config::WorkerConfig;
use super::diagnostics::DiagnosticBuffer;
use super::error::WorkerError;
use super::process::WorkerSession;
use super::protocol::{CallOutcome, Request};
use super::reader::preview;
use super::router::{CorrelationTable, PendingCall, PendingGuard};
use super::supervisor::{Supervisor, WorkerState};

/// After an exit is observed, how long a response already in the pipeline
/// may still arrive.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// How many diagnostic lines accompany a timeout warning.
const TIMEOUT_DIAGNOSTIC_TAIL: usize = 20;

/// Handle to one worker and the calls in flight on it.
///
/// Cloning is cheap; clones share the worker, the correlation table and the
/// id counter.
#[derive(Clone)]
pub struct ToolClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    supervisor: Supervisor,
    table: Arc<CorrelationTable>,
    next_id: AtomicU64,
}

impl ToolClient {
    pub fn new(config: WorkerConfig) -> Self {
        let table = Arc::new(CorrelationTable::new());
        Self {
            inner: Arc::new(ClientInner {
                supervisor: Supervisor::new(config, Arc::clone(&table)),
                table,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        self.inner.supervisor.config()
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        self.inner.supervisor.start().await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.inner.supervisor.stop().await
    }

    pub fn is_usable(&self) -> bool {
        self.inner.supervisor.is_usable()
    }

    pub fn state(&self) -> WorkerState {
        self.inner.supervisor.state()
    }

    pub fn diagnostics(&self) -> &DiagnosticBuffer {
        self.inner.supervisor.diagnostics()
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Call `method` with the timeout configured for it.
    pub async fn call(&self, method: &str, params: Value) -> Result<CallOutcome, WorkerError> {
        let timeout = self.config().timeout_for(method);
        self.call_with_timeout(method, params, timeout).await
    }

    /// Call `method` and wait at most `timeout` for its response.
    ///
    /// Tool errors and timeouts are ordinary outcomes; `Err` is reserved for
    /// transport failures, after which the worker has been stopped and the
    /// next call starts a fresh one. A timeout does not cancel the work on
    /// the worker side; a late response is discarded.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<CallOutcome, WorkerError> {
        let session = self.ensure_started().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let line = Request::new(id, method, params.clone()).to_line()?;

        // Registered before the write so the router can never see the
        // response ahead of the entry
        let (pending, reply) = PendingCall::new(id, method, params, timeout);
        let deadline = tokio::time::Instant::from_std(pending.deadline);
        self.inner.table.register(pending)?;
        let _guard = PendingGuard::new(Arc::clone(&self.inner.table), id);

        tracing::debug!("Sending request {}: {}", id, preview(line.trim_end()));
        if let Err(source) = session.write_line(&line).await {
            tracing::error!(
                "Failed to write request {} to worker stdin: {}. Stopping worker.",
                id,
                source
            );
            self.inner.supervisor.retire(&session).await;
            return Err(WorkerError::Transport { id, source });
        }

        let mut reply = reply;
        tokio::select! {
            biased;

            delivered = &mut reply => match delivered {
                Ok(reply) => Ok(reply.into()),
                Err(_) => Err(self.terminated(&session, id, method).await),
            },

            _ = session.wait_exit() => {
                // The response may have been written just before the exit
                if let Ok(Ok(reply)) = tokio::time::timeout(EXIT_DRAIN, &mut reply).await {
                    return Ok(reply.into());
                }
                Err(self.terminated(&session, id, method).await)
            }

            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    "Request {} ({}) timed out after {:?}",
                    id,
                    method,
                    timeout
                );
                let recent = self.diagnostics().tail(TIMEOUT_DIAGNOSTIC_TAIL);
                if !recent.is_empty() {
                    tracing::warn!("Recent worker stderr output:\n{}", recent.join("\n"));
                }
                Ok(CallOutcome::Timeout(timeout))
            }
        }
    }

    async fn ensure_started(&self) -> Result<Arc<WorkerSession>, WorkerError> {
        if let Some(session) = self.inner.supervisor.usable_session() {
            return Ok(session);
        }
        tracing::warn!(
            "Worker is not running ({}), attempting to start it",
            self.state()
        );
        self.inner.supervisor.start().await.map_err(|e| {
            tracing::error!("Implicit worker start failed: {}", e);
            WorkerError::unavailable(e)
        })
    }

    async fn terminated(&self, session: &Arc<WorkerSession>, id: u64, method: &str) -> WorkerError {
        let exit_code = session.exit_status().and_then(|exit| exit.code);
        tracing::error!(
            "Worker process terminated while request {} ({}) was pending",
            id,
            method
        );
        self.inner.supervisor.retire(session).await;
        WorkerError::ProcessTerminated { id, exit_code }
    }
}

impl std::fmt::Debug for ToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolClient")
            .field("supervisor", &self.inner.supervisor)
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(script: &str) -> ToolClient {
        ToolClient::new(
            WorkerConfig::new("sh")
                .arg("-c")
                .arg(script)
                .startup_probe(Duration::from_millis(100))
                .stop_grace(Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_call_starts_worker_implicitly() {
        let client = client(r#"read l; echo '{"id":1,"result":"hi"}'; cat >/dev/null"#);
        assert_eq!(client.state(), WorkerState::NotStarted);

        let outcome = client
            .call_with_timeout("echo", json!({"message": "hi"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, CallOutcome::Result(json!("hi")));
        assert!(client.is_usable());
        assert_eq!(client.pending_count(), 0);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_receives_reply() {
        let client = client(r#"read l; echo '{"id":1,"result":"late but fine"}'; cat >/dev/null"#);
        let outcome = client
            .call_with_timeout("echo", json!({}), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(outcome, CallOutcome::Result(json!("late but fine")));
        assert_eq!(client.pending_count(), 0);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_error_is_an_outcome() {
        let client = client(
            r#"read l; echo '{"id":1,"error":{"message":"Unknown tool","code":-32601}}'; cat >/dev/null"#,
        );
        let outcome = client
            .call_with_timeout("nope", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            CallOutcome::ToolError(failure) => assert_eq!(failure.message, "Unknown tool"),
            other => panic!("Expected tool error, got {other:?}"),
        }
        assert!(client.is_usable());
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_implicit_start_is_service_unavailable() {
        let client = client("echo 'cannot import' >&2; exit 2");
        let err = client
            .call_with_timeout("echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ServiceUnavailable { .. }));
        assert_eq!(err.diagnostics(), ["cannot import".to_string()]);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_while_pending_is_process_terminated() {
        let client = client("read l; sleep 0.2; exit 4");
        let err = client
            .call_with_timeout("echo", json!({}), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::ProcessTerminated {
                id: 1,
                exit_code: Some(4)
            }
        ));
        assert!(!client.is_usable());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_never_reused_across_restarts() {
        let client = client(r#"while read l; do echo '{"id":0}'; done"#);
        client.start().await.unwrap();
        for _ in 0..2 {
            let outcome = client
                .call_with_timeout("x", json!({}), Duration::from_millis(200))
                .await
                .unwrap();
            assert!(matches!(outcome, CallOutcome::Timeout(_)));
        }
        client.stop().await.unwrap();
        client.start().await.unwrap();
        assert_eq!(client.inner.next_id.load(Ordering::SeqCst), 3);
        client.stop().await.unwrap();
    }
}
