//! Start/stop coordination for a single worker instance

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use super::config::WorkerConfig;
use super::diagnostics::DiagnosticBuffer;
use super::error::WorkerError;
use super::process::{self, WorkerSession};
use super::reader::{spawn_reader, ResponseQueue, StreamSource};
use super::router::{spawn_router, CorrelationTable};

/// How long a failed start waits for the stderr reader to catch up.
const DIAGNOSTIC_SETTLE: Duration = Duration::from_millis(200);

/// Lifecycle of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::NotStarted => "not started",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Owns the current worker session.
///
/// Start and stop are serialized against each other by `lifecycle`; callers
/// only take the session lock for the instant it takes to clone the handle.
pub struct Supervisor {
    config: WorkerConfig,
    diagnostics: DiagnosticBuffer,
    table: Arc<CorrelationTable>,
    lifecycle: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<WorkerSession>>>,
    state: Mutex<WorkerState>,
}

impl Supervisor {
    pub fn new(config: WorkerConfig, table: Arc<CorrelationTable>) -> Self {
        let diagnostics = DiagnosticBuffer::new(config.diagnostic_capacity);
        Self {
            config,
            diagnostics,
            table,
            lifecycle: tokio::sync::Mutex::new(()),
            session: RwLock::new(None),
            state: Mutex::new(WorkerState::NotStarted),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &DiagnosticBuffer {
        &self.diagnostics
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn current(&self) -> Option<Arc<WorkerSession>> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_session(&self, session: Option<Arc<WorkerSession>>) -> Option<Arc<WorkerSession>> {
        let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, session)
    }

    /// Current state. A running worker whose exit has been observed reads
    /// as `Crashed`.
    pub fn state(&self) -> WorkerState {
        let state = *self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state == WorkerState::Running && self.current().map_or(true, |s| s.has_exited()) {
            WorkerState::Crashed
        } else {
            state
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// The running session, if it can take requests right now.
    pub fn usable_session(&self) -> Option<Arc<WorkerSession>> {
        if self.is_usable() {
            self.current()
        } else {
            None
        }
    }

    /// Start the worker unless it is already running.
    pub async fn start(&self) -> Result<Arc<WorkerSession>, WorkerError> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(session) = self.usable_session() {
            return Ok(session);
        }

        if let Some(stale) = self.replace_session(None) {
            tracing::info!(
                "Cleaning up previous worker process {:?} before restart",
                stale.pid()
            );
            if let Err(e) = stale.terminate(self.config.stop_grace).await {
                tracing::warn!("Previous worker did not shut down cleanly: {}", e);
            }
        }

        self.config.validate()?;
        self.set_state(WorkerState::Starting);
        self.diagnostics.clear();
        tracing::info!("Starting worker: {}", self.config.display_command());

        let spawned = match process::spawn(&self.config, self.diagnostics.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!("{}", e);
                self.set_state(WorkerState::Stopped);
                return Err(e);
            }
        };

        let (lines_tx, lines_rx) = mpsc::channel(self.config.response_queue_capacity);
        spawn_reader(
            spawned.stdout,
            StreamSource::Stdout,
            ResponseQueue::new(lines_tx),
        );
        let stderr_reader = spawn_reader(
            spawned.stderr,
            StreamSource::Stderr,
            self.diagnostics.clone(),
        );
        spawn_router(lines_rx, Arc::clone(&self.table));

        let session = Arc::new(spawned.session);

        let exited_early =
            tokio::time::timeout(self.config.startup_probe, session.wait_exit())
                .await
                .is_ok();
        if exited_early {
            let _ = tokio::time::timeout(DIAGNOSTIC_SETTLE, stderr_reader).await;
            let exit_code = session.exit_status().and_then(|exit| exit.code);
            tracing::error!(
                "Worker exited immediately after start (exit code {:?})",
                exit_code
            );
            self.set_state(WorkerState::Stopped);
            return Err(WorkerError::StartFailure {
                exit_code,
                diagnostics: self.diagnostics.snapshot(),
            });
        }

        self.replace_session(Some(Arc::clone(&session)));
        self.set_state(WorkerState::Running);
        tracing::info!("Worker started successfully (pid {:?})", session.pid());
        Ok(session)
    }

    /// Stop the worker. A no-op when nothing is running.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.replace_session(None) {
            Some(session) => self.shutdown(session).await,
            None => {
                if self.state() != WorkerState::NotStarted {
                    self.set_state(WorkerState::Stopped);
                }
                Ok(())
            }
        }
    }

    /// Stop `session` if it is still the current one.
    ///
    /// Used after transport failures: a caller holding an old session must
    /// not take down a worker that has since been restarted.
    pub async fn retire(&self, session: &Arc<WorkerSession>) {
        let _lifecycle = self.lifecycle.lock().await;
        let is_current = self
            .current()
            .is_some_and(|current| Arc::ptr_eq(&current, session));
        if !is_current {
            return;
        }
        let crashed = session.has_exited();
        if let Some(session) = self.replace_session(None) {
            if let Err(e) = self.shutdown(session).await {
                tracing::warn!("Failed to stop worker after transport failure: {}", e);
            }
        }
        if crashed {
            self.set_state(WorkerState::Crashed);
        }
    }

    async fn shutdown(&self, session: Arc<WorkerSession>) -> Result<(), WorkerError> {
        self.set_state(WorkerState::Stopping);
        tracing::info!("Stopping worker process {:?}", session.pid());
        let result = session.terminate(self.config.stop_grace).await;
        self.set_state(WorkerState::Stopped);
        match result {
            Ok(exit) => {
                tracing::info!(
                    "Worker stopped ({}) after {:?}",
                    exit,
                    session.uptime()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("{}", e);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.config.display_command())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor(script: &str) -> Supervisor {
        let config = WorkerConfig::new("sh")
            .arg("-c")
            .arg(script)
            .startup_probe(Duration::from_millis(200))
            .stop_grace(Duration::from_secs(1));
        Supervisor::new(config, Arc::new(CorrelationTable::new()))
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let supervisor = supervisor("cat >/dev/null");
        assert_eq!(supervisor.state(), WorkerState::NotStarted);

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), WorkerState::Running);
        assert!(supervisor.is_usable());

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(!supervisor.is_usable());
    }

    #[tokio::test]
    async fn test_start_is_noop_when_running() {
        let supervisor = supervisor("cat >/dev/null");
        let first = supervisor.start().await.unwrap();
        let second = supervisor.start().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let supervisor = supervisor("cat >/dev/null");
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), WorkerState::NotStarted);
        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_immediate_exit_is_start_failure_with_diagnostics() {
        let supervisor = supervisor("echo 'missing module' >&2; exit 3");
        let err = supervisor.start().await.unwrap_err();
        match err {
            WorkerError::StartFailure {
                exit_code,
                diagnostics,
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(diagnostics, vec!["missing module"]);
            }
            other => panic!("Expected StartFailure, got {other:?}"),
        }
        assert!(!supervisor.is_usable());
    }

    #[tokio::test]
    async fn test_crash_is_observed_as_crashed_state() {
        let supervisor = supervisor("sleep 0.4; exit 1");
        let session = supervisor.start().await.unwrap();
        session.wait_exit().await;
        assert_eq!(supervisor.state(), WorkerState::Crashed);
        assert!(supervisor.usable_session().is_none());

        supervisor.retire(&session).await;
        assert_eq!(supervisor.state(), WorkerState::Crashed);
    }

    #[tokio::test]
    async fn test_retire_ignores_replaced_session() {
        let supervisor = supervisor("cat >/dev/null");
        let old = supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
        let fresh = supervisor.start().await.unwrap();

        supervisor.retire(&old).await;
        assert!(supervisor.is_usable());
        assert!(!fresh.has_exited());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_clears_previous_diagnostics() {
        let supervisor = supervisor("cat >/dev/null");
        supervisor.diagnostics().push("stale line");
        supervisor.start().await.unwrap();
        assert!(supervisor.diagnostics().is_empty());
        supervisor.stop().await.unwrap();
    }
}
