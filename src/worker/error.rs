//! Error types for the worker transport

use std::time::Duration;

/// Transport-level failures of the worker client.
///
/// Tool-reported errors and timeouts are not errors at this level; they are
/// ordinary [`CallOutcome`](super::protocol::CallOutcome) variants.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker exited immediately after start (exit code {exit_code:?})")]
    StartFailure {
        exit_code: Option<i32>,
        diagnostics: Vec<String>,
    },

    #[error("Worker service is unavailable: {source}")]
    ServiceUnavailable {
        #[source]
        source: Box<WorkerError>,
    },

    #[error("Failed to write request {id} to worker stdin: {source}")]
    Transport {
        id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker process terminated while request {id} was pending (exit code {exit_code:?})")]
    ProcessTerminated { id: u64, exit_code: Option<i32> },


    #[error("Failed to capture worker {0}")]
    MissingPipe(&'static str),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid worker configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error(transparent)]
    DuplicateId(#[from] super::router::DuplicateId),
}

impl WorkerError {
    /// Wrap a start-class failure as the error a caller sees from `call`.
    pub fn unavailable(source: WorkerError) -> Self {
        match source {
            already @ WorkerError::ServiceUnavailable { .. } => already,
            other => WorkerError::ServiceUnavailable {
                source: Box::new(other),
            },
        }
    }

    /// True for failures that mean the worker cannot serve requests right now
    /// and a later call should trigger a fresh start.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(
            self,
            WorkerError::Spawn { .. }
                | WorkerError::StartFailure { .. }
                | WorkerError::ServiceUnavailable { .. }
                | WorkerError::Transport { .. }
                | WorkerError::ProcessTerminated { .. }
                | WorkerError::MissingPipe(_)
        )
    }

    /// Diagnostic lines captured at the moment of failure, if any.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            WorkerError::StartFailure { diagnostics, .. } => diagnostics,
            WorkerError::ServiceUnavailable { source } => source.diagnostics(),
            _ => &[],
        }
    }
}
