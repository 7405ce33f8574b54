use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::llm::LlmError;
use crate::lookup::LookupError;
use crate::server::ServerError;
use crate::worker::{ToolFailure, WorkerError};

/// The unified error type for toolbridge
#[derive(Error, Debug)]
pub enum ToolbridgeError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Worker error: {message}")]
    Worker {
        code: u16,
        message: String,
        /// Recent worker stderr captured with the failure
        diagnostics: Vec<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Tool error: {message}")]
    Tool {
        code: u16,
        message: String,
        tool: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Text generation error: {message}")]
    Llm {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Lookup error: {message}")]
    Lookup {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Validation error: {message}")]
    Validation {
        code: u16,
        message: String,
        field: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] {message}")]
    Other {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ToolbridgeError {
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn worker_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Worker {
            code,
            message: message.into(),
            diagnostics: Vec::new(),
            source: None,
        }
    }

    /// Create a tool error for a named tool
    pub fn tool_with_code(code: u16, message: impl Into<String>, tool: Option<String>) -> Self {
        Self::Tool {
            code,
            message: message.into(),
            tool,
            source: None,
        }
    }

    /// A call the tool answered with an error.
    pub fn tool_failed(tool: &str, failure: &ToolFailure) -> Self {
        Self::tool_with_code(
            ErrorCode::TOOL_FAILED,
            failure.to_string(),
            Some(tool.to_string()),
        )
    }

    /// A call that got no answer in time.
    pub fn tool_timeout(tool: &str, after: Duration) -> Self {
        Self::tool_with_code(
            ErrorCode::TOOL_TIMEOUT,
            format!("no response within {after:?}"),
            Some(tool.to_string()),
        )
    }

    pub fn llm_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Llm {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn lookup_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Lookup {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a validation error with specific code and field
    pub fn validation_with_code(
        code: u16,
        message: impl Into<String>,
        field: Option<String>,
    ) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            field,
            source: None,
        }
    }

    /// Create a generic other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::Worker { source: src, .. }
            | Self::Tool { source: src, .. }
            | Self::Llm { source: src, .. }
            | Self::Lookup { source: src, .. }
            | Self::Validation { source: src, .. }
            | Self::Other { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::Worker { message, .. }
            | Self::Tool { message, .. }
            | Self::Llm { message, .. }
            | Self::Lookup { message, .. }
            | Self::Validation { message, .. }
            | Self::Other { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
        }
        self
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::Worker { .. } => 3,
            Self::Tool { .. } => 4,
            Self::Llm { .. } => 5,
            Self::Lookup { .. } => 6,
            Self::Validation { .. } => 8,
            Self::Other { .. } => 1,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::Worker { code, .. }
            | Self::Tool { code, .. }
            | Self::Llm { code, .. }
            | Self::Lookup { code, .. }
            | Self::Validation { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { message, .. } => format!("Configuration problem: {}", message),
            Self::Worker { message, .. } => format!("Tool worker problem: {}", message),
            Self::Tool { message, tool, .. } => match tool {
                Some(tool) => format!("Tool '{}' failed: {}", tool, message),
                None => format!("Tool failed: {}", message),
            },
            Self::Llm { message, .. } => format!("Text generation failed: {}", message),
            Self::Lookup { message, .. } => format!("Protein lookup failed: {}", message),
            Self::Validation { message, field, .. } => match field {
                Some(f) => format!("Validation error for '{}': {}", f, message),
                None => format!("Validation error: {}", message),
            },
            Self::Other { message, .. } => message.clone(),
        }
    }

    /// Worker stderr captured with the failure, if any.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            Self::Worker { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }

    /// True when the worker could not serve the request and a retry may
    /// succeed after a fresh start.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Worker { code, .. } if matches!(
                *code,
                ErrorCode::WORKER_SPAWN_FAILED
                    | ErrorCode::WORKER_START_FAILED
                    | ErrorCode::WORKER_UNAVAILABLE
                    | ErrorCode::WORKER_TRANSPORT
                    | ErrorCode::WORKER_TERMINATED
            )
        )
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Llm { code, .. } => matches!(
                *code,
                ErrorCode::LLM_RATE_LIMITED | ErrorCode::LLM_EMPTY_RESPONSE
            ),
            Self::Tool { code, .. } => *code == ErrorCode::TOOL_TIMEOUT,
            _ => self.is_service_unavailable(),
        }
    }
}

/// Type alias for Results using ToolbridgeError
pub type Result<T> = std::result::Result<T, ToolbridgeError>;

impl From<WorkerError> for ToolbridgeError {
    fn from(err: WorkerError) -> Self {
        let code = match &err {
            WorkerError::Spawn { .. } => ErrorCode::WORKER_SPAWN_FAILED,
            WorkerError::StartFailure { .. } => ErrorCode::WORKER_START_FAILED,
            WorkerError::ServiceUnavailable { .. } => ErrorCode::WORKER_UNAVAILABLE,
            WorkerError::Transport { .. } | WorkerError::MissingPipe(_) => {
                ErrorCode::WORKER_TRANSPORT
            }
            WorkerError::ProcessTerminated { .. } => ErrorCode::WORKER_TERMINATED,
            WorkerError::StopTimeout(_) => ErrorCode::WORKER_STOP_TIMEOUT,
            WorkerError::InvalidConfig(_) => ErrorCode::WORKER_INVALID_CONFIG,
            WorkerError::Encode(_) | WorkerError::DuplicateId(_) => ErrorCode::WORKER_PROTOCOL,
        };
        let message = err.to_string();
        let diagnostics = err.diagnostics().to_vec();
        ToolbridgeError::Worker {
            code,
            message,
            diagnostics,
            source: Some(Box::new(err)),
        }
    }
}

impl From<LlmError> for ToolbridgeError {
    fn from(err: LlmError) -> Self {
        let code = match &err {
            LlmError::Http { .. } | LlmError::Client(_) => ErrorCode::LLM_HTTP,
            LlmError::Status { .. } => ErrorCode::LLM_STATUS,
            LlmError::RateLimited(_) => ErrorCode::LLM_RATE_LIMITED,
            LlmError::MissingApiKey { .. } => ErrorCode::LLM_MISSING_API_KEY,
            LlmError::MissingModel(_) => ErrorCode::LLM_MISSING_MODEL,
            LlmError::EmptyResponse => ErrorCode::LLM_EMPTY_RESPONSE,
            LlmError::MalformedJson { .. } => ErrorCode::LLM_MALFORMED_JSON,
        };
        ToolbridgeError::llm_with_code(code, err.to_string()).with_source(err)
    }
}

impl From<LookupError> for ToolbridgeError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::EmptyQuery => ToolbridgeError::validation_with_code(
                ErrorCode::VALIDATION_INVALID_INPUT,
                err.to_string(),
                Some("query".to_string()),
            ),
            other => {
                let code = match &other {
                    LookupError::Http(_) | LookupError::Client(_) => ErrorCode::LOOKUP_HTTP,
                    LookupError::Status { .. } => ErrorCode::LOOKUP_STATUS,
                    LookupError::Decode(_) => ErrorCode::LOOKUP_DECODE,
                    LookupError::EmptyQuery => ErrorCode::LOOKUP_GENERIC,
                };
                ToolbridgeError::lookup_with_code(code, other.to_string()).with_source(other)
            }
        }
    }
}

impl From<CatalogError> for ToolbridgeError {
    fn from(err: CatalogError) -> Self {
        let (code, field) = match &err {
            CatalogError::UnknownTool(tool) => {
                (ErrorCode::VALIDATION_UNKNOWN_TOOL, Some(tool.clone()))
            }
            CatalogError::NotAnObject(tool) => {
                (ErrorCode::VALIDATION_INVALID_INPUT, Some(tool.clone()))
            }
            CatalogError::MissingParameters { tool, .. } => {
                (ErrorCode::VALIDATION_MISSING_PARAMS, Some(tool.clone()))
            }
            CatalogError::UnknownParameter { name, .. } => {
                (ErrorCode::VALIDATION_UNKNOWN_PARAM, Some(name.clone()))
            }
            CatalogError::TypeMismatch { name, .. } => {
                (ErrorCode::VALIDATION_INVALID_TYPE, Some(name.clone()))
            }
        };
        ToolbridgeError::validation_with_code(code, err.to_string(), field).with_source(err)
    }
}

impl From<ConfigError> for ToolbridgeError {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::Read { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ErrorCode::CONFIG_NOT_FOUND
            }
            ConfigError::Read { .. } => ErrorCode::CONFIG_GENERIC,
            ConfigError::Parse { .. } => ErrorCode::CONFIG_PARSE_ERROR,
            ConfigError::Invalid { .. } => ErrorCode::CONFIG_INVALID_VALUE,
        };
        ToolbridgeError::config_with_code(code, err.to_string()).with_source(err)
    }
}

impl From<ServerError> for ToolbridgeError {
    fn from(err: ServerError) -> Self {
        ToolbridgeError::tool_with_code(ErrorCode::TOOL_SERVER_IO, err.to_string(), None)
            .with_source(err)
    }
}

impl From<serde_json::Error> for ToolbridgeError {
    fn from(err: serde_json::Error) -> Self {
        ToolbridgeError::validation_with_code(
            ErrorCode::VALIDATION_INVALID_INPUT,
            "Invalid JSON",
            None,
        )
        .with_source(err)
    }
}

// Note: ToolbridgeError converts to anyhow::Error because it implements std::error::Error

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_source_is_optional_and_chained() {
        let bare = ToolbridgeError::other("no cause");
        assert!(bare.source().is_none());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let chained = ToolbridgeError::other("write failed").with_source(io);
        let source = chained.source().expect("source should be kept");
        assert_eq!(source.to_string(), "pipe closed");
    }

    #[test]
    fn test_worker_errors_map_to_codes() {
        let err = ToolbridgeError::from(WorkerError::unavailable(WorkerError::StartFailure {
            exit_code: Some(2),
            diagnostics: vec!["boom".to_string()],
        }));
        assert_eq!(err.code(), ErrorCode::WORKER_UNAVAILABLE);
        assert!(err.to_string().starts_with("[E2003]"));
        assert!(err.is_service_unavailable());
        assert_eq!(err.diagnostics(), ["boom".to_string()]);
        assert_eq!(err.exit_code(), 3);

        let stop = ToolbridgeError::from(WorkerError::StopTimeout(Duration::from_secs(1)));
        assert!(!stop.is_service_unavailable());
    }

    #[test]
    fn test_tool_outcomes() {
        let failed = ToolbridgeError::tool_failed("echo", &ToolFailure::new("bad"));
        assert_eq!(failed.code(), ErrorCode::TOOL_FAILED);
        assert_eq!(failed.user_message(), "Tool 'echo' failed: bad");

        let timeout = ToolbridgeError::tool_timeout("sleep", Duration::from_secs(1));
        assert!(timeout.is_recoverable());
        assert_eq!(timeout.exit_code(), 4);
    }

    #[test]
    fn test_catalog_errors_are_validation() {
        let err = ToolbridgeError::from(CatalogError::MissingParameters {
            tool: "get_protein_data".to_string(),
            missing: vec!["identifier".to_string()],
        });
        assert_eq!(err.code(), ErrorCode::VALIDATION_MISSING_PARAMS);
        assert!(err.user_message().contains("identifier"));
    }

    #[test]
    fn test_context_is_appended() {
        let err = ToolbridgeError::from(LlmError::EmptyResponse).with_context("while planning");
        assert_eq!(err.code(), ErrorCode::LLM_EMPTY_RESPONSE);
        assert!(err.to_string().ends_with("while planning"));
        assert!(err.is_recoverable());
    }
}
