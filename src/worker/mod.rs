//! Stdio transport to a tool worker process
//!
//! A [`ToolClient`] owns one worker process and multiplexes concurrent calls
//! over its stdin/stdout as newline-delimited JSON. Responses are matched to
//! callers by correlation id; the worker's stderr is kept in a bounded
//! [`DiagnosticBuffer`] for troubleshooting.
//!
//! ```text
//! caller -> ToolClient::call -> stdin
//! stdout -> reader -> queue -> router -> pending call -> caller
//! stderr -> reader -> diagnostic buffer
//! ```

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod process;
pub mod protocol;
pub mod reader;
pub mod router;
pub mod supervisor;

pub use client::ToolClient;
pub use config::WorkerConfig;
pub use diagnostics::DiagnosticBuffer;
pub use error::WorkerError;
pub use protocol::{CallOutcome, Request, Response, ToolFailure};
pub use supervisor::WorkerState;
