//! Line-delimited JSON wire format shared by the client and the server

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code for a method the worker does not implement
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Error code for arguments the tool rejected
pub const INVALID_PARAMS: i64 = -32602;
/// Error code for a failure inside the tool implementation
pub const INTERNAL_ERROR: i64 = -32603;

/// One request line written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize as exactly one newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Application-level error reported by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            data: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Build from the `error` member of a response. A missing or non-string
    /// `message` falls back to a generic text.
    pub fn from_value(value: &Value) -> Self {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown tool error")
            .to_string();
        let code = value.get("code").and_then(Value::as_i64);
        let data = value.get("data").cloned();
        Self {
            message,
            code,
            data,
        }
    }
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Payload of a matched response.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Value),
    Error(ToolFailure),
}

/// A response line parsed into its correlation id and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: u64,
    pub reply: Reply,
}

/// Why a line could not be turned into an [`InboundMessage`].
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("line is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("message has no usable id")]
    MissingId,
}

impl InboundMessage {
    /// Parse one response line.
    ///
    /// The id must be a positive integer. `result` takes precedence over
    /// `error`; a message with neither resolves as an invalid-format failure.
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(line)?;
        let object = value.as_object().ok_or(MessageError::NotAnObject)?;
        let id = object
            .get("id")
            .and_then(Value::as_u64)
            .filter(|id| *id > 0)
            .ok_or(MessageError::MissingId)?;

        let reply = if let Some(result) = object.get("result") {
            Reply::Result(result.clone())
        } else if let Some(error) = object.get("error") {
            Reply::Error(ToolFailure::from_value(error))
        } else {
            Reply::Error(ToolFailure::new(
                "Received invalid response format from worker",
            ))
        };

        Ok(Self { id, reply })
    }
}

/// Response line written by the server side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl Response {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: ToolFailure) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Terminal outcome of a call that reached the worker.
///
/// Transport failures are reported separately as
/// [`WorkerError`](super::error::WorkerError).
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Result(Value),
    ToolError(ToolFailure),
    Timeout(Duration),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Result(_))
    }

    /// Render as a JSON object with an `error` member on failure, the shape
    /// the agent hands to its reply step.
    pub fn to_json(&self) -> Value {
        match self {
            CallOutcome::Result(value) => value.clone(),
            CallOutcome::ToolError(failure) => {
                serde_json::json!({ "error": format!("Tool error: {}", failure.message) })
            }
            CallOutcome::Timeout(after) => serde_json::json!({
                "error": format!("Tool request timed out after {} seconds.", after.as_secs_f64())
            }),
        }
    }
}

impl From<Reply> for CallOutcome {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Result(value) => CallOutcome::Result(value),
            Reply::Error(failure) => CallOutcome::ToolError(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_shape() {
        let line = Request::new(1, "echo", json!({"message": "hi"}))
            .to_line()
            .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"message": "hi"}})
        );
    }

    #[test]
    fn test_request_accepts_missing_optional_members() {
        let request: Request = serde_json::from_str(r#"{"id": 4, "method": "echo"}"#).unwrap();
        assert_eq!(request.jsonrpc, "2.0");
        assert_eq!(request.params, json!({}));
    }

    #[test]
    fn test_parse_result() {
        let msg = InboundMessage::parse(r#"{"id":1,"result":"hi"}"#).unwrap();
        assert_eq!(msg.id, 1);
        assert_eq!(msg.reply, Reply::Result(json!("hi")));
    }

    #[test]
    fn test_parse_null_result_is_still_a_result() {
        let msg = InboundMessage::parse(r#"{"id":7,"result":null}"#).unwrap();
        assert_eq!(msg.reply, Reply::Result(Value::Null));
    }

    #[test]
    fn test_parse_error_payload() {
        let msg =
            InboundMessage::parse(r#"{"id":2,"error":{"code":-32601,"message":"Unknown tool"}}"#)
                .unwrap();
        match msg.reply {
            Reply::Error(failure) => {
                assert_eq!(failure.message, "Unknown tool");
                assert_eq!(failure.code, Some(METHOD_NOT_FOUND));
            }
            other => panic!("Expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_without_message() {
        let msg = InboundMessage::parse(r#"{"id":2,"error":{}}"#).unwrap();
        assert_eq!(
            msg.reply,
            Reply::Error(ToolFailure::new("Unknown tool error"))
        );
    }

    #[test]
    fn test_parse_result_wins_over_error() {
        let msg =
            InboundMessage::parse(r#"{"id":3,"result":1,"error":{"message":"x"}}"#).unwrap();
        assert_eq!(msg.reply, Reply::Result(json!(1)));
    }

    #[test]
    fn test_parse_neither_result_nor_error() {
        let msg = InboundMessage::parse(r#"{"id":3}"#).unwrap();
        assert!(matches!(msg.reply, Reply::Error(ref f) if f.message.contains("invalid response")));
    }

    #[test]
    fn test_parse_rejects_noise() {
        assert!(matches!(
            InboundMessage::parse("Starting server..."),
            Err(MessageError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse("[1,2,3]"),
            Err(MessageError::NotAnObject)
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"result":"no id"}"#),
            Err(MessageError::MissingId)
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"id":"1","result":"string id"}"#),
            Err(MessageError::MissingId)
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"id":0,"result":"zero"}"#),
            Err(MessageError::MissingId)
        ));
    }

    #[test]
    fn test_response_line_omits_absent_members() {
        let ok = Response::result(5, json!({"a": 1})).to_line().unwrap();
        assert!(!ok.contains("error"));
        let err = Response::error(5, ToolFailure::new("bad").with_code(INVALID_PARAMS))
            .to_line()
            .unwrap();
        assert!(!err.contains("result"));
        let parsed = InboundMessage::parse(err.trim_end()).unwrap();
        assert_eq!(parsed.id, 5);
    }

    #[test]
    fn test_outcome_to_json() {
        assert_eq!(CallOutcome::Result(json!([1])).to_json(), json!([1]));
        let timeout = CallOutcome::Timeout(Duration::from_secs(2)).to_json();
        assert!(timeout["error"].as_str().unwrap().contains("timed out"));
        let failure = CallOutcome::ToolError(ToolFailure::new("nope")).to_json();
        assert_eq!(failure["error"], "Tool error: nope");
    }
}
