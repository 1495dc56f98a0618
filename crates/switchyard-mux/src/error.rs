//! Error types for child supervision and call routing.

use crate::jsonrpc::{ErrorObject, error_codes};
use thiserror::Error;

/// Errors from talking to child processes.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Failed to spawn child '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Child '{name}' is not running")]
    ChildNotRunning { name: String },

    #[error("Child '{name}' not found")]
    UnknownChild { name: String },

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("{message}")]
    ChildError {
        child: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Call '{method}' to child '{child}' timed out after {timeout_ms}ms")]
    Timeout {
        child: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("Child '{child}' exited before responding")]
    ChildExited { child: String },

    #[error("Child '{child}' already has {limit} calls in flight")]
    Overloaded { child: String, limit: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The single error shape surfaced to the gateway's caller.
///
/// Carries a JSON-RPC error code and a message; internal request ids and
/// process details never appear in it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct GatewayError {
    pub code: i64,
    pub message: String,
}

impl GatewayError {
    /// Convert into the wire-level error object.
    pub fn into_error_object(self) -> ErrorObject {
        ErrorObject {
            code: self.code,
            message: self.message,
            data: None,
        }
    }

    /// Whether this error came from a call timing out.
    pub fn is_timeout(&self) -> bool {
        self.code == error_codes::REQUEST_TIMEOUT
    }
}

impl From<MuxError> for GatewayError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::UnknownTool { .. } => Self {
                code: error_codes::INVALID_REQUEST,
                message: err.to_string(),
            },
            MuxError::UnknownChild { .. } => Self {
                code: error_codes::INTERNAL_ERROR,
                message: err.to_string(),
            },
            MuxError::Timeout { .. } => Self {
                code: error_codes::REQUEST_TIMEOUT,
                message: format!("Tool execution failed: {err}"),
            },
            other => Self {
                code: error_codes::INTERNAL_ERROR,
                message: format!("Tool execution failed: {other}"),
            },
        }
    }
}
