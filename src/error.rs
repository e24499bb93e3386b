//! Operational error taxonomy shared by the executor and instrumentation layers.
//!
//! Every failure that leaves the bridge is one of a small, closed set of kinds.
//! Callers match on [`BridgeError::kind`] instead of inspecting message text.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connection,
    Server,
    Timeout,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed server definition or configuration file.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Remote server unreachable or answered with a non-success status.
    #[error("cannot reach {server_name}: {message}")]
    Connection {
        server_name: String,
        message: String,
    },

    /// Server not running, or any execution failure on a server.
    #[error("server {server_name} failed to run {tool_name}: {message}")]
    Server {
        server_name: String,
        tool_name: String,
        message: String,
    },

    /// No matching response from a local server within the bound.
    #[error("{server_name} did not answer {tool_name} within {}ms", .timeout.as_millis())]
    Timeout {
        server_name: String,
        tool_name: String,
        timeout: Duration,
    },

    /// Failure surfaced through a generated callable function.
    #[error("tool execution failed: {source}")]
    ToolExecution {
        tool_name: String,
        #[source]
        source: Box<BridgeError>,
    },
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config {
            message: message.into(),
        }
    }

    pub fn server(
        server_name: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        BridgeError::Server {
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Wrapper errors report the kind of the failure they carry.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Config { .. } => ErrorKind::Config,
            BridgeError::Connection { .. } => ErrorKind::Connection,
            BridgeError::Server { .. } => ErrorKind::Server,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::ToolExecution { source, .. } => source.kind(),
        }
    }

    /// Name of the tool the failure belongs to, when known.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            BridgeError::Server { tool_name, .. }
            | BridgeError::Timeout { tool_name, .. }
            | BridgeError::ToolExecution { tool_name, .. } => Some(tool_name),
            BridgeError::Config { .. } | BridgeError::Connection { .. } => None,
        }
    }

    /// Message text without the server/tool prefix added by `Display`.
    pub fn cause_message(&self) -> String {
        match self {
            BridgeError::Config { message }
            | BridgeError::Connection { message, .. }
            | BridgeError::Server { message, .. } => message.clone(),
            BridgeError::Timeout { timeout, .. } => {
                format!("request timed out after {}ms", timeout.as_millis())
            }
            BridgeError::ToolExecution { source, .. } => source.cause_message(),
        }
    }
}
