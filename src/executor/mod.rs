//! Routes named tool invocations to a server's local or remote backend.
//!
//! Whatever goes wrong underneath, callers see exactly one [`BridgeError`]
//! per call: `Timeout` when a local server never answered, `Server` for
//! everything else, both tagged with the server and tool names.

pub mod http;
pub(crate) mod protocol;
pub mod stdio;

use crate::error::{BridgeError, BridgeResult};
use crate::server::{ServerInstance, ServerTransport};
pub use http::{build_http_client, HttpSettings};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stdio::LocalCallError;
use tracing::debug;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub call_timeout: Duration,
    pub http: HttpSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            http: HttpSettings::default(),
        }
    }
}

pub struct ToolExecutor {
    server: Arc<ServerInstance>,
    http: reqwest::Client,
    call_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(server: Arc<ServerInstance>, settings: &ExecutorSettings) -> BridgeResult<Self> {
        let http = build_http_client(&settings.http)?;
        Ok(Self::with_client(server, http, settings.call_timeout))
    }

    /// Shares an existing HTTP client, e.g. one pool across every remote server.
    pub fn with_client(
        server: Arc<ServerInstance>,
        http: reqwest::Client,
        call_timeout: Duration,
    ) -> Self {
        Self {
            server,
            http,
            call_timeout,
        }
    }

    pub fn server(&self) -> &Arc<ServerInstance> {
        &self.server
    }

    pub fn server_name(&self) -> &str {
        self.server.name()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn available_tools(&self) -> Vec<String> {
        self.server
            .tools()
            .iter()
            .map(|tool| tool.name.clone())
            .collect()
    }

    pub async fn execute_tool(&self, tool_name: &str, arguments: Value) -> BridgeResult<String> {
        let server_name = self.server.name();
        if !self.server.is_running() {
            return Err(BridgeError::server(server_name, tool_name, "server not running"));
        }

        debug!(
            server = %server_name,
            tool = %tool_name,
            kind = ?self.server.kind(),
            "Executing tool"
        );
        match self.server.transport() {
            ServerTransport::Local(channel) => channel
                .call(tool_name, &arguments, self.call_timeout)
                .await
                .map_err(|err| self.normalize_local(tool_name, err)),
            ServerTransport::Remote(connection) => {
                http::call_remote(&self.http, server_name, connection, tool_name, &arguments)
                    .await
                    .map_err(|err| BridgeError::server(server_name, tool_name, err.cause_message()))
            }
        }
    }

    fn normalize_local(&self, tool_name: &str, err: LocalCallError) -> BridgeError {
        match err {
            LocalCallError::TimedOut => BridgeError::Timeout {
                server_name: self.server.name().to_string(),
                tool_name: tool_name.to_string(),
                timeout: self.call_timeout,
            },
            other => BridgeError::server(self.server.name(), tool_name, other.to_string()),
        }
    }

    /// Buffered stderr of a local server; `None` for remote servers.
    pub async fn diagnostics(&self) -> Option<String> {
        match self.server.transport() {
            ServerTransport::Local(channel) => Some(channel.diagnostics().await),
            ServerTransport::Remote(_) => None,
        }
    }
}
