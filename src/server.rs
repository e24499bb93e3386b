//! Tool-server handles consumed by the executor.
//!
//! A [`ServerInstance`] is created by whoever owns the server (a spawned child
//! process or a configured remote endpoint) and shared with executors through
//! an `Arc`. The bridge never starts or stops the underlying process; it only
//! observes the running flag.

use crate::error::{BridgeError, BridgeResult};
use crate::executor::stdio::StdioChannel;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// One callable tool as advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Declared schema, or the single string `input` schema when none was given.
    pub fn effective_parameters(&self) -> Value {
        self.parameters.clone().unwrap_or_else(default_parameters)
    }
}

pub fn default_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "input": {
                "type": "string",
                "description": "Input for the tool"
            }
        },
        "required": ["input"]
    })
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Standard streams of an already-running local tool server.
pub struct ProcessHandles {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
}

impl ProcessHandles {
    pub fn new<W, R>(stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: None,
        }
    }

    pub fn with_stderr<E>(mut self, stderr: E) -> Self
    where
        E: AsyncRead + Send + Unpin + 'static,
    {
        self.stderr = Some(Box::new(stderr));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteConnection {
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl RemoteConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Local,
    Remote,
}

pub enum ServerTransport {
    Local(StdioChannel),
    Remote(RemoteConnection),
}

pub struct ServerInstance {
    name: String,
    running: AtomicBool,
    transport: ServerTransport,
    tools: Vec<ToolDescriptor>,
}

impl ServerInstance {
    /// Attaches to a local server's streams. Must be called inside a Tokio
    /// runtime: the output demultiplexer starts immediately.
    pub fn local(
        name: impl Into<String>,
        handles: ProcessHandles,
        tools: Vec<ToolDescriptor>,
    ) -> Self {
        let name = name.into();
        let channel = StdioChannel::attach(name.clone(), handles);
        Self {
            name,
            running: AtomicBool::new(true),
            transport: ServerTransport::Local(channel),
            tools,
        }
    }

    pub fn remote(
        name: impl Into<String>,
        connection: RemoteConnection,
        tools: Vec<ToolDescriptor>,
    ) -> Self {
        Self {
            name: name.into(),
            running: AtomicBool::new(true),
            transport: ServerTransport::Remote(connection),
            tools,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServerKind {
        match self.transport {
            ServerTransport::Local(_) => ServerKind::Local,
            ServerTransport::Remote(_) => ServerKind::Remote,
        }
    }

    pub fn transport(&self) -> &ServerTransport {
        &self.transport
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

/// Explicit owner of the live server set.
///
/// Holders of an `Arc<ServerInstance>` keep the instance alive; the registry is
/// what enumerates servers and marks them stopped on shutdown.
#[derive(Default)]
pub struct ServerRegistry {
    servers: Vec<Arc<ServerInstance>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, server: ServerInstance) -> BridgeResult<Arc<ServerInstance>> {
        if self.find(server.name()).is_some() {
            return Err(BridgeError::config(format!(
                "duplicate server name: {}",
                server.name()
            )));
        }
        let server = Arc::new(server);
        self.servers.push(server.clone());
        Ok(server)
    }

    pub fn find(&self, name: &str) -> Option<Arc<ServerInstance>> {
        self.servers
            .iter()
            .find(|server| server.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn servers(&self) -> &[Arc<ServerInstance>] {
        &self.servers
    }

    pub fn running(&self) -> impl Iterator<Item = &Arc<ServerInstance>> {
        self.servers.iter().filter(|server| server.is_running())
    }

    /// Marks every server stopped and releases the registry's references.
    pub fn shutdown(&mut self) -> Vec<Arc<ServerInstance>> {
        for server in &self.servers {
            server.set_running(false);
        }
        std::mem::take(&mut self.servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_without_parameters_uses_input_schema() {
        let descriptor = ToolDescriptor::new("x");
        let schema = descriptor.effective_parameters();

        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["input"]["type"], "string");
        assert_eq!(schema["required"], json!(["input"]));
    }

    #[test]
    fn descriptor_keeps_declared_parameters() {
        let declared = json!({"type": "object", "properties": {"city": {"type": "string"}}});
        let descriptor = ToolDescriptor::new("weather").with_parameters(declared.clone());
        assert_eq!(descriptor.effective_parameters(), declared);
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = ServerRegistry::new();
        registry
            .register(ServerInstance::remote(
                "alpha",
                RemoteConnection::new("http://localhost:1"),
                Vec::new(),
            ))
            .expect("first registration");

        let err = registry
            .register(ServerInstance::remote(
                "Alpha",
                RemoteConnection::new("http://localhost:2"),
                Vec::new(),
            ))
            .err()
            .expect("duplicate should fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn registry_shutdown_marks_servers_stopped() {
        let mut registry = ServerRegistry::new();
        let alpha = registry
            .register(ServerInstance::remote(
                "alpha",
                RemoteConnection::new("http://localhost:1"),
                Vec::new(),
            ))
            .expect("register");
        assert_eq!(registry.running().count(), 1);

        let released = registry.shutdown();
        assert_eq!(released.len(), 1);
        assert!(!alpha.is_running());
        assert!(registry.servers().is_empty());
    }
}
