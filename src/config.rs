//! TOML configuration: executor tuning plus the tool servers to attach.

use crate::error::{BridgeError, BridgeResult};
use crate::executor::{ExecutorSettings, HttpSettings};
use crate::server::{RemoteConnection, ToolDescriptor};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_http_connect_timeout_secs() -> u64 {
    10
}

fn default_http_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Local,
    Remote,
}

impl TransportKind {
    /// Resolves the transport name, defaulting to local when a command is set
    /// and remote otherwise.
    pub fn from_config(config: &ServerConfig) -> BridgeResult<Self> {
        let transport = match config.transport.as_deref() {
            Some(transport) => transport.to_ascii_lowercase(),
            None if config.command.is_some() => return Ok(TransportKind::Local),
            None => return Ok(TransportKind::Remote),
        };
        match transport.as_str() {
            "local" | "stdio" => Ok(TransportKind::Local),
            "remote" | "http" => Ok(TransportKind::Remote),
            other => Err(BridgeError::config(format!(
                "server {}: unsupported transport: {}",
                config.name, other
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub transport: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub url: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    pub enabled: Option<bool>,
}

impl ServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn require_command(&self) -> BridgeResult<&str> {
        self.command.as_deref().ok_or_else(|| {
            BridgeError::config(format!(
                "server {}: command is required for local transport",
                self.name
            ))
        })
    }

    pub fn args(&self) -> &[String] {
        self.args.as_deref().unwrap_or_default()
    }

    pub fn remote_connection(&self) -> BridgeResult<RemoteConnection> {
        let url = self.url.clone().ok_or_else(|| {
            BridgeError::config(format!(
                "server {}: url is required for remote transport",
                self.name
            ))
        })?;
        Ok(RemoteConnection {
            url,
            headers: self.headers.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BridgeConfig {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_http_connect_timeout_secs")]
    pub http_connect_timeout_secs: u64,
    #[serde(default = "default_http_request_timeout_secs")]
    pub http_request_timeout_secs: u64,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            http_connect_timeout_secs: default_http_connect_timeout_secs(),
            http_request_timeout_secs: default_http_request_timeout_secs(),
            servers: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Missing files yield the defaults; unreadable or malformed files fail.
    pub fn load_from_path(config_path: &Path) -> BridgeResult<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|err| {
            BridgeError::config(format!(
                "failed to read config at {}: {}",
                config_path.display(),
                err
            ))
        })?;
        let config: BridgeConfig = toml::from_str(&contents).map_err(|err| {
            BridgeError::config(format!(
                "failed to parse config at {}: {}",
                config_path.display(),
                err
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "toolbridge", "toolbridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.call_timeout_secs == 0 {
            return Err(BridgeError::config("call_timeout_secs must be positive"));
        }
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(BridgeError::config("server name cannot be empty"));
            }
            if !seen.insert(server.name.to_ascii_lowercase()) {
                return Err(BridgeError::config(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            match TransportKind::from_config(server)? {
                TransportKind::Local => {
                    server.require_command()?;
                }
                TransportKind::Remote => {
                    server.remote_connection()?;
                }
            }
            let mut tool_names = HashSet::new();
            for tool in &server.tools {
                if !tool_names.insert(tool.name.as_str()) {
                    return Err(BridgeError::config(format!(
                        "server {}: duplicate tool name: {}",
                        server.name, tool.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            http: HttpSettings {
                connect_timeout: Duration::from_secs(self.http_connect_timeout_secs),
                request_timeout: Duration::from_secs(self.http_request_timeout_secs),
            },
        }
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|server| server.is_enabled())
    }

    pub fn find_server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|server| server.name.eq_ignore_ascii_case(name))
    }
}
