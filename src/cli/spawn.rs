use crate::config::{ServerConfig, TransportKind};
use crate::error::{BridgeError, BridgeResult};
use crate::server::{ProcessHandles, ServerInstance, ServerRegistry};
use tokio::process::{Child, Command};
use tracing::debug;

/// Spawns local servers and registers every configured server.
///
/// The returned children are killed when dropped, so callers keep them alive
/// for as long as the registry is in use.
pub fn attach_servers<'a>(
    servers: impl IntoIterator<Item = &'a ServerConfig>,
    registry: &mut ServerRegistry,
) -> BridgeResult<Vec<Child>> {
    let mut children = Vec::new();
    for config in servers {
        let instance = match TransportKind::from_config(config)? {
            TransportKind::Local => {
                let (child, handles) = spawn_local(config)?;
                children.push(child);
                ServerInstance::local(&config.name, handles, config.tools.clone())
            }
            TransportKind::Remote => ServerInstance::remote(
                &config.name,
                config.remote_connection()?,
                config.tools.clone(),
            ),
        };
        registry.register(instance)?;
    }
    Ok(children)
}

fn spawn_local(config: &ServerConfig) -> BridgeResult<(Child, ProcessHandles)> {
    let command = config.require_command()?;
    let args = config.args();
    debug!(server = %config.name, command = %command, args = ?args, "Starting local tool server");

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(env) = &config.env {
        cmd.envs(env);
    }

    let spawn_error = |message: String| BridgeError::server(&config.name, "<spawn>", message);
    let mut child = cmd
        .spawn()
        .map_err(|err| spawn_error(format!("failed to start {command}: {err}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error("Unable to retrieve stdin.".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("Unable to retrieve stdout.".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_error("Unable to retrieve stderr.".to_string()))?;

    Ok((child, ProcessHandles::new(stdin, stdout).with_stderr(stderr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn missing_command_reports_server_error() {
        let config = ServerConfig {
            name: "ghost".to_string(),
            command: Some("/definitely-missing-command".to_string()),
            ..Default::default()
        };
        let mut registry = ServerRegistry::new();

        let err = attach_servers([&config], &mut registry).expect_err("spawn should fail");
        assert_eq!(err.kind(), ErrorKind::Server);
        assert!(err.to_string().contains("failed to start"));
        assert!(registry.servers().is_empty());
    }

    #[tokio::test]
    async fn remote_servers_register_without_spawning() {
        let config = ServerConfig {
            name: "remote".to_string(),
            url: Some("http://127.0.0.1:9".to_string()),
            ..Default::default()
        };
        let mut registry = ServerRegistry::new();

        let children = attach_servers([&config], &mut registry).expect("attach");
        assert!(children.is_empty());
        assert_eq!(
            registry.find("remote").map(|server| server.kind()),
            Some(crate::server::ServerKind::Remote)
        );
    }
}
