//! Command-line interface parsing and handling
//!
//! The binary plays the role of the server owner: it spawns local tool servers,
//! registers them, and then drives the bridge the same way an agent would.

pub mod spawn;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::stream;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::config::BridgeConfig;
use crate::executor::{build_http_client, ToolExecutor};
use crate::instrument::{ToolInstrumentation, ToolProvider, ToolSet};
use crate::logging::init_tracing;
use crate::server::ServerRegistry;
use crate::stream::{handle_streaming_response, on_complete, CompletionError};

#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(about = "Invoke tool-server tools and frame streamed answers")]
#[command(
    long_about = "toolbridge connects to the tool servers listed in its config file \
(local subprocesses speaking line-delimited JSON, or remote HTTP services) and exposes \
their tools as callable functions.\n\n\
Environment Variables:\n\
  TOOLBRIDGE_LOG    tracing filter directive (e.g. debug, toolbridge=trace)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the config file (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the function definitions generated for every enabled server
    Tools,
    /// Invoke one tool and print its result
    Call {
        /// Server name from the config file
        server: String,
        /// Tool name advertised by the server
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short = 'a', long, default_value = "{}")]
        args: String,
    },
    /// Frame stdin lines as text records on stdout
    Frame,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing("warn").map_err(|err| err.to_string())?;

    let config_path = args
        .config
        .or_else(BridgeConfig::default_config_path)
        .ok_or("Unable to determine config directory; pass --config")?;
    let config = BridgeConfig::load_from_path(&config_path)?;

    match args.command {
        Commands::Tools => list_tools(&config).await,
        Commands::Call { server, tool, args } => call_tool(&config, &server, &tool, &args).await,
        Commands::Frame => frame_stdin().await,
    }
}

async fn list_tools(config: &BridgeConfig) -> Result<(), Box<dyn Error>> {
    let mut registry = ServerRegistry::new();
    let _children = spawn::attach_servers(config.enabled_servers(), &mut registry)?;
    let http = build_http_client(&config.executor_settings().http)?;
    let call_timeout = config.executor_settings().call_timeout;

    let mut set = ToolSet::default();
    for server in registry.running() {
        let executor = ToolExecutor::with_client(server.clone(), http.clone(), call_timeout);
        let instrumentation =
            ToolInstrumentation::new(Arc::new(executor)).with_base(Arc::new(set));
        set = instrumentation.extract();
    }

    println!("{}", serde_json::to_string_pretty(&set.tools)?);
    registry.shutdown();
    Ok(())
}

async fn call_tool(
    config: &BridgeConfig,
    server_name: &str,
    tool_name: &str,
    raw_args: &str,
) -> Result<(), Box<dyn Error>> {
    let arguments: Value = serde_json::from_str(raw_args)
        .map_err(|err| format!("--args must be a JSON object: {err}"))?;
    if !arguments.is_object() {
        return Err("--args must be a JSON object".into());
    }

    let server_config = config
        .find_server(server_name)
        .ok_or_else(|| format!("Unknown server: {server_name}"))?;
    let mut registry = ServerRegistry::new();
    let _children = spawn::attach_servers(std::iter::once(server_config), &mut registry)?;
    let server = registry
        .find(server_name)
        .ok_or_else(|| format!("Server {server_name} failed to attach"))?;

    let executor = Arc::new(ToolExecutor::new(server, &config.executor_settings())?);
    let functions = ToolInstrumentation::new(executor.clone()).extract().functions;
    let function = functions.get(tool_name).ok_or_else(|| {
        format!(
            "Server {server_name} has no tool {tool_name}; available: {}",
            executor.available_tools().join(", ")
        )
    })?;

    let outcome = function.invoke(arguments).await;
    if outcome.is_err() {
        if let Some(diagnostics) = executor.diagnostics().await.filter(|d| !d.is_empty()) {
            eprintln!("{}", diagnostics.trim_end());
        }
    }
    registry.shutdown();
    println!("{}", outcome?);
    Ok(())
}

async fn frame_stdin() -> Result<(), Box<dyn Error>> {
    let lines = BufReader::new(tokio::io::stdin()).lines();
    let source = stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(format!("{line}\n")), lines)),
            Ok(None) => None,
            Err(err) => Some((Err(err), lines)),
        }
    });

    let callback = on_complete(|text| async move {
        info!(bytes = text.len(), lines = text.lines().count(), "Captured framed text");
        Ok::<(), CompletionError>(())
    });
    handle_streaming_response(source, tokio::io::stdout(), Some(callback)).await?;
    Ok(())
}
