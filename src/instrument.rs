//! Exposes a tool server's catalog to the agent's function-calling interface.
//!
//! Each advertised tool becomes a [`ChatToolDefinition`] for the model plus a
//! [`CallableFunction`] that forwards to the server's [`ToolExecutor`]. Tool
//! sets from unrelated providers compose through [`ToolProvider`]: entries are
//! merged into one name-keyed mapping, later providers overwriting earlier
//! ones.

use crate::api::ChatToolDefinition;
use crate::error::{BridgeError, BridgeResult};
use crate::executor::ToolExecutor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait ToolFunction: Send + Sync {
    async fn call(&self, arguments: Value) -> BridgeResult<String>;
}

#[derive(Clone)]
pub struct CallableFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    implementation: Arc<dyn ToolFunction>,
}

impl CallableFunction {
    pub fn new(
        definition: &ChatToolDefinition,
        implementation: Arc<dyn ToolFunction>,
    ) -> Self {
        Self {
            name: definition.function.name.clone(),
            description: definition.function.description.clone(),
            parameters: definition.function.parameters.clone(),
            implementation,
        }
    }

    pub async fn invoke(&self, arguments: Value) -> BridgeResult<String> {
        self.implementation.call(arguments).await
    }
}

impl fmt::Debug for CallableFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableFunction")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Function definitions for the model plus their implementations.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    pub tools: Vec<ChatToolDefinition>,
    pub functions: HashMap<String, CallableFunction>,
}

impl ToolSet {
    /// Entries of `other` replace same-named entries of `self`. Replaced tools
    /// keep their position; new ones are appended.
    pub fn merge(mut self, other: ToolSet) -> ToolSet {
        for tool in other.tools {
            match self.tools.iter_mut().find(|existing| existing.name() == tool.name()) {
                Some(existing) => *existing = tool,
                None => self.tools.push(tool),
            }
        }
        self.functions.extend(other.functions);
        self
    }

    pub fn function(&self, name: &str) -> Option<&CallableFunction> {
        self.functions.get(name)
    }
}

pub trait ToolProvider: Send + Sync {
    fn extract(&self) -> ToolSet;
}

impl ToolProvider for ToolSet {
    fn extract(&self) -> ToolSet {
        self.clone()
    }
}

struct ServerToolFunction {
    executor: Arc<ToolExecutor>,
    tool_name: String,
}

#[async_trait]
impl ToolFunction for ServerToolFunction {
    async fn call(&self, arguments: Value) -> BridgeResult<String> {
        self.executor
            .execute_tool(&self.tool_name, arguments)
            .await
            .map_err(|err| {
                debug!(tool = %self.tool_name, error = %err, "Tool execution failed");
                BridgeError::ToolExecution {
                    tool_name: self.tool_name.clone(),
                    source: Box::new(err),
                }
            })
    }
}

pub struct ToolInstrumentation {
    executor: Arc<ToolExecutor>,
    base: Option<Arc<dyn ToolProvider>>,
}

impl ToolInstrumentation {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self {
            executor,
            base: None,
        }
    }

    pub fn with_base(mut self, base: Arc<dyn ToolProvider>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn generate_tools(&self) -> Vec<ChatToolDefinition> {
        let server_name = self.executor.server_name();
        self.executor
            .server()
            .tools()
            .iter()
            .map(|tool| {
                let description = tool.description.clone().unwrap_or_else(|| {
                    format!("Execute {} tool from server {}", tool.name, server_name)
                });
                ChatToolDefinition::function(&tool.name, description, tool.effective_parameters())
            })
            .collect()
    }

    pub fn create_function_map(
        &self,
        tools: &[ChatToolDefinition],
    ) -> HashMap<String, CallableFunction> {
        tools
            .iter()
            .map(|tool| {
                let implementation = Arc::new(ServerToolFunction {
                    executor: self.executor.clone(),
                    tool_name: tool.name().to_string(),
                });
                (tool.name().to_string(), CallableFunction::new(tool, implementation))
            })
            .collect()
    }
}

impl ToolProvider for ToolInstrumentation {
    fn extract(&self) -> ToolSet {
        let tools = self.generate_tools();
        let functions = self.create_function_map(&tools);
        let own = ToolSet { tools, functions };
        match &self.base {
            Some(base) => base.extract().merge(own),
            None => own,
        }
    }
}
