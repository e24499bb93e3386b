use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FUNCTION_TOOL_KIND: &str = "function";

/// Function-calling entry in the shape chat completion APIs accept.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ChatToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            kind: FUNCTION_TOOL_KIND.to_string(),
            function: ChatToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}
