//! Tool Registry (spec §4.1 design note, §4.5, §4.6).
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/tools/edit.rs` for the
//! `Tool` capability shape (tagged-enum input via serde, a handler that
//! returns a result object) and `examples/adolfousier-opencrabs/src/brain/
//! agent/service/builder.rs` for holding the registry behind an `Arc` on the
//! runner state. Design note §9: "each tool registers a static {name,
//! description, parameter schema, handler} record at startup; the registry
//! is a name->record map."

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreResult;

mod expand_message;
pub use expand_message::ExpandMessageTool;

/// OpenAPI-style function schema (spec §6 "Tool schema").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolFunctionSchema,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolFunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of invoking a tool: what gets wrapped into a `tool` message.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Capability set a tool implements (design note §9): schema introspection
/// plus invocation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn invoke(&self, params: Value) -> CoreResult<ToolResult>;

    fn openapi_schema(&self) -> ToolSchema {
        ToolSchema {
            kind: "function",
            function: ToolFunctionSchema {
                name: self.name().to_string(),
                description: self.description().to_string(),
                parameters: self.parameters_schema(),
            },
        }
    }
}

/// Name -> tool instance map. Static registration at startup, no runtime
/// reflection (design note §9).
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.openapi_schema()).collect()
    }

    pub fn is_terminating(&self, name: &str) -> bool {
        matches!(name, "ask" | "complete")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        async fn invoke(&self, params: Value) -> CoreResult<ToolResult> {
            Ok(ToolResult::ok(params["text"].as_str().unwrap_or_default()))
        }
    }

    #[tokio::test]
    async fn registry_looks_up_registered_tool_by_name() {
        let registry = ToolRegistry::new().register(Arc::new(EchoTool));
        let tool = registry.get("echo").unwrap();
        let result = tool.invoke(serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(result.output, "hi");
    }

    #[test]
    fn unregistered_tool_returns_none() {
        let registry = ToolRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn terminating_tools_are_ask_and_complete() {
        let registry = ToolRegistry::new();
        assert!(registry.is_terminating("ask"));
        assert!(registry.is_terminating("complete"));
        assert!(!registry.is_terminating("web_search"));
    }
}
