// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolCall, ToolCategory, ToolOutput};

/// A tool schema as handed to the model.  Mirrors dodo_model::ToolSchema
/// but keeps the tools crate independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Central registry holding all available tools.  Names are unique;
/// re-registering a name replaces the previous tool.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas for all registered tools, name-sorted for stable prompts.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn category(&self, name: &str) -> Option<ToolCategory> {
        self.tools.get(name).map(|t| t.meta().category)
    }

    pub fn retryable(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.retryable()).unwrap_or(false)
    }

    /// Validate a call's arguments against the tool's JSON schema.
    ///
    /// Unknown tool names are a validation error listing the available
    /// tools so the model can self-correct without wasting the step.
    pub fn validate(&self, call: &ToolCall) -> Result<(), String> {
        let Some(tool) = self.tools.get(&call.name) else {
            return Err(format!(
                "unknown tool '{}'; available tools: {}",
                call.name,
                self.names().join(", ")
            ));
        };
        validate_args(&tool.parameters_schema(), &call.args)
    }

    /// Execute a call.  The arguments are assumed validated; unknown names
    /// still produce an error output rather than a panic.
    pub async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call, cancel).await,
            None => ToolOutput::err(
                &call.id,
                format!(
                    "unknown tool '{}'; available tools: {}",
                    call.name,
                    self.names().join(", ")
                ),
            ),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal JSON-schema argument validation: object shape, `required`
/// members, and primitive `type` tags on declared properties.  Deliberately
/// shallow; tools do their own fine-grained checks.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(name) {
                return Err(format!("missing required parameter '{name}'"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in obj {
            let Some(prop) = props.get(name) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!(
                    "parameter '{name}' must be of type {expected}, got {value}"
                ));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tool::ToolMeta;

    struct EchoTool {
        name: &'static str,
        category: ToolCategory,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "count": { "type": "integer" }
                },
                "required": ["text"]
            })
        }
        fn meta(&self) -> ToolMeta {
            ToolMeta::for_category(self.category)
        }
        fn retryable(&self) -> bool {
            true
        }
        async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "echo",
            category: ToolCategory::Search,
        });
        reg
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn register_and_get() {
        assert!(registry().get("echo").is_some());
        assert!(registry().get("nope").is_none());
    }

    #[test]
    fn schemas_are_name_sorted() {
        let mut reg = registry();
        reg.register(EchoTool {
            name: "aaa",
            category: ToolCategory::Other,
        });
        let names: Vec<String> = reg.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["aaa", "echo"]);
    }

    #[test]
    fn category_and_retryable_lookups() {
        let reg = registry();
        assert_eq!(reg.category("echo"), Some(ToolCategory::Search));
        assert!(reg.retryable("echo"));
        assert_eq!(reg.category("missing"), None);
        assert!(!reg.retryable("missing"));
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = registry();
        reg.register(EchoTool {
            name: "echo",
            category: ToolCategory::Edit,
        });
        assert_eq!(reg.names().len(), 1);
        assert_eq!(reg.category("echo"), Some(ToolCategory::Edit));
    }

    #[test]
    fn validate_unknown_tool_lists_available() {
        let err = registry().validate(&call("ghost", json!({}))).unwrap_err();
        assert!(err.contains("unknown tool 'ghost'"));
        assert!(err.contains("echo"));
    }

    #[test]
    fn validate_missing_required_parameter() {
        let err = registry().validate(&call("echo", json!({}))).unwrap_err();
        assert!(err.contains("missing required parameter 'text'"));
    }

    #[test]
    fn validate_wrong_type_is_rejected() {
        let err = registry()
            .validate(&call("echo", json!({"text": 42})))
            .unwrap_err();
        assert!(err.contains("'text' must be of type string"));
    }

    #[test]
    fn validate_accepts_well_formed_arguments() {
        assert!(registry()
            .validate(&call("echo", json!({"text": "hi", "count": 3})))
            .is_ok());
    }

    #[test]
    fn validate_ignores_undeclared_properties() {
        assert!(registry()
            .validate(&call("echo", json!({"text": "hi", "extra": true})))
            .is_ok());
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let out = registry()
            .execute(
                &call("echo", json!({"text": "x"})),
                &CancellationToken::new(),
            )
            .await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let out = registry()
            .execute(&call("missing", json!({})), &CancellationToken::new())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }
}
