// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Coarse behavioural category of a tool.
///
/// Drives phase detection (the scheduler maps the most recent tool message
/// back to a phase) and planning enforcement (Edit tools are refused until
/// a mini-plan exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCategory {
    /// Codebase search (hybrid retrieval, grep-alikes).
    Search,
    /// File and span reads.
    Read,
    /// Mutating the working tree (edit, write, search-replace, patch).
    Edit,
    /// Build, test, and lint runners.
    Build,
    /// Mini-plan creation and revision.
    Plan,
    /// Terminal answer back to the user.
    Respond,
    #[default]
    Other,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Search => "search",
            ToolCategory::Read => "read",
            ToolCategory::Edit => "edit",
            ToolCategory::Build => "build",
            ToolCategory::Plan => "plan",
            ToolCategory::Respond => "respond",
            ToolCategory::Other => "other",
        }
    }
}

/// Descriptor metadata carried by every tool.
#[derive(Debug, Clone)]
pub struct ToolMeta {
    pub category: ToolCategory,
    pub tags: Vec<String>,
    pub version: String,
    pub deprecated: bool,
}

impl Default for ToolMeta {
    fn default() -> Self {
        Self {
            category: ToolCategory::Other,
            tags: Vec::new(),
            version: "1.0.0".into(),
            deprecated: false,
        }
    }
}

impl ToolMeta {
    pub fn for_category(category: ToolCategory) -> Self {
        Self {
            category,
            ..Default::default()
        }
    }
}

/// A single tool invocation as seen by the registry.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when execution failed non-fatally (error message in content).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Trait every built-in and host-registered tool implements.
///
/// `execute` receives the session's cancellation token; long-running tools
/// (shell commands especially) must observe it at their await points.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object
    fn parameters_schema(&self) -> Value;
    fn meta(&self) -> ToolMeta {
        ToolMeta::default()
    }
    /// Whether failed executions may be retried under the tool retry
    /// policy.  Defaults to false: only tools whose execution is idempotent
    /// should opt in.
    fn retryable(&self) -> bool {
        false
    }
    /// Execute the tool.  Errors are reported via [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
