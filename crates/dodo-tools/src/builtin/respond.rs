// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolCall, ToolCategory, ToolMeta, ToolOutput};

/// Terminal answer tool.  Calling it ends the run: the scheduler sets the
/// done flag and the session manager records the summary and derives the
/// session title.
pub struct RespondTool;

#[async_trait]
impl Tool for RespondTool {
    fn name(&self) -> &str {
        "respond"
    }

    fn description(&self) -> &str {
        "Deliver the final answer for this task and end the run. \
         summary: what was done and why. files_changed: repo-relative \
         paths that were modified. next_steps: suggested follow-ups."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "Final summary of the work" },
                "files_changed": { "type": "array", "items": { "type": "string" } },
                "next_steps": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["summary"],
            "additionalProperties": false
        })
    }

    fn meta(&self) -> ToolMeta {
        ToolMeta::for_category(ToolCategory::Respond)
    }

    async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
        let Some(summary) = call.args.get("summary").and_then(Value::as_str) else {
            return ToolOutput::err(&call.id, "missing required parameter 'summary'");
        };
        let files_changed = call
            .args
            .get("files_changed")
            .cloned()
            .unwrap_or_else(|| json!([]));
        let next_steps = call
            .args
            .get("next_steps")
            .cloned()
            .unwrap_or_else(|| json!([]));

        // Canonical JSON result; the session manager parses this back out
        // of the transcript on completion.
        let result = json!({
            "summary": summary,
            "files_changed": files_changed,
            "next_steps": next_steps,
        });
        ToolOutput::ok(&call.id, result.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
