// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dodo_retrieval::RetrievalEngine;

use crate::tool::{Tool, ToolCall, ToolCategory, ToolMeta, ToolOutput};

const DEFAULT_LIMIT: usize = 10;

/// Hybrid code search over the repository index.
pub struct SearchCodeTool {
    engine: Arc<RetrievalEngine>,
}

impl SearchCodeTool {
    pub fn new(engine: Arc<RetrievalEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for SearchCodeTool {
    fn name(&self) -> &str {
        "search_code"
    }

    fn description(&self) -> &str {
        "Search the codebase with hybrid keyword + semantic ranking. \
         Returns ranked spans with path, line range, and a snippet.\n\
         query: what to look for (identifiers work well). \
         globs: optional path filters like [\"src/**/*.rs\"]. \
         limit: max results (default 10)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query (free text or identifier)"
                },
                "globs": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Optional glob filters applied to file paths"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of spans to return (default 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn meta(&self) -> ToolMeta {
        ToolMeta::for_category(ToolCategory::Search)
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
        if cancel.is_cancelled() {
            return ToolOutput::err(&call.id, "cancelled");
        }
        let Some(query) = call.args.get("query").and_then(Value::as_str) else {
            return ToolOutput::err(&call.id, "missing required parameter 'query'");
        };
        let globs: Vec<String> = call
            .args
            .get("globs")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let limit = call
            .args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_LIMIT as u64) as usize;

        debug!(query = %query, ?globs, limit, "search_code");

        match self.engine.search(query, &globs, limit).await {
            Ok(spans) if spans.is_empty() => ToolOutput::ok(&call.id, "(no matches)"),
            Ok(spans) => {
                let mut out = String::new();
                for span in &spans {
                    out.push_str(&format!(
                        "{}:{}-{}  score={:.4}  [{}]\n{}\n---\n",
                        span.path, span.start_line, span.end_line, span.score, span.reason,
                        span.snippet
                    ));
                }
                ToolOutput::ok(&call.id, out)
            }
            Err(e) => ToolOutput::err(&call.id, format!("search failed: {e}")),
        }
    }
}
