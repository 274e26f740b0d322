// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use dodo_retrieval::RetrievalEngine;

use crate::tool::{Tool, ToolCall, ToolCategory, ToolMeta, ToolOutput};

/// Rendered spans cached per session.  Keyed by (path, bounds, mtime) so a
/// touched file naturally misses.
const CACHE_CAPACITY: usize = 64;

type CacheKey = (String, usize, usize, i64);

/// Read an inclusive line span from a repository file, with a per-session
/// LRU cache over rendered results.
pub struct ReadSpanTool {
    engine: Arc<RetrievalEngine>,
    cache: Mutex<LruCache<CacheKey, String>>,
}

impl ReadSpanTool {
    pub fn new(engine: Arc<RetrievalEngine>) -> Self {
        Self {
            engine,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        }
    }

    fn mtime(&self, rel: &str) -> i64 {
        std::fs::metadata(self.engine.root().join(rel))
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Tool for ReadSpanTool {
    fn name(&self) -> &str {
        "read_span"
    }

    fn description(&self) -> &str {
        "Read a line range from a file in the repository. Out-of-range \
         bounds are clamped and reversed bounds are swapped.\n\
         path: repo-relative file path. start_line/end_line: 1-based inclusive."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Repo-relative file path" },
                "start_line": { "type": "integer", "description": "First line (1-based)" },
                "end_line": { "type": "integer", "description": "Last line (inclusive)" }
            },
            "required": ["path", "start_line", "end_line"],
            "additionalProperties": false
        })
    }

    fn meta(&self) -> ToolMeta {
        ToolMeta::for_category(ToolCategory::Read)
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
        let Some(path) = call.args.get("path").and_then(Value::as_str) else {
            return ToolOutput::err(&call.id, "missing required parameter 'path'");
        };
        let start = call
            .args
            .get("start_line")
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;
        let end = call
            .args
            .get("end_line")
            .and_then(Value::as_u64)
            .unwrap_or(start as u64) as usize;

        let key: CacheKey = (path.to_string(), start, end, self.mtime(path));
        if let Some(hit) = self.cache.lock().unwrap_or_else(|p| p.into_inner()).get(&key) {
            return ToolOutput::ok(&call.id, hit.clone());
        }

        match self.engine.read_span(path, start, end) {
            Ok(span) => {
                let mut out = format!("{}:{}-{}\n", span.path, span.start_line, span.end_line);
                for (offset, line) in span.snippet.lines().enumerate() {
                    out.push_str(&format!("{:>6}\t{line}\n", span.start_line + offset));
                }
                self.cache
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .put(key, out.clone());
                ToolOutput::ok(&call.id, out)
            }
            Err(e) => ToolOutput::err(&call.id, format!("read_span failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
