// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
///
/// The id is stable across the request and the tool message answering it.
/// `error` is set by the provider when the call arrived truncated (e.g. the
/// stream was cut mid-arguments); such calls are never executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Argument mapping as sent by the model (JSON object members).
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            error: None,
        }
    }

    /// The arguments as a JSON object value.
    pub fn args_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.args.clone())
    }

    /// The arguments serialized back to a JSON string (for wire formats and
    /// token accounting).
    pub fn args_json(&self) -> String {
        serde_json::Value::Object(self.args.clone()).to_string()
    }
}

/// A single message in the transcript.
///
/// Invariants: a tool message carries the id of the assistant tool call it
/// answers; `tool_calls` is only populated on assistant messages; a system
/// message, when present, is the first element of a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Assistant message that requests tools.  `content` may be empty when
    /// the model emitted calls without accompanying text.
    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_call_id: None,
            tool_calls: calls,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }
}

// ─── Completion request / response ────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model client.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
}

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A fully assembled model response: final text plus zero or more tool calls.
/// Zero tool calls means the model considers the task answered.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

// ─── Streaming events ─────────────────────────────────────────────────────────

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A tool-call fragment.  Providers interleave fragments for different
    /// parallel calls by `index`; id/name arrive once, arguments accumulate.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
        /// Set when the provider reports the call as truncated.
        error: Option<String>,
    },
    /// Final usage statistics
    Usage(Usage),
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

// ─── Tool-call assembly ───────────────────────────────────────────────────────

/// Reconstructs complete [`ToolCallRequest`]s from interleaved streamed
/// fragments.  Shared by the default non-streaming `complete` and by the
/// scheduler's streaming variant so both paths produce identical calls.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    pending: HashMap<u32, PendingCall>,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    args_buf: String,
    error: Option<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u32, id: &str, name: &str, arguments: &str, error: Option<&str>) {
        let slot = self.pending.entry(index).or_default();
        if !id.is_empty() {
            slot.id = id.to_string();
        }
        if !name.is_empty() {
            slot.name = name.to_string();
        }
        slot.args_buf.push_str(arguments);
        if let Some(e) = error {
            slot.error = Some(e.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush accumulated calls ordered by provider index.
    ///
    /// Calls with an empty name cannot be dispatched and are dropped;
    /// storing them would corrupt the transcript sent back on the next
    /// turn.  An empty id gets a synthetic fallback so the turn can still
    /// complete.  Unparseable argument buffers become an empty object with
    /// the error indicator set, so the scheduler answers the call instead
    /// of executing it.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        let mut sorted: Vec<(u32, PendingCall)> = self.pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);

        let mut calls = Vec::with_capacity(sorted.len());
        for (i, (_, slot)) in sorted.into_iter().enumerate() {
            if slot.name.is_empty() {
                warn!(call_id = %slot.id, "dropping tool call with empty name from model");
                continue;
            }
            let id = if slot.id.is_empty() {
                warn!(tool = %slot.name, "tool call had empty id; generated synthetic id");
                format!("call_synthetic_{i}")
            } else {
                slot.id
            };
            let mut error = slot.error;
            let args = if slot.args_buf.is_empty() {
                serde_json::Map::new()
            } else {
                match serde_json::from_str::<serde_json::Value>(&slot.args_buf) {
                    Ok(serde_json::Value::Object(m)) => m,
                    Ok(other) => {
                        warn!(tool = %slot.name, "tool call arguments were not an object: {other}");
                        error.get_or_insert_with(|| "arguments were not a JSON object".into());
                        serde_json::Map::new()
                    }
                    Err(e) => {
                        warn!(tool = %slot.name, error = %e, "tool call arguments failed to parse");
                        error.get_or_insert_with(|| format!("truncated arguments: {e}"));
                        serde_json::Map::new()
                    }
                }
            };
            calls.push(ToolCallRequest {
                id,
                name: slot.name,
                args,
                error,
            });
        }
        calls
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "hello");
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn message_tool_result_references_call_id() {
        let m = Message::tool_result("call-1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn assistant_with_calls_keeps_call_order() {
        let calls = vec![
            ToolCallRequest::new("a", "read", obj(json!({}))),
            ToolCallRequest::new("b", "grep", obj(json!({}))),
        ];
        let m = Message::assistant_with_calls("", calls);
        assert_eq!(m.tool_calls[0].id, "a");
        assert_eq!(m.tool_calls[1].id, "b");
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.content, "test payload");
    }

    #[test]
    fn empty_tool_calls_are_omitted_from_json() {
        let json = serde_json::to_string(&Message::user("x")).unwrap();
        assert!(!json.contains("tool_calls"), "{json}");
        assert!(!json.contains("tool_call_id"), "{json}");
    }

    #[test]
    fn tool_call_request_round_trips_args() {
        let c = ToolCallRequest::new("id1", "search", obj(json!({"query": "foo", "k": 5})));
        let json = serde_json::to_string(&c).unwrap();
        let back: ToolCallRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.args["query"], "foo");
        assert_eq!(back.args["k"], 5);
        assert!(back.error.is_none());
    }

    #[test]
    fn role_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }

    // ── Usage ─────────────────────────────────────────────────────────────────

    #[test]
    fn usage_add_accumulates() {
        let mut u = Usage {
            input_tokens: 10,
            output_tokens: 5,
        };
        u.add(Usage {
            input_tokens: 3,
            output_tokens: 2,
        });
        assert_eq!(u.input_tokens, 13);
        assert_eq!(u.output_tokens, 7);
        assert_eq!(u.total(), 20);
    }

    // ── Assembler ─────────────────────────────────────────────────────────────

    #[test]
    fn assembler_joins_argument_fragments() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, "c1", "search", r#"{"que"#, None);
        asm.push(0, "", "", r#"ry":"x"}"#, None);
        let calls = asm.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].args["query"], "x");
    }

    #[test]
    fn assembler_orders_parallel_calls_by_index() {
        let mut asm = ToolCallAssembler::new();
        asm.push(1, "c2", "b", "{}", None);
        asm.push(0, "c1", "a", "{}", None);
        let calls = asm.finish();
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[1].id, "c2");
    }

    #[test]
    fn assembler_drops_empty_name() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, "c1", "", "{}", None);
        assert!(asm.finish().is_empty());
    }

    #[test]
    fn assembler_synthesises_missing_id() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, "", "tool", "{}", None);
        let calls = asm.finish();
        assert_eq!(calls[0].id, "call_synthetic_0");
    }

    #[test]
    fn assembler_marks_truncated_arguments_as_error() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, "c1", "edit", r#"{"path": "src/ma"#, None);
        let calls = asm.finish();
        assert!(calls[0].error.is_some());
        assert!(calls[0].args.is_empty());
    }

    #[test]
    fn assembler_preserves_provider_error() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, "c1", "edit", "{}", Some("truncated by provider"));
        let calls = asm.finish();
        assert_eq!(calls[0].error.as_deref(), Some("truncated by provider"));
    }

    #[test]
    fn assembler_empty_arguments_become_empty_object() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, "c1", "noop", "", None);
        let calls = asm.finish();
        assert!(calls[0].args.is_empty());
        assert!(calls[0].error.is_none());
    }
}
