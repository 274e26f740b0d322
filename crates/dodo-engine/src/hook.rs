// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Translation from scheduler hook callbacks to protocol events.

use dodo_core::Hook;
use dodo_model::{ToolCallRequest, Usage};
use dodo_tools::plan::MiniPlan;

use crate::bridge::EventSender;
use crate::protocol::Event;

/// Observes one agent run and forwards everything to the event channel.
/// Purely observational; session bookkeeping stays in the manager.
pub struct ChannelHook {
    session_id: String,
    events: EventSender,
}

impl ChannelHook {
    pub fn new(session_id: impl Into<String>, events: EventSender) -> Self {
        Self {
            session_id: session_id.into(),
            events,
        }
    }

    fn sid(&self) -> String {
        self.session_id.clone()
    }
}

impl Hook for ChannelHook {
    fn before_llm(&self, _step: u32, _message_count: usize, _tool_count: usize) {
        self.events.emit(Event::Status {
            session_id: Some(self.sid()),
            state: "thinking".into(),
            message: None,
        });
    }

    fn on_stream_delta(&self, delta: &str) {
        self.events.emit(Event::AssistantText {
            session_id: self.sid(),
            content: delta.to_string(),
            is_final: false,
        });
    }

    fn after_llm(&self, _step: u32, content: &str, _tool_calls: usize, usage: &Usage) {
        if !content.is_empty() {
            self.events.emit(Event::AssistantText {
                session_id: self.sid(),
                content: content.to_string(),
                is_final: true,
            });
        }
        self.events.emit(Event::TokenUsage {
            session_id: self.sid(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
        });
    }

    fn on_tool_call(&self, call: &ToolCallRequest) {
        self.events.emit(Event::ToolEvent {
            session_id: self.sid(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            phase: "start".into(),
            is_error: None,
        });
        self.events.emit(Event::Activity {
            session_id: self.sid(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            state: "started".into(),
        });
    }

    fn on_tool_result(&self, call_id: &str, tool: &str, content: &str, is_error: bool) {
        self.events.emit(Event::ToolEvent {
            session_id: self.sid(),
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            phase: "end".into(),
            is_error: Some(is_error),
        });
        self.events.emit(Event::Activity {
            session_id: self.sid(),
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            state: if is_error { "failed" } else { "completed" }.into(),
        });
        self.events.emit(Event::ToolOutput {
            session_id: self.sid(),
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            chunk: content.to_string(),
        });
    }

    fn on_tool_output(&self, call_id: &str, tool: &str, chunk: &str) {
        self.events.emit(Event::ToolOutput {
            session_id: self.sid(),
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            chunk: chunk.to_string(),
        });
    }

    fn on_retry_attempt(&self, operation: &str, attempt: u32, delay: std::time::Duration) {
        self.events.emit(Event::Status {
            session_id: Some(self.sid()),
            state: "retrying".into(),
            message: Some(format!(
                "{operation} attempt {attempt}, retrying in {} ms",
                delay.as_millis()
            )),
        });
    }

    fn on_budget_exceeded(&self, tokens: usize, soft_limit: usize) {
        self.events.emit(Event::Context {
            session_id: self.sid(),
            message: format!("context at {tokens} tokens, above the soft limit of {soft_limit}"),
        });
    }

    fn on_budget_compression(&self, strategy: &str, tokens_before: usize, tokens_after: usize) {
        self.events.emit(Event::Context {
            session_id: self.sid(),
            message: format!(
                "compressed history with {strategy}: {tokens_before} to {tokens_after} tokens"
            ),
        });
    }

    fn on_plan_updated(&self, plan: &MiniPlan) {
        self.events.emit(Event::ProjectPlan {
            session_id: self.sid(),
            plan: serde_json::to_value(plan).unwrap_or(serde_json::Value::Null),
        });
    }

    fn on_done(&self, summary: &str) {
        self.events.emit(Event::Done {
            session_id: self.sid(),
            summary: summary.to_string(),
        });
    }
}
