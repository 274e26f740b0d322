// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Observability hooks.
//!
//! A hook is a set of callback slots with no-op defaults; implementers
//! override only what they need.  The bus dispatches to hooks in
//! registration order.  Hooks are purely observational: every slot takes
//! `&self` and must not mutate agent state.

use std::sync::Arc;
use std::time::Duration;

use dodo_model::{ToolCallRequest, Usage};
use dodo_tools::plan::MiniPlan;

use crate::state::Phase;

#[allow(unused_variables)]
pub trait Hook: Send + Sync {
    fn on_step_start(&self, step: u32, phase: Phase) {}
    fn before_llm(&self, step: u32, message_count: usize, tool_count: usize) {}
    fn after_llm(&self, step: u32, content: &str, tool_calls: usize, usage: &Usage) {}
    fn on_stream_delta(&self, delta: &str) {}
    fn on_tool_call(&self, call: &ToolCallRequest) {}
    fn on_tool_result(&self, call_id: &str, tool: &str, content: &str, is_error: bool) {}
    fn on_tool_output(&self, call_id: &str, tool: &str, chunk: &str) {}
    fn on_history_changed(&self, message_count: usize) {}
    fn on_summarize(&self, summary: &str) {}
    fn on_retry_attempt(&self, operation: &str, attempt: u32, delay: Duration) {}
    fn on_retry_exhausted(&self, operation: &str, attempts: u32) {}
    fn on_budget_exceeded(&self, tokens: usize, soft_limit: usize) {}
    fn on_budget_compression(&self, strategy: &str, tokens_before: usize, tokens_after: usize) {}
    fn on_soft_cap(&self, guidance: &str) {}
    fn on_done(&self, summary: &str) {}
    fn on_plan_updated(&self, plan: &MiniPlan) {}
}

/// Hook with every slot left at its default.
pub struct NoopHook;

impl Hook for NoopHook {}

/// Ordered collection of hooks.  Cloning shares the registered hooks.
#[derive(Clone, Default)]
pub struct HookBus {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn on_step_start(&self, step: u32, phase: Phase) {
        for h in &self.hooks {
            h.on_step_start(step, phase);
        }
    }

    pub fn before_llm(&self, step: u32, message_count: usize, tool_count: usize) {
        for h in &self.hooks {
            h.before_llm(step, message_count, tool_count);
        }
    }

    pub fn after_llm(&self, step: u32, content: &str, tool_calls: usize, usage: &Usage) {
        for h in &self.hooks {
            h.after_llm(step, content, tool_calls, usage);
        }
    }

    pub fn on_stream_delta(&self, delta: &str) {
        for h in &self.hooks {
            h.on_stream_delta(delta);
        }
    }

    pub fn on_tool_call(&self, call: &ToolCallRequest) {
        for h in &self.hooks {
            h.on_tool_call(call);
        }
    }

    pub fn on_tool_result(&self, call_id: &str, tool: &str, content: &str, is_error: bool) {
        for h in &self.hooks {
            h.on_tool_result(call_id, tool, content, is_error);
        }
    }

    pub fn on_tool_output(&self, call_id: &str, tool: &str, chunk: &str) {
        for h in &self.hooks {
            h.on_tool_output(call_id, tool, chunk);
        }
    }

    pub fn on_history_changed(&self, message_count: usize) {
        for h in &self.hooks {
            h.on_history_changed(message_count);
        }
    }

    pub fn on_summarize(&self, summary: &str) {
        for h in &self.hooks {
            h.on_summarize(summary);
        }
    }

    pub fn on_retry_attempt(&self, operation: &str, attempt: u32, delay: Duration) {
        for h in &self.hooks {
            h.on_retry_attempt(operation, attempt, delay);
        }
    }

    pub fn on_retry_exhausted(&self, operation: &str, attempts: u32) {
        for h in &self.hooks {
            h.on_retry_exhausted(operation, attempts);
        }
    }

    pub fn on_budget_exceeded(&self, tokens: usize, soft_limit: usize) {
        for h in &self.hooks {
            h.on_budget_exceeded(tokens, soft_limit);
        }
    }

    pub fn on_budget_compression(&self, strategy: &str, before: usize, after: usize) {
        for h in &self.hooks {
            h.on_budget_compression(strategy, before, after);
        }
    }

    pub fn on_soft_cap(&self, guidance: &str) {
        for h in &self.hooks {
            h.on_soft_cap(guidance);
        }
    }

    pub fn on_done(&self, summary: &str) {
        for h in &self.hooks {
            h.on_done(summary);
        }
    }

    pub fn on_plan_updated(&self, plan: &MiniPlan) {
        for h in &self.hooks {
            h.on_plan_updated(plan);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Hook for Recorder {
        fn on_done(&self, summary: &str) {
            self.log.lock().unwrap().push(format!("{}:{summary}", self.tag));
        }
    }

    #[test]
    fn dispatch_preserves_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = HookBus::new();
        bus.add(Arc::new(Recorder {
            tag: "first",
            log: Arc::clone(&log),
        }));
        bus.add(Arc::new(Recorder {
            tag: "second",
            log: Arc::clone(&log),
        }));
        bus.on_done("x");
        let entries = log.lock().unwrap();
        assert_eq!(*entries, vec!["first:x", "second:x"]);
    }

    #[test]
    fn noop_hook_implements_every_slot() {
        let bus = {
            let mut b = HookBus::new();
            b.add(Arc::new(NoopHook));
            b
        };
        // Exercise a few slots; defaults must not panic.
        bus.on_step_start(0, Phase::Explore);
        bus.on_stream_delta("chunk");
        bus.on_budget_compression("truncate", 100, 50);
        bus.on_soft_cap("guidance");
    }

    #[test]
    fn empty_bus_is_fine() {
        let bus = HookBus::new();
        assert!(bus.is_empty());
        bus.on_done("nothing registered");
    }
}
