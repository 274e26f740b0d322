// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use dodo_model::{Message, Role, Usage};
use dodo_tools::plan::MiniPlan;
use dodo_tools::{ToolCategory, ToolRegistry};

use crate::budget::BudgetConfig;

/// Failure-count key for build/test/lint tool failures.
pub const BUILD_FAILURE_KEY: &str = "build";

/// Failure-count key for search-replace failures against one file.
pub fn search_replace_failure_key(file: &str) -> String {
    format!("search_replace:{file}")
}

/// What the agent is currently doing, inferred from the transcript tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Explore,
    DiscoverAndPlan,
    Edit,
    Validate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Explore => "explore",
            Phase::DiscoverAndPlan => "discover_and_plan",
            Phase::Edit => "edit",
            Phase::Validate => "validate",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a tool category to the phase its use indicates.
pub fn phase_for_category(category: Option<ToolCategory>) -> Phase {
    match category {
        Some(ToolCategory::Edit) => Phase::Edit,
        Some(ToolCategory::Build) => Phase::Validate,
        Some(ToolCategory::Search) | Some(ToolCategory::Read) => Phase::DiscoverAndPlan,
        _ => Phase::Explore,
    }
}

/// Mutable state of one agent run, owned by the session.
#[derive(Debug)]
pub struct AgentState {
    pub transcript: Vec<Message>,
    /// Completed scheduler steps.  Monotonic, bounded by `max_steps`;
    /// errors do not consume steps.
    pub step: u32,
    /// LLM retry attempts across the run (counted separately from steps).
    pub retries: u32,
    pub phase: Phase,
    pub model: String,
    pub max_steps: u32,
    pub budget: BudgetConfig,
    pub usage: Usage,
    pub plan: Option<MiniPlan>,
    pub tool_calls_total: u32,
    /// Set when an edit-category call was refused for lack of a plan.
    pub edit_blocked: bool,
    pub failure_counts: HashMap<String, u32>,
    pub done: bool,
}

impl AgentState {
    pub fn new(model: impl Into<String>, max_steps: u32, budget: BudgetConfig) -> Self {
        Self {
            transcript: Vec::new(),
            step: 0,
            retries: 0,
            phase: Phase::Explore,
            model: model.into(),
            max_steps,
            budget,
            usage: Usage::default(),
            plan: None,
            tool_calls_total: 0,
            edit_blocked: false,
            failure_counts: HashMap::new(),
            done: false,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.transcript.push(msg);
    }

    pub fn record_failure(&mut self, key: impl Into<String>) -> u32 {
        let counter = self.failure_counts.entry(key.into()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failure_counts.get(key).copied().unwrap_or(0)
    }

    /// Detect the current phase: find the most recent tool message, resolve
    /// the name of the call it answers, and map that tool's category.
    pub fn detect_phase(&self, registry: &ToolRegistry) -> Phase {
        for msg in self.transcript.iter().rev() {
            if msg.role != Role::Tool {
                continue;
            }
            let Some(call_id) = msg.tool_call_id.as_deref() else {
                continue;
            };
            let name = self.transcript.iter().rev().find_map(|m| {
                m.tool_calls
                    .iter()
                    .find(|tc| tc.id == call_id)
                    .map(|tc| tc.name.clone())
            });
            return phase_for_category(name.as_deref().and_then(|n| registry.category(n)));
        }
        Phase::Explore
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
