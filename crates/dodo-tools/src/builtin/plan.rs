// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::ToolEvent;
use crate::plan::{MiniPlan, PlanStep, StepStatus, MAX_PLAN_STEPS, MIN_PLAN_STEPS};
use crate::tool::{Tool, ToolCall, ToolCategory, ToolMeta, ToolOutput};

/// Create or revise the session's mini-plan.
///
/// The current plan is held here (the tool instance is session-scoped) and
/// every change is published as [`ToolEvent::PlanUpdated`] so the agent
/// loop can mirror it into its state and unlock edit tools.
pub struct PlanTool {
    current: Mutex<Option<MiniPlan>>,
    events: mpsc::Sender<ToolEvent>,
}

impl PlanTool {
    pub fn new(events: mpsc::Sender<ToolEvent>) -> Self {
        Self {
            current: Mutex::new(None),
            events,
        }
    }

    fn parse_steps(raw: &Value) -> Result<Vec<PlanStep>, String> {
        let Some(arr) = raw.as_array() else {
            return Err("'steps' must be an array".into());
        };
        let mut steps = Vec::with_capacity(arr.len());
        for (i, item) in arr.iter().enumerate() {
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("step {} is missing 'description'", i + 1))?;
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("s{}", i + 1));
            let target_files = item
                .get("target_files")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            steps.push(PlanStep {
                id,
                description: description.to_string(),
                target_files,
                status: StepStatus::Pending,
            });
        }
        Ok(steps)
    }

    fn create(&self, call: &ToolCall) -> Result<MiniPlan, String> {
        let task = call
            .args
            .get("task")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'task'")?;
        let steps = Self::parse_steps(call.args.get("steps").ok_or("missing 'steps'")?)?;
        let mut plan = MiniPlan::new(task, steps)?;
        if let Some(areas) = call.args.get("target_areas").and_then(Value::as_array) {
            plan.target_areas = areas
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
        }
        if let Some(risks) = call.args.get("risks").and_then(Value::as_array) {
            plan.risks = risks
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
        }
        Ok(plan)
    }

    fn revise(&self, plan: &mut MiniPlan, updates: &Value) -> Result<(), String> {
        let Some(arr) = updates.as_array() else {
            return Err("'updates' must be an array of {id, status}".into());
        };
        for item in arr {
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .ok_or("update is missing 'id'")?;
            let status = match item.get("status").and_then(Value::as_str) {
                Some("completed") => StepStatus::Completed,
                Some("skipped") => StepStatus::Skipped,
                Some("pending") => StepStatus::Pending,
                other => return Err(format!("invalid status {other:?}")),
            };
            plan.update_step(id, status)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for PlanTool {
    fn name(&self) -> &str {
        "plan"
    }

    fn description(&self) -> &str {
        "Create or revise the execution plan for this task. A plan with \
         3-6 concrete steps is required before edit tools are available.\n\
         To create: pass task and steps [{description, target_files?}]. \
         To revise: pass updates [{id, status: completed|skipped|pending}]."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "One-line task summary" },
                "steps": {
                    "type": "array",
                    "description": format!("{MIN_PLAN_STEPS}-{MAX_PLAN_STEPS} ordered steps"),
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "description": { "type": "string" },
                            "target_files": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["description"]
                    }
                },
                "target_areas": { "type": "array", "items": { "type": "string" } },
                "risks": { "type": "array", "items": { "type": "string" } },
                "updates": {
                    "type": "array",
                    "description": "Step status updates for an existing plan",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "status": { "type": "string" }
                        },
                        "required": ["id", "status"]
                    }
                }
            }
        })
    }

    fn meta(&self) -> ToolMeta {
        ToolMeta::for_category(ToolCategory::Plan)
    }

    async fn execute(&self, call: &ToolCall, _cancel: &CancellationToken) -> ToolOutput {
        let result: Result<MiniPlan, String> = (|| {
            let mut guard = self.current.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(updates) = call.args.get("updates") {
                let plan = guard.as_mut().ok_or("no plan exists yet; create one first")?;
                self.revise(plan, updates)?;
                Ok(plan.clone())
            } else {
                let plan = self.create(call)?;
                *guard = Some(plan.clone());
                Ok(plan)
            }
        })();

        match result {
            Ok(plan) => {
                let rendered = plan.render();
                let _ = self.events.send(ToolEvent::PlanUpdated(plan)).await;
                ToolOutput::ok(&call.id, rendered)
            }
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
