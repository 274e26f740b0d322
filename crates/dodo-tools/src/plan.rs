// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum and maximum steps a mini-plan may carry.
pub const MIN_PLAN_STEPS: usize = 3;
pub const MAX_PLAN_STEPS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    pub status: StepStatus,
}

/// The session's concrete execution plan, required before edit tools are
/// unlocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniPlan {
    pub task: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub target_areas: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered log of revisions, newest last.
    #[serde(default)]
    pub revisions: Vec<String>,
}

impl MiniPlan {
    pub fn new(task: impl Into<String>, steps: Vec<PlanStep>) -> Result<Self, String> {
        let now = Utc::now();
        let plan = Self {
            task: task.into(),
            steps,
            target_areas: Vec::new(),
            risks: Vec::new(),
            created_at: now,
            updated_at: now,
            revisions: vec!["created".into()],
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Step count bounds and id uniqueness.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.len() < MIN_PLAN_STEPS || self.steps.len() > MAX_PLAN_STEPS {
            return Err(format!(
                "a plan needs {MIN_PLAN_STEPS}-{MAX_PLAN_STEPS} steps, got {}",
                self.steps.len()
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(format!("duplicate step id '{}'", step.id));
            }
        }
        Ok(())
    }

    /// Update one step's status, recording the revision.  Unknown ids are
    /// an error so the model learns the real step list.
    pub fn update_step(&mut self, step_id: &str, status: StepStatus) -> Result<(), String> {
        let step = match self.steps.iter_mut().find(|s| s.id == step_id) {
            Some(step) => step,
            None => {
                let ids: Vec<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
                return Err(format!(
                    "unknown step id '{step_id}'; known steps: {}",
                    ids.join(", ")
                ));
            }
        };
        step.status = status;
        self.updated_at = Utc::now();
        self.revisions
            .push(format!("step {step_id} -> {}", serde_json::to_string(&status).unwrap_or_default()));
        Ok(())
    }

    /// Human-readable rendering used as tool output and in status events.
    pub fn render(&self) -> String {
        let mut out = format!("Plan: {}\n", self.task);
        for step in &self.steps {
            let mark = match step.status {
                StepStatus::Pending => " ",
                StepStatus::Completed => "x",
                StepStatus::Skipped => "-",
            };
            out.push_str(&format!("  [{mark}] {}: {}", step.id, step.description));
            if !step.target_files.is_empty() {
                out.push_str(&format!(" ({})", step.target_files.join(", ")));
            }
            out.push('\n');
        }
        if !self.risks.is_empty() {
            out.push_str(&format!("Risks: {}\n", self.risks.join("; ")));
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(n: usize) -> Vec<PlanStep> {
        (1..=n)
            .map(|i| PlanStep {
                id: format!("s{i}"),
                description: format!("step {i}"),
                target_files: vec![],
                status: StepStatus::Pending,
            })
            .collect()
    }

    #[test]
    fn plan_accepts_three_to_six_steps() {
        assert!(MiniPlan::new("t", steps(3)).is_ok());
        assert!(MiniPlan::new("t", steps(6)).is_ok());
    }

    #[test]
    fn plan_rejects_too_few_or_too_many_steps() {
        assert!(MiniPlan::new("t", steps(2)).is_err());
        assert!(MiniPlan::new("t", steps(7)).is_err());
    }

    #[test]
    fn plan_rejects_duplicate_step_ids() {
        let mut s = steps(3);
        s[2].id = "s1".into();
        assert!(MiniPlan::new("t", s).is_err());
    }

    #[test]
    fn update_step_changes_status_and_logs_revision() {
        let mut plan = MiniPlan::new("t", steps(3)).unwrap();
        plan.update_step("s2", StepStatus::Completed).unwrap();
        assert_eq!(plan.steps[1].status, StepStatus::Completed);
        assert_eq!(plan.revisions.len(), 2);
        assert!(plan.revisions[1].contains("s2"));
    }

    #[test]
    fn update_unknown_step_lists_known_ids() {
        let mut plan = MiniPlan::new("t", steps(3)).unwrap();
        let err = plan.update_step("nope", StepStatus::Skipped).unwrap_err();
        assert!(err.contains("s1, s2, s3"));
    }

    #[test]
    fn render_marks_statuses() {
        let mut plan = MiniPlan::new("fix the bug", steps(3)).unwrap();
        plan.update_step("s1", StepStatus::Completed).unwrap();
        plan.update_step("s2", StepStatus::Skipped).unwrap();
        let text = plan.render();
        assert!(text.contains("[x] s1"));
        assert!(text.contains("[-] s2"));
        assert!(text.contains("[ ] s3"));
    }

    #[test]
    fn plan_serialises_round_trip() {
        let plan = MiniPlan::new("t", steps(4)).unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let back: MiniPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps.len(), 4);
        assert_eq!(back.revisions, vec!["created".to_string()]);
    }
}
