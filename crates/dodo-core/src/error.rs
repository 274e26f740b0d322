// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use crate::state::Phase;

/// Where in the scheduler an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    LlmCall,
    ToolExecution,
    Compression,
    MessagePreparation,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::LlmCall => "llm_call",
            Operation::ToolExecution => "tool_execution",
            Operation::Compression => "compression",
            Operation::MessagePreparation => "message_preparation",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution context attached to every externally surfaced error.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub step: u32,
    pub phase: Phase,
    pub operation: Operation,
    pub tool: Option<String>,
}

impl ExecContext {
    pub fn new(step: u32, phase: Phase, operation: Operation) -> Self {
        Self {
            step,
            phase,
            operation,
            tool: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}

impl std::fmt::Display for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step {} ({}, {})",
            self.step, self.phase, self.operation
        )?;
        if let Some(tool) = &self.tool {
            write!(f, " tool {tool}")?;
        }
        Ok(())
    }
}

/// A threshold that stopped the loop gracefully.  Distinct from hard
/// failures so clients show advisory messaging instead of a crash state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftCapKind {
    ToolCalls { count: u32, limit: u32 },
    BuildFailures { count: u32, limit: u32 },
    SearchReplaceFailures { file: String, count: u32, limit: u32 },
}

impl SoftCapKind {
    /// Advisory text forwarded to the client.
    pub fn guidance(&self) -> String {
        match self {
            SoftCapKind::ToolCalls { count, limit } => format!(
                "The run used {count} tool calls (limit {limit}). Consider narrowing \
                 the task or continuing in a fresh message."
            ),
            SoftCapKind::BuildFailures { count, limit } => format!(
                "Build or test commands failed {count} times (limit {limit}). Review \
                 the errors before letting the agent continue."
            ),
            SoftCapKind::SearchReplaceFailures { file, count, limit } => format!(
                "Edits to {file} failed {count} times (limit {limit}). The file may \
                 have drifted from what the agent expects; re-read it before retrying."
            ),
        }
    }
}

impl std::fmt::Display for SoftCapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SoftCapKind::ToolCalls { count, limit } => {
                write!(f, "tool calls {count}/{limit}")
            }
            SoftCapKind::BuildFailures { count, limit } => {
                write!(f, "build failures {count}/{limit}")
            }
            SoftCapKind::SearchReplaceFailures { file, count, limit } => {
                write!(f, "search-replace failures on {file} {count}/{limit}")
            }
        }
    }
}

/// Canonical error kinds of the runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Bad arguments or schema failures.  Non-retryable; normally kept in
    /// the loop as a tool result rather than propagated.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network, rate limits, 5xx, timeouts.
    #[error("transient error: {0}")]
    Transient(String),

    /// Non-retryable provider failure (auth, malformed request, refusal).
    #[error("provider error: {0}")]
    Provider(String),

    /// The prompt cannot fit under the hard token limit.
    #[error("token budget exceeded: {required} tokens required, limit {limit} \
             ({attempts} compression strategies attempted)")]
    Budget {
        required: usize,
        limit: usize,
        attempts: usize,
    },

    /// The loop stopped at an advisory threshold.
    #[error("soft cap reached: {kind}")]
    SoftCap { kind: SoftCapKind },

    /// The run was cancelled by the client.
    #[error("run cancelled")]
    Cancelled,

    /// The retry policy gave up.  `class` is "maybe" when the error class
    /// was only tentatively retryable.
    #[error("retries exhausted after {attempts} attempts (class: {class}): {message}")]
    RetryExhausted {
        attempts: u32,
        class: &'static str,
        message: String,
    },

    /// An error wrapped with its execution context.
    #[error("{context}: {source}")]
    Contextual {
        context: ExecContext,
        #[source]
        source: Box<AgentError>,
    },
}

impl AgentError {
    pub fn with_context(self, context: ExecContext) -> Self {
        AgentError::Contextual {
            context,
            source: Box::new(self),
        }
    }

    /// Unwrap context layers down to the underlying kind.
    pub fn root(&self) -> &AgentError {
        match self {
            AgentError::Contextual { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), AgentError::Cancelled)
    }

    pub fn is_soft_cap(&self) -> bool {
        matches!(self.root(), AgentError::SoftCap { .. })
    }

    pub fn is_budget(&self) -> bool {
        matches!(self.root(), AgentError::Budget { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_strings_are_snake_case() {
        assert_eq!(Operation::LlmCall.as_str(), "llm_call");
        assert_eq!(Operation::MessagePreparation.as_str(), "message_preparation");
    }

    #[test]
    fn context_display_includes_step_phase_operation() {
        let ctx = ExecContext::new(3, Phase::Edit, Operation::ToolExecution).with_tool("write");
        let s = ctx.to_string();
        assert!(s.contains("step 3"));
        assert!(s.contains("edit"));
        assert!(s.contains("tool_execution"));
        assert!(s.contains("write"));
    }

    #[test]
    fn root_unwraps_nested_context() {
        let err = AgentError::Cancelled
            .with_context(ExecContext::new(1, Phase::Explore, Operation::LlmCall))
            .with_context(ExecContext::new(1, Phase::Explore, Operation::ToolExecution));
        assert!(err.is_cancelled());
        assert!(matches!(err.root(), AgentError::Cancelled));
    }

    #[test]
    fn budget_error_reports_numbers() {
        let err = AgentError::Budget {
            required: 3000,
            limit: 800,
            attempts: 4,
        };
        let s = err.to_string();
        assert!(s.contains("3000"));
        assert!(s.contains("800"));
        assert!(s.contains("4"));
        assert!(err.is_budget());
    }

    #[test]
    fn soft_cap_guidance_names_the_threshold() {
        let kind = SoftCapKind::SearchReplaceFailures {
            file: "src/main.rs".into(),
            count: 3,
            limit: 3,
        };
        assert!(kind.guidance().contains("src/main.rs"));
        let err = AgentError::SoftCap { kind };
        assert!(err.is_soft_cap());
    }
}
