// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Retry policies for LLM and tool calls.
//!
//! Delay = min(max_delay, initial · multiplier^attempt), plus 0-20 % jitter
//! when enabled.  A provider Retry-After hint overrides the computed delay,
//! still capped by max_delay.  Waits observe the cancellation token.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use dodo_model::ClientError;
use dodo_tools::{ToolCall, ToolOutput, ToolRegistry};

use crate::error::AgentError;
use crate::hooks::HookBus;

/// `Maybe`-class errors retry at most this often regardless of the policy.
pub const MAYBE_RETRY_CAP: u32 = 2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn llm_default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn tool_default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Single attempt, no retries.  Used for tools marked non-retryable.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    /// Tentatively retryable (deadline or context-length overflow); capped
    /// at [`MAYBE_RETRY_CAP`] attempts.
    Maybe,
    NonRetryable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Maybe => "maybe",
            ErrorClass::NonRetryable => "non_retryable",
        }
    }
}

/// Classify an LLM client error.
pub fn classify_llm_error(err: &ClientError) -> ErrorClass {
    let msg = err.to_string().to_lowercase();

    // Message patterns take precedence over status codes: a 429 caused by
    // quota exhaustion must not be retried, and a 400 caused by context
    // overflow is only tentatively retryable.
    if msg.contains("context length")
        || msg.contains("context_length")
        || msg.contains("maximum context")
        || msg.contains("deadline exceeded")
    {
        return ErrorClass::Maybe;
    }
    if msg.contains("quota") || msg.contains("billing") {
        return ErrorClass::NonRetryable;
    }
    if msg.contains("content_filter") || msg.contains("content filter") {
        return ErrorClass::NonRetryable;
    }

    match err {
        ClientError::Api { status, .. } => match status {
            429 | 408 => ErrorClass::Retryable,
            s if (500..=599).contains(s) => ErrorClass::Retryable,
            _ => ErrorClass::NonRetryable,
        },
        ClientError::Network(m) => {
            let m = m.to_lowercase();
            if m.contains("timed out")
                || m.contains("timeout")
                || m.contains("dns")
                || m.contains("connection reset")
                || m.contains("connection refused")
                || m.contains("broken pipe")
            {
                ErrorClass::Retryable
            } else {
                // Unknown network failures default to retryable.
                ErrorClass::Retryable
            }
        }
        ClientError::Decode(_) => ErrorClass::NonRetryable,
    }
}

/// Classify a tool failure message.  Stricter than the LLM side: only
/// clearly transient OS/network/database failures retry.
pub fn classify_tool_error(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();
    if msg.contains("not found")
        || msg.contains("no such file")
        || msg.contains("permission denied")
        || msg.contains("invalid")
        || msg.contains("missing required")
    {
        return ErrorClass::NonRetryable;
    }
    if msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("temporarily unavailable")
        || msg.contains("resource busy")
        || msg.contains("database is locked")
        || msg.contains("broken pipe")
    {
        return ErrorClass::Retryable;
    }
    ErrorClass::NonRetryable
}

/// Compute the wait before retry number `attempt` (0-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(policy.max_delay);
    }
    let base = policy.initial_delay.as_millis() as f64 * policy.multiplier.powi(attempt as i32);
    let mut millis = base.min(policy.max_delay.as_millis() as f64);
    if policy.jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.0..0.2);
        millis += millis * factor;
        millis = millis.min(policy.max_delay.as_millis() as f64);
    }
    Duration::from_millis(millis as u64)
}

/// Run an LLM operation under the retry policy.
///
/// `attempts_out` receives the number of retries performed (for the
/// agent's retry counter).  Cancellation during a wait aborts immediately.
pub async fn retry_llm<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    hooks: &HookBus,
    attempts_out: &mut u32,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut last_class = ErrorClass::Retryable;
    let mut last_message = String::new();

    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify_llm_error(&err);
                last_message = err.to_string();
                last_class = class;
                match class {
                    ErrorClass::NonRetryable => {
                        return Err(AgentError::Provider(last_message));
                    }
                    ErrorClass::Maybe if attempt + 1 > MAYBE_RETRY_CAP => break,
                    _ => {}
                }
                if attempt + 1 >= policy.max_attempts {
                    break;
                }
                let delay = backoff_delay(policy, attempt, err.retry_after());
                hooks.on_retry_attempt("llm_call", attempt + 1, delay);
                *attempts_out += 1;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    let attempts = *attempts_out + 1;
    hooks.on_retry_exhausted("llm_call", attempts);
    Err(AgentError::RetryExhausted {
        attempts,
        class: last_class.as_str(),
        message: last_message,
    })
}

/// Execute a tool call under the tool retry policy.
///
/// Failures never escalate to hard errors here; the final (possibly
/// failed) output flows back into the transcript as an error tool message
/// so the model can self-correct.
pub async fn retry_tool(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    hooks: &HookBus,
    registry: &ToolRegistry,
    call: &ToolCall,
) -> ToolOutput {
    let mut attempt = 0u32;
    loop {
        let output = registry.execute(call, cancel).await;
        if !output.is_error || cancel.is_cancelled() {
            return output;
        }
        if classify_tool_error(&output.content) != ErrorClass::Retryable {
            return output;
        }
        attempt += 1;
        if attempt >= policy.max_attempts {
            hooks.on_retry_exhausted(&format!("tool:{}", call.name), attempt);
            return output;
        }
        let delay = backoff_delay(policy, attempt - 1, None);
        hooks.on_retry_attempt(&format!("tool:{}", call.name), attempt, delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return output,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
