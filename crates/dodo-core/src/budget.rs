// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use dodo_model::Message;

use crate::error::AgentError;

/// Fixed per-message overhead (role framing, separators) in tokens.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token estimation capability.  The default is a heuristic; hosts can
/// plug a real tokenizer for their model family.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str, model: &str) -> usize;
}

/// `chars/4 + whitespace/6`, minimum 1 for non-empty text.
///
/// Whitespace-heavy text (code) tokenizes worse than prose, which the
/// second term approximates.
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str, _model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count();
        let whitespace = text.chars().filter(|c| c.is_whitespace()).count();
        (chars / 4 + whitespace / 6).max(1)
    }
}

/// Estimated cost of one message: overhead + role + content, plus each
/// tool call's name and serialized arguments, plus the answered call id.
pub fn message_tokens(tokenizer: &dyn Tokenizer, model: &str, msg: &Message) -> usize {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS;
    tokens += tokenizer.count(role_str(msg), model);
    tokens += tokenizer.count(&msg.content, model);
    for call in &msg.tool_calls {
        tokens += tokenizer.count(&call.name, model);
        tokens += tokenizer.count(&call.args_json(), model);
    }
    if let Some(id) = &msg.tool_call_id {
        tokens += tokenizer.count(id, model);
    }
    tokens
}

fn role_str(msg: &Message) -> &'static str {
    match msg.role {
        dodo_model::Role::System => "system",
        dodo_model::Role::User => "user",
        dodo_model::Role::Assistant => "assistant",
        dodo_model::Role::Tool => "tool",
    }
}

pub fn transcript_tokens(tokenizer: &dyn Tokenizer, model: &str, msgs: &[Message]) -> usize {
    msgs.iter()
        .map(|m| message_tokens(tokenizer, model, m))
        .sum()
}

/// Token budget for one agent.
///
/// `soft_limit` is advisory (warning event), `hard_limit` is enforced via
/// compression, `reserve` is held back for the model's response.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub reserve: usize,
    pub max_passes: usize,
}

impl BudgetConfig {
    pub fn new(
        soft_limit: usize,
        hard_limit: usize,
        reserve: usize,
        max_passes: usize,
    ) -> Result<Self, AgentError> {
        if hard_limit <= reserve {
            return Err(AgentError::Validation(format!(
                "invalid budget: hard_limit {hard_limit} must exceed reserve {reserve}"
            )));
        }
        Ok(Self {
            soft_limit,
            hard_limit,
            reserve,
            max_passes,
        })
    }

    /// The enforced ceiling: `hard_limit - reserve`.
    pub fn effective_hard(&self) -> usize {
        self.hard_limit - self.reserve
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        // Conservative default; per-model presets override at construction.
        Self {
            soft_limit: 60_000,
            hard_limit: 90_000,
            reserve: 4_096,
            max_passes: 4,
        }
    }
}

/// Substrings that identify long-context model families.
const LONG_CONTEXT_MARKERS: &[&str] = &[
    "claude", "opus", "sonnet", "haiku", "gemini", "gpt-4.1", "gpt-5", "200k",
];

/// Budget preset by model-name substring.  Applied at agent construction
/// unless the caller overrides.
pub fn budget_for_model(model: &str) -> BudgetConfig {
    let lower = model.to_lowercase();
    if LONG_CONTEXT_MARKERS.iter().any(|m| lower.contains(m)) {
        BudgetConfig {
            soft_limit: 150_000,
            hard_limit: 190_000,
            reserve: 4_096,
            max_passes: 4,
        }
    } else {
        BudgetConfig::default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dodo_model::ToolCallRequest;
    use serde_json::json;

    const M: &str = "test-model";

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(HeuristicTokenizer.count("", M), 0);
    }

    #[test]
    fn short_text_counts_at_least_one() {
        assert_eq!(HeuristicTokenizer.count("a", M), 1);
    }

    #[test]
    fn heuristic_matches_formula() {
        // 24 chars, 3 whitespace: 24/4 + 3/6 = 6 + 0 = 6
        let text = "abcde fghij klmno pqrstu";
        assert_eq!(text.chars().count(), 24);
        assert_eq!(HeuristicTokenizer.count(text, M), 6);
    }

    #[test]
    fn whitespace_heavy_text_costs_more() {
        let dense = "a".repeat(120);
        let spaced = "a ".repeat(60);
        assert!(
            HeuristicTokenizer.count(&spaced, M) > HeuristicTokenizer.count(&dense, M)
        );
    }

    #[test]
    fn message_cost_includes_overhead() {
        let msg = Message::user("12345678");
        // 4 overhead + 1 (role "user") + 2 (content)
        assert_eq!(message_tokens(&HeuristicTokenizer, M, &msg), 7);
    }

    #[test]
    fn tool_call_arguments_contribute() {
        let mut args = serde_json::Map::new();
        args.insert("query".into(), json!("a longer argument string here"));
        let bare = Message::assistant("x");
        let with_call = Message::assistant_with_calls(
            "x",
            vec![ToolCallRequest::new("c1", "search_code", args)],
        );
        assert!(
            message_tokens(&HeuristicTokenizer, M, &with_call)
                > message_tokens(&HeuristicTokenizer, M, &bare)
        );
    }

    #[test]
    fn transcript_tokens_sums_messages() {
        let msgs = vec![Message::user("hello there"), Message::assistant("hi")];
        let total = transcript_tokens(&HeuristicTokenizer, M, &msgs);
        let by_hand = message_tokens(&HeuristicTokenizer, M, &msgs[0])
            + message_tokens(&HeuristicTokenizer, M, &msgs[1]);
        assert_eq!(total, by_hand);
    }

    #[test]
    fn budget_requires_hard_above_reserve() {
        assert!(BudgetConfig::new(500, 1000, 200, 4).is_ok());
        assert!(BudgetConfig::new(500, 200, 200, 4).is_err());
        assert!(BudgetConfig::new(500, 100, 200, 4).is_err());
    }

    #[test]
    fn effective_hard_subtracts_reserve() {
        let b = BudgetConfig::new(500, 1000, 200, 4).unwrap();
        assert_eq!(b.effective_hard(), 800);
    }

    #[test]
    fn long_context_models_get_large_presets() {
        for name in ["claude-opus-4-5", "gemini-2.5-pro", "gpt-4.1-mini"] {
            let b = budget_for_model(name);
            assert_eq!(b.soft_limit, 150_000, "{name}");
            assert_eq!(b.hard_limit, 190_000, "{name}");
        }
    }

    #[test]
    fn unknown_models_get_conservative_preset() {
        let b = budget_for_model("some-local-7b");
        assert_eq!(b.soft_limit, 60_000);
        assert_eq!(b.hard_limit, 90_000);
    }
}
