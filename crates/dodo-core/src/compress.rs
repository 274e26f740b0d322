// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History processors and budget-driven compression.
//!
//! Every prepare pass runs the processors in order (keep-recent-tool-cycles,
//! summarize-older, keep-last-N, truncate-long-tools), then enforces the
//! token budget with escalating strategies.  Two invariants hold across
//! all of it: the leading system message and the first user message always
//! survive, and no tool message is left referencing a call id that is not
//! present on a retained assistant message.

use std::collections::HashSet;
use std::sync::Arc;

use dodo_model::{CompletionRequest, LlmClient, Message, Role};

use crate::budget::{transcript_tokens, BudgetConfig, Tokenizer};
use crate::error::AgentError;
use crate::hooks::HookBus;

// ─── Tuning constants ─────────────────────────────────────────────────────────

/// Tool cycles (assistant call + results) kept verbatim by the processor.
const KEEP_RECENT_TOOL_CYCLES: usize = 4;
/// Processor-stage summarization kicks in above this many messages.
const SUMMARIZE_AFTER_MESSAGES: usize = 40;
/// Messages preserved verbatim by processor-stage summarization.
const SUMMARIZE_PROCESSOR_KEEP: usize = 30;
/// Hard cap on message count after the keep-last-N processor.
const KEEP_LAST_MESSAGES: usize = 80;
/// Processor-stage tool truncation threshold (characters).
const PREPARE_TRUNCATE_CHARS: usize = 8_000;

/// Strategy-stage tool truncation threshold (characters).
const STRATEGY_TRUNCATE_CHARS: usize = 2_000;
/// Recent tail preserved by the summarize strategy.
const SUMMARIZE_KEEP_RECENT: usize = 12;
/// Recent tail preserved by the aggressive summarize strategy.
const AGGRESSIVE_KEEP_RECENT: usize = 4;
/// Recent tail preserved by the remove strategy.
const REMOVE_KEEP_RECENT: usize = 6;

const ELIDED_TOOL_NOTE: &str = "[older tool output elided]";

const SUMMARIZE_PROMPT: &str = "Summarise the following conversation history into a dense \
     technical summary. Preserve every file path, symbol name, error message, decision, \
     and TODO item that later work may depend on. The summary replaces the original \
     messages, so include everything that still matters and nothing else.";

const AGGRESSIVE_SUMMARIZE_PROMPT: &str = "Compress the following conversation history \
     into the shortest summary that still lists: the task, every file path touched, \
     key symbol names, unresolved errors, and open TODO items. Drop everything else.";

// ─── Strategies ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Truncate,
    Summarize,
    AggressiveSummarize,
    Remove,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Truncate => "truncate",
            Strategy::Summarize => "summarize",
            Strategy::AggressiveSummarize => "aggressive_summarize",
            Strategy::Remove => "remove",
        }
    }

    const ORDER: [Strategy; 4] = [
        Strategy::Truncate,
        Strategy::Summarize,
        Strategy::AggressiveSummarize,
        Strategy::Remove,
    ];
}

// ─── Processors ───────────────────────────────────────────────────────────────

/// Replace the middle of oversized tool messages with "…", keeping head
/// and tail halves.
pub fn truncate_long_tools(msgs: &mut [Message], threshold_chars: usize) {
    for msg in msgs.iter_mut() {
        if msg.role != Role::Tool || msg.content.len() <= threshold_chars {
            continue;
        }
        let half = threshold_chars / 2;
        // Cut on char boundaries; byte slicing may split a code point.
        let head: String = msg.content.chars().take(half).collect();
        let tail_chars: Vec<char> = msg.content.chars().rev().take(half).collect();
        let tail: String = tail_chars.into_iter().rev().collect();
        msg.content = format!("{head}\n…\n{tail}");
    }
}

/// Elide tool outputs that belong to all but the last `cycles` tool-call
/// rounds.  Message structure and call ids stay intact.
pub fn keep_recent_tool_cycles(msgs: &mut [Message], cycles: usize) {
    let call_rounds: Vec<usize> = msgs
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Assistant && !m.tool_calls.is_empty())
        .map(|(i, _)| i)
        .collect();
    if call_rounds.len() <= cycles {
        return;
    }
    let protected: HashSet<String> = call_rounds[call_rounds.len() - cycles..]
        .iter()
        .flat_map(|&i| msgs[i].tool_calls.iter().map(|tc| tc.id.clone()))
        .collect();
    for msg in msgs.iter_mut() {
        if msg.role != Role::Tool {
            continue;
        }
        let keep = msg
            .tool_call_id
            .as_deref()
            .map(|id| protected.contains(id))
            .unwrap_or(false);
        if !keep && msg.content != ELIDED_TOOL_NOTE {
            msg.content = ELIDED_TOOL_NOTE.to_string();
        }
    }
}

/// Index of the first user message (the task anchor), if any.
fn first_user_index(msgs: &[Message]) -> Option<usize> {
    msgs.iter().position(|m| m.role == Role::User)
}

/// Split a transcript into (anchors, rest): the leading system message and
/// the first user message versus everything after them.
fn split_anchors(msgs: &[Message]) -> (Vec<Message>, Vec<Message>) {
    let mut anchors = Vec::new();
    let mut rest = Vec::new();
    let user_idx = first_user_index(msgs);
    for (i, msg) in msgs.iter().enumerate() {
        let is_anchor = (i == 0 && msg.role == Role::System) || Some(i) == user_idx;
        if is_anchor {
            anchors.push(msg.clone());
        } else {
            rest.push(msg.clone());
        }
    }
    (anchors, rest)
}

/// Move `split` backward until `rest[split..]` starts at a clean turn
/// boundary: a tail must not begin with a tool message whose call lives in
/// the summarised region.
fn align_to_turn_boundary(rest: &[Message], mut split: usize) -> usize {
    while split > 0 && split < rest.len() && rest[split].role == Role::Tool {
        split -= 1;
    }
    split
}

/// Keep the anchors plus the last `n` messages of the rest.
pub fn keep_last_n(msgs: &mut Vec<Message>, n: usize) {
    let (anchors, rest) = split_anchors(msgs);
    if rest.len() <= n {
        return;
    }
    let split = align_to_turn_boundary(&rest, rest.len() - n);
    let mut out = anchors;
    out.extend_from_slice(&rest[split..]);
    *msgs = out;
}

fn serialize_history(msgs: &[Message]) -> String {
    msgs.iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let mut line = format!("{role}: {}", m.content);
            for call in &m.tool_calls {
                line.push_str(&format!(
                    "\n[tool_call: {}({})]",
                    call.name,
                    call.args_json()
                ));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Ask the model to summarize `region`.  `None` on failure or an empty
/// reply; the caller treats that as the strategy being exhausted.
async fn summarize_region(
    client: &Arc<dyn LlmClient>,
    prompt: &str,
    region: &[Message],
) -> Option<String> {
    let request = CompletionRequest {
        messages: vec![Message::user(format!(
            "{prompt}\n\n---\n\n{}",
            serialize_history(region)
        ))],
        tools: Vec::new(),
        stream: false,
    };
    match client.complete(request).await {
        Ok(c) if !c.content.trim().is_empty() => Some(c.content),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("summarization call failed: {e}");
            None
        }
    }
}

/// Summarize everything before the last `keep_n` messages into a single
/// system message placed after the anchors.
async fn summarize_strategy(
    msgs: &[Message],
    keep_n: usize,
    prompt: &str,
    client: Option<&Arc<dyn LlmClient>>,
    hooks: &HookBus,
) -> Option<Vec<Message>> {
    let client = client?;
    let (anchors, rest) = split_anchors(msgs);
    if rest.len() <= keep_n {
        return None;
    }
    let split = align_to_turn_boundary(&rest, rest.len() - keep_n);
    if split == 0 {
        return None;
    }
    let summary = summarize_region(client, prompt, &rest[..split]).await?;
    hooks.on_summarize(&summary);

    let mut out = anchors;
    out.push(Message::system(format!(
        "Summary of earlier conversation:\n{summary}"
    )));
    out.extend_from_slice(&rest[split..]);
    Some(out)
}

/// Drop everything but the anchors and the most recent tail.
fn remove_strategy(msgs: &[Message], keep_n: usize) -> Vec<Message> {
    let (anchors, rest) = split_anchors(msgs);
    let split = if rest.len() <= keep_n {
        0
    } else {
        align_to_turn_boundary(&rest, rest.len() - keep_n)
    };
    let mut out = anchors;
    out.extend_from_slice(&rest[split..]);
    out
}

// ─── Budget enforcement ───────────────────────────────────────────────────────

/// Apply strategies in escalating order, each at most once, until the
/// transcript fits `budget.effective_hard()` or every strategy is
/// exhausted.  A strategy counts as exhausted when it fails to strictly
/// decrease the token count.
pub async fn enforce_budget(
    mut msgs: Vec<Message>,
    budget: &BudgetConfig,
    tokenizer: &dyn Tokenizer,
    model: &str,
    client: Option<&Arc<dyn LlmClient>>,
    hooks: &HookBus,
) -> Result<Vec<Message>, AgentError> {
    let mut tokens = transcript_tokens(tokenizer, model, &msgs);
    if tokens > budget.soft_limit {
        hooks.on_budget_exceeded(tokens, budget.soft_limit);
    }
    let limit = budget.effective_hard();
    if tokens <= limit {
        return Ok(msgs);
    }

    let mut attempts = 0usize;
    for strategy in Strategy::ORDER {
        if attempts >= budget.max_passes {
            break;
        }
        attempts += 1;

        let candidate: Option<Vec<Message>> = match strategy {
            Strategy::Truncate => {
                let mut c = msgs.clone();
                truncate_long_tools(&mut c, STRATEGY_TRUNCATE_CHARS);
                Some(c)
            }
            Strategy::Summarize => {
                summarize_strategy(&msgs, SUMMARIZE_KEEP_RECENT, SUMMARIZE_PROMPT, client, hooks)
                    .await
            }
            Strategy::AggressiveSummarize => {
                summarize_strategy(
                    &msgs,
                    AGGRESSIVE_KEEP_RECENT,
                    AGGRESSIVE_SUMMARIZE_PROMPT,
                    client,
                    hooks,
                )
                .await
            }
            Strategy::Remove => Some(remove_strategy(&msgs, REMOVE_KEEP_RECENT)),
        };

        let Some(candidate) = candidate else {
            continue; // exhausted without producing a candidate
        };
        let candidate_tokens = transcript_tokens(tokenizer, model, &candidate);
        if candidate_tokens >= tokens {
            continue; // exhausted: no strict decrease
        }
        hooks.on_budget_compression(strategy.as_str(), tokens, candidate_tokens);
        msgs = candidate;
        tokens = candidate_tokens;
        if tokens <= limit {
            return Ok(msgs);
        }
    }

    Err(AgentError::Budget {
        required: tokens,
        limit,
        attempts,
    })
}

/// Build the message list for one model call: clone of the transcript run
/// through the processors, then budget enforcement.
pub async fn prepare_messages(
    transcript: &[Message],
    compression_enabled: bool,
    budget: &BudgetConfig,
    tokenizer: &dyn Tokenizer,
    model: &str,
    client: Option<&Arc<dyn LlmClient>>,
    hooks: &HookBus,
) -> Result<Vec<Message>, AgentError> {
    let mut msgs = transcript.to_vec();
    if compression_enabled {
        keep_recent_tool_cycles(&mut msgs, KEEP_RECENT_TOOL_CYCLES);
        if msgs.len() > SUMMARIZE_AFTER_MESSAGES {
            if let Some(summarized) =
                summarize_strategy(&msgs, SUMMARIZE_PROCESSOR_KEEP, SUMMARIZE_PROMPT, client, hooks)
                    .await
            {
                msgs = summarized;
            }
        }
        keep_last_n(&mut msgs, KEEP_LAST_MESSAGES);
        truncate_long_tools(&mut msgs, PREPARE_TRUNCATE_CHARS);
    }
    enforce_budget(msgs, budget, tokenizer, model, client, hooks).await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use dodo_model::{mock::ScriptedClient, ToolCallRequest};

    use super::*;
    use crate::budget::HeuristicTokenizer;
    use crate::hooks::Hook;

    const M: &str = "test-model";

    fn tool_round(id: &str, output: &str) -> Vec<Message> {
        vec![
            Message::assistant_with_calls(
                "",
                vec![ToolCallRequest::new(id, "search_code", serde_json::Map::new())],
            ),
            Message::tool_result(id, output),
        ]
    }

    fn base_transcript() -> Vec<Message> {
        let mut msgs = vec![Message::system("You are dodo."), Message::user("fix the bug")];
        for i in 0..6 {
            msgs.extend(tool_round(&format!("c{i}"), &format!("output {i}")));
        }
        msgs
    }

    struct CompressionRecorder {
        log: Mutex<Vec<(String, usize, usize)>>,
    }

    impl Hook for CompressionRecorder {
        fn on_budget_compression(&self, strategy: &str, before: usize, after: usize) {
            self.log.lock().unwrap().push((strategy.into(), before, after));
        }
    }

    // ── Processors ────────────────────────────────────────────────────────────

    #[test]
    fn truncate_keeps_head_and_tail() {
        let mut msgs = vec![Message::tool_result("c1", "A".repeat(500) + &"B".repeat(500))];
        truncate_long_tools(&mut msgs, 100);
        let content = &msgs[0].content;
        assert!(content.contains('…'));
        assert!(content.starts_with('A'));
        assert!(content.ends_with('B'));
        assert!(content.len() < 200);
    }

    #[test]
    fn truncate_leaves_short_messages_alone() {
        let mut msgs = vec![Message::tool_result("c1", "short output")];
        truncate_long_tools(&mut msgs, 100);
        assert_eq!(msgs[0].content, "short output");
    }

    #[test]
    fn truncate_ignores_non_tool_messages() {
        let long = "x".repeat(1000);
        let mut msgs = vec![Message::user(long.clone())];
        truncate_long_tools(&mut msgs, 100);
        assert_eq!(msgs[0].content, long);
    }

    #[test]
    fn recent_tool_cycles_survive_elision() {
        let mut msgs = base_transcript();
        keep_recent_tool_cycles(&mut msgs, 2);
        // First four rounds elided, last two intact.
        let tool_contents: Vec<&str> = msgs
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(tool_contents.len(), 6);
        assert!(tool_contents[..4].iter().all(|c| *c == ELIDED_TOOL_NOTE));
        assert_eq!(tool_contents[4], "output 4");
        assert_eq!(tool_contents[5], "output 5");
    }

    #[test]
    fn keep_recent_cycles_noop_when_few_rounds() {
        let mut msgs = base_transcript();
        let before = msgs.clone();
        keep_recent_tool_cycles(&mut msgs, 10);
        let contents: Vec<&String> = msgs.iter().map(|m| &m.content).collect();
        let expected: Vec<&String> = before.iter().map(|m| &m.content).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn keep_last_n_preserves_anchors() {
        let mut msgs = base_transcript();
        keep_last_n(&mut msgs, 3);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].content, "fix the bug");
        assert!(msgs.len() <= 2 + 4); // anchors + tail (boundary-aligned)
    }

    #[test]
    fn keep_last_n_never_orphans_tool_messages() {
        let mut msgs = base_transcript();
        keep_last_n(&mut msgs, 1);
        // Collect retained call ids on assistant messages.
        let ids: HashSet<String> = msgs
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|tc| tc.id.clone()))
            .collect();
        for msg in msgs.iter().filter(|m| m.role == Role::Tool) {
            let id = msg.tool_call_id.as_deref().unwrap();
            assert!(ids.contains(id), "tool message {id} lost its assistant call");
        }
    }

    // ── Budget enforcement ────────────────────────────────────────────────────

    #[tokio::test]
    async fn under_limit_transcript_is_untouched() {
        let msgs = base_transcript();
        let budget = BudgetConfig::new(50_000, 90_000, 200, 4).unwrap();
        let out = enforce_budget(msgs.clone(), &budget, &HeuristicTokenizer, M, None, &HookBus::new())
            .await
            .unwrap();
        assert_eq!(out.len(), msgs.len());
    }

    #[tokio::test]
    async fn oversized_tool_message_is_truncated_to_fit() {
        // Scenario: hard=1000, reserve=200, one 10 KB tool message.
        let mut msgs = vec![Message::system("sys"), Message::user("task")];
        msgs.extend(tool_round("big", &"line of output\n".repeat(700))); // ~10 KB
        let budget = BudgetConfig::new(500, 1000, 200, 4).unwrap();

        let recorder = Arc::new(CompressionRecorder {
            log: Mutex::new(Vec::new()),
        });
        let mut hooks = HookBus::new();
        hooks.add(Arc::clone(&recorder) as Arc<dyn Hook>);

        let out = enforce_budget(msgs, &budget, &HeuristicTokenizer, M, None, &hooks)
            .await
            .unwrap();
        let tokens = transcript_tokens(&HeuristicTokenizer, M, &out);
        assert!(tokens <= 800, "got {tokens} tokens");

        let log = recorder.log.lock().unwrap();
        assert_eq!(log[0].0, "truncate");
        assert!(log[0].1 > log[0].2, "tokens must strictly decrease");
    }

    #[tokio::test]
    async fn summarize_strategy_replaces_old_region() {
        // Transcript too big for truncate alone: many medium messages.
        let mut msgs = vec![Message::system("sys"), Message::user("task")];
        for i in 0..30 {
            msgs.push(Message::assistant(format!("thought {i} {}", "pad ".repeat(50))));
        }
        let budget = BudgetConfig::new(100, 1200, 200, 4).unwrap();
        let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::always_text("condensed summary"));

        let out = enforce_budget(
            msgs,
            &budget,
            &HeuristicTokenizer,
            M,
            Some(&client),
            &HookBus::new(),
        )
        .await
        .unwrap();

        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].content, "task");
        assert!(out
            .iter()
            .any(|m| m.content.contains("condensed summary")));
        assert!(transcript_tokens(&HeuristicTokenizer, M, &out) <= 1000);
    }

    #[tokio::test]
    async fn anchors_survive_every_strategy() {
        let mut msgs = vec![Message::system("anchor-sys"), Message::user("anchor-user")];
        for i in 0..40 {
            msgs.push(Message::assistant(format!("msg {i} {}", "word ".repeat(100))));
        }
        // No client: summarize strategies are exhausted, remove must fire.
        let budget = BudgetConfig::new(100, 1200, 100, 4).unwrap();
        let out = enforce_budget(msgs, &budget, &HeuristicTokenizer, M, None, &HookBus::new())
            .await
            .unwrap();
        assert_eq!(out[0].content, "anchor-sys");
        assert_eq!(out[1].content, "anchor-user");
    }

    #[tokio::test]
    async fn impossible_budget_reports_required_and_attempts() {
        // Even the anchors are too large for the limit.
        let msgs = vec![
            Message::system("s ".repeat(2000)),
            Message::user("u ".repeat(2000)),
        ];
        let budget = BudgetConfig::new(10, 110, 100, 4).unwrap();
        let err = enforce_budget(msgs, &budget, &HeuristicTokenizer, M, None, &HookBus::new())
            .await
            .unwrap_err();
        match err {
            AgentError::Budget {
                required,
                limit,
                attempts,
            } => {
                assert!(required > limit);
                assert_eq!(limit, 10);
                assert!(attempts > 0);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn prepare_messages_is_noop_without_compression_under_budget() {
        let msgs = base_transcript();
        let budget = BudgetConfig::default();
        let out = prepare_messages(
            &msgs,
            false,
            &budget,
            &HeuristicTokenizer,
            M,
            None,
            &HookBus::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), msgs.len());
        assert_eq!(out[2].content, msgs[2].content);
    }

    #[tokio::test]
    async fn prepare_messages_elides_old_tool_output() {
        let msgs = base_transcript();
        let budget = BudgetConfig::default();
        let out = prepare_messages(
            &msgs,
            true,
            &budget,
            &HeuristicTokenizer,
            M,
            None,
            &HookBus::new(),
        )
        .await
        .unwrap();
        // 6 rounds, keep 4: the two oldest tool outputs are elided.
        let tool_contents: Vec<&str> = out
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(tool_contents[0], ELIDED_TOOL_NOTE);
        assert_eq!(tool_contents[1], ELIDED_TOOL_NOTE);
        assert_eq!(tool_contents[5], "output 5");
    }
}
