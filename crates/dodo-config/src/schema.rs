// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | "openrouter" | "groq" | "ollama" | "mock",
    /// or any other id understood by the OpenAI-compatible driver.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or llama.cpp.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            // api_key_env is intentionally None here.  The client registry
            // knows the canonical env-var name for each provider
            // (OPENAI_API_KEY, OPENROUTER_API_KEY, ...) and hard-coding one
            // here would shadow that lookup when the provider is overridden.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
        }
    }
}

fn default_max_steps() -> u32 {
    50
}
fn default_max_tool_calls() -> u32 {
    40
}
fn default_failure_cap() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of scheduler steps before the agent yields back to the
    /// client.  Reaching the ceiling is not an error.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Refuse edit-category tool calls until a mini-plan exists.
    #[serde(default = "default_true")]
    pub planning_required: bool,
    /// Stream model deltas to observers instead of waiting for the full turn.
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Apply the history processors before every model call.
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Soft cap: total tool calls across the whole run.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    /// Soft cap: consecutive build/test/lint tool failures.
    #[serde(default = "default_failure_cap")]
    pub max_build_failures: u32,
    /// Soft cap: search/replace failures against a single file.
    #[serde(default = "default_failure_cap")]
    pub max_search_replace_failures: u32,
    /// Token budget overrides.  When unset, a per-model preset is chosen at
    /// agent construction based on the model name.
    pub soft_limit: Option<usize>,
    pub hard_limit: Option<usize>,
    pub reserve: Option<usize>,
    pub max_compression_passes: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            planning_required: true,
            streaming: true,
            compression: true,
            max_tool_calls: default_max_tool_calls(),
            max_build_failures: default_failure_cap(),
            max_search_replace_failures: default_failure_cap(),
            soft_limit: None,
            hard_limit: None,
            reserve: None,
            max_compression_passes: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}
fn default_batch_size() -> usize {
    20
}
fn default_safety_scan_interval() -> u64 {
    600
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_code_file_boost() -> f32 {
    1.2
}
fn default_max_file_size_kb() -> u64 {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Seconds between pending-queue polls of the background indexer.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum pending files claimed per indexer tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between full safety rescans that catch missed changes.
    #[serde(default = "default_safety_scan_interval")]
    pub safety_scan_interval_secs: u64,
    /// Filesystem-watcher debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Score multiplier for source-code files in hybrid search results.
    /// Clamped to [1.0, 2.0]; overridable via DODO_CODE_FILE_BOOST.
    #[serde(default = "default_code_file_boost")]
    pub code_file_boost: f32,
    /// Files larger than this are skipped by the indexer.
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,
    /// Enable the near-real-time filesystem watcher.
    #[serde(default = "default_true")]
    pub watch: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            safety_scan_interval_secs: default_safety_scan_interval(),
            debounce_ms: default_debounce_ms(),
            code_file_boost: default_code_file_boost(),
            max_file_size_kb: default_max_file_size_kb(),
            watch: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model.provider, "openai");
        assert_eq!(back.agent.max_steps, 50);
        assert_eq!(back.retrieval.batch_size, 20);
    }

    #[test]
    fn empty_object_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert!(cfg.agent.planning_required);
        assert!(cfg.agent.streaming);
        assert_eq!(cfg.retrieval.poll_interval_secs, 5);
        assert_eq!(cfg.retrieval.debounce_ms, 500);
    }

    #[test]
    fn partial_agent_section_keeps_other_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"agent": {"max_steps": 7}}"#).unwrap();
        assert_eq!(cfg.agent.max_steps, 7);
        assert_eq!(cfg.agent.max_tool_calls, 40);
        assert!(cfg.agent.compression);
    }

    #[test]
    fn soft_cap_defaults_match_runtime_limits() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.max_tool_calls, 40);
        assert_eq!(cfg.max_build_failures, 3);
        assert_eq!(cfg.max_search_replace_failures, 3);
    }

    #[test]
    fn code_file_boost_default() {
        let cfg = RetrievalConfig::default();
        assert!((cfg.code_file_boost - 1.2).abs() < f32::EPSILON);
    }
}
