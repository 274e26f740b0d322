// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider selection.
//!
//! The environment wins over the config file at runtime: `LLM_PROVIDER`
//! picks the provider, `<PROVIDER>_API_KEY` / `<PROVIDER>_BASE_URL` /
//! `<PROVIDER>_MODEL` refine it.  The config loader exports its own values
//! into unset variables at boot, so both sources flow through here.

use std::sync::Arc;

use anyhow::bail;

use dodo_config::ModelConfig;

use crate::{mock::MockClient, openai_compat::OpenAiCompatClient, LlmClient};

/// Default API base URLs for well-known OpenAI-compatible providers.
fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}

fn env_for(provider: &str, suffix: &str) -> Option<String> {
    let var = format!("{}_{suffix}", provider.to_uppercase().replace('-', "_"));
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Build a client from the environment and the model config section.
pub fn client_from_env(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let provider = std::env::var("LLM_PROVIDER")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| cfg.provider.clone());

    if provider == "mock" {
        return Ok(Arc::new(MockClient));
    }

    let model = env_for(&provider, "MODEL").unwrap_or_else(|| cfg.name.clone());

    let base_url = env_for(&provider, "BASE_URL")
        .or_else(|| cfg.base_url.clone())
        .or_else(|| default_base_url(&provider).map(String::from));
    let Some(base_url) = base_url else {
        bail!(
            "unknown provider '{provider}': set {}_BASE_URL or model.base_url",
            provider.to_uppercase()
        );
    };

    let api_key = cfg
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| {
            cfg.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
        .or_else(|| env_for(&provider, "API_KEY"));

    Ok(Arc::new(OpenAiCompatClient::new(
        provider,
        model,
        api_key,
        &base_url,
        cfg.max_tokens,
        cfg.temperature,
    )))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that touch LLM_PROVIDER must not interleave: the environment
    /// is process-global while the test harness runs threads in parallel.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn known_providers_have_base_urls() {
        assert!(default_base_url("openai").is_some());
        assert!(default_base_url("groq").is_some());
        assert!(default_base_url("never-heard-of-it").is_none());
    }

    #[test]
    fn mock_provider_builds_without_keys() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::set_var("LLM_PROVIDER", "mock");
        let cfg = ModelConfig {
            provider: "mock".into(),
            ..Default::default()
        };
        let client = client_from_env(&cfg).unwrap();
        assert_eq!(client.provider(), "mock");
        std::env::remove_var("LLM_PROVIDER");
    }

    #[test]
    fn unknown_provider_without_base_url_fails() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::remove_var("LLM_PROVIDER");
        let cfg = ModelConfig {
            provider: "totally-custom".into(),
            base_url: None,
            ..Default::default()
        };
        assert!(client_from_env(&cfg).is_err());
    }

    #[test]
    fn custom_provider_with_base_url_builds() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::remove_var("LLM_PROVIDER");
        let cfg = ModelConfig {
            provider: "llamacpp".into(),
            base_url: Some("http://127.0.0.1:8080/v1".into()),
            ..Default::default()
        };
        let client = client_from_env(&cfg).unwrap();
        assert_eq!(client.provider(), "llamacpp");
    }
}
