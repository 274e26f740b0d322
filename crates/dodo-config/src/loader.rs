// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Per-user config file: `~/.dodo/config.json`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".dodo").join("config.json"))
}

/// Per-project config file: `<repo>/.dodo/config.json`.
pub fn project_config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(".dodo").join("config.json")
}

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths(repo_root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(user) = user_config_path() {
        paths.push(user);
    }
    paths.push(project_config_path(repo_root));
    paths
}

/// Load configuration by merging all discovered JSON files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(repo_root: &Path, extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    for path in config_search_paths(repo_root) {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_json(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_json(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_json::Value::Object(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_json::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Export the configured provider into the environment.
///
/// `LLM_PROVIDER` is only written when it is not already set: the config
/// file wins at process start, but a variable set in the environment wins
/// across a restart.  The same rule applies to the per-provider model
/// variable so `reload_config` rebuilds from a consistent view.
pub fn apply_env(config: &Config) {
    if std::env::var("LLM_PROVIDER").is_err() {
        std::env::set_var("LLM_PROVIDER", &config.model.provider);
    }
    if let Some(key) = config
        .model
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
    {
        let var = config
            .model
            .api_key_env
            .clone()
            .unwrap_or_else(|| format!("{}_API_KEY", config.model.provider.to_uppercase()));
        if std::env::var(&var).is_err() {
            std::env::set_var(var, key);
        }
    }
}

/// Write the config to the project's `.dodo/config.json`, creating the
/// directory when needed.
pub fn save_project(repo_root: &Path, config: &Config) -> anyhow::Result<()> {
    let path = project_config_path(repo_root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_json(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_json::Value::Object(serde_json::Map::new()));
                merge_json(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
