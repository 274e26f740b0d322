// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hybrid keyword + vector search with Reciprocal Rank Fusion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::embedder::Embedder;
use crate::error::{Result, RetrievalError};
use crate::keyword::KeywordIndex;
use crate::spans;
use crate::store::Store;
use crate::types::{is_code_path, ChunkRecord, Span};
use crate::vector::{cosine_similarity, decode_embedding};

/// RRF rank offset: `score = Σ 1/(60 + rank)`.
const RRF_K: f32 = 60.0;
/// Per-index candidate pool fed into fusion.
const POOL_SIZE: usize = 100;
/// Hard cap on chunks pulled from the store for the vector scan.
const VECTOR_CANDIDATE_CAP: usize = 500;
/// Lines included in a result snippet.
const SNIPPET_LINES: usize = 30;

/// Resolve the code-file boost: the `DODO_CODE_FILE_BOOST` variable wins
/// when it parses and lies inside [1.0, 2.0]; otherwise the configured
/// value is clamped into range.
pub fn resolve_code_boost(configured: f32) -> f32 {
    if let Ok(raw) = std::env::var("DODO_CODE_FILE_BOOST") {
        match raw.trim().parse::<f32>() {
            Ok(v) if (1.0..=2.0).contains(&v) => return v,
            _ => warn!(value = %raw, "ignoring invalid DODO_CODE_FILE_BOOST (want 1.0..=2.0)"),
        }
    }
    configured.clamp(1.0, 2.0)
}

/// Translate a glob into a SQL LIKE pattern for coarse path pre-filtering.
/// The precise filter is still the compiled glob set; LIKE only trims the
/// candidate pool.
pub fn glob_to_like(pattern: &str) -> String {
    pattern
        .replace('%', "\\%")
        .replace('_', "\\_")
        .replace("**", "*")
        .replace('*', "%")
        .replace('?', "_")
}

/// Merge ranked id lists with Reciprocal Rank Fusion.
///
/// Stable under permutation of equal-score inputs: callers must tie-break
/// the final ordering deterministically (we sort by id on equal score).
pub fn rrf_fuse(lists: &[Vec<String>]) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_default() += 1.0 / (RRF_K + (rank + 1) as f32);
        }
    }
    scores
}

fn build_globset(globs: &[String]) -> Result<Option<GlobSet>> {
    if globs.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pat in globs {
        let glob = Glob::new(pat).map_err(|e| RetrievalError::InvalidGlob {
            pattern: pat.clone(),
            cause: e.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| RetrievalError::InvalidGlob {
        pattern: globs.join(","),
        cause: e.to_string(),
    })?;
    Ok(Some(set))
}

/// The search surface handed to the agent's tools: hybrid search, span
/// reads, and the cached workspace context.
pub struct RetrievalEngine {
    store: Arc<Store>,
    keyword: Arc<KeywordIndex>,
    embedder: Arc<dyn Embedder>,
    root: PathBuf,
    code_boost: f32,
    workspace_context: Mutex<Option<String>>,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<Store>,
        keyword: Arc<KeywordIndex>,
        embedder: Arc<dyn Embedder>,
        root: impl Into<PathBuf>,
        configured_boost: f32,
    ) -> Self {
        Self {
            store,
            keyword,
            embedder,
            root: root.into(),
            code_boost: resolve_code_boost(configured_boost),
            workspace_context: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Hybrid search: BM25 top-100 and cosine top-100 fused with RRF, then
    /// boosted for source-code paths and cut to `k` spans.
    pub async fn search(&self, query: &str, globs: &[String], k: usize) -> Result<Vec<Span>> {
        let glob_set = build_globset(globs)?;
        let path_ok = |path: &str| {
            glob_set
                .as_ref()
                .map(|g| g.is_match(path))
                .unwrap_or(true)
        };

        // Keyword side.
        let keyword_available = self.keyword.available().await;
        let keyword_ranked: Vec<String> = self
            .keyword
            .search(query, POOL_SIZE * 2)
            .await
            .into_iter()
            .filter(|(_, path, _)| path_ok(path))
            .take(POOL_SIZE)
            .map(|(id, _, _)| id)
            .collect();

        // Vector side.
        let query_vec = self.embedder.embed(query).await?;
        let like_patterns: Vec<String> = globs.iter().map(|g| glob_to_like(g)).collect();
        let candidates = self
            .store
            .embedding_candidates(like_patterns, VECTOR_CANDIDATE_CAP)
            .await?;

        let mut by_id: HashMap<String, ChunkRecord> = HashMap::new();
        let mut vector_scored: Vec<(String, f32)> = Vec::new();
        for (chunk, blob) in candidates {
            if !path_ok(&chunk.path) {
                continue;
            }
            let vec = match decode_embedding(&chunk.id, &blob) {
                Ok(v) => v,
                Err(e) => {
                    warn!(chunk = %chunk.id, "skipping corrupt embedding: {e}");
                    continue;
                }
            };
            let sim = cosine_similarity(&query_vec, &vec);
            if sim > 0.0 {
                vector_scored.push((chunk.id.clone(), sim));
            }
            by_id.insert(chunk.id.clone(), chunk);
        }
        vector_scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        vector_scored.truncate(POOL_SIZE);
        let vector_ranked: Vec<String> = vector_scored.into_iter().map(|(id, _)| id).collect();

        // Fuse, boost, cut.
        let mut fused: Vec<(String, f32)> = rrf_fuse(&[keyword_ranked.clone(), vector_ranked])
            .into_iter()
            .collect();

        // Resolve chunk records the keyword side contributed.
        let missing: Vec<String> = fused
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !by_id.contains_key(id))
            .collect();
        for chunk in self.store.chunks_by_ids(missing).await? {
            by_id.insert(chunk.id.clone(), chunk);
        }

        for (id, score) in &mut fused {
            if let Some(chunk) = by_id.get(id) {
                if is_code_path(&chunk.path) {
                    *score *= self.code_boost;
                }
            }
        }
        fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        fused.truncate(k);

        let reason = if keyword_available && !keyword_ranked.is_empty() {
            "rrf(bm25+vec)"
        } else {
            "embedding_only"
        };

        let mut spans = Vec::with_capacity(fused.len());
        for (id, score) in fused {
            let Some(chunk) = by_id.get(&id) else { continue };
            let mut span = self.snippet_span(chunk);
            span.score = score;
            span.reason = reason.into();
            spans.push(span);
        }
        Ok(spans)
    }

    /// A snippet span for a chunk: up to [`SNIPPET_LINES`] lines from the
    /// live file, falling back to the stored chunk text when the file has
    /// moved underneath the index.
    fn snippet_span(&self, chunk: &ChunkRecord) -> Span {
        let end = chunk
            .end_line
            .min(chunk.start_line + SNIPPET_LINES - 1)
            .max(chunk.start_line);
        match spans::read_span(&self.root, &chunk.path, chunk.start_line, end) {
            Ok(span) => span,
            Err(_) => Span {
                path: chunk.path.clone(),
                start_line: chunk.start_line,
                end_line: end,
                language: chunk.language.clone(),
                snippet: chunk
                    .text
                    .lines()
                    .take(SNIPPET_LINES)
                    .collect::<Vec<_>>()
                    .join("\n"),
                score: 0.0,
                reason: String::new(),
            },
        }
    }

    /// Clamped span read relative to the engine root.
    pub fn read_span(&self, path: &str, start: usize, end: usize) -> Result<Span> {
        spans::read_span(&self.root, path, start, end)
    }

    /// Cached one-level workspace listing injected into prompts.
    /// Structural filesystem changes invalidate it via the watcher.
    pub fn workspace_context(&self) -> String {
        let mut cache = self.workspace_context.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(ctx) = cache.as_ref() {
            return ctx.clone();
        }
        let mut entries: Vec<String> = std::fs::read_dir(&self.root)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let name = e.file_name().to_string_lossy().to_string();
                        if name.starts_with('.') {
                            return None;
                        }
                        let suffix = if e.path().is_dir() { "/" } else { "" };
                        Some(format!("{name}{suffix}"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        let ctx = entries.join("\n");
        *cache = Some(ctx.clone());
        ctx
    }

    pub fn invalidate_workspace_context(&self) {
        let mut cache = self.workspace_context.lock().unwrap_or_else(|p| p.into_inner());
        *cache = None;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_to_like_translates_wildcards() {
        assert_eq!(glob_to_like("src/*.rs"), "src/%.rs");
        assert_eq!(glob_to_like("**/*.go"), "%/%.go");
        assert_eq!(glob_to_like("a?.txt"), "a_.txt");
    }

    #[test]
    fn glob_to_like_escapes_sql_metacharacters() {
        assert_eq!(glob_to_like("100%_done"), "100\\%\\_done");
    }

    #[test]
    fn rrf_sums_reciprocal_ranks() {
        let fused = rrf_fuse(&[
            vec!["a".into(), "b".into()],
            vec!["b".into(), "a".into()],
        ]);
        // Both appear at ranks 1 and 2.
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused["a"] - expected).abs() < 1e-6);
        assert!((fused["b"] - expected).abs() < 1e-6);
    }

    #[test]
    fn rrf_is_stable_under_list_permutation() {
        let a = rrf_fuse(&[vec!["x".into()], vec!["y".into()]]);
        let b = rrf_fuse(&[vec!["y".into()], vec!["x".into()]]);
        assert_eq!(a["x"], b["x"]);
        assert_eq!(a["y"], b["y"]);
    }

    #[test]
    fn rrf_single_list_top_rank_beats_lower() {
        let fused = rrf_fuse(&[vec!["top".into(), "second".into()]]);
        assert!(fused["top"] > fused["second"]);
    }

    #[test]
    fn invalid_glob_is_reported() {
        let err = build_globset(&["{broken".into()]).unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidGlob { .. }));
    }

    #[test]
    fn code_boost_resolution() {
        // One test covers clamping and the env override: the variable is
        // process-global and parallel tests must not interleave on it.
        std::env::remove_var("DODO_CODE_FILE_BOOST");
        assert_eq!(resolve_code_boost(5.0), 2.0);
        assert_eq!(resolve_code_boost(0.1), 1.0);
        assert!((resolve_code_boost(1.2) - 1.2).abs() < f32::EPSILON);

        std::env::set_var("DODO_CODE_FILE_BOOST", "1.5");
        assert!((resolve_code_boost(1.2) - 1.5).abs() < f32::EPSILON);
        // Out-of-range overrides are ignored in favour of the configured value.
        std::env::set_var("DODO_CODE_FILE_BOOST", "9.0");
        assert!((resolve_code_boost(1.2) - 1.2).abs() < f32::EPSILON);
        std::env::remove_var("DODO_CODE_FILE_BOOST");
    }
}
