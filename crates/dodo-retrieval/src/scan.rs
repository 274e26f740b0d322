// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Repository change detection.
//!
//! Git repositories use `ls-files` for the tracked baseline and
//! `status --porcelain` for deltas; everything else falls back to a
//! gitignore-aware walk.  Either way the store comparison uses a
//! (size, mtime) fast path and only rehashes when those differ.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, RetrievalError};
use crate::store::Store;
use crate::types::detect_language;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
    pub seen: usize,
    pub queued: usize,
    pub deleted: usize,
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// (size, mtime-seconds) for the fast-path comparison.
pub fn file_meta(path: &Path) -> Option<(u64, i64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;
    Some((meta.len(), mtime))
}

/// Cheap binary sniff: NUL in the first kilobyte means not indexable text.
pub fn is_probably_text(path: &Path) -> bool {
    let Ok(bytes) = std::fs::read(path) else {
        return false;
    };
    !bytes.iter().take(1024).any(|b| *b == 0)
}

pub async fn is_git_repo(root: &Path) -> bool {
    tokio::process::Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(root)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn git_lines(root: &Path, args: &[&str]) -> Option<Vec<String>> {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(root)
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    Some(
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect(),
    )
}

/// Candidate paths in a git repo: tracked files plus dirty/untracked ones
/// from `status --porcelain` (renames contribute their new name).
async fn git_candidates(root: &Path) -> Option<Vec<String>> {
    let mut paths: HashSet<String> = git_lines(root, &["ls-files"]).await?.into_iter().collect();
    for line in git_lines(root, &["status", "--porcelain"]).await? {
        if line.len() < 4 {
            continue;
        }
        let entry = &line[3..];
        let path = entry.split(" -> ").last().unwrap_or(entry);
        paths.insert(path.trim_matches('"').to_string());
    }
    Some(paths.into_iter().collect())
}

/// Gitignore-aware filesystem walk returning repo-relative paths.
pub fn walk_candidates(root: &Path) -> Vec<String> {
    ignore::WalkBuilder::new(root)
        .hidden(true)
        .build()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

/// Skip paths the runtime itself writes under the repo.
fn is_internal(path: &str) -> bool {
    path.starts_with(".dodo/") || path.starts_with(".git/")
}

/// Full reconciliation pass: queue new/changed files, tombstone vanished
/// ones.  Also used by the safety-scan ticker to catch missed changes.
pub async fn scan_repo(
    store: &Arc<Store>,
    root: &Path,
    repo: &str,
    max_file_size_kb: u64,
) -> Result<ScanSummary> {
    let candidates: Vec<String> = if is_git_repo(root).await {
        match git_candidates(root).await {
            Some(paths) => paths,
            None => walk_candidates(root),
        }
    } else {
        walk_candidates(root)
    };

    let mut summary = ScanSummary::default();
    let mut live: HashSet<String> = HashSet::new();
    let max_bytes = max_file_size_kb * 1024;

    for rel in candidates {
        if is_internal(&rel) {
            continue;
        }
        let abs = root.join(&rel);
        let Some((size, mtime)) = file_meta(&abs) else {
            // Listed but unreadable/unstatable: treat as deleted.
            store.mark_deleted(repo, &rel).await?;
            summary.deleted += 1;
            continue;
        };
        if size > max_bytes || !is_probably_text(&abs) {
            continue;
        }
        summary.seen += 1;
        live.insert(rel.clone());

        // Fast path: unchanged (size, mtime) needs no rehash.
        if let Some(rec) = store.get_file(repo, &rel).await? {
            if !rec.deleted && rec.size == size && rec.mtime == mtime {
                continue;
            }
        }
        let hash = hash_file(&abs).map_err(|e| RetrievalError::io(&abs, e))?;
        let queued = store
            .upsert_scanned(repo, &rel, detect_language(&rel), &hash, size, mtime)
            .await?;
        if queued {
            debug!(path = %rel, "queued for indexing");
            summary.queued += 1;
        }
    }

    // Files the store knows about but the scan no longer sees.
    for rec in store.files_for_repo(repo).await? {
        if !live.contains(&rec.path) {
            store.mark_deleted(repo, &rec.path).await?;
            summary.deleted += 1;
        }
    }

    if summary.queued > 0 || summary.deleted > 0 {
        debug!(?summary, "scan complete");
    }
    Ok(summary)
}

/// Re-stat one path (watcher events) and queue or tombstone it.
pub async fn scan_single(
    store: &Arc<Store>,
    root: &Path,
    repo: &str,
    rel: &str,
    max_file_size_kb: u64,
) -> Result<bool> {
    if is_internal(rel) {
        return Ok(false);
    }
    let abs = root.join(rel);
    match file_meta(&abs) {
        None => {
            store.mark_deleted(repo, rel).await?;
            Ok(false)
        }
        Some((size, mtime)) => {
            if size > max_file_size_kb * 1024 || !is_probably_text(&abs) {
                return Ok(false);
            }
            let hash = match hash_file(&abs) {
                Ok(h) => h,
                Err(e) => {
                    warn!(path = %rel, "hash failed: {e}");
                    return Ok(false);
                }
            };
            store
                .upsert_scanned(repo, rel, detect_language(rel), &hash, size, mtime)
                .await
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
