// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ─── Index status ─────────────────────────────────────────────────────────────

/// Lifecycle of a file in the index.
///
/// new/changed → Pending → Indexing → (Indexed | Failed);
/// Failed → Pending on rescan; Indexing stuck past a threshold → Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Pending,
    Indexing,
    Indexed,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexing => "indexing",
            IndexStatus::Indexed => "indexed",
            IndexStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "indexing" => IndexStatus::Indexing,
            "indexed" => IndexStatus::Indexed,
            "failed" => IndexStatus::Failed,
            _ => IndexStatus::Pending,
        }
    }
}

// ─── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub repo: String,
    pub path: String,
    pub language: String,
    pub content_hash: String,
    pub size: u64,
    pub mtime: i64,
    pub deleted: bool,
    pub status: IndexStatus,
    pub indexed_at: Option<i64>,
    pub updated_at: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SymbolRecord {
    pub id: String,
    pub file_id: i64,
    pub name: String,
    pub kind: String,
    pub signature: String,
    pub start_line: usize,
    pub end_line: usize,
    pub docstring: String,
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub file_id: i64,
    pub path: String,
    pub language: String,
    pub symbol_id: Option<String>,
    pub kind: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

/// A contiguous slice of source code returned by search or span reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub language: String,
    pub snippet: String,
    pub score: f32,
    /// Why this span was returned: `rrf(bm25+vec)`, `embedding_only`, `read`.
    pub reason: String,
}

// ─── Deterministic ids ────────────────────────────────────────────────────────

/// Chunk id derived from (path, start, end).  Deterministic so that
/// re-chunking an unchanged file is idempotent.
pub fn chunk_id(path: &str, start_line: usize, end_line: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(start_line.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(end_line.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Symbol id derived from (path, name, start).
pub fn symbol_id(path: &str, name: &str, start_line: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"#");
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(start_line.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

// ─── Language detection ───────────────────────────────────────────────────────

/// Map a path to a language tag by extension.  Unknown extensions map to "".
pub fn detect_language(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "jsx" => "javascript",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "sh" | "bash" => "shell",
        "md" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        _ => "",
    }
}

/// True when the path looks like source code (used for the hybrid search
/// code-file boost; docs/config formats are excluded on purpose).
pub fn is_code_path(path: &str) -> bool {
    !matches!(detect_language(path), "" | "markdown" | "yaml" | "json" | "toml")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
