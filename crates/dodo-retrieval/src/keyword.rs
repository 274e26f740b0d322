// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! BM25 keyword index over code chunks.
//!
//! The index is in-memory (the `bm25` crate) and rebuilt wholesale from the
//! SQLite store whenever the chunk set changes.  Analyzed content is the
//! chunk text plus the owning symbol's name and signature, so identifier
//! queries hit even when the body text is terse.  A missing or empty index
//! degrades hybrid search to `embedding_only` rather than failing.

use std::collections::HashMap;

use bm25::{Document, Language, SearchEngine, SearchEngineBuilder};
use tokio::sync::RwLock;

use crate::types::{ChunkRecord, SymbolRecord};

/// One keyword document: a chunk plus its searchable metadata fields.
#[derive(Debug, Clone)]
pub struct KeywordDoc {
    pub chunk_id: String,
    pub path: String,
    pub text: String,
    pub symbol: String,
    pub signature: String,
}

impl KeywordDoc {
    pub fn from_chunk(chunk: &ChunkRecord, symbol: Option<&SymbolRecord>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            path: chunk.path.clone(),
            text: chunk.text.clone(),
            symbol: symbol.map(|s| s.name.clone()).unwrap_or_default(),
            signature: symbol.map(|s| s.signature.clone()).unwrap_or_default(),
        }
    }

    fn contents(&self) -> String {
        // Path components help "manager.rs" style queries; symbol and
        // signature carry identifier weight.
        format!(
            "{}\n{}\n{}\n{}",
            self.path.replace(['/', '.'], " "),
            self.symbol,
            self.signature,
            self.text
        )
    }
}

struct Inner {
    engine: Option<SearchEngine<String>>,
    paths: HashMap<String, String>,
}

pub struct KeywordIndex {
    inner: RwLock<Inner>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                engine: None,
                paths: HashMap::new(),
            }),
        }
    }

    /// Replace the whole index from the given documents.  An empty document
    /// set clears the index (search then reports unavailable).
    pub async fn rebuild(&self, docs: Vec<KeywordDoc>) {
        let mut inner = self.inner.write().await;
        if docs.is_empty() {
            inner.engine = None;
            inner.paths.clear();
            return;
        }
        inner.paths = docs
            .iter()
            .map(|d| (d.chunk_id.clone(), d.path.clone()))
            .collect();
        let documents: Vec<Document<String>> = docs
            .iter()
            .map(|d| Document::new(d.chunk_id.clone(), d.contents()))
            .collect();
        inner.engine =
            Some(SearchEngineBuilder::with_documents(Language::English, documents).build());
    }

    /// True when an index has been built and has documents.
    pub async fn available(&self) -> bool {
        self.inner.read().await.engine.is_some()
    }

    /// Ranked (chunk_id, path, score) triples for `query`.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<(String, String, f32)> {
        let inner = self.inner.read().await;
        let Some(engine) = &inner.engine else {
            return Vec::new();
        };
        engine
            .search(query, limit)
            .into_iter()
            .map(|r| {
                let path = inner
                    .paths
                    .get(&r.document.id)
                    .cloned()
                    .unwrap_or_default();
                (r.document.id, path, r.score)
            })
            .collect()
    }
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
