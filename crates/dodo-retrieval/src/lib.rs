// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hybrid code retrieval: SQLite-backed index, BM25 keyword search, cosine
//! vector search, Reciprocal Rank Fusion, and a background indexer with
//! crash recovery and a debounced filesystem watcher.

mod chunker;
mod embedder;
mod error;
mod hybrid;
mod indexer;
mod keyword;
mod scan;
mod spans;
mod store;
mod types;
mod vector;
mod watcher;

pub use chunker::{paragraph_chunks, ChunkDraft, Chunker, DefaultChunker, SymbolDraft};
pub use embedder::{Embedder, HashEmbedder};
pub use error::{Result, RetrievalError};
pub use hybrid::{glob_to_like, resolve_code_boost, rrf_fuse, RetrievalEngine};
pub use indexer::Indexer;
pub use keyword::{KeywordDoc, KeywordIndex};
pub use scan::{hash_file, scan_repo, scan_single, ScanSummary};
pub use spans::read_span;
pub use store::Store;
pub use types::{
    chunk_id, detect_language, is_code_path, symbol_id, ChunkRecord, FileRecord, IndexStatus,
    Span, SymbolRecord,
};
pub use vector::{cosine_similarity, decode_embedding, encode_embedding};
pub use watcher::spawn_watcher;
