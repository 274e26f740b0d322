// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end retrieval scenarios against tempdir fixtures.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use dodo_config::RetrievalConfig;
use dodo_retrieval::{
    chunk_id, encode_embedding, ChunkRecord, DefaultChunker, Embedder, HashEmbedder, IndexStatus,
    Indexer, KeywordDoc, KeywordIndex, RetrievalEngine, RetrievalError, Store,
};

/// Embedder with a fixed vector per known text; everything else embeds to
/// zero so it never ranks.
struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    fn name(&self) -> &str {
        "stub"
    }
    fn dimension(&self) -> usize {
        2
    }
    async fn embed(&self, text: &str) -> dodo_retrieval::Result<Vec<f32>> {
        Ok(match text {
            // Query and chunk A share a direction (cosine 0.9); chunk B is
            // orthogonal (cosine 0.0).
            "search" => vec![1.0, 0.0],
            "search result" => vec![0.9, 0.436],
            "other text" => vec![0.0, 1.0],
            _ => vec![0.0, 0.0],
        })
    }
}

struct Fixture {
    _dir: TempDir,
    store: Arc<Store>,
    keyword: Arc<KeywordIndex>,
}

async fn fixture(files: &[(&str, &str)]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join(".dodo/index.db")).unwrap());
    let keyword = Arc::new(KeywordIndex::new());

    let mut docs = Vec::new();
    for (path, text) in files {
        std::fs::write(dir.path().join(path), text).unwrap();
        store
            .upsert_scanned("repo", path, "rust", &format!("hash-{path}"), text.len() as u64, 1)
            .await
            .unwrap();
    }
    for rec in store.claim_pending(100).await.unwrap() {
        let text = std::fs::read_to_string(dir.path().join(&rec.path)).unwrap();
        let lines = text.lines().count().max(1);
        let chunk = ChunkRecord {
            id: chunk_id(&rec.path, 1, lines),
            file_id: rec.id,
            path: rec.path.clone(),
            language: "rust".into(),
            symbol_id: None,
            kind: "code".into(),
            start_line: 1,
            end_line: lines,
            text: text.clone(),
        };
        let vector = StubEmbedder.embed(text.trim()).await.unwrap();
        let emb = vec![(chunk.id.clone(), vector.len(), encode_embedding(&vector))];
        docs.push(KeywordDoc {
            chunk_id: chunk.id.clone(),
            path: chunk.path.clone(),
            text: text.trim().to_string(),
            symbol: String::new(),
            signature: String::new(),
        });
        store
            .replace_file_index(rec.id, vec![], vec![chunk], emb)
            .await
            .unwrap();
    }
    keyword.rebuild(docs).await;
    Fixture {
        _dir: dir,
        store,
        keyword,
    }
}

// ── Hybrid search ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn hybrid_search_ranks_matching_chunk_first() {
    let fx = fixture(&[("a.rs", "search result\n"), ("b.rs", "other text\n")]).await;
    let engine = RetrievalEngine::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.keyword),
        Arc::new(StubEmbedder),
        fx._dir.path(),
        1.2,
    );

    let spans = engine.search("search", &[], 5).await.unwrap();
    assert!(!spans.is_empty());
    assert_eq!(spans[0].path, "a.rs");
    assert_eq!(spans[0].reason, "rrf(bm25+vec)");
    assert!(spans[0].score > 0.0);
}

#[tokio::test]
async fn search_degrades_to_embedding_only_without_keyword_index() {
    let fx = fixture(&[("a.rs", "search result\n"), ("b.rs", "other text\n")]).await;
    let empty_keyword = Arc::new(KeywordIndex::new());
    let engine = RetrievalEngine::new(
        Arc::clone(&fx.store),
        empty_keyword,
        Arc::new(StubEmbedder),
        fx._dir.path(),
        1.2,
    );

    let spans = engine.search("search", &[], 5).await.unwrap();
    assert!(!spans.is_empty());
    assert_eq!(spans[0].path, "a.rs");
    assert_eq!(spans[0].reason, "embedding_only");
}

#[tokio::test]
async fn glob_filter_restricts_results() {
    let fx = fixture(&[("a.rs", "search result\n"), ("b.rs", "other text\n")]).await;
    let engine = RetrievalEngine::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.keyword),
        Arc::new(StubEmbedder),
        fx._dir.path(),
        1.2,
    );

    let spans = engine.search("search", &["b.*".into()], 5).await.unwrap();
    assert!(spans.iter().all(|s| s.path == "b.rs"), "{spans:?}");
}

#[tokio::test]
async fn invalid_glob_surfaces_as_error() {
    let fx = fixture(&[("a.rs", "search result\n")]).await;
    let engine = RetrievalEngine::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.keyword),
        Arc::new(StubEmbedder),
        fx._dir.path(),
        1.2,
    );
    let err = engine.search("q", &["{bad".into()], 5).await.unwrap_err();
    assert!(matches!(err, RetrievalError::InvalidGlob { .. }));
}

#[tokio::test]
async fn search_k_caps_result_count() {
    let files: Vec<(String, String)> = (0..8)
        .map(|i| (format!("f{i}.rs"), "search result\n".to_string()))
        .collect();
    let borrowed: Vec<(&str, &str)> = files
        .iter()
        .map(|(p, t)| (p.as_str(), t.as_str()))
        .collect();
    let fx = fixture(&borrowed).await;
    let engine = RetrievalEngine::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.keyword),
        Arc::new(StubEmbedder),
        fx._dir.path(),
        1.2,
    );
    let spans = engine.search("search", &[], 3).await.unwrap();
    assert_eq!(spans.len(), 3);
}

// ── Span reads ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_span_is_symmetric_in_bounds() {
    let fx = fixture(&[("a.rs", "one\ntwo\nthree\nfour\n")]).await;
    let engine = RetrievalEngine::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.keyword),
        Arc::new(StubEmbedder),
        fx._dir.path(),
        1.2,
    );
    let ab = engine.read_span("a.rs", 2, 3).unwrap();
    let ba = engine.read_span("a.rs", 3, 2).unwrap();
    assert_eq!(ab.snippet, ba.snippet);
}

// ── Crash recovery ────────────────────────────────────────────────────────────

#[tokio::test]
async fn stale_indexing_rows_recover_to_pending_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join(".dodo/index.db")).unwrap());
    for name in ["a.rs", "b.rs", "c.rs"] {
        std::fs::write(dir.path().join(name), "fn x() {}").unwrap();
        store
            .upsert_scanned("repo", name, "rust", "h", 9, 1)
            .await
            .unwrap();
    }
    // Simulate a crash mid-index: claimed two hours ago, never finished.
    let two_hours_ago = chrono::Utc::now().timestamp() - 7200;
    for rec in store.claim_pending(10).await.unwrap() {
        store
            .force_status(rec.id, IndexStatus::Indexing, two_hours_ago)
            .await
            .unwrap();
    }
    assert_eq!(store.count_by_status(IndexStatus::Indexing).await.unwrap(), 3);

    let indexer = Indexer::new(
        Arc::clone(&store),
        Arc::new(KeywordIndex::new()),
        Arc::new(HashEmbedder::default()),
        Arc::new(DefaultChunker::new()),
        RetrievalConfig::default(),
        "repo",
        dir.path(),
    );
    let reset = indexer.recover().await.unwrap();
    assert_eq!(reset, 3);
    assert_eq!(store.count_by_status(IndexStatus::Pending).await.unwrap(), 3);
    assert_eq!(store.count_by_status(IndexStatus::Indexing).await.unwrap(), 0);
}

// ── Indexer end to end ────────────────────────────────────────────────────────

#[tokio::test]
async fn indexer_processes_pending_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join(".dodo/index.db")).unwrap());
    let keyword = Arc::new(KeywordIndex::new());
    std::fs::write(
        dir.path().join("lib.rs"),
        "fn handle_request() {\n    route();\n}\n",
    )
    .unwrap();

    let indexer = Indexer::new(
        Arc::clone(&store),
        Arc::clone(&keyword),
        Arc::new(HashEmbedder::default()),
        Arc::new(DefaultChunker::new()),
        RetrievalConfig::default(),
        "repo",
        dir.path(),
    );

    dodo_retrieval::scan_repo(&store, dir.path(), "repo", 512)
        .await
        .unwrap();
    let processed = indexer.process_pending_batch().await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(store.count_by_status(IndexStatus::Indexed).await.unwrap(), 1);
    assert!(!store.all_chunks().await.unwrap().is_empty());

    // The keyword index was rebuilt and can find the new symbol.
    let engine = RetrievalEngine::new(
        Arc::clone(&store),
        Arc::clone(&keyword),
        Arc::new(HashEmbedder::default()),
        dir.path(),
        1.2,
    );
    let spans = engine.search("handle_request", &[], 5).await.unwrap();
    assert!(!spans.is_empty());
    assert_eq!(spans[0].path, "lib.rs");
}

#[tokio::test]
async fn reindexing_unchanged_file_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join(".dodo/index.db")).unwrap());
    let keyword = Arc::new(KeywordIndex::new());
    std::fs::write(dir.path().join("m.rs"), "fn m() {}\n").unwrap();

    let indexer = Indexer::new(
        Arc::clone(&store),
        Arc::clone(&keyword),
        Arc::new(HashEmbedder::default()),
        Arc::new(DefaultChunker::new()),
        RetrievalConfig::default(),
        "repo",
        dir.path(),
    );

    dodo_retrieval::scan_repo(&store, dir.path(), "repo", 512)
        .await
        .unwrap();
    indexer.process_pending_batch().await.unwrap();
    let first = store.all_chunks().await.unwrap();

    // Force a reindex of the same content.
    let rec = store.get_file("repo", "m.rs").await.unwrap().unwrap();
    store
        .force_status(rec.id, IndexStatus::Pending, chrono::Utc::now().timestamp())
        .await
        .unwrap();
    indexer.process_pending_batch().await.unwrap();
    let second = store.all_chunks().await.unwrap();

    let ids_first: Vec<&str> = first.iter().map(|c| c.id.as_str()).collect();
    let ids_second: Vec<&str> = second.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids_first, ids_second, "chunk ids must be deterministic");
}
