// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background indexing worker.
//!
//! Startup: reset crash-stuck `indexing` rows, reconcile with the
//! filesystem, rebuild the keyword index.  Steady state: poll the pending
//! queue, claim a bounded batch, index each file, refresh the keyword
//! index; a slower safety ticker rescans the whole repo to catch anything
//! the watcher missed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dodo_config::RetrievalConfig;

use crate::chunker::Chunker;
use crate::embedder::Embedder;
use crate::error::{Result, RetrievalError};
use crate::keyword::KeywordIndex;
use crate::scan;
use crate::store::Store;
use crate::types::{chunk_id, symbol_id, ChunkRecord, FileRecord, SymbolRecord};
use crate::vector::encode_embedding;

/// `indexing` rows older than this are considered crash leftovers.
const STUCK_THRESHOLD_SECS: i64 = 3600;

pub struct Indexer {
    store: Arc<Store>,
    keyword: Arc<KeywordIndex>,
    embedder: Arc<dyn Embedder>,
    chunker: Arc<dyn Chunker>,
    config: RetrievalConfig,
    repo: String,
    root: PathBuf,
}

impl Indexer {
    pub fn new(
        store: Arc<Store>,
        keyword: Arc<KeywordIndex>,
        embedder: Arc<dyn Embedder>,
        chunker: Arc<dyn Chunker>,
        config: RetrievalConfig,
        repo: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            keyword,
            embedder,
            chunker,
            config,
            repo: repo.into(),
            root: root.into(),
        }
    }

    /// Crash recovery: files stuck in `indexing` for over an hour go back
    /// to `pending`.  Returns how many were reset.
    pub async fn recover(&self) -> Result<usize> {
        let reset = self.store.reset_stuck_indexing(STUCK_THRESHOLD_SECS).await?;
        if reset > 0 {
            info!(reset, "reset crash-stuck files to pending");
        }
        Ok(reset)
    }

    /// Run the worker until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.recover().await {
            warn!("index recovery failed: {e}");
        }
        if let Err(e) = scan::scan_repo(&self.store, &self.root, &self.repo, self.config.max_file_size_kb).await {
            warn!("initial scan failed: {e}");
        }
        if let Err(e) = self.rebuild_keyword().await {
            warn!("keyword rebuild failed: {e}");
        }

        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        let mut safety =
            tokio::time::interval(Duration::from_secs(self.config.safety_scan_interval_secs.max(1)));
        // The first tick of each interval fires immediately; consume them so
        // the loop starts with a real wait.
        poll.tick().await;
        safety.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("indexer cancelled");
                    return;
                }
                _ = poll.tick() => {
                    match self.process_pending_batch().await {
                        Ok(0) => {}
                        Ok(n) => debug!(indexed = n, "batch complete"),
                        Err(e) => warn!("indexing batch failed: {e}"),
                    }
                }
                _ = safety.tick() => {
                    if let Err(e) = self.safety_scan().await {
                        warn!("safety scan failed: {e}");
                    }
                }
            }
        }
    }

    /// Claim and index up to `batch_size` pending files.  Returns the number
    /// of files processed (indexed or failed).
    pub async fn process_pending_batch(&self) -> Result<usize> {
        let batch = self.store.claim_pending(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let n = batch.len();
        for record in batch {
            if let Err(e) = self.index_file(&record).await {
                warn!(path = %record.path, "indexing failed: {e}");
                self.store.mark_failed(record.id, &e.to_string()).await?;
            }
        }
        self.rebuild_keyword().await?;
        Ok(n)
    }

    /// Full rescan plus failed-file requeue; the poll loop picks up the
    /// resulting pending entries.
    pub async fn safety_scan(&self) -> Result<()> {
        scan::scan_repo(&self.store, &self.root, &self.repo, self.config.max_file_size_kb).await?;
        self.store.requeue_failed().await?;
        Ok(())
    }

    async fn index_file(&self, record: &FileRecord) -> Result<()> {
        let abs = self.root.join(&record.path);
        let text = match std::fs::read_to_string(&abs) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.store.mark_deleted(&record.repo, &record.path).await?;
                return Ok(());
            }
            Err(e) => return Err(RetrievalError::io(&abs, e)),
        };

        let drafts = self.chunker.chunk(&record.language, &text);

        let mut symbols: Vec<SymbolRecord> = Vec::new();
        let mut chunks: Vec<ChunkRecord> = Vec::with_capacity(drafts.len());
        for draft in &drafts {
            let sym_id = draft.symbol.as_ref().map(|s| {
                let id = symbol_id(&record.path, &s.name, draft.start_line);
                symbols.push(SymbolRecord {
                    id: id.clone(),
                    file_id: record.id,
                    name: s.name.clone(),
                    kind: s.kind.clone(),
                    signature: s.signature.clone(),
                    start_line: draft.start_line,
                    end_line: draft.end_line,
                    docstring: s.docstring.clone(),
                });
                id
            });
            chunks.push(ChunkRecord {
                id: chunk_id(&record.path, draft.start_line, draft.end_line),
                file_id: record.id,
                path: record.path.clone(),
                language: record.language.clone(),
                symbol_id: sym_id,
                kind: draft.kind.clone(),
                start_line: draft.start_line,
                end_line: draft.end_line,
                text: draft.text.clone(),
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        let embeddings: Vec<(String, usize, Vec<u8>)> = chunks
            .iter()
            .zip(vectors.iter())
            .map(|(c, v)| (c.id.clone(), v.len(), encode_embedding(v)))
            .collect();

        debug!(path = %record.path, chunks = chunks.len(), "indexed");
        self.store
            .replace_file_index(record.id, symbols, chunks, embeddings)
            .await
    }

    /// Rebuild the in-memory keyword index from the store.
    pub async fn rebuild_keyword(&self) -> Result<()> {
        let docs = self.store.keyword_docs().await?;
        self.keyword.rebuild(docs).await;
        Ok(())
    }
}
