// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite storage for the retrieval index.
//!
//! One writer, many readers: the connection runs in WAL mode and is wrapped
//! in `Arc<Mutex<Connection>>` with all access funnelled through
//! `spawn_blocking` (rusqlite connections are not `Sync`).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::task::spawn_blocking;

use crate::error::{Result, RetrievalError};
use crate::types::{ChunkRecord, FileRecord, IndexStatus, SymbolRecord};

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

/// SQLite schema for the retrieval index.
///
/// Deleting a file row cascades to symbols and chunks; deleting a chunk
/// cascades to its embedding.  Soft-deleted files keep a tombstone row with
/// `deleted = 1` and have their children removed explicitly.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    repo TEXT NOT NULL,
    path TEXT NOT NULL,
    language TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    indexed_at INTEGER,
    updated_at INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    UNIQUE(repo, path)
);

CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);
CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);

CREATE TABLE IF NOT EXISTS symbols (
    id TEXT PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    signature TEXT NOT NULL DEFAULT '',
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    docstring TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_id);
CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    symbol_id TEXT REFERENCES symbols(id) ON DELETE SET NULL,
    kind TEXT NOT NULL DEFAULT 'code',
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL
);
"#;

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        repo: row.get(1)?,
        path: row.get(2)?,
        language: row.get(3)?,
        content_hash: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        mtime: row.get(6)?,
        deleted: row.get::<_, i64>(7)? != 0,
        status: IndexStatus::parse(&row.get::<_, String>(8)?),
        indexed_at: row.get(9)?,
        updated_at: row.get(10)?,
        last_error: row.get(11)?,
    })
}

const FILE_COLS: &str =
    "id, repo, path, language, content_hash, size, mtime, deleted, status, indexed_at, updated_at, last_error";

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        path: row.get(2)?,
        language: row.get(3)?,
        symbol_id: row.get(4)?,
        kind: row.get(5)?,
        start_line: row.get::<_, i64>(6)? as usize,
        end_line: row.get::<_, i64>(7)? as usize,
        text: row.get(8)?,
    })
}

const CHUNK_COLS: &str = "c.id, c.file_id, f.path, f.language, c.symbol_id, c.kind, c.start_line, c.end_line, c.text";

impl Store {
    /// Open or create the index database at `path`.
    ///
    /// On a corrupted database the file is deleted and recreated: the index
    /// is derived state and a rebuild is always safe.
    pub fn open(path: &Path) -> Result<Self> {
        match Self::try_open(path) {
            Ok(store) => Ok(store),
            Err(first) => {
                tracing::warn!(path = %path.display(), error = %first, "index database corrupt; rebuilding");
                let _ = std::fs::remove_file(path);
                Self::try_open(path)
            }
        }
    }

    fn try_open(path: &Path) -> Result<Self> {
        let sql_err = |e: rusqlite::Error| RetrievalError::Sqlite {
            path: path.to_path_buf(),
            cause: e.to_string(),
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| RetrievalError::io(dir, e))?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        // journal_mode returns the resulting mode as a row, so it cannot go
        // through pragma_update.
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))
            .map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let path = self.path.clone();
        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard).map_err(|e| RetrievalError::Sqlite {
                path: path.clone(),
                cause: e.to_string(),
            })
        })
        .await
        .map_err(|e| RetrievalError::Sqlite {
            path: self.path.clone(),
            cause: format!("spawn_blocking failed: {e}"),
        })?
    }

    // ── File lifecycle ────────────────────────────────────────────────────────

    /// Record a scanned file.  Returns `true` when the file was (re)queued
    /// for indexing, `false` when it was already up to date.
    pub async fn upsert_scanned(
        &self,
        repo: &str,
        path: &str,
        language: &str,
        content_hash: &str,
        size: u64,
        mtime: i64,
    ) -> Result<bool> {
        let (repo, path, language, content_hash) = (
            repo.to_string(),
            path.to_string(),
            language.to_string(),
            content_hash.to_string(),
        );
        self.with_conn(move |conn| {
            let now = now_ts();
            let existing: Option<(i64, String, i64)> = conn
                .query_row(
                    "SELECT id, content_hash, deleted FROM files WHERE repo = ?1 AND path = ?2",
                    params![repo, path],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            match existing {
                None => {
                    conn.execute(
                        "INSERT INTO files (repo, path, language, content_hash, size, mtime, status, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                        params![repo, path, language, content_hash, size as i64, mtime, now],
                    )?;
                    Ok(true)
                }
                Some((id, old_hash, deleted)) if old_hash != content_hash || deleted != 0 => {
                    conn.execute(
                        "UPDATE files SET language = ?2, content_hash = ?3, size = ?4, mtime = ?5,
                                deleted = 0, status = 'pending', last_error = NULL, updated_at = ?6
                         WHERE id = ?1",
                        params![id, language, content_hash, size as i64, mtime, now],
                    )?;
                    Ok(true)
                }
                Some((id, _, _)) => {
                    conn.execute(
                        "UPDATE files SET size = ?2, mtime = ?3 WHERE id = ?1",
                        params![id, size as i64, mtime],
                    )?;
                    Ok(false)
                }
            }
        })
        .await
    }

    /// Soft-delete a file and drop its derived data (symbols, chunks; the
    /// chunk FK cascades to embeddings).
    pub async fn mark_deleted(&self, repo: &str, path: &str) -> Result<()> {
        let (repo, path) = (repo.to_string(), path.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM files WHERE repo = ?1 AND path = ?2",
                    params![repo, path],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = id {
                tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![id])?;
                tx.execute("DELETE FROM symbols WHERE file_id = ?1", params![id])?;
                tx.execute(
                    "UPDATE files SET deleted = 1, updated_at = ?2 WHERE id = ?1",
                    params![id, now_ts()],
                )?;
            }
            tx.commit()
        })
        .await
    }

    /// Claim up to `limit` pending files, flipping them to `indexing`.
    pub async fn claim_pending(&self, limit: usize) -> Result<Vec<FileRecord>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let records: Vec<FileRecord> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {FILE_COLS} FROM files
                     WHERE status = 'pending' AND deleted = 0
                     ORDER BY updated_at ASC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], row_to_file)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let now = now_ts();
            for rec in &records {
                tx.execute(
                    "UPDATE files SET status = 'indexing', updated_at = ?2 WHERE id = ?1",
                    params![rec.id, now],
                )?;
            }
            tx.commit()?;
            Ok(records)
        })
        .await
    }

    pub async fn mark_failed(&self, file_id: i64, error: &str) -> Result<()> {
        let error = error.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE files SET status = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1",
                params![file_id, error, now_ts()],
            )
            .map(|_| ())
        })
        .await
    }

    /// Reset files stuck in `indexing` longer than `max_age_secs` back to
    /// `pending`.  Run at startup to recover from crashes mid-index.
    pub async fn reset_stuck_indexing(&self, max_age_secs: i64) -> Result<usize> {
        self.with_conn(move |conn| {
            let cutoff = now_ts() - max_age_secs;
            conn.execute(
                "UPDATE files SET status = 'pending', updated_at = ?2
                 WHERE status = 'indexing' AND updated_at < ?1",
                params![cutoff, now_ts()],
            )
        })
        .await
    }

    /// Requeue failed files (called by the safety rescan).
    pub async fn requeue_failed(&self) -> Result<usize> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE files SET status = 'pending', updated_at = ?1 WHERE status = 'failed'",
                params![now_ts()],
            )
        })
        .await
    }

    pub async fn get_file(&self, repo: &str, path: &str) -> Result<Option<FileRecord>> {
        let (repo, path) = (repo.to_string(), path.to_string());
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {FILE_COLS} FROM files WHERE repo = ?1 AND path = ?2"),
                params![repo, path],
                row_to_file,
            )
            .optional()
        })
        .await
    }

    /// All live (not deleted) file records for a repo.
    pub async fn files_for_repo(&self, repo: &str) -> Result<Vec<FileRecord>> {
        let repo = repo.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLS} FROM files WHERE repo = ?1 AND deleted = 0"
            ))?;
            let rows = stmt.query_map(params![repo], row_to_file)?;
            rows.collect()
        })
        .await
    }

    pub async fn count_by_status(&self, status: IndexStatus) -> Result<usize> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM files WHERE status = ?1 AND deleted = 0",
                params![status.as_str()],
                |r| r.get::<_, i64>(0).map(|n| n as usize),
            )
        })
        .await
    }

    /// Force a file's status, bypassing the normal transitions.  Test and
    /// recovery tooling only.
    pub async fn force_status(&self, file_id: i64, status: IndexStatus, updated_at: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE files SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![file_id, status.as_str(), updated_at],
            )
            .map(|_| ())
        })
        .await
    }

    // ── Derived data ──────────────────────────────────────────────────────────

    /// Atomically replace a file's symbols, chunks and embeddings and mark
    /// it indexed.  Old rows are removed first so re-chunking is idempotent.
    pub async fn replace_file_index(
        &self,
        file_id: i64,
        symbols: Vec<SymbolRecord>,
        chunks: Vec<ChunkRecord>,
        embeddings: Vec<(String, usize, Vec<u8>)>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
            tx.execute("DELETE FROM symbols WHERE file_id = ?1", params![file_id])?;
            for s in &symbols {
                tx.execute(
                    "INSERT OR REPLACE INTO symbols (id, file_id, name, kind, signature, start_line, end_line, docstring)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        s.id,
                        file_id,
                        s.name,
                        s.kind,
                        s.signature,
                        s.start_line as i64,
                        s.end_line as i64,
                        s.docstring
                    ],
                )?;
            }
            for c in &chunks {
                tx.execute(
                    "INSERT OR REPLACE INTO chunks (id, file_id, symbol_id, kind, start_line, end_line, text)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        c.id,
                        file_id,
                        c.symbol_id,
                        c.kind,
                        c.start_line as i64,
                        c.end_line as i64,
                        c.text
                    ],
                )?;
            }
            for (chunk_id, dimension, blob) in &embeddings {
                tx.execute(
                    "INSERT OR REPLACE INTO embeddings (chunk_id, dimension, vector) VALUES (?1, ?2, ?3)",
                    params![chunk_id, *dimension as i64, blob],
                )?;
            }
            let now = now_ts();
            tx.execute(
                "UPDATE files SET status = 'indexed', indexed_at = ?2, updated_at = ?2, last_error = NULL
                 WHERE id = ?1",
                params![file_id, now],
            )?;
            tx.commit()
        })
        .await
    }

    /// All chunks of live files, joined with path and language.  Feeds the
    /// keyword-index rebuild.
    pub async fn all_chunks(&self) -> Result<Vec<ChunkRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHUNK_COLS} FROM chunks c JOIN files f ON f.id = c.file_id
                 WHERE f.deleted = 0"
            ))?;
            let rows = stmt.query_map([], row_to_chunk)?;
            rows.collect()
        })
        .await
    }

    /// Keyword documents for the BM25 rebuild: every live chunk joined with
    /// its symbol's name and signature (empty when the chunk is symbol-free).
    pub async fn keyword_docs(&self) -> Result<Vec<crate::keyword::KeywordDoc>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, f.path, c.text, COALESCE(s.name, ''), COALESCE(s.signature, '')
                 FROM chunks c
                 JOIN files f ON f.id = c.file_id
                 LEFT JOIN symbols s ON s.id = c.symbol_id
                 WHERE f.deleted = 0",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(crate::keyword::KeywordDoc {
                    chunk_id: row.get(0)?,
                    path: row.get(1)?,
                    text: row.get(2)?,
                    symbol: row.get(3)?,
                    signature: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    pub async fn chunks_by_ids(&self, ids: Vec<String>) -> Result<Vec<ChunkRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let placeholders = std::iter::repeat("?")
                .take(ids.len())
                .collect::<Vec<_>>()
                .join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHUNK_COLS} FROM chunks c JOIN files f ON f.id = c.file_id
                 WHERE c.id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), row_to_chunk)?;
            rows.collect()
        })
        .await
    }

    /// Candidate chunks for vector search: (chunk, embedding blob) pairs,
    /// optionally path-filtered with SQL LIKE patterns, capped at `limit`.
    pub async fn embedding_candidates(
        &self,
        like_patterns: Vec<String>,
        limit: usize,
    ) -> Result<Vec<(ChunkRecord, Vec<u8>)>> {
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {CHUNK_COLS}, e.vector FROM chunks c
                 JOIN files f ON f.id = c.file_id
                 JOIN embeddings e ON e.chunk_id = c.id
                 WHERE f.deleted = 0"
            );
            if !like_patterns.is_empty() {
                let ors = like_patterns
                    .iter()
                    .map(|_| "f.path LIKE ?")
                    .collect::<Vec<_>>()
                    .join(" OR ");
                sql.push_str(&format!(" AND ({ors})"));
            }
            sql.push_str(" LIMIT ");
            sql.push_str(&limit.to_string());

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(like_patterns.iter()), |row| {
                let chunk = row_to_chunk(row)?;
                let blob: Vec<u8> = row.get(9)?;
                Ok((chunk, blob))
            })?;
            rows.collect()
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
