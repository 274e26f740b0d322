// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("sqlite error at {path}: {cause}")]
    Sqlite { path: PathBuf, cause: String },

    #[error("io error at {path}: {cause}")]
    Io { path: PathBuf, cause: String },

    #[error("file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("invalid glob pattern '{pattern}': {cause}")]
    InvalidGlob { pattern: String, cause: String },

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("corrupt embedding blob for chunk {chunk_id}")]
    CorruptEmbedding { chunk_id: String },
}

impl RetrievalError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            cause: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
