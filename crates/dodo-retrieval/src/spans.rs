// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use crate::error::{Result, RetrievalError};
use crate::types::{detect_language, Span};

/// Read an inclusive line range from a file under `root`.
///
/// Bounds are clamped to [1, line-count] and swapped when reversed, so any
/// (a, b) pair the model produces yields a valid span.
pub fn read_span(root: &Path, rel_path: &str, start: usize, end: usize) -> Result<Span> {
    let abs = root.join(rel_path);
    let text = std::fs::read_to_string(&abs).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RetrievalError::NotFound { path: abs.clone() }
        } else {
            RetrievalError::io(&abs, e)
        }
    })?;
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Ok(Span {
            path: rel_path.to_string(),
            start_line: 1,
            end_line: 1,
            language: detect_language(rel_path).to_string(),
            snippet: String::new(),
            score: 0.0,
            reason: "read".into(),
        });
    }

    let (mut lo, mut hi) = (start.clamp(1, lines.len()), end.clamp(1, lines.len()));
    if lo > hi {
        std::mem::swap(&mut lo, &mut hi);
    }

    Ok(Span {
        path: rel_path.to_string(),
        start_line: lo,
        end_line: hi,
        language: detect_language(rel_path).to_string(),
        snippet: lines[lo - 1..hi].join("\n"),
        score: 0.0,
        reason: "read".into(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
