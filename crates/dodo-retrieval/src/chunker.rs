// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Source chunking.
//!
//! `Chunker` is a capability seam: richer AST chunkers can be injected by
//! hosts.  The shipped implementations are a regex chunker that splits
//! known languages at top-level declarations and a paragraph chunker for
//! everything else.

use regex::Regex;

/// A symbol discovered while chunking (declaration the chunk starts at).
#[derive(Debug, Clone)]
pub struct SymbolDraft {
    pub name: String,
    pub kind: String,
    pub signature: String,
    pub docstring: String,
}

/// One chunk of a file, line-addressed (1-based, inclusive).
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub start_line: usize,
    pub end_line: usize,
    pub kind: String,
    pub symbol: Option<SymbolDraft>,
    pub text: String,
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, language: &str, text: &str) -> Vec<ChunkDraft>;
}

/// Maximum lines per chunk before an oversized declaration is split.
const MAX_CHUNK_LINES: usize = 120;
/// Paragraph chunks are capped lower; prose embeds poorly in long blocks.
const MAX_PARAGRAPH_LINES: usize = 60;

/// Declaration-boundary chunker for the languages the runtime knows.
/// Falls back to paragraph chunking for unknown languages.
pub struct DefaultChunker {
    decl_patterns: Vec<(&'static [&'static str], Regex)>,
}

impl DefaultChunker {
    pub fn new() -> Self {
        // One pattern per language family, anchored to column zero so
        // nested items stay inside their parent's chunk.
        let table: Vec<(&'static [&'static str], &'static str)> = vec![
            (
                &["rust"],
                r"^(pub(\(\w+\))?\s+)?(async\s+)?(unsafe\s+)?(fn|struct|enum|trait|impl|mod|macro_rules!)\s+[A-Za-z_]",
            ),
            (&["go"], r"^(func|type|var|const)\s+[A-Za-z_(]"),
            (&["python"], r"^(async\s+)?(def|class)\s+[A-Za-z_]"),
            (
                &["javascript", "typescript"],
                r"^(export\s+)?(default\s+)?(async\s+)?(function|class|const|interface|type|enum)\s+[A-Za-z_$]",
            ),
            (
                &["java", "csharp", "cpp", "c"],
                r"^(public|private|protected|static|void|int|class|struct|namespace|template)[\s<]",
            ),
        ];
        let decl_patterns = table
            .into_iter()
            .map(|(langs, pat)| (langs, Regex::new(pat).unwrap_or_else(|_| Regex::new("$^").unwrap())))
            .collect();
        Self { decl_patterns }
    }

    fn pattern_for(&self, language: &str) -> Option<&Regex> {
        self.decl_patterns
            .iter()
            .find(|(langs, _)| langs.contains(&language))
            .map(|(_, re)| re)
    }

    fn code_chunks(&self, re: &Regex, text: &str) -> Vec<ChunkDraft> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            return Vec::new();
        }

        // Boundary = every declaration line; line 1 is always a boundary so
        // the leading imports/preamble form their own chunk.
        let mut boundaries: Vec<usize> = vec![0];
        for (i, line) in lines.iter().enumerate() {
            if i > 0 && re.is_match(line) {
                boundaries.push(i);
            }
        }
        boundaries.push(lines.len());

        let mut out = Vec::new();
        for w in boundaries.windows(2) {
            let (start, end) = (w[0], w[1]);
            if start >= end {
                continue;
            }
            // Split oversized regions at the line cap.
            let mut cursor = start;
            while cursor < end {
                let stop = (cursor + MAX_CHUNK_LINES).min(end);
                let slice = &lines[cursor..stop];
                if slice.iter().all(|l| l.trim().is_empty()) {
                    cursor = stop;
                    continue;
                }
                let symbol = if cursor == start && start > 0 {
                    parse_symbol(lines[start])
                } else {
                    None
                };
                out.push(ChunkDraft {
                    start_line: cursor + 1,
                    end_line: stop,
                    kind: "code".into(),
                    symbol,
                    text: slice.join("\n"),
                });
                cursor = stop;
            }
        }
        out
    }
}

impl Default for DefaultChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker for DefaultChunker {
    fn chunk(&self, language: &str, text: &str) -> Vec<ChunkDraft> {
        match self.pattern_for(language) {
            Some(re) => self.code_chunks(re, text),
            None => paragraph_chunks(text, MAX_PARAGRAPH_LINES),
        }
    }
}

/// Extract a rough symbol (name, kind, signature) from a declaration line.
fn parse_symbol(line: &str) -> Option<SymbolDraft> {
    let trimmed = line.trim();
    let sig = trimmed.trim_end_matches('{').trim().to_string();
    let mut words = trimmed
        .split(|c: char| c.is_whitespace() || c == '(' || c == '<' || c == ':' || c == '{')
        .filter(|w| !w.is_empty());
    let mut kind = None;
    let mut name = None;
    for w in words.by_ref() {
        match w {
            "pub" | "export" | "default" | "async" | "unsafe" | "static" | "public" | "private"
            | "protected" => continue,
            "fn" | "func" | "def" | "class" | "struct" | "enum" | "trait" | "impl" | "mod"
            | "type" | "interface" | "function" | "const" | "var" | "namespace" => {
                kind = Some(w.to_string());
            }
            other => {
                name = Some(other.trim_end_matches('!').to_string());
                break;
            }
        }
    }
    Some(SymbolDraft {
        name: name?,
        kind: kind?,
        signature: sig,
        docstring: String::new(),
    })
}

/// Blank-line paragraph chunking with a line cap.  Used for prose and for
/// languages without a declaration pattern.
pub fn paragraph_chunks(text: &str, max_lines: usize) -> Vec<ChunkDraft> {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Vec::new();
    let mut start: Option<usize> = None;

    let mut flush = |out: &mut Vec<ChunkDraft>, start: usize, end: usize, lines: &[&str]| {
        let mut cursor = start;
        while cursor < end {
            let stop = (cursor + max_lines).min(end);
            out.push(ChunkDraft {
                start_line: cursor + 1,
                end_line: stop,
                kind: "text".into(),
                symbol: None,
                text: lines[cursor..stop].join("\n"),
            });
            cursor = stop;
        }
    };

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                flush(&mut out, s, i, &lines);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        flush(&mut out, s, lines.len(), &lines);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
