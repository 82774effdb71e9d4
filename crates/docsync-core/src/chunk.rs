//! Overlapping token-window chunker.
//!
//! Splits normalized document text into [`ChunkDraft`]s of at most
//! `max_tokens` whitespace-delimited tokens. Consecutive windows share
//! `overlap_tokens` tokens: window `i + 1` starts `max_tokens - overlap_tokens`
//! tokens after window `i`.
//!
//! Each draft receives a SHA-256 hash of its text. The hash is what the
//! store compares during reconciliation, so the chunker must be fully
//! deterministic: the same text and configuration always produce the same
//! sequence of `(index, text, hash)`.
//!
//! # Algorithm
//!
//! 1. Locate every token as a byte span in the text.
//! 2. Starting at token 0, take up to `max_tokens` tokens.
//! 3. Slice the original text from the first token's start to the last
//!    token's end, so line breaks inside a window survive.
//! 4. Stop once a window reaches the final token; otherwise advance the
//!    start by the stride and repeat.
//!
//! # Example
//!
//! ```rust
//! use docsync_core::chunk::Chunker;
//!
//! let chunker = Chunker::new(4, 1).unwrap();
//! let chunks = chunker.chunk("a b c d e f g");
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].text, "a b c d");
//! assert_eq!(chunks[1].text, "d e f g");
//! ```

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::ChunkDraft;

pub const DEFAULT_MAX_TOKENS: usize = 800;
pub const DEFAULT_OVERLAP_TOKENS: usize = 200;

/// Deterministic sliding-window chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_tokens: usize,
    overlap_tokens: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

impl Chunker {
    /// Create a chunker, rejecting configurations that would never advance.
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        if max_tokens == 0 {
            bail!("max_tokens must be > 0");
        }
        if overlap_tokens >= max_tokens {
            bail!(
                "overlap_tokens ({}) must be smaller than max_tokens ({})",
                overlap_tokens,
                max_tokens
            );
        }
        Ok(Self {
            max_tokens,
            overlap_tokens,
        })
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    /// Distance in tokens between the starts of consecutive windows.
    pub fn stride(&self) -> usize {
        self.max_tokens - self.overlap_tokens
    }

    /// Split `text` into overlapping windows with contiguous indices from 0.
    ///
    /// Text with no tokens yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<ChunkDraft> {
        let spans = token_spans(text);
        let total = spans.len();
        let mut drafts = Vec::new();
        let mut start = 0usize;

        while start < total {
            let end = (start + self.max_tokens).min(total);
            let byte_start = spans[start].0;
            let byte_end = spans[end - 1].1;
            let window = &text[byte_start..byte_end];

            drafts.push(ChunkDraft {
                index: drafts.len() as i64,
                text: window.to_string(),
                token_count: (end - start) as i64,
                hash: hash_text(window),
            });

            if end == total {
                break;
            }
            start += self.stride();
        }

        drafts
    }
}

/// Byte spans of whitespace-delimited tokens.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut current: Option<usize> = None;

    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(start) = current.take() {
                spans.push((start, i));
            }
        } else if current.is_none() {
            current = Some(i);
        }
    }
    if let Some(start) = current {
        spans.push((start, text.len()));
    }

    spans
}

/// Canonical text form used for fingerprints and chunking.
///
/// Line endings become `\n`, a leading byte-order mark is dropped, trailing
/// whitespace is removed from every line, runs of blank lines collapse to
/// one, and the result is trimmed.
pub fn normalize_text(raw: &str) -> String {
    let unified = raw
        .trim_start_matches('\u{feff}')
        .replace("\r\n", "\n")
        .replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

/// Hex SHA-256 of arbitrary text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content fingerprint of already-normalized document text.
pub fn fingerprint(normalized: &str) -> String {
    hash_text(normalized)
}

/// Stable chunk identifier derived from the document id and chunk index.
pub fn chunk_id(document_id: &str, index: i64) -> String {
    let name = format!("{}#{}", document_id, index);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
