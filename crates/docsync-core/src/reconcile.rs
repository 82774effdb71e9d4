//! Chunk-set reconciliation planning.
//!
//! Before writing, the orchestrator compares freshly computed
//! [`ChunkDraft`]s with what the store already holds for the document
//! ([`StoredChunkState`]). Chunks whose hash is unchanged and which already
//! carry a vector from the active model are reused; everything else is
//! embedded again. The resulting [`ChunkSet`] is handed to
//! [`Store::replace_chunks`](crate::store::Store::replace_chunks), which
//! applies it in one transaction.

use std::collections::HashMap;

use crate::error::InvariantViolation;
use crate::models::{ChunkDraft, StoredChunkState};

/// What the store should do with a chunk's vector.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingUpdate {
    /// Leave the stored vector in place. Only meaningful when the stored
    /// hash equals the new hash; otherwise the store drops the vector.
    Keep,
    Set { vector: Vec<f32>, model: String },
    /// No embedder configured; the chunk is lexical-only.
    Missing,
    /// Embedding failed permanently; the chunk is excluded from retrieval.
    Failed { reason: String },
}

/// A chunk to persist together with its vector instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkWrite {
    pub draft: ChunkDraft,
    pub embedding: EmbeddingUpdate,
}

/// A validated, complete chunk set for one document.
///
/// Indices are guaranteed to be exactly `0..len`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSet {
    document_id: String,
    fingerprint: String,
    source_revision: Option<String>,
    writes: Vec<ChunkWrite>,
}

impl ChunkSet {
    pub fn new(
        document_id: impl Into<String>,
        fingerprint: impl Into<String>,
        source_revision: Option<String>,
        writes: Vec<ChunkWrite>,
    ) -> Result<Self, InvariantViolation> {
        let document_id = document_id.into();
        for (position, write) in writes.iter().enumerate() {
            if write.draft.index != position as i64 {
                return Err(InvariantViolation {
                    document_id,
                    detail: format!(
                        "chunk at position {} has index {}",
                        position, write.draft.index
                    ),
                });
            }
        }
        Ok(Self {
            document_id,
            fingerprint: fingerprint.into(),
            source_revision,
            writes,
        })
    }

    /// A set with no chunks, used for unsupported content.
    pub fn empty(
        document_id: impl Into<String>,
        fingerprint: impl Into<String>,
        source_revision: Option<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            fingerprint: fingerprint.into(),
            source_revision,
            writes: Vec::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn source_revision(&self) -> Option<&str> {
        self.source_revision.as_deref()
    }

    pub fn writes(&self) -> &[ChunkWrite] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Row-level effect of a `replace_chunks` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl ReconcileReport {
    /// Number of chunk rows written or removed.
    pub fn chunk_writes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Per-chunk embedding decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedDecision {
    /// Stored chunk already matches; reuse its vector (or its absence).
    Reuse,
    /// Text is new or changed, or the stored vector is missing or stale.
    Embed,
    /// Embedding disabled and the chunk text changed.
    Skip,
}

/// Decide, chunk by chunk, which drafts need an embedding call.
///
/// `model` is the active embedder's model name, `None` when embedding is
/// disabled. A stored chunk with the same hash is reused only if its
/// vector came from the same model.
pub fn plan_embeddings(
    drafts: &[ChunkDraft],
    existing: &[StoredChunkState],
    model: Option<&str>,
) -> Vec<EmbedDecision> {
    let by_index: HashMap<i64, &StoredChunkState> =
        existing.iter().map(|s| (s.index, s)).collect();

    drafts
        .iter()
        .map(|draft| {
            let stored = by_index.get(&draft.index).filter(|s| s.hash == draft.hash);
            match (model, stored) {
                (Some(model), Some(s))
                    if s.has_vector && s.embedding_model.as_deref() == Some(model) =>
                {
                    EmbedDecision::Reuse
                }
                (Some(_), _) => EmbedDecision::Embed,
                (None, Some(_)) => EmbedDecision::Reuse,
                (None, None) => EmbedDecision::Skip,
            }
        })
        .collect()
}
