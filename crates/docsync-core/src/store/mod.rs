//! Storage abstraction for docsync.
//!
//! The [`Store`] trait covers everything the sync pipeline writes and the
//! retrieval engine reads. [`CursorStore`] holds the singleton change-stream
//! position. Both are implemented by [`memory::InMemoryStore`] here and by
//! the SQLite store in the application crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CursorState, DocumentRef, DocumentStatus, SourceDocument, StoredChunkState};
use crate::reconcile::{ChunkSet, ReconcileReport};
use crate::search::AccessContext;

/// Document fields the retrieval engine needs for filtering, fusion and
/// presentation, carried on every candidate so ranking needs no extra
/// round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateDocument {
    pub title: String,
    pub path: Vec<String>,
    pub core: bool,
    pub audience: BTreeSet<String>,
    pub status: DocumentStatus,
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

/// A chunk returned from keyword or vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    /// Backend score: BM25-derived relevance (higher is better) or cosine
    /// similarity.
    pub raw_score: f64,
    pub text: String,
    pub document: CandidateDocument,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_document`](Store::get_document) | Read one document row |
/// | [`upsert_document`](Store::upsert_document) | Insert or overwrite source metadata |
/// | [`chunk_states`](Store::chunk_states) | Stored hashes for reconciliation |
/// | [`replace_chunks`](Store::replace_chunks) | Transactionally reconcile a chunk set |
/// | [`mark_error`](Store::mark_error) | Put a document in the error state |
/// | [`delete_document`](Store::delete_document) | Tombstone a document |
/// | [`active_document_ids`](Store::active_document_ids) | Ids of non-deleted documents |
/// | [`keyword_search`](Store::keyword_search) | Lexical candidates |
/// | [`vector_search`](Store::vector_search) | Cosine candidates |
/// | [`status_counts`](Store::status_counts) | Documents per status |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>>;

    /// Insert or overwrite a document's source metadata and set its status.
    ///
    /// Last write wins on every metadata field. The committed fingerprint,
    /// revision and chunks are left alone; they only change through
    /// [`replace_chunks`](Store::replace_chunks).
    async fn upsert_document(&self, doc: &DocumentRef, status: DocumentStatus) -> Result<String>;

    async fn chunk_states(&self, doc_id: &str) -> Result<Vec<StoredChunkState>>;

    /// Reconcile stored chunks against `set` in a single transaction.
    ///
    /// Chunks at indices past the new length are deleted with their
    /// lexical entries and vectors. Chunks with an identical hash and a
    /// [`Keep`](crate::reconcile::EmbeddingUpdate::Keep) instruction are not
    /// touched. Changed chunks are rewritten and their vector replaced or
    /// dropped. On commit the document records the set's fingerprint and
    /// revision and becomes `indexed`.
    async fn replace_chunks(&self, set: &ChunkSet) -> Result<ReconcileReport>;

    async fn mark_error(&self, doc_id: &str, reason: &str) -> Result<()>;

    /// Purge chunks, lexical entries and vectors, keeping a `deleted`
    /// tombstone row. Returns false if no live document existed.
    async fn delete_document(&self, doc_id: &str) -> Result<bool>;

    async fn active_document_ids(&self) -> Result<Vec<String>>;

    /// Lexical candidates visible to `access`, best first.
    async fn keyword_search(
        &self,
        query: &str,
        access: &AccessContext,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Vector candidates visible to `access`, most similar first. Chunks
    /// without a vector are never returned.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        access: &AccessContext,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    async fn status_counts(&self) -> Result<Vec<(DocumentStatus, i64)>>;
}

/// Singleton change-stream cursor with compare-and-swap commits.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> Result<Option<CursorState>>;

    /// Replace the token only if the stored one equals `expected`
    /// (`None` meaning no cursor yet). Returns whether the swap happened.
    async fn commit(&self, expected: Option<&str>, next: &str) -> Result<bool>;

    /// Forget the cursor so the next poll bootstraps.
    async fn reset(&self) -> Result<()>;
}

/// Shared visibility rule applied by every store and re-checked by the
/// retrieval engine.
pub fn is_visible(document: &CandidateDocument, chunk_failed: bool, access: &AccessContext) -> bool {
    !chunk_failed && document.status.is_retrievable() && access.permits(document.core, &document.audience)
}
