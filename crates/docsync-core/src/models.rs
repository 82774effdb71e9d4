//! Core data models shared by the sync pipeline and the retrieval engine.
//!
//! # Data Flow
//!
//! ```text
//! ChangeSource ──► DocumentRef ──► Extractor ──► Extraction
//!                                                   │
//!                                              Chunker::chunk
//!                                                   │
//!                                                   ▼
//!                        ChunkDraft ──► ChunkWrite ──► Store::replace_chunks
//!                                                   │
//!                                                   ▼
//!                                   SourceDocument (status = indexed)
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access-control attributes attached to every document.
///
/// Only `core` and `audience` take part in retrieval filtering; the
/// remaining tag sets are carried through for callers that display or
/// post-filter results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessAttributes {
    /// Core documents are visible to every caller.
    pub core: bool,
    pub audience: BTreeSet<String>,
    pub age_levels: BTreeSet<String>,
    pub geographies: BTreeSet<String>,
    pub governance: BTreeSet<String>,
    pub vouchers: Option<bool>,
}

/// A document as observed by a [`ChangeSource`](crate::capability::ChangeSource).
///
/// This is a metadata snapshot; content is fetched separately through an
/// [`Extractor`](crate::capability::Extractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Stable identifier, unique across the whole source.
    pub id: String,
    pub parent_id: Option<String>,
    /// Breadcrumb of ancestor names, root first. Does not include the title.
    pub path: Vec<String>,
    /// MIME type reported by the source.
    pub content_type: String,
    pub title: String,
    /// Source-side revision marker (checksum, `mtime:size`, ...). When it
    /// matches the stored value the document is not re-extracted.
    pub revision: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub access: AccessAttributes,
    pub created_by: Option<String>,
    pub maintained_by: Option<String>,
}

impl DocumentRef {
    /// Minimal reference with empty metadata, mostly useful in tests and fakes.
    pub fn new(id: impl Into<String>, title: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            path: Vec::new(),
            content_type: content_type.into(),
            title: title.into(),
            revision: None,
            modified_at: None,
            last_reviewed_at: None,
            access: AccessAttributes::default(),
            created_by: None,
            maintained_by: None,
        }
    }

    /// Breadcrumb including the document title as the final segment.
    pub fn breadcrumb(&self) -> Vec<String> {
        let mut crumbs = self.path.clone();
        crumbs.push(self.title.clone());
        crumbs
    }
}

/// Persisted lifecycle status of a document.
///
/// The pipeline stages between `Discovered` and `Indexed` are modelled as
/// types in [`state`](crate::state); this enum is their persisted shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Discovered,
    Extracted,
    Chunked,
    Embedded,
    Indexed,
    Error,
    Deleted,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 7] = [
        DocumentStatus::Discovered,
        DocumentStatus::Extracted,
        DocumentStatus::Chunked,
        DocumentStatus::Embedded,
        DocumentStatus::Indexed,
        DocumentStatus::Error,
        DocumentStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Discovered => "discovered",
            DocumentStatus::Extracted => "extracted",
            DocumentStatus::Chunked => "chunked",
            DocumentStatus::Embedded => "embedded",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Error => "error",
            DocumentStatus::Deleted => "deleted",
        }
    }

    /// Whether chunks of a document in this status may appear in results.
    pub fn is_retrievable(&self) -> bool {
        !matches!(self, DocumentStatus::Error | DocumentStatus::Deleted)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown document status: {}", s))
    }
}

/// A document row as held by the [`Store`](crate::store::Store).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDocument {
    pub id: String,
    pub parent_id: Option<String>,
    pub path: Vec<String>,
    pub content_type: String,
    pub title: String,
    /// SHA-256 of the normalized text committed with the current chunk set.
    pub fingerprint: Option<String>,
    pub source_revision: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub access: AccessAttributes,
    pub created_by: Option<String>,
    pub maintained_by: Option<String>,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub chunk_count: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SourceDocument {
    /// Build a fresh row from a source snapshot.
    pub fn from_ref(doc: &DocumentRef, status: DocumentStatus) -> Self {
        Self {
            id: doc.id.clone(),
            parent_id: doc.parent_id.clone(),
            path: doc.path.clone(),
            content_type: doc.content_type.clone(),
            title: doc.title.clone(),
            fingerprint: None,
            source_revision: None,
            modified_at: doc.modified_at,
            last_reviewed_at: doc.last_reviewed_at,
            access: doc.access.clone(),
            created_by: doc.created_by.clone(),
            maintained_by: doc.maintained_by.clone(),
            status,
            error: None,
            chunk_count: 0,
            last_synced_at: None,
        }
    }

    /// Overwrite every source-owned field with the snapshot (last write wins).
    pub fn apply_ref(&mut self, doc: &DocumentRef) {
        self.parent_id = doc.parent_id.clone();
        self.path = doc.path.clone();
        self.content_type = doc.content_type.clone();
        self.title = doc.title.clone();
        self.modified_at = doc.modified_at;
        self.last_reviewed_at = doc.last_reviewed_at;
        self.access = doc.access.clone();
        self.created_by = doc.created_by.clone();
        self.maintained_by = doc.maintained_by.clone();
    }

    /// True when the snapshot carries metadata that differs from this row.
    ///
    /// `modified_at` is ignored: it moves on every content edit and the
    /// content path already covers that.
    pub fn metadata_differs(&self, doc: &DocumentRef) -> bool {
        self.parent_id != doc.parent_id
            || self.path != doc.path
            || self.content_type != doc.content_type
            || self.title != doc.title
            || self.last_reviewed_at != doc.last_reviewed_at
            || self.access != doc.access
            || self.created_by != doc.created_by
            || self.maintained_by != doc.maintained_by
    }

    pub fn breadcrumb(&self) -> Vec<String> {
        let mut crumbs = self.path.clone();
        crumbs.push(self.title.clone());
        crumbs
    }
}

/// A single entry in a change batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Upserted(DocumentRef),
    Removed { id: String },
    /// The source saw a change but could not describe the document.
    /// Recorded against that document only; the batch still commits.
    Failed { id: String, reason: String },
}

impl ChangeEvent {
    pub fn document_id(&self) -> &str {
        match self {
            ChangeEvent::Upserted(doc) => &doc.id,
            ChangeEvent::Removed { id } | ChangeEvent::Failed { id, .. } => id,
        }
    }
}

/// One page of changes plus the token to resume after it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub events: Vec<ChangeEvent>,
    pub next_token: String,
}

/// Output of a successful extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Normalized plain text.
    pub text: String,
    /// SHA-256 of `text`.
    pub fingerprint: String,
}

impl Extraction {
    /// Normalize raw text and compute its fingerprint.
    pub fn from_raw(raw: &str) -> Self {
        let text = crate::chunk::normalize_text(raw);
        let fingerprint = crate::chunk::fingerprint(&text);
        Self { text, fingerprint }
    }
}

/// Chunk produced by the [`Chunker`](crate::chunk::Chunker), before embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub index: i64,
    pub text: String,
    pub token_count: i64,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// What the store currently holds for one chunk index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunkState {
    pub index: i64,
    pub hash: String,
    pub has_vector: bool,
    pub embedding_model: Option<String>,
    /// Reason the last embedding attempt failed permanently.
    pub embed_error: Option<String>,
}

/// Persisted singleton change-stream position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorState {
    pub token: String,
    pub applied_at: DateTime<Utc>,
}
