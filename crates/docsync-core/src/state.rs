//! Per-document processing state machine.
//!
//! The in-flight pipeline is a chain of stage types. Each stage can only be
//! built by consuming the previous one, so an `Embedded` value without a
//! preceding `Chunked` cannot exist:
//!
//! ```text
//! Discovered ──extracted()──► Extracted ──chunk()──► Chunked ──embedded()──► Embedded
//!     │                           │                                              │
//!     └─ revision guard           └─ fingerprint guard                   into_chunk_set()
//!        (no-op pass)                (no-op pass)                                │
//!                                                                    Store::replace_chunks
//!                                                                     (status = indexed)
//! ```
//!
//! [`DocumentStatus`] is the persisted shadow of these stages plus the side
//! states `Error` and `Deleted`; [`DocumentStatus::can_transition_to`]
//! encodes which persisted transitions are legal.

use crate::chunk::Chunker;
use crate::error::InvariantViolation;
use crate::models::{ChunkDraft, DocumentRef, DocumentStatus, Extraction, SourceDocument};
use crate::reconcile::{ChunkSet, ChunkWrite, EmbeddingUpdate};

impl DocumentStatus {
    /// Whether the orchestrator may move a document from `self` to `next`.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus as S;

        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (_, S::Error)
                | (_, S::Deleted)
                | (S::Discovered, S::Extracted)
                | (S::Discovered, S::Indexed)
                | (S::Extracted, S::Chunked)
                | (S::Extracted, S::Indexed)
                | (S::Chunked, S::Embedded)
                | (S::Embedded, S::Indexed)
                | (S::Indexed, S::Discovered)
                | (S::Error, S::Discovered)
                | (S::Deleted, S::Discovered)
        )
    }
}

/// Check a persisted transition, producing an [`InvariantViolation`] if it
/// is not allowed.
pub fn check_transition(
    document_id: &str,
    from: DocumentStatus,
    to: DocumentStatus,
) -> Result<(), InvariantViolation> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(InvariantViolation {
            document_id: document_id.to_string(),
            detail: format!("illegal status transition {} -> {}", from, to),
        })
    }
}

/// A document that entered the pipeline.
#[derive(Debug, Clone)]
pub struct Discovered {
    doc: DocumentRef,
    stored: Option<SourceDocument>,
    force: bool,
}

impl Discovered {
    /// `force` bypasses both no-op guards (manual re-index).
    pub fn new(doc: DocumentRef, stored: Option<SourceDocument>, force: bool) -> Self {
        Self { doc, stored, force }
    }

    pub fn doc(&self) -> &DocumentRef {
        &self.doc
    }

    pub fn stored(&self) -> Option<&SourceDocument> {
        self.stored.as_ref()
    }

    /// Revision guard: the source reports the same revision that was
    /// committed with the current chunk set.
    pub fn revision_unchanged(&self) -> bool {
        if self.force {
            return false;
        }
        match (&self.stored, &self.doc.revision) {
            (Some(stored), Some(revision)) => {
                stored.status == DocumentStatus::Indexed
                    && stored.source_revision.as_deref() == Some(revision.as_str())
            }
            _ => false,
        }
    }

    /// Source metadata differs from the stored row.
    pub fn metadata_changed(&self) -> bool {
        self.stored
            .as_ref()
            .map(|s| s.metadata_differs(&self.doc))
            .unwrap_or(true)
    }

    pub fn extracted(self, extraction: Extraction) -> Extracted {
        Extracted {
            doc: self.doc,
            stored: self.stored,
            force: self.force,
            extraction,
        }
    }
}

/// Text and fingerprint are known.
#[derive(Debug, Clone)]
pub struct Extracted {
    doc: DocumentRef,
    stored: Option<SourceDocument>,
    force: bool,
    extraction: Extraction,
}

impl Extracted {
    pub fn doc(&self) -> &DocumentRef {
        &self.doc
    }

    pub fn fingerprint(&self) -> &str {
        &self.extraction.fingerprint
    }

    /// Fingerprint guard: the content is identical to the committed chunk set.
    pub fn fingerprint_unchanged(&self) -> bool {
        if self.force {
            return false;
        }
        self.stored
            .as_ref()
            .map(|s| {
                s.status == DocumentStatus::Indexed
                    && s.fingerprint.as_deref() == Some(self.extraction.fingerprint.as_str())
            })
            .unwrap_or(false)
    }

    pub fn metadata_changed(&self) -> bool {
        self.stored
            .as_ref()
            .map(|s| s.metadata_differs(&self.doc))
            .unwrap_or(true)
    }

    pub fn chunk(self, chunker: &Chunker) -> Chunked {
        let drafts = chunker.chunk(&self.extraction.text);
        Chunked {
            doc: self.doc,
            fingerprint: self.extraction.fingerprint,
            drafts,
        }
    }
}

/// Drafts are computed; vectors are not.
#[derive(Debug, Clone)]
pub struct Chunked {
    doc: DocumentRef,
    fingerprint: String,
    drafts: Vec<ChunkDraft>,
}

impl Chunked {
    pub fn doc(&self) -> &DocumentRef {
        &self.doc
    }

    pub fn drafts(&self) -> &[ChunkDraft] {
        &self.drafts
    }

    /// Attach one embedding instruction per draft, in draft order.
    pub fn embedded(self, updates: Vec<EmbeddingUpdate>) -> Result<Embedded, InvariantViolation> {
        if updates.len() != self.drafts.len() {
            return Err(InvariantViolation {
                document_id: self.doc.id,
                detail: format!(
                    "{} embedding updates for {} chunks",
                    updates.len(),
                    self.drafts.len()
                ),
            });
        }
        let writes = self
            .drafts
            .into_iter()
            .zip(updates)
            .map(|(draft, embedding)| ChunkWrite { draft, embedding })
            .collect();
        Ok(Embedded {
            doc: self.doc,
            fingerprint: self.fingerprint,
            writes,
        })
    }
}

/// Every chunk has a vector instruction; ready to commit.
#[derive(Debug, Clone)]
pub struct Embedded {
    doc: DocumentRef,
    fingerprint: String,
    writes: Vec<ChunkWrite>,
}

impl Embedded {
    pub fn doc(&self) -> &DocumentRef {
        &self.doc
    }

    pub fn into_chunk_set(self) -> Result<ChunkSet, InvariantViolation> {
        ChunkSet::new(self.doc.id, self.fingerprint, self.doc.revision, self.writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DocumentStatus as S;

    fn indexed_row(doc: &DocumentRef, fingerprint: &str, revision: Option<&str>) -> SourceDocument {
        let mut row = SourceDocument::from_ref(doc, S::Indexed);
        row.fingerprint = Some(fingerprint.to_string());
        row.source_revision = revision.map(str::to_string);
        row
    }

    #[test]
    fn test_pipeline_transitions_allowed() {
        assert!(S::Discovered.can_transition_to(S::Extracted));
        assert!(S::Extracted.can_transition_to(S::Chunked));
        assert!(S::Chunked.can_transition_to(S::Embedded));
        assert!(S::Embedded.can_transition_to(S::Indexed));
        assert!(S::Error.can_transition_to(S::Discovered));
        assert!(S::Deleted.can_transition_to(S::Discovered));
    }

    #[test]
    fn test_skipping_stages_rejected() {
        assert!(!S::Discovered.can_transition_to(S::Embedded));
        assert!(!S::Chunked.can_transition_to(S::Indexed));
        assert!(!S::Deleted.can_transition_to(S::Indexed));
        assert!(check_transition("d1", S::Discovered, S::Chunked).is_err());
    }

    #[test]
    fn test_error_reachable_from_everywhere() {
        for status in DocumentStatus::ALL {
            assert!(status.can_transition_to(S::Error));
            assert!(status.can_transition_to(S::Deleted));
        }
    }

    #[test]
    fn test_revision_guard() {
        let mut doc = DocumentRef::new("d1", "T", "text/plain");
        doc.revision = Some("r1".into());
        let row = indexed_row(&doc, "fp", Some("r1"));

        assert!(Discovered::new(doc.clone(), Some(row.clone()), false).revision_unchanged());
        assert!(!Discovered::new(doc.clone(), Some(row.clone()), true).revision_unchanged());

        let mut errored = row;
        errored.status = S::Error;
        assert!(!Discovered::new(doc, Some(errored), false).revision_unchanged());
    }

    #[test]
    fn test_fingerprint_guard() {
        let doc = DocumentRef::new("d1", "T", "text/plain");
        let extraction = Extraction::from_raw("hello world");
        let row = indexed_row(&doc, &extraction.fingerprint, None);

        let same = Discovered::new(doc.clone(), Some(row.clone()), false).extracted(extraction.clone());
        assert!(same.fingerprint_unchanged());

        let changed = Discovered::new(doc, Some(row), false).extracted(Extraction::from_raw("hello there"));
        assert!(!changed.fingerprint_unchanged());
    }

    #[test]
    fn test_stages_build_chunk_set() {
        let doc = DocumentRef::new("d1", "T", "text/plain");
        let chunker = Chunker::new(2, 1).unwrap();
        let chunked = Discovered::new(doc, None, false)
            .extracted(Extraction::from_raw("a b c"))
            .chunk(&chunker);
        assert_eq!(chunked.drafts().len(), 2);

        let updates = vec![EmbeddingUpdate::Missing; 2];
        let set = chunked.embedded(updates).unwrap().into_chunk_set().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.document_id(), "d1");
    }

    #[test]
    fn test_embedded_rejects_mismatched_updates() {
        let doc = DocumentRef::new("d1", "T", "text/plain");
        let chunked = Discovered::new(doc, None, false)
            .extracted(Extraction::from_raw("a b c"))
            .chunk(&Chunker::new(2, 1).unwrap());
        assert!(chunked.embedded(vec![EmbeddingUpdate::Missing]).is_err());
    }
}
