//! In-memory [`Store`] and [`CursorStore`] for tests and embedding.
//!
//! All state sits behind one `RwLock`, so every trait call is atomic with
//! respect to the others. Keyword search counts matching query terms per
//! chunk; vector search is brute-force cosine similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::chunk::chunk_id;
use crate::embedding::cosine_similarity;
use crate::models::{CursorState, DocumentRef, DocumentStatus, SourceDocument, StoredChunkState};
use crate::reconcile::{ChunkSet, EmbeddingUpdate, ReconcileReport};
use crate::search::AccessContext;

use super::{is_visible, CandidateDocument, ChunkCandidate, CursorStore, Store};

struct MemChunk {
    id: String,
    text: String,
    hash: String,
    token_count: i64,
    vector: Option<(Vec<f32>, String)>,
    embed_error: Option<String>,
}

impl MemChunk {
    fn apply_embedding(&mut self, update: &EmbeddingUpdate, text_changed: bool) {
        match update {
            EmbeddingUpdate::Keep => {
                if text_changed {
                    self.vector = None;
                    self.embed_error = None;
                }
            }
            EmbeddingUpdate::Set { vector, model } => {
                self.vector = Some((vector.clone(), model.clone()));
                self.embed_error = None;
            }
            EmbeddingUpdate::Missing => {
                self.vector = None;
                self.embed_error = None;
            }
            EmbeddingUpdate::Failed { reason } => {
                self.vector = None;
                self.embed_error = Some(reason.clone());
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    docs: HashMap<String, SourceDocument>,
    chunks: HashMap<String, BTreeMap<i64, MemChunk>>,
    cursor: Option<CursorState>,
    writes: u64,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls that changed stored state.
    pub fn write_count(&self) -> u64 {
        self.state.read().map(|s| s.writes).unwrap_or(0)
    }

    /// Stored vector for a chunk, if any.
    pub fn vector(&self, doc_id: &str, index: i64) -> Option<Vec<f32>> {
        let state = self.state.read().ok()?;
        state
            .chunks
            .get(doc_id)?
            .get(&index)?
            .vector
            .as_ref()
            .map(|(v, _)| v.clone())
    }

    /// Stored chunk texts for a document, in index order.
    pub fn chunk_texts(&self, doc_id: &str) -> Vec<String> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        state
            .chunks
            .get(doc_id)
            .map(|chunks| chunks.values().map(|c| c.text.clone()).collect())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn candidate_document(doc: &SourceDocument) -> CandidateDocument {
    CandidateDocument {
        title: doc.title.clone(),
        path: doc.path.clone(),
        core: doc.access.core,
        audience: doc.access.audience.clone(),
        status: doc.status,
        last_reviewed_at: doc.last_reviewed_at,
    }
}

fn by_score_desc(a: &ChunkCandidate, b: &ChunkCandidate) -> std::cmp::Ordering {
    b.raw_score
        .total_cmp(&a.raw_score)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>> {
        Ok(self.read()?.docs.get(id).cloned())
    }

    async fn upsert_document(&self, doc: &DocumentRef, status: DocumentStatus) -> Result<String> {
        let mut state = self.write()?;
        match state.docs.get_mut(&doc.id) {
            Some(existing) => {
                existing.apply_ref(doc);
                existing.status = status;
                if status != DocumentStatus::Error {
                    existing.error = None;
                }
            }
            None => {
                state
                    .docs
                    .insert(doc.id.clone(), SourceDocument::from_ref(doc, status));
            }
        }
        state.writes += 1;
        Ok(doc.id.clone())
    }

    async fn chunk_states(&self, doc_id: &str) -> Result<Vec<StoredChunkState>> {
        let state = self.read()?;
        Ok(state
            .chunks
            .get(doc_id)
            .map(|chunks| {
                chunks
                    .iter()
                    .map(|(index, c)| StoredChunkState {
                        index: *index,
                        hash: c.hash.clone(),
                        has_vector: c.vector.is_some(),
                        embedding_model: c.vector.as_ref().map(|(_, m)| m.clone()),
                        embed_error: c.embed_error.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_chunks(&self, set: &ChunkSet) -> Result<ReconcileReport> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let doc_id = set.document_id();

        let Some(doc) = state.docs.get_mut(doc_id) else {
            bail!("cannot replace chunks of unknown document {}", doc_id);
        };

        let mut report = ReconcileReport::default();
        let chunks = state.chunks.entry(doc_id.to_string()).or_default();
        let new_len = set.len() as i64;

        let stale: Vec<i64> = chunks.range(new_len..).map(|(i, _)| *i).collect();
        for index in stale {
            chunks.remove(&index);
            report.deleted += 1;
        }

        for write in set.writes() {
            let draft = &write.draft;
            match chunks.get_mut(&draft.index) {
                Some(existing)
                    if existing.hash == draft.hash
                        && write.embedding == EmbeddingUpdate::Keep =>
                {
                    report.unchanged += 1;
                }
                Some(existing) => {
                    let text_changed = existing.hash != draft.hash;
                    existing.text = draft.text.clone();
                    existing.hash = draft.hash.clone();
                    existing.token_count = draft.token_count;
                    existing.apply_embedding(&write.embedding, text_changed);
                    report.updated += 1;
                }
                None => {
                    let mut chunk = MemChunk {
                        id: chunk_id(doc_id, draft.index),
                        text: draft.text.clone(),
                        hash: draft.hash.clone(),
                        token_count: draft.token_count,
                        vector: None,
                        embed_error: None,
                    };
                    chunk.apply_embedding(&write.embedding, true);
                    chunks.insert(draft.index, chunk);
                    report.inserted += 1;
                }
            }
        }

        doc.fingerprint = Some(set.fingerprint().to_string());
        doc.source_revision = set.source_revision().map(str::to_string);
        doc.status = DocumentStatus::Indexed;
        doc.error = None;
        doc.chunk_count = new_len;
        doc.last_synced_at = Some(Utc::now());
        state.writes += 1;

        Ok(report)
    }

    async fn mark_error(&self, doc_id: &str, reason: &str) -> Result<()> {
        let mut state = self.write()?;
        let Some(doc) = state.docs.get_mut(doc_id) else {
            bail!("cannot mark unknown document {} as failed", doc_id);
        };
        doc.status = DocumentStatus::Error;
        doc.error = Some(reason.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let Some(doc) = state.docs.get_mut(doc_id) else {
            return Ok(false);
        };
        if doc.status == DocumentStatus::Deleted {
            return Ok(false);
        }
        doc.status = DocumentStatus::Deleted;
        doc.fingerprint = None;
        doc.source_revision = None;
        doc.chunk_count = 0;
        doc.error = None;
        state.chunks.remove(doc_id);
        state.writes += 1;
        Ok(true)
    }

    async fn active_document_ids(&self) -> Result<Vec<String>> {
        let state = self.read()?;
        let mut ids: Vec<String> = state
            .docs
            .values()
            .filter(|d| d.status != DocumentStatus::Deleted)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn keyword_search(
        &self,
        query: &str,
        access: &AccessContext,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.read()?;
        let mut candidates = Vec::new();
        for (doc_id, chunks) in &state.chunks {
            let Some(doc) = state.docs.get(doc_id) else {
                continue;
            };
            let document = candidate_document(doc);
            for (index, chunk) in chunks {
                if !is_visible(&document, chunk.embed_error.is_some(), access) {
                    continue;
                }
                let text_lower = chunk.text.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                if matches > 0 {
                    candidates.push(ChunkCandidate {
                        chunk_id: chunk.id.clone(),
                        document_id: doc_id.clone(),
                        chunk_index: *index,
                        raw_score: matches as f64,
                        text: chunk.text.clone(),
                        document: document.clone(),
                    });
                }
            }
        }

        candidates.sort_by(by_score_desc);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        access: &AccessContext,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let state = self.read()?;
        let mut candidates = Vec::new();
        for (doc_id, chunks) in &state.chunks {
            let Some(doc) = state.docs.get(doc_id) else {
                continue;
            };
            let document = candidate_document(doc);
            for (index, chunk) in chunks {
                let Some((vector, _)) = &chunk.vector else {
                    continue;
                };
                if !is_visible(&document, chunk.embed_error.is_some(), access) {
                    continue;
                }
                candidates.push(ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    document_id: doc_id.clone(),
                    chunk_index: *index,
                    raw_score: cosine_similarity(query_vec, vector) as f64,
                    text: chunk.text.clone(),
                    document: document.clone(),
                });
            }
        }

        candidates.sort_by(by_score_desc);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn status_counts(&self) -> Result<Vec<(DocumentStatus, i64)>> {
        let state = self.read()?;
        Ok(DocumentStatus::ALL
            .iter()
            .map(|status| {
                let count = state.docs.values().filter(|d| d.status == *status).count();
                (*status, count as i64)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }
}

#[async_trait]
impl CursorStore for InMemoryStore {
    async fn load(&self) -> Result<Option<CursorState>> {
        Ok(self.read()?.cursor.clone())
    }

    async fn commit(&self, expected: Option<&str>, next: &str) -> Result<bool> {
        let mut state = self.write()?;
        let current = state.cursor.as_ref().map(|c| c.token.as_str());
        if current != expected {
            return Ok(false);
        }
        state.cursor = Some(CursorState {
            token: next.to_string(),
            applied_at: Utc::now(),
        });
        state.writes += 1;
        Ok(true)
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.write()?;
        state.cursor = None;
        state.writes += 1;
        Ok(())
    }
}
