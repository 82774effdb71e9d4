//! Orchestrator scenarios over the in-memory store with scripted sources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use docsync::config::FilesystemSourceConfig;
use docsync::source_fs::FilesystemSource;
use docsync::sync::{DocOutcome, Orchestrator, SyncSettings};
use docsync_core::capability::{ChangeSource, DocumentStream, Embedder, Extractor};
use docsync_core::chunk::{hash_text, Chunker};
use docsync_core::error::CapabilityError;
use docsync_core::models::{
    ChangeBatch, ChangeEvent, DocumentRef, DocumentStatus, Extraction, SourceDocument,
    StoredChunkState,
};
use docsync_core::reconcile::{ChunkSet, ReconcileReport};
use docsync_core::search::AccessContext;
use docsync_core::store::memory::InMemoryStore;
use docsync_core::store::{ChunkCandidate, CursorStore, Store};

// ============ Fakes ============

#[derive(Default)]
struct FakeSource {
    docs: Mutex<BTreeMap<String, (DocumentRef, String)>>,
    pending: Mutex<Vec<ChangeEvent>>,
    /// Events already handed out per token; polling a token again replays them.
    issued: Mutex<HashMap<String, Vec<ChangeEvent>>>,
    head: AtomicU64,
    extract_failures: Mutex<HashMap<String, CapabilityError>>,
    fail_poll: AtomicBool,
    broken_enumeration: AtomicBool,
}

impl FakeSource {
    fn put(&self, id: &str, text: &str) -> DocumentRef {
        self.put_with_revision(id, text, &hash_text(text)[..12])
    }

    fn put_with_revision(&self, id: &str, text: &str, revision: &str) -> DocumentRef {
        let mut doc = DocumentRef::new(id, format!("{} title", id), "text/plain");
        doc.revision = Some(revision.to_string());
        doc.access.core = true;
        self.docs
            .lock()
            .unwrap()
            .insert(id.to_string(), (doc.clone(), text.to_string()));
        doc
    }

    fn remove(&self, id: &str) {
        self.docs.lock().unwrap().remove(id);
    }

    fn push(&self, event: ChangeEvent) {
        self.pending.lock().unwrap().push(event);
    }

    fn fail_extract(&self, id: &str, err: CapabilityError) {
        self.extract_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), err);
    }

    fn heal_extract(&self, id: &str) {
        self.extract_failures.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl ChangeSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start_token(&self) -> Result<String, CapabilityError> {
        Ok(format!("t{}", self.head.load(Ordering::SeqCst)))
    }

    async fn bootstrap(&self) -> Result<DocumentStream, CapabilityError> {
        let mut items: Vec<Result<DocumentRef, CapabilityError>> = self
            .docs
            .lock()
            .unwrap()
            .values()
            .map(|(doc, _)| Ok(doc.clone()))
            .collect();
        if self.broken_enumeration.load(Ordering::SeqCst) {
            items.push(Err(CapabilityError::permanent("listing failed")));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn poll_changes(&self, token: &str) -> Result<ChangeBatch, CapabilityError> {
        if self.fail_poll.load(Ordering::SeqCst) {
            return Err(CapabilityError::transient("changes endpoint unavailable"));
        }
        let mut issued = self.issued.lock().unwrap();
        let mut events = issued.get(token).cloned().unwrap_or_default();
        events.extend(std::mem::take(&mut *self.pending.lock().unwrap()));
        issued.insert(token.to_string(), events.clone());
        let next = self.head.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ChangeBatch {
            events,
            next_token: format!("t{}", next),
        })
    }

    async fn describe(&self, id: &str) -> Result<Option<DocumentRef>, CapabilityError> {
        Ok(self.docs.lock().unwrap().get(id).map(|(doc, _)| doc.clone()))
    }
}

#[async_trait]
impl Extractor for FakeSource {
    async fn extract(&self, doc: &DocumentRef) -> Result<Extraction, CapabilityError> {
        if let Some(err) = self.extract_failures.lock().unwrap().get(&doc.id) {
            return Err(err.clone());
        }
        let docs = self.docs.lock().unwrap();
        let (_, text) = docs
            .get(&doc.id)
            .ok_or_else(|| CapabilityError::permanent("document vanished"))?;
        Ok(Extraction::from_raw(text))
    }
}

#[derive(Default)]
struct FakeEmbedder {
    calls: Mutex<Vec<String>>,
    reject: Mutex<HashSet<String>>,
}

impl FakeEmbedder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embed"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        self.calls.lock().unwrap().push(text.to_string());
        if self.reject.lock().unwrap().contains(text) {
            return Err(CapabilityError::permanent("input rejected"));
        }
        Ok(vec![text.len() as f32, 1.0, 0.5])
    }
}

/// Delegates to an in-memory store, failing chosen writes.
struct FlakyStore {
    inner: Arc<InMemoryStore>,
    replaces: AtomicUsize,
    /// 1-based `replace_chunks` call that fails.
    fail_replace_at: AtomicUsize,
    fail_deletes: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            replaces: AtomicUsize::new(0),
            fail_replace_at: AtomicUsize::new(0),
            fail_deletes: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get_document(&self, id: &str) -> anyhow::Result<Option<SourceDocument>> {
        self.inner.get_document(id).await
    }

    async fn upsert_document(&self, doc: &DocumentRef, status: DocumentStatus) -> anyhow::Result<String> {
        self.inner.upsert_document(doc, status).await
    }

    async fn chunk_states(&self, doc_id: &str) -> anyhow::Result<Vec<StoredChunkState>> {
        self.inner.chunk_states(doc_id).await
    }

    async fn replace_chunks(&self, set: &ChunkSet) -> anyhow::Result<ReconcileReport> {
        let call = self.replaces.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_replace_at.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.inner.replace_chunks(set).await
    }

    async fn mark_error(&self, doc_id: &str, reason: &str) -> anyhow::Result<()> {
        self.inner.mark_error(doc_id, reason).await
    }

    async fn delete_document(&self, doc_id: &str) -> anyhow::Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.inner.delete_document(doc_id).await
    }

    async fn active_document_ids(&self) -> anyhow::Result<Vec<String>> {
        self.inner.active_document_ids().await
    }

    async fn keyword_search(
        &self,
        query: &str,
        access: &AccessContext,
        limit: usize,
    ) -> anyhow::Result<Vec<ChunkCandidate>> {
        self.inner.keyword_search(query, access, limit).await
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        access: &AccessContext,
        limit: usize,
    ) -> anyhow::Result<Vec<ChunkCandidate>> {
        self.inner.vector_search(query_vec, access, limit).await
    }

    async fn status_counts(&self) -> anyhow::Result<Vec<(DocumentStatus, i64)>> {
        self.inner.status_counts().await
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    cursor: Arc<InMemoryStore>,
    source: Arc<FakeSource>,
    embedder: Arc<FakeEmbedder>,
    flaky: Arc<FlakyStore>,
    orchestrator: Arc<Orchestrator>,
}

fn harness_with(embed: bool) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let cursor = Arc::new(InMemoryStore::new());
    let source = Arc::new(FakeSource::default());
    let embedder = Arc::new(FakeEmbedder::default());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let settings = SyncSettings {
        chunker: Chunker::new(4, 0).unwrap(),
        ..SyncSettings::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        flaky.clone(),
        cursor.clone(),
        source.clone(),
        source.clone(),
        if embed {
            Some(embedder.clone() as Arc<dyn Embedder>)
        } else {
            None
        },
        settings,
    ));
    Harness {
        store,
        cursor,
        source,
        embedder,
        flaky,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(true)
}

async fn cursor_token(h: &Harness) -> Option<String> {
    h.cursor.load().await.unwrap().map(|c| c.token)
}

async fn status(h: &Harness, id: &str) -> DocumentStatus {
    h.store.get_document(id).await.unwrap().unwrap().status
}

const V1: &str = "a1 a2 a3 a4 b1 b2 b3 b4 c1 c2 c3 c4";
const V2: &str = "a1 a2 a3 a4 b1 b2 b3 b4 x1 x2 x3 x4 y1 y2";

// ============ Scenarios ============

#[tokio::test]
async fn test_bootstrap_then_rerun_writes_nothing() {
    let h = harness();
    h.source.put("d1", V1);
    h.source.put("d2", "hello world");
    let cancel = CancellationToken::new();

    let report = h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert_eq!(report.seen, 2);
    assert_eq!(report.indexed, 2);
    assert!(report.cursor_advanced);
    assert_eq!(cursor_token(&h).await.as_deref(), Some("t0"));
    assert_eq!(status(&h, "d1").await, DocumentStatus::Indexed);
    assert_eq!(h.store.chunk_texts("d1").len(), 3);

    let writes = h.store.write_count();
    let embeds = h.embedder.calls().len();

    let report = h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert_eq!(report.unchanged, 2);
    assert_eq!(report.indexed, 0);
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.embedder.calls().len(), embeds);
}

#[tokio::test]
async fn test_changed_document_reembeds_only_changed_chunks() {
    let h = harness();
    h.source.put("D", V1);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert_eq!(h.embedder.calls().len(), 3);
    let first_vector = h.store.vector("D", 0).unwrap();

    let doc = h.source.put("D", V2);
    h.source.push(ChangeEvent::Upserted(doc));
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert!(report.cursor_advanced);

    let new_calls: HashSet<String> = h.embedder.calls()[3..].iter().cloned().collect();
    let expected: HashSet<String> = ["x1 x2 x3 x4", "y1 y2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(new_calls, expected);

    assert_eq!(h.store.vector("D", 0), Some(first_vector));
    assert!(h.store.vector("D", 3).is_some());

    let stored = h.store.get_document("D").await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Indexed);
    assert_eq!(stored.chunk_count, 4);
    assert_eq!(
        stored.fingerprint.as_deref(),
        Some(Extraction::from_raw(V2).fingerprint.as_str())
    );
}

#[tokio::test]
async fn test_new_revision_with_same_text_is_unchanged() {
    let h = harness();
    h.source.put("d1", V1);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();
    let embeds = h.embedder.calls().len();

    let doc = h.source.put_with_revision("d1", V1, "touched");
    h.source.push(ChangeEvent::Upserted(doc));
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(h.embedder.calls().len(), embeds);
}

#[tokio::test]
async fn test_metadata_change_updates_without_reembedding() {
    let h = harness();
    let mut doc = h.source.put("d1", V1);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();
    let embeds = h.embedder.calls().len();

    doc.title = "Renamed".to_string();
    h.source
        .docs
        .lock()
        .unwrap()
        .insert("d1".to_string(), (doc.clone(), V1.to_string()));
    h.source.push(ChangeEvent::Upserted(doc));

    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.metadata_updated, 1);
    assert_eq!(h.embedder.calls().len(), embeds);
    let stored = h.store.get_document("d1").await.unwrap().unwrap();
    assert_eq!(stored.title, "Renamed");
    assert_eq!(stored.status, DocumentStatus::Indexed);
}

#[tokio::test]
async fn test_poll_failure_keeps_cursor() {
    let h = harness();
    h.source.put("d1", V1);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();

    h.source.fail_poll.store(true, Ordering::SeqCst);
    assert!(h.orchestrator.poll(&cancel).await.is_err());
    assert_eq!(cursor_token(&h).await.as_deref(), Some("t0"));

    h.source.fail_poll.store(false, Ordering::SeqCst);
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert!(report.cursor_advanced);
    assert_eq!(cursor_token(&h).await.as_deref(), Some("t1"));
}

#[tokio::test]
async fn test_poll_without_cursor_bootstraps() {
    let h = harness();
    h.source.put("d1", V1);
    let report = h
        .orchestrator
        .poll(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert!(cursor_token(&h).await.is_some());
}

#[tokio::test]
async fn test_extraction_failure_is_isolated_and_recovers_by_reindex() {
    let h = harness();
    h.source.put("good", "enrollment opens in may");
    h.source.put("bad", "enrollment policy for partners");
    h.source
        .fail_extract("bad", CapabilityError::permanent("export refused"));

    let report = h
        .orchestrator
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.failed, 1);
    // A per-document failure does not hold back the cursor.
    assert!(report.cursor_advanced);

    let bad = h.store.get_document("bad").await.unwrap().unwrap();
    assert_eq!(bad.status, DocumentStatus::Error);
    assert!(bad.error.unwrap().contains("export refused"));

    let everyone = AccessContext::default();
    let hits = h.store.keyword_search("policy", &everyone, 10).await.unwrap();
    assert!(hits.is_empty());

    h.source.heal_extract("bad");
    let outcome = h.orchestrator.reindex("bad").await.unwrap();
    assert!(matches!(outcome, DocOutcome::Indexed(_)));

    let bad = h.store.get_document("bad").await.unwrap().unwrap();
    assert_eq!(bad.status, DocumentStatus::Indexed);
    assert!(bad.error.is_none());
    let hits = h.store.keyword_search("policy", &everyone, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "bad");
}

#[tokio::test]
async fn test_transient_extraction_failure_escalates_after_retries() {
    let h = harness();
    h.source.put("d1", V1);
    h.source
        .fail_extract("d1", CapabilityError::transient("rate limited"));

    let report = h
        .orchestrator
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    let stored = h.store.get_document("d1").await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Error);
    assert!(stored.error.unwrap().contains("gave up after 3 attempts"));
}

#[tokio::test]
async fn test_unsupported_content_indexes_without_chunks() {
    let h = harness();
    h.source.put("blob", "ignored");
    h.source.fail_extract(
        "blob",
        CapabilityError::Unsupported("application/octet-stream".to_string()),
    );

    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();
    let stored = h.store.get_document("blob").await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Indexed);
    assert_eq!(stored.chunk_count, 0);

    let writes = h.store.write_count();
    let doc = h.source.put_with_revision("blob", "ignored", "v2");
    h.source.push(ChangeEvent::Upserted(doc));
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn test_removed_event_tombstones_and_document_can_return() {
    let h = harness();
    h.source.put("d1", V1);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();

    h.source.remove("d1");
    h.source.push(ChangeEvent::Removed {
        id: "d1".to_string(),
    });
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(status(&h, "d1").await, DocumentStatus::Deleted);
    assert!(h.store.chunk_texts("d1").is_empty());

    let doc = h.source.put("d1", V1);
    h.source.push(ChangeEvent::Upserted(doc));
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(status(&h, "d1").await, DocumentStatus::Indexed);
    assert_eq!(h.store.chunk_texts("d1").len(), 3);
}

#[tokio::test]
async fn test_events_for_one_document_apply_in_order() {
    let h = harness();
    h.source.put("d1", V1);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();

    let doc = h.source.put("d1", V2);
    h.source.push(ChangeEvent::Upserted(doc));
    h.source.push(ChangeEvent::Removed {
        id: "d1".to_string(),
    });
    h.source.remove("d1");

    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.seen, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(status(&h, "d1").await, DocumentStatus::Deleted);
}

#[tokio::test]
async fn test_bootstrap_sweeps_documents_missing_from_source() {
    let h = harness();
    h.source.put("keep", V1);
    h.source.put("gone", V2);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();

    h.source.remove("gone");
    let report = h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(status(&h, "gone").await, DocumentStatus::Deleted);
    assert_eq!(status(&h, "keep").await, DocumentStatus::Indexed);
}

#[tokio::test]
async fn test_incomplete_bootstrap_skips_sweep_and_cursor() {
    let h = harness();
    h.source.put("keep", V1);
    h.source.put("gone", V2);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();
    let token = cursor_token(&h).await;

    h.source.remove("gone");
    h.source.broken_enumeration.store(true, Ordering::SeqCst);
    h.source.head.store(7, Ordering::SeqCst);

    let report = h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert_eq!(report.source_errors, 1);
    assert!(!report.cursor_advanced);
    assert_eq!(cursor_token(&h).await, token);
    assert_eq!(status(&h, "gone").await, DocumentStatus::Indexed);
}

#[tokio::test]
async fn test_cancelled_bootstrap_commits_nothing() {
    let h = harness();
    h.source.put("d1", V1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert!(!report.cursor_advanced);
    assert!(cursor_token(&h).await.is_none());
    assert!(h.store.get_document("d1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reindex_unknown_and_vanished_documents() {
    let h = harness();
    assert_eq!(
        h.orchestrator.reindex("nope").await.unwrap(),
        DocOutcome::NotFound
    );

    h.source.put("d1", V1);
    h.orchestrator
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();
    h.source.remove("d1");
    assert_eq!(
        h.orchestrator.reindex("d1").await.unwrap(),
        DocOutcome::Deleted
    );
    assert_eq!(status(&h, "d1").await, DocumentStatus::Deleted);
}

#[tokio::test]
async fn test_reindex_forces_reprocessing_of_unchanged_document() {
    let h = harness();
    h.source.put("d1", V1);
    h.orchestrator
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();
    let embeds = h.embedder.calls().len();

    let outcome = h.orchestrator.reindex("d1").await.unwrap();
    match outcome {
        DocOutcome::Indexed(report) => assert_eq!(report.unchanged, 3),
        other => panic!("unexpected outcome {:?}", other),
    }
    // Stored vectors from the same model are reused.
    assert_eq!(h.embedder.calls().len(), embeds);
}

#[tokio::test]
async fn test_failed_chunk_embedding_excludes_only_that_chunk() {
    let h = harness();
    h.embedder
        .reject
        .lock()
        .unwrap()
        .insert("c1 c2 c3 c4".to_string());
    h.source.put("d1", V1);

    h.orchestrator
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status(&h, "d1").await, DocumentStatus::Indexed);
    assert!(h.store.vector("d1", 2).is_none());

    let everyone = AccessContext::default();
    assert!(h
        .store
        .keyword_search("c1", &everyone, 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        h.store.keyword_search("a1", &everyone, 10).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_without_embedder_chunks_stay_lexical() {
    let h = harness_with(false);
    h.source.put("d1", V1);
    h.orchestrator
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();

    assert!(h.embedder.calls().is_empty());
    assert!(h.store.vector("d1", 0).is_none());
    let hits = h
        .store
        .keyword_search("b2", &AccessContext::default(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_runs_can_be_spawned_onto_the_runtime() {
    let h = harness();
    h.source.put("d1", V1);
    let cancel = CancellationToken::new();

    let orchestrator = h.orchestrator.clone();
    let token = cancel.clone();
    let report = tokio::spawn(async move { orchestrator.bootstrap(&token).await })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.indexed, 1);

    let doc = h.source.put("d1", V2);
    h.source.push(ChangeEvent::Upserted(doc));
    let orchestrator = h.orchestrator.clone();
    let report = tokio::spawn(async move { orchestrator.poll(&cancel).await })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert!(report.cursor_advanced);
}

#[tokio::test]
async fn test_partially_applied_poll_keeps_cursor_and_replays_batch() {
    let h = harness();
    h.source.put("d1", V1);
    h.source.put("d2", "hello world");
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert_eq!(h.flaky.replaces.load(Ordering::SeqCst), 2);

    let a = h.source.put("d1", V2);
    let b = h.source.put("d2", "hello there world");
    h.source.push(ChangeEvent::Upserted(a));
    h.source.push(ChangeEvent::Upserted(b));
    // The second write of the batch fails; the first one commits.
    h.flaky.fail_replace_at.store(4, Ordering::SeqCst);

    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.storage_errors, 1);
    assert!(!report.cursor_advanced);
    assert_eq!(cursor_token(&h).await.as_deref(), Some("t0"));

    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.seen, 2);
    assert_eq!(report.indexed, 1);
    assert_eq!(report.unchanged, 1);
    assert!(report.cursor_advanced);
    assert_eq!(cursor_token(&h).await.as_deref(), Some("t2"));
    assert_eq!(h.store.chunk_texts("d1").len(), 4);
    assert_eq!(h.store.chunk_texts("d2"), vec!["hello there world"]);
    assert_eq!(status(&h, "d2").await, DocumentStatus::Indexed);
}

#[tokio::test]
async fn test_undescribable_change_fails_only_that_document() {
    let h = harness();
    h.source.put("d1", V1);
    h.source.put("d2", "hello world");
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();

    h.source.push(ChangeEvent::Failed {
        id: "d1".to_string(),
        reason: "cannot resolve location: HTTP 403".to_string(),
    });
    h.source.push(ChangeEvent::Failed {
        id: "never-seen".to_string(),
        reason: "cannot resolve location: HTTP 403".to_string(),
    });
    let doc = h.source.put("d2", "hello there world");
    h.source.push(ChangeEvent::Upserted(doc));

    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.indexed, 1);
    assert!(report.cursor_advanced);
    assert_eq!(status(&h, "d1").await, DocumentStatus::Error);
    assert_eq!(status(&h, "d2").await, DocumentStatus::Indexed);
    assert!(h.store.get_document("never-seen").await.unwrap().is_none());
}

// ============ Filesystem source ============

struct FsHarness {
    dir: TempDir,
    store: Arc<InMemoryStore>,
    flaky: Arc<FlakyStore>,
    cursor: Arc<InMemoryStore>,
    orchestrator: Orchestrator,
}

fn fs_harness(files: &[(&str, &str)]) -> FsHarness {
    let dir = TempDir::new().unwrap();
    for (name, body) in files {
        fs::write(dir.path().join(name), body).unwrap();
    }
    let source = Arc::new(
        FilesystemSource::new(&FilesystemSourceConfig {
            root: dir.path().to_path_buf(),
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            default_core: true,
            default_audience: Vec::new(),
        })
        .unwrap(),
    );
    let store = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let cursor = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(
        flaky.clone(),
        cursor.clone(),
        source.clone(),
        source,
        None,
        SyncSettings {
            chunker: Chunker::new(4, 0).unwrap(),
            ..SyncSettings::default()
        },
    );
    FsHarness {
        dir,
        store,
        flaky,
        cursor,
        orchestrator,
    }
}

impl FsHarness {
    async fn status(&self, id: &str) -> DocumentStatus {
        self.store.get_document(id).await.unwrap().unwrap().status
    }

    async fn cursor_token(&self) -> Option<String> {
        self.cursor.load().await.unwrap().map(|c| c.token)
    }
}

#[tokio::test]
async fn test_malformed_front_matter_fails_one_file_and_commits() {
    let h = fs_harness(&[
        ("good.md", "+++\ntitle = \"Enrollment\"\n+++\nEnrollment opens in May."),
        ("bad.md", "+++\ncore = [not toml\n+++\nBody text."),
        ("plain.md", "No front matter at all."),
    ]);
    let cancel = CancellationToken::new();

    let report = h.orchestrator.bootstrap(&cancel).await.unwrap();
    assert_eq!(report.seen, 3);
    assert_eq!(report.indexed, 2);
    assert_eq!(report.failed, 1);
    assert!(report.cursor_advanced);
    assert_eq!(h.status("good.md").await, DocumentStatus::Indexed);
    assert_eq!(h.status("plain.md").await, DocumentStatus::Indexed);
    let bad = h.store.get_document("bad.md").await.unwrap().unwrap();
    assert_eq!(bad.status, DocumentStatus::Error);
    assert!(bad.error.unwrap_or_default().contains("invalid front matter"));

    let first = h.cursor_token().await.unwrap();
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert!(report.cursor_advanced);
    assert_ne!(h.cursor_token().await.unwrap(), first);

    fs::write(h.dir.path().join("bad.md"), "+++\ncore = true\n+++\nBody text fixed.").unwrap();
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert!(report.cursor_advanced);
    assert_eq!(h.status("bad.md").await, DocumentStatus::Indexed);
}

#[tokio::test]
async fn test_failed_file_removal_is_redelivered_by_next_poll() {
    let h = fs_harness(&[("a.md", "alpha beta gamma"), ("b.md", "delta epsilon")]);
    let cancel = CancellationToken::new();
    h.orchestrator.bootstrap(&cancel).await.unwrap();
    let token = h.cursor_token().await;

    fs::remove_file(h.dir.path().join("b.md")).unwrap();
    h.flaky.fail_deletes.store(true, Ordering::SeqCst);
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.storage_errors, 1);
    assert!(!report.cursor_advanced);
    assert_eq!(h.cursor_token().await, token);
    assert_eq!(h.status("b.md").await, DocumentStatus::Indexed);

    h.flaky.fail_deletes.store(false, Ordering::SeqCst);
    let report = h.orchestrator.poll(&cancel).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(report.cursor_advanced);
    assert_eq!(h.status("b.md").await, DocumentStatus::Deleted);
    assert_eq!(h.status("a.md").await, DocumentStatus::Indexed);
}
