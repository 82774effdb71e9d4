//! Sync orchestrator: drives documents from discovery to `indexed`.
//!
//! One [`Orchestrator`] owns the storage handles and capability objects.
//! It exposes the three entry points used by the worker, the HTTP server
//! and the CLI:
//!
//! - [`Orchestrator::bootstrap`]: enumerate the whole hierarchy, sweep
//!   documents that disappeared, then record the start token.
//! - [`Orchestrator::poll`]: apply one change batch after the stored cursor
//!   and advance the cursor only when every document reached a durable
//!   outcome.
//! - [`Orchestrator::reindex`]: force one document through the pipeline.
//!
//! Per-document processing moves through the typed stages in
//! [`docsync_core::state`] and commits with a single
//! [`Store::replace_chunks`] call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::{stream, FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use docsync_core::capability::{ChangeSource, Embedder, Extractor};
use docsync_core::chunk::Chunker;
use docsync_core::error::{CapabilityError, InvariantViolation};
use docsync_core::models::{ChangeEvent, ChunkDraft, DocumentRef, DocumentStatus, Extraction};
use docsync_core::reconcile::{plan_embeddings, EmbedDecision, EmbeddingUpdate, ReconcileReport};
use docsync_core::state::{check_transition, Discovered};
use docsync_core::store::{CursorStore, Store};

use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::retry::{with_backoff, RetryPolicy};

/// Result of running one document through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DocOutcome {
    /// Chunks were reconciled and the document is `indexed`.
    Indexed(ReconcileReport),
    /// Revision or fingerprint unchanged; nothing written.
    Unchanged,
    /// Only title, path or access metadata changed.
    MetadataUpdated,
    /// Recorded as `error` with the given reason.
    Failed(String),
    /// Tombstoned.
    Deleted,
    /// The id is not known to the store.
    NotFound,
    /// Not started because shutdown was requested.
    Cancelled,
}

impl DocOutcome {
    /// Whether the outcome is persisted (or needs no persistence).
    pub fn is_durable(&self) -> bool {
        !matches!(self, DocOutcome::Cancelled)
    }
}

/// Counters for one bootstrap or poll run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub seen: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub metadata_updated: usize,
    pub failed: usize,
    pub deleted: usize,
    pub chunks_written: usize,
    pub source_errors: usize,
    pub storage_errors: usize,
    pub cancelled: usize,
    pub cursor_advanced: bool,
}

impl SyncReport {
    fn record(&mut self, outcome: &Result<DocOutcome>) {
        match outcome {
            Ok(DocOutcome::Indexed(report)) => {
                self.indexed += 1;
                self.chunks_written += report.chunk_writes();
            }
            Ok(DocOutcome::Unchanged) | Ok(DocOutcome::NotFound) => self.unchanged += 1,
            Ok(DocOutcome::MetadataUpdated) => self.metadata_updated += 1,
            Ok(DocOutcome::Failed(_)) => self.failed += 1,
            Ok(DocOutcome::Deleted) => self.deleted += 1,
            Ok(DocOutcome::Cancelled) => self.cancelled += 1,
            Err(_) => self.storage_errors += 1,
        }
    }

    /// True when the run may move the cursor.
    fn is_clean(&self) -> bool {
        self.source_errors == 0 && self.storage_errors == 0 && self.cancelled == 0
    }
}

/// Tuning knobs for the orchestrator.
pub struct SyncSettings {
    pub chunker: Chunker,
    /// Documents (and chunk embeddings within a document) processed in parallel.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub extract_limiter: RateLimiter,
    pub embed_limiter: RateLimiter,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let window = config.limits.window();
        Ok(Self {
            chunker: config.chunker()?,
            concurrency: config.sync.concurrency.max(1),
            retry: RetryPolicy::from_config(&config.sync),
            extract_limiter: RateLimiter::new(config.limits.extract_per_window, window),
            embed_limiter: RateLimiter::new(config.limits.embed_per_window, window),
        })
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            chunker: Chunker::default(),
            concurrency: 4,
            retry: RetryPolicy::immediate(3),
            extract_limiter: RateLimiter::unlimited(),
            embed_limiter: RateLimiter::unlimited(),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    cursor: Arc<dyn CursorStore>,
    source: Arc<dyn ChangeSource>,
    extractor: Arc<dyn Extractor>,
    embedder: Option<Arc<dyn Embedder>>,
    settings: SyncSettings,
    /// Serializes bootstrap and poll so only one run owns the cursor.
    poll_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        cursor: Arc<dyn CursorStore>,
        source: Arc<dyn ChangeSource>,
        extractor: Arc<dyn Extractor>,
        embedder: Option<Arc<dyn Embedder>>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            cursor,
            source,
            extractor,
            embedder,
            settings,
            poll_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Full enumeration of the source.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let _guard = self.poll_lock.lock().await;
        self.bootstrap_locked(cancel).await
    }

    async fn bootstrap_locked(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let retry = &self.settings.retry;
        let source = self.source.as_ref();
        let expected = self.cursor.load().await?.map(|c| c.token);

        let start_token = with_backoff(retry, "source.start_token", move || source.start_token())
            .await
            .map_err(|e| anyhow!("could not obtain start token: {}", e))?;
        let docs = with_backoff(retry, "source.bootstrap", move || source.bootstrap())
            .await
            .map_err(|e| anyhow!("could not enumerate source: {}", e))?;

        tracing::info!(source = source.name(), "bootstrap started");

        let mut report = SyncReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        let mut results = Box::pin(
            docs.take_until(cancel.cancelled())
                .map(|item| {
                    async move {
                        match item {
                            Ok(doc) => {
                                let id = doc.id.clone();
                                let outcome = self.process_document(doc, false, cancel).await;
                                Ok((id, outcome))
                            }
                            Err(err) => Err(err),
                        }
                    }
                    .boxed()
                })
                .buffer_unordered(self.settings.concurrency),
        );

        while let Some(item) = results.next().await {
            match item {
                Ok((id, outcome)) => {
                    if let Err(err) = &outcome {
                        tracing::error!(document_id = %id, error = %err, "storage failure during bootstrap");
                    }
                    report.seen += 1;
                    report.record(&outcome);
                    seen.insert(id);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "source error during bootstrap enumeration");
                    report.source_errors += 1;
                }
            }
        }
        drop(results);

        if cancel.is_cancelled() {
            report.cancelled += 1;
        }

        if !report.is_clean() {
            tracing::warn!(?report, "bootstrap incomplete; skipping sweep and cursor update");
            return Ok(report);
        }

        for id in self.store.active_document_ids().await? {
            if !seen.contains(&id) && self.store.delete_document(&id).await? {
                tracing::info!(document_id = %id, "removed document missing from source");
                report.deleted += 1;
            }
        }

        report.cursor_advanced = self.cursor.commit(expected.as_deref(), &start_token).await?;
        if !report.cursor_advanced {
            tracing::warn!("cursor changed during bootstrap; leaving it untouched");
        }

        tracing::info!(
            seen = report.seen,
            indexed = report.indexed,
            unchanged = report.unchanged,
            failed = report.failed,
            deleted = report.deleted,
            "bootstrap finished"
        );
        Ok(report)
    }

    /// Apply the next change batch. Falls back to bootstrap when no cursor
    /// has been recorded yet.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let _guard = self.poll_lock.lock().await;

        let Some(cursor) = self.cursor.load().await? else {
            tracing::info!("no cursor recorded; running bootstrap");
            return self.bootstrap_locked(cancel).await;
        };

        let source = self.source.as_ref();
        let token = cursor.token.as_str();
        let batch = with_backoff(&self.settings.retry, "source.poll_changes", move || {
            source.poll_changes(token)
        })
        .await
        .map_err(|e| anyhow!("could not fetch changes after {}: {}", token, e))?;

        // Group by document, keeping delivery order within each group.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<ChangeEvent>> = HashMap::new();
        for event in batch.events {
            let id = event.document_id().to_string();
            groups
                .entry(id.clone())
                .or_insert_with(|| {
                    order.push(id);
                    Vec::new()
                })
                .push(event);
        }

        tracing::debug!(documents = order.len(), "applying change batch");

        let mut report = SyncReport::default();
        let mut results = stream::iter(order.into_iter().filter_map(|id| groups.remove(&id)))
            .map(|events| self.apply_events(events, cancel).boxed())
            .buffer_unordered(self.settings.concurrency);

        while let Some(outcome) = results.next().await {
            if let Err(err) = &outcome {
                tracing::error!(error = %err, "storage failure while applying changes");
            }
            report.seen += 1;
            report.record(&outcome);
        }
        drop(results);

        if report.is_clean() {
            report.cursor_advanced = self
                .cursor
                .commit(Some(&cursor.token), &batch.next_token)
                .await?;
            if !report.cursor_advanced {
                tracing::warn!("cursor changed during poll; leaving it untouched");
            }
        } else {
            tracing::warn!(?report, "poll incomplete; cursor not advanced");
        }

        Ok(report)
    }

    /// Apply one document's events in order. Returns the last outcome.
    async fn apply_events(
        &self,
        events: Vec<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> Result<DocOutcome> {
        let mut last = DocOutcome::Unchanged;
        for event in events {
            last = match event {
                ChangeEvent::Upserted(doc) => self.process_document(doc, false, cancel).await?,
                ChangeEvent::Removed { id } => {
                    if cancel.is_cancelled() {
                        DocOutcome::Cancelled
                    } else {
                        self.remove_document(&id).await?
                    }
                }
                ChangeEvent::Failed { id, reason } => self.source_failed(&id, &reason).await?,
            };
            if !last.is_durable() {
                break;
            }
        }
        Ok(last)
    }

    /// Force one document through the pipeline with fresh metadata.
    pub async fn reindex(&self, id: &str) -> Result<DocOutcome> {
        if self.store.get_document(id).await?.is_none() {
            return Ok(DocOutcome::NotFound);
        }

        let source = self.source.as_ref();
        let described = with_backoff(&self.settings.retry, "source.describe", move || {
            source.describe(id)
        })
        .await;

        match described {
            Ok(Some(doc)) => {
                tracing::info!(document_id = %id, "manual re-index");
                self.process_document(doc, true, &CancellationToken::new()).await
            }
            Ok(None) => {
                tracing::info!(document_id = %id, "document no longer exists at source");
                self.remove_document(id).await
            }
            Err(err) => self.fail(id, &err.to_string()).await,
        }
    }

    async fn remove_document(&self, id: &str) -> Result<DocOutcome> {
        if self.store.delete_document(id).await? {
            tracing::info!(document_id = %id, "document deleted");
            Ok(DocOutcome::Deleted)
        } else {
            Ok(DocOutcome::Unchanged)
        }
    }

    /// A change the source could not describe. Only documents already in
    /// the index get an error row; unknown ids are skipped.
    async fn source_failed(&self, id: &str, reason: &str) -> Result<DocOutcome> {
        match self.store.get_document(id).await? {
            Some(stored) if stored.status != DocumentStatus::Deleted => self.fail(id, reason).await,
            _ => {
                tracing::warn!(document_id = %id, error = %reason, "skipping change the source could not describe");
                Ok(DocOutcome::Failed(reason.to_string()))
            }
        }
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<DocOutcome> {
        tracing::warn!(document_id = %id, error = %reason, "document failed");
        self.store.mark_error(id, reason).await?;
        Ok(DocOutcome::Failed(reason.to_string()))
    }

    /// Run one document through extract → chunk → embed → commit.
    ///
    /// `Err` is reserved for storage failures; capability failures and
    /// invariant violations are recorded on the document.
    pub async fn process_document(
        &self,
        doc: DocumentRef,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<DocOutcome> {
        if cancel.is_cancelled() {
            return Ok(DocOutcome::Cancelled);
        }

        let id = doc.id.clone();
        let stored = self.store.get_document(&id).await?;
        let discovered = Discovered::new(doc, stored, force);

        if discovered.revision_unchanged() {
            return self.sync_metadata_only(discovered.doc(), discovered.metadata_changed()).await;
        }

        // The row must exist before a failure can be recorded against it.
        let mut row_written = false;
        let entry_status = discovered.stored().map(|s| s.status);
        match entry_status {
            None | Some(DocumentStatus::Deleted) => {
                if let Some(from) = entry_status {
                    if let Err(violation) = check_transition(&id, from, DocumentStatus::Discovered) {
                        return self.fail(&id, &violation.to_string()).await;
                    }
                }
                self.store
                    .upsert_document(discovered.doc(), DocumentStatus::Discovered)
                    .await?;
                row_written = true;
            }
            Some(_) => {}
        }

        let extraction = match self.extract(discovered.doc()).await {
            Ok(extraction) => extraction,
            Err(CapabilityError::Unsupported(content_type)) => {
                tracing::info!(document_id = %id, %content_type, "unsupported content; indexing without chunks");
                Extraction::from_raw("")
            }
            Err(err) => return self.fail(&id, &err.to_string()).await,
        };

        let extracted = discovered.extracted(extraction);
        if extracted.fingerprint_unchanged() {
            return self.sync_metadata_only(extracted.doc(), extracted.metadata_changed()).await;
        }

        if !row_written && extracted.metadata_changed() {
            let status = entry_status.unwrap_or(DocumentStatus::Discovered);
            self.store.upsert_document(extracted.doc(), status).await?;
        }

        let chunked = extracted.chunk(&self.settings.chunker);
        let existing = self.store.chunk_states(&id).await?;
        let model = self.embedder.as_ref().map(|e| e.model_name());
        let plan = plan_embeddings(chunked.drafts(), &existing, model);
        let updates = self.embed_chunks(&id, chunked.drafts(), &plan).await;

        let chunk_set = match chunked
            .embedded(updates)
            .and_then(|embedded| embedded.into_chunk_set())
        {
            Ok(set) => set,
            Err(violation) => return self.invariant_failed(violation).await,
        };

        let report = self.store.replace_chunks(&chunk_set).await?;
        tracing::info!(
            document_id = %id,
            chunks = chunk_set.len(),
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            "document indexed"
        );
        Ok(DocOutcome::Indexed(report))
    }

    async fn sync_metadata_only(&self, doc: &DocumentRef, changed: bool) -> Result<DocOutcome> {
        if !changed {
            tracing::debug!(document_id = %doc.id, "document unchanged");
            return Ok(DocOutcome::Unchanged);
        }
        self.store.upsert_document(doc, DocumentStatus::Indexed).await?;
        tracing::info!(document_id = %doc.id, "metadata updated");
        Ok(DocOutcome::MetadataUpdated)
    }

    async fn invariant_failed(&self, violation: InvariantViolation) -> Result<DocOutcome> {
        tracing::error!(document_id = %violation.document_id, detail = %violation.detail, "invariant violation");
        let id = violation.document_id.clone();
        self.fail(&id, &violation.to_string()).await
    }

    async fn extract(&self, doc: &DocumentRef) -> Result<Extraction, CapabilityError> {
        let extractor = self.extractor.as_ref();
        let limiter = &self.settings.extract_limiter;
        with_backoff(&self.settings.retry, "extract", move || {
            async move {
                limiter.acquire().await;
                extractor.extract(doc).await
            }
            .boxed()
        })
        .await
    }

    async fn embed_chunks(
        &self,
        doc_id: &str,
        drafts: &[ChunkDraft],
        plan: &[EmbedDecision],
    ) -> Vec<EmbeddingUpdate> {
        let Some(embedder) = self.embedder.as_deref() else {
            return plan
                .iter()
                .map(|decision| match decision {
                    EmbedDecision::Reuse => EmbeddingUpdate::Keep,
                    EmbedDecision::Embed | EmbedDecision::Skip => EmbeddingUpdate::Missing,
                })
                .collect();
        };

        let futures: Vec<_> = drafts
            .iter()
            .zip(plan.iter())
            .map(|(draft, decision)| {
                async move {
                    match decision {
                        EmbedDecision::Reuse => EmbeddingUpdate::Keep,
                        EmbedDecision::Skip => EmbeddingUpdate::Missing,
                        EmbedDecision::Embed => self.embed_one(embedder, doc_id, draft).await,
                    }
                }
                .boxed()
            })
            .collect();
        stream::iter(futures)
            .buffered(self.settings.concurrency)
            .collect()
            .await
    }

    async fn embed_one(&self, embedder: &dyn Embedder, doc_id: &str, draft: &ChunkDraft) -> EmbeddingUpdate {
        let limiter = &self.settings.embed_limiter;
        let text = draft.text.as_str();
        let result = with_backoff(&self.settings.retry, "embed", move || {
            async move {
                limiter.acquire().await;
                embedder.embed(text).await
            }
            .boxed()
        })
        .await
        .and_then(|vector| {
            if vector.len() == embedder.dims() {
                Ok(vector)
            } else {
                Err(CapabilityError::permanent(format!(
                    "embedding has {} dimensions, expected {}",
                    vector.len(),
                    embedder.dims()
                )))
            }
        });

        match result {
            Ok(vector) => EmbeddingUpdate::Set {
                vector,
                model: embedder.model_name().to_string(),
            },
            Err(err) => {
                tracing::warn!(
                    document_id = %doc_id,
                    chunk_index = draft.index,
                    error = %err,
                    "chunk embedding failed"
                );
                EmbeddingUpdate::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}
