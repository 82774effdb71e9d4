//! Capability traits for the external collaborators of the sync pipeline.
//!
//! Each trait reports failures as a [`CapabilityError`] so the orchestrator
//! can tell retryable conditions from permanent ones without knowing which
//! backend it talks to. Test code substitutes scripted fakes.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CapabilityError;
use crate::models::{ChangeBatch, DocumentRef, Extraction};

/// Lazy enumeration of every document in the managed hierarchy.
pub type DocumentStream = BoxStream<'static, Result<DocumentRef, CapabilityError>>;

/// Discovers documents and changes in the upstream store.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Short identifier used in logs (`"filesystem"`, `"drive"`).
    fn name(&self) -> &str;

    /// Token for the current head of the change stream.
    ///
    /// Captured before a bootstrap so that changes made while enumerating
    /// are delivered again by the next poll.
    async fn start_token(&self) -> Result<String, CapabilityError>;

    /// Enumerate the whole hierarchy. Safe to restart.
    async fn bootstrap(&self) -> Result<DocumentStream, CapabilityError>;

    /// Fetch changes after `token`.
    ///
    /// An error means the batch was not obtained; callers must not advance
    /// their cursor.
    async fn poll_changes(&self, token: &str) -> Result<ChangeBatch, CapabilityError>;

    /// Current metadata for a single document, or `None` if it is gone.
    async fn describe(&self, id: &str) -> Result<Option<DocumentRef>, CapabilityError>;
}

/// Turns a document into normalized plain text plus its fingerprint.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, doc: &DocumentRef) -> Result<Extraction, CapabilityError>;
}

/// Produces fixed-dimension vectors for chunk text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier stored alongside each vector.
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}
