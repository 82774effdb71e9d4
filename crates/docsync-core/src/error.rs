//! Failure taxonomy for external collaborators and pipeline invariants.

use thiserror::Error;

/// Outcome classification for calls to extractors, embedders and change
/// sources.
///
/// `Transient` failures are retried with backoff; once attempts run out
/// they are [`escalate`](CapabilityError::escalate)d to `Permanent`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("unsupported content type: {0}")]
    Unsupported(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn transient(msg: impl Into<String>) -> Self {
        CapabilityError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        CapabilityError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }

    /// Convert an exhausted transient failure into a permanent one.
    pub fn escalate(self, attempts: u32) -> Self {
        match self {
            CapabilityError::Transient(msg) => CapabilityError::Permanent(format!(
                "gave up after {} attempts: {}",
                attempts, msg
            )),
            other => other,
        }
    }
}

/// A broken structural guarantee detected before it reached storage.
///
/// Fatal to one document's processing pass only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invariant violation for document {document_id}: {detail}")]
pub struct InvariantViolation {
    pub document_id: String,
    pub detail: String,
}
