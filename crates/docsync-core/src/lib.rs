//! # docsync core
//!
//! Runtime-free logic for docsync: data models, chunking, fingerprints,
//! the per-document processing state machine, capability traits for
//! external collaborators, the storage abstraction, and the hybrid
//! retrieval algorithm.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or HTTP client.
//! Everything that talks to the outside world implements one of the
//! traits in [`capability`] or [`store`] and lives in the `docsync`
//! application crate.

pub mod capability;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod search;
pub mod state;
pub mod store;
