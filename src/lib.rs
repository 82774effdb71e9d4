//! # docsync
//!
//! Incremental document synchronization and hybrid retrieval.
//!
//! docsync follows a document source's change stream, extracts and
//! chunks changed documents, embeds only the chunks whose content
//! changed, and reconciles them into a SQLite index that answers
//! access-filtered hybrid (lexical + semantic) queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │ Change source│──▶│ Orchestrator             │──▶│ SQLite        │
//! │ FS / Drive   │   │ extract→chunk→embed→write │   │ FTS5 + vectors│
//! └──────────────┘   └────────────▲─────────────┘   └──────┬───────┘
//!                                 │ jobs                   │
//!                           ┌─────┴─────┐            ┌─────▼─────┐
//!                           │  worker   │◀── HTTP ──▶│ retrieval │
//!                           └───────────┘            └───────────┘
//! ```
//!
//! Pure domain logic (chunking, state machine, reconciliation plan, score
//! fusion, storage traits) lives in the `docsync-core` crate; this crate
//! supplies the I/O: sources, extraction, the embedding client, SQLite
//! storage, the orchestrator, the worker and the HTTP server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite `Store` and `CursorStore` |
//! | [`source_fs`] | Filesystem change source and extractor |
//! | [`source_drive`] | Drive change source and extractor |
//! | [`drive_auth`] | Drive service-account and static credentials |
//! | [`extract`] | Binary format text extraction |
//! | [`embedding`] | OpenAI-compatible embedding client |
//! | [`retry`] | Backoff and failure classification |
//! | [`rate_limit`] | Fixed-window call budgets |
//! | [`sync`] | Sync orchestrator |
//! | [`worker`] | Background job queue |
//! | [`search`] | Query entry point |
//! | [`server`] | HTTP trigger and query server |
//! | [`stats`] | Index statistics |
//! | [`app`] | Configuration → runtime wiring |

pub mod app;
pub mod config;
pub mod db;
pub mod drive_auth;
pub mod embedding;
pub mod extract;
pub mod migrate;
pub mod rate_limit;
pub mod retry;
pub mod search;
pub mod server;
pub mod source_drive;
pub mod source_fs;
pub mod sqlite_store;
pub mod stats;
pub mod sync;
pub mod worker;
