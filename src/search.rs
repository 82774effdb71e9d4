//! Query entry point shared by `docsync search` and `POST /search`.
//!
//! Embeds the query when a backend is configured and delegates ranking to
//! [`docsync_core::search::retrieve`]. An embedding failure downgrades the
//! query to lexical-only instead of failing it.

use anyhow::Result;
use chrono::Utc;

use docsync_core::capability::Embedder;
use docsync_core::search::{retrieve, AccessContext, ChunkResult, RetrievalRequest};
use docsync_core::store::Store;

use crate::app;
use crate::config::{Config, RetrievalConfig};

/// One retrieval call as received from a caller.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    pub audience: Vec<String>,
    /// Falls back to `retrieval.default_k`.
    pub k: Option<usize>,
    pub explain: bool,
}

pub async fn search_chunks(
    store: &dyn Store,
    embedder: Option<&dyn Embedder>,
    retrieval: &RetrievalConfig,
    query: &Query,
) -> Result<Vec<ChunkResult>> {
    if query.text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = match embedder {
        Some(embedder) => match embedder.embed(&query.text).await {
            Ok(vec) => Some(vec),
            Err(err) => {
                tracing::warn!(error = %err, "query embedding failed, using lexical ranking only");
                None
            }
        },
        None => None,
    };

    let access = AccessContext::new(query.audience.iter().map(String::as_str));
    let params = retrieval.params();
    let request = RetrievalRequest {
        query: &query.text,
        query_vec: query_vec.as_deref(),
        access: &access,
        k: query.k.unwrap_or(retrieval.default_k),
        params: &params,
        now: Utc::now(),
        explain: query.explain,
    };

    retrieve(store, &request).await
}

/// Run a query against the configured database and print ranked chunks.
pub async fn run_search(config: &Config, query: Query) -> Result<()> {
    if query.text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let store = app::open_store(config).await?;
    let embedder = crate::embedding::create_embedder(&config.embedding)?;

    let results = search_chunks(
        store.as_ref(),
        embedder.as_deref(),
        &config.retrieval,
        &query,
    )
    .await?;

    if results.is_empty() {
        println!("No results.");
        store.pool().close().await;
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}",
            i + 1,
            result.score,
            result.breadcrumb.join(" / ")
        );
        if let Some(reviewed) = result.last_reviewed_at {
            println!("    reviewed: {}", reviewed.format("%Y-%m-%d"));
        }
        println!("    excerpt: \"{}\"", excerpt(&result.text, 240));
        println!("    chunk: {} (#{})", result.chunk_id, result.chunk_index);
        if let Some(explain) = result.explain {
            println!(
                "    explain: semantic={:.3} lexical={:.3} recency={:.3} core={:.3}",
                explain.semantic, explain.lexical, explain.recency, explain.core
            );
        }
        println!();
    }

    store.pool().close().await;
    Ok(())
}

/// Single-line excerpt truncated on a character boundary.
fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
