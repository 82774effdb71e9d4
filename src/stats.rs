//! Index statistics and per-document status.
//!
//! `docsync stats` summarizes what's indexed: documents per status, chunk
//! and vector counts, embedding failures, and the change cursor.
//! `docsync status <id>` shows one document's lifecycle state.

use anyhow::Result;
use sqlx::Row;

use docsync_core::models::DocumentStatus;
use docsync_core::store::{CursorStore, Store};

use crate::app;
use crate::config::Config;

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = app::open_store(config).await?;
    let pool = store.pool();

    let counts = store.status_counts().await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(pool)
        .await?;
    let embed_failures: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embed_error IS NOT NULL")
            .fetch_one(pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docsync index stats");
    println!("===================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    let total_docs: i64 = counts
        .iter()
        .filter(|(status, _)| *status != DocumentStatus::Deleted)
        .map(|(_, n)| n)
        .sum();
    println!("  Documents:   {}", total_docs);
    for status in DocumentStatus::ALL {
        let n = counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        if n > 0 {
            println!("    {:<12} {}", status.as_str(), n);
        }
    }
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    if embed_failures > 0 {
        println!("  Embed failures: {}", embed_failures);
    }

    match store.load().await? {
        Some(cursor) => println!(
            "  Cursor:      {} (applied {})",
            cursor.token,
            format_ts_relative(cursor.applied_at.timestamp())
        ),
        None => println!("  Cursor:      none (next poll bootstraps)"),
    }

    let errored = sqlx::query(
        "SELECT id, title, error FROM documents WHERE status = 'error' ORDER BY updated_at DESC LIMIT 10",
    )
    .fetch_all(pool)
    .await?;
    if !errored.is_empty() {
        println!();
        println!("  Recent errors:");
        for row in &errored {
            let id: String = row.get("id");
            let title: String = row.get("title");
            let error: Option<String> = row.get("error");
            println!(
                "    {} ({}): {}",
                title,
                id,
                error.unwrap_or_else(|| "unknown".to_string())
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Print one document's status row.
pub async fn run_document_status(config: &Config, id: &str) -> Result<()> {
    let store = app::open_store(config).await?;
    let doc = store.get_document(id).await?;
    store.pool().close().await;

    let Some(doc) = doc else {
        anyhow::bail!("Document not found: {}", id);
    };

    println!("{}", doc.breadcrumb().join(" / "));
    println!("  id:          {}", doc.id);
    println!("  status:      {}", doc.status);
    println!("  type:        {}", doc.content_type);
    println!("  chunks:      {}", doc.chunk_count);
    if let Some(revision) = &doc.source_revision {
        println!("  revision:    {}", revision);
    }
    if let Some(ts) = doc.last_synced_at {
        println!("  synced:      {}", format_ts_relative(ts.timestamp()));
    }
    if let Some(error) = &doc.error {
        println!("  error:       {}", error);
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
