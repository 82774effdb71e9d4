//! # docsync CLI
//!
//! Keeps a local hybrid-retrieval index in step with a document source
//! (a filesystem tree or a Drive folder) and serves trigger and query
//! endpoints.
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./config/docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync init` | Create the SQLite database and schema |
//! | `docsync bootstrap` | Enumerate the whole source and reset the cursor |
//! | `docsync poll` | Apply changes since the stored cursor |
//! | `docsync reindex <id>` | Force one document through the pipeline |
//! | `docsync status <id>` | Show a document's lifecycle state |
//! | `docsync search "<query>"` | Hybrid retrieval with access filtering |
//! | `docsync stats` | Index summary |
//! | `docsync cursor show\|reset` | Inspect or forget the change cursor |
//! | `docsync serve` | Run the HTTP server and background worker |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docsync::app;
use docsync::config;
use docsync::migrate;
use docsync::search::{self, Query};
use docsync::server;
use docsync::stats;
use docsync::sync::{DocOutcome, SyncReport};
use docsync_core::store::CursorStore;

/// docsync: incremental document synchronization and hybrid retrieval.
#[derive(Parser)]
#[command(name = "docsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run the HTTP server with a background sync worker.
    Serve,

    /// Enumerate every document under the source root.
    ///
    /// Documents that no longer exist are tombstoned and the change
    /// cursor is reset to the token captured before enumeration.
    Bootstrap,

    /// Apply source changes since the stored cursor.
    ///
    /// Bootstraps first when no cursor exists.
    Poll,

    /// Force a document through the full pipeline.
    Reindex { document_id: String },

    /// Show a document's lifecycle state.
    Status { document_id: String },

    /// Search indexed chunks.
    Search {
        query: String,

        /// Caller audience tags, comma-separated.
        #[arg(long, value_delimiter = ',')]
        audience: Vec<String>,

        /// Number of results (defaults to `retrieval.default_k`).
        #[arg(long)]
        k: Option<usize>,

        /// Print per-component score breakdown.
        #[arg(long)]
        explain: bool,
    },

    /// Show index statistics.
    Stats,

    /// Inspect or reset the change cursor.
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    Show,
    /// Forget the cursor; the next poll bootstraps.
    Reset,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create tracing filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Cancel `token` on Ctrl-C so in-flight documents finish and no new ones start.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight documents");
            token.cancel();
        }
    });
}

fn print_report(label: &str, report: &SyncReport) {
    println!("{} complete:", label);
    println!("  documents seen:     {}", report.seen);
    println!("  indexed:            {}", report.indexed);
    println!("  unchanged:          {}", report.unchanged);
    println!("  metadata updated:   {}", report.metadata_updated);
    println!("  deleted:            {}", report.deleted);
    println!("  failed:             {}", report.failed);
    println!("  chunks written:     {}", report.chunks_written);
    if report.source_errors > 0 || report.storage_errors > 0 {
        println!(
            "  errors:             {} source, {} storage",
            report.source_errors, report.storage_errors
        );
    }
    if report.cancelled > 0 {
        println!("  cancelled:          {}", report.cancelled);
    }
    println!(
        "  cursor:             {}",
        if report.cursor_advanced {
            "advanced"
        } else {
            "unchanged"
        }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Bootstrap => {
            let runtime = app::build_runtime(&cfg).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let report = runtime.orchestrator.bootstrap(&cancel).await?;
            print_report("Bootstrap", &report);
            runtime.store.pool().close().await;
        }
        Commands::Poll => {
            let runtime = app::build_runtime(&cfg).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let report = runtime.orchestrator.poll(&cancel).await?;
            print_report("Poll", &report);
            runtime.store.pool().close().await;
        }
        Commands::Reindex { document_id } => {
            let runtime = app::build_runtime(&cfg).await?;
            let outcome = runtime.orchestrator.reindex(&document_id).await?;
            runtime.store.pool().close().await;
            match outcome {
                DocOutcome::Indexed(report) => println!(
                    "Re-indexed {}: {} inserted, {} updated, {} unchanged, {} deleted chunks",
                    document_id, report.inserted, report.updated, report.unchanged, report.deleted
                ),
                DocOutcome::Failed(reason) => {
                    anyhow::bail!("Re-index of {} failed: {}", document_id, reason)
                }
                DocOutcome::NotFound => anyhow::bail!("Document not found: {}", document_id),
                DocOutcome::Deleted => {
                    println!("{} no longer exists at the source; tombstoned.", document_id)
                }
                other => println!("{}: {:?}", document_id, other),
            }
        }
        Commands::Status { document_id } => {
            stats::run_document_status(&cfg, &document_id).await?;
        }
        Commands::Search {
            query,
            audience,
            k,
            explain,
        } => {
            let query = Query {
                text: query,
                audience,
                k,
                explain,
            };
            search::run_search(&cfg, query).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Cursor { action } => {
            let store = app::open_store(&cfg).await?;
            match action {
                CursorAction::Show => match store.load().await? {
                    Some(cursor) => println!(
                        "{} (applied {})",
                        cursor.token,
                        cursor.applied_at.to_rfc3339()
                    ),
                    None => println!("No cursor; the next poll will bootstrap."),
                },
                CursorAction::Reset => {
                    store.reset().await?;
                    println!("Cursor reset.");
                }
            }
            store.pool().close().await;
        }
    }

    Ok(())
}
