//! Wiring from a [`Config`] to a ready orchestrator.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use docsync_core::capability::{ChangeSource, Embedder, Extractor};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate::apply_schema;
use crate::retry::RetryPolicy;
use crate::source_drive::DriveSource;
use crate::source_fs::FilesystemSource;
use crate::sqlite_store::SqliteStore;
use crate::sync::{Orchestrator, SyncSettings};

/// Everything a command needs to run sync or retrieval.
pub struct Runtime {
    pub store: Arc<SqliteStore>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Open the configured database, creating the schema if needed.
pub async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

/// Instantiate the configured change source. One object serves as both
/// discoverer and extractor since both talk to the same backend.
pub fn create_source(
    config: &Config,
    retry: RetryPolicy,
) -> Result<(Arc<dyn ChangeSource>, Arc<dyn Extractor>)> {
    match config.source.kind.as_str() {
        "filesystem" => {
            let fs_config = config
                .source
                .filesystem
                .as_ref()
                .ok_or_else(|| anyhow!("missing [source.filesystem] section"))?;
            let source = Arc::new(FilesystemSource::new(fs_config)?);
            Ok((source.clone(), source))
        }
        "drive" => {
            let drive_config = config
                .source
                .drive
                .as_ref()
                .ok_or_else(|| anyhow!("missing [source.drive] section"))?;
            let source = Arc::new(DriveSource::new(drive_config, retry)?);
            Ok((source.clone(), source))
        }
        other => Err(anyhow!("Unknown source kind: {}", other)),
    }
}

pub async fn build_runtime(config: &Config) -> Result<Runtime> {
    let store = open_store(config).await?;
    let embedder = create_embedder(&config.embedding)?;
    let settings = SyncSettings::from_config(config)?;
    let (source, extractor) = create_source(config, settings.retry)?;

    tracing::debug!(
        source = source.name(),
        embeddings = embedder.is_some(),
        "runtime assembled"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        source,
        extractor,
        embedder.clone(),
        settings,
    ));

    Ok(Runtime {
        store,
        embedder,
        orchestrator,
    })
}
