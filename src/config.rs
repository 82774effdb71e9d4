//! TOML configuration.
//!
//! Secrets never live in the file: the `[auth]`, `[embedding]` and
//! `[source.drive]` sections name environment variables that hold them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docsync_core::chunk::{Chunker, DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS};
use docsync_core::search::{RetrievalParams, RetrievalWeights};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}
fn default_overlap_tokens() -> usize {
    DEFAULT_OVERLAP_TOKENS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_minor_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_minor_weight")]
    pub core_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_lexical: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_semantic: usize,
    #[serde(default = "default_half_life")]
    pub recency_half_life_days: f64,
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            lexical_weight: default_lexical_weight(),
            recency_weight: default_minor_weight(),
            core_weight: default_minor_weight(),
            candidate_k_lexical: default_candidate_k(),
            candidate_k_semantic: default_candidate_k(),
            recency_half_life_days: default_half_life(),
            default_k: default_k(),
            max_k: default_max_k(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.6
}
fn default_lexical_weight() -> f64 {
    0.3
}
fn default_minor_weight() -> f64 {
    0.05
}
fn default_candidate_k() -> usize {
    50
}
fn default_half_life() -> f64 {
    180.0
}
fn default_k() -> usize {
    8
}
fn default_max_k() -> usize {
    50
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            weights: RetrievalWeights {
                semantic: self.semantic_weight,
                lexical: self.lexical_weight,
                recency: self.recency_weight,
                core: self.core_weight,
            },
            candidate_k_lexical: self.candidate_k_lexical,
            candidate_k_semantic: self.candidate_k_semantic,
            recency_half_life_days: self.recency_half_life_days,
            max_k: self.max_k,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            timeout_secs: default_timeout_secs(),
            api_key_env: default_openai_key_env(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Documents processed in parallel within one batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Periodic poll interval for `serve`; 0 relies on webhooks only.
    #[serde(default)]
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            queue_capacity: default_queue_capacity(),
            poll_interval_secs: 0,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_queue_capacity() -> usize {
    16
}

/// Fixed-window budgets for external calls; 0 disables a limit.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_extract_per_window")]
    pub extract_per_window: u32,
    #[serde(default = "default_embed_per_window")]
    pub embed_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            extract_per_window: default_extract_per_window(),
            embed_per_window: default_embed_per_window(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_extract_per_window() -> u32 {
    600
}
fn default_embed_per_window() -> u32 {
    3000
}
fn default_window_secs() -> u64 {
    60
}

impl LimitsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Environment variable holding the bearer token for trigger and query routes.
    #[serde(default = "default_trigger_token_env")]
    pub trigger_token_env: String,
    /// Environment variable holding the webhook channel token / HMAC secret.
    #[serde(default = "default_webhook_secret_env")]
    pub webhook_secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            trigger_token_env: default_trigger_token_env(),
            webhook_secret_env: default_webhook_secret_env(),
        }
    }
}

fn default_trigger_token_env() -> String {
    "DOCSYNC_TRIGGER_TOKEN".to_string()
}
fn default_webhook_secret_env() -> String {
    "DOCSYNC_WEBHOOK_SECRET".to_string()
}

impl AuthConfig {
    pub fn trigger_token(&self) -> Option<String> {
        read_secret(&self.trigger_token_env)
    }

    pub fn webhook_secret(&self) -> Option<String> {
        read_secret(&self.webhook_secret_env)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `"filesystem"` or `"drive"`.
    pub kind: String,
    #[serde(default)]
    pub filesystem: Option<FilesystemSourceConfig>,
    #[serde(default)]
    pub drive: Option<DriveSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Applied when a file has no `core` front-matter key.
    #[serde(default)]
    pub default_core: bool,
    /// Applied when a file has no `audience` front-matter key.
    #[serde(default)]
    pub default_audience: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveSourceConfig {
    pub root_folder_id: String,
    /// Holds a service-account key, as JSON or base64-encoded JSON.
    /// Preferred over `access_token_env` when both are set.
    #[serde(default = "default_service_account_env")]
    pub service_account_env: String,
    /// Holds a pre-minted bearer token. It is never refreshed.
    #[serde(default = "default_drive_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_drive_api_base")]
    pub api_base: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_service_account_env() -> String {
    "GOOGLE_SERVICE_ACCOUNT".to_string()
}
fn default_drive_token_env() -> String {
    "DRIVE_ACCESS_TOKEN".to_string()
}
fn default_drive_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_page_size() -> u32 {
    200
}

/// Read a non-empty environment variable.
pub fn read_secret(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn chunker(&self) -> Result<Chunker> {
        Chunker::new(self.chunking.max_tokens, self.chunking.overlap_tokens)
            .context("invalid [chunking] section")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config.chunker()?;

    let r = &config.retrieval;
    for (name, weight) in [
        ("semantic_weight", r.semantic_weight),
        ("lexical_weight", r.lexical_weight),
        ("recency_weight", r.recency_weight),
        ("core_weight", r.core_weight),
    ] {
        if !(0.0..=1.0).contains(&weight) {
            bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if r.max_k == 0 || r.default_k == 0 {
        bail!("retrieval.default_k and retrieval.max_k must be >= 1");
    }
    if r.default_k > r.max_k {
        bail!("retrieval.default_k must not exceed retrieval.max_k");
    }
    if r.recency_half_life_days <= 0.0 {
        bail!("retrieval.recency_half_life_days must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.unwrap_or(0) == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.sync.concurrency == 0 {
        bail!("sync.concurrency must be >= 1");
    }
    if config.sync.max_attempts == 0 {
        bail!("sync.max_attempts must be >= 1");
    }
    if config.sync.queue_capacity == 0 {
        bail!("sync.queue_capacity must be >= 1");
    }

    match config.source.kind.as_str() {
        "filesystem" if config.source.filesystem.is_none() => {
            bail!("source.kind = \"filesystem\" requires a [source.filesystem] section")
        }
        "drive" if config.source.drive.is_none() => {
            bail!("source.kind = \"drive\" requires a [source.drive] section")
        }
        "filesystem" | "drive" => {}
        other => bail!(
            "Unknown source kind: '{}'. Must be filesystem or drive.",
            other
        ),
    }

    Ok(())
}
