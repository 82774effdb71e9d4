//! Local directory change source.
//!
//! Walks a root directory with include/exclude globs. Each matching file is
//! one document whose id is its path relative to the root. Access metadata
//! comes from an optional TOML front-matter block fenced by `+++` lines:
//!
//! ```text
//! +++
//! core = false
//! audience = ["partners"]
//! last_reviewed_at = 2024-03-01
//! maintained_by = "ops@example.org"
//! +++
//! # Enrollment policy
//! ```
//!
//! Poll tokens are `<unix millis>-<seq>` high-water marks, where `seq`
//! counts tokens issued by this process. Each token handed out is paired
//! with the set of ids present when it was issued, and a poll from
//! that token reports every id that has since disappeared. Re-polling the
//! same token therefore re-delivers the same removals. Tokens issued by
//! another process have no baseline; their removals are caught by the next
//! bootstrap sweep.
//!
//! A file whose front matter does not parse is still enumerated with
//! default metadata, and its extraction fails, so the document is recorded
//! as `error` without holding back the rest of the tree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use walkdir::WalkDir;

use docsync_core::capability::{ChangeSource, DocumentStream, Extractor};
use docsync_core::error::CapabilityError;
use docsync_core::models::{AccessAttributes, ChangeBatch, ChangeEvent, DocumentRef, Extraction};

use crate::config::FilesystemSourceConfig;
use crate::extract::{content_type_for_path, extract_text, is_text_type};

const FENCE: &str = "+++";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
/// File timestamps come from a coarse kernel clock and can trail the token
/// clock slightly; files modified this close before a token are re-reported.
const MTIME_SLACK_MS: i64 = 2_000;

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    title: Option<String>,
    core: Option<bool>,
    audience: Option<Vec<String>>,
    #[serde(default)]
    age_levels: Vec<String>,
    #[serde(default)]
    geographies: Vec<String>,
    #[serde(default)]
    governance: Vec<String>,
    vouchers: Option<bool>,
    last_reviewed_at: Option<toml::Value>,
    maintained_by: Option<String>,
}

/// Parse the front matter of `text`, returning it with the remaining body.
fn parse_front_matter<'a>(id: &str, text: &'a str) -> Result<(FrontMatter, &'a str), CapabilityError> {
    match split_front_matter(text) {
        (Some(raw), body) => toml::from_str::<FrontMatter>(raw)
            .map(|front| (front, body))
            .map_err(|e| CapabilityError::permanent(format!("{}: invalid front matter: {}", id, e))),
        (None, body) => Ok((FrontMatter::default(), body)),
    }
}

/// Split a leading `+++` block off `text`. Returns the raw TOML (if any)
/// and the remaining body.
fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let rest = match text.strip_prefix(FENCE) {
        Some(rest) if rest.starts_with('\n') || rest.starts_with("\r\n") => rest,
        _ => return (None, text),
    };
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(header), body);
        }
        offset += line.len();
    }
    (None, text)
}

fn parse_review_date(value: &toml::Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Datetime(dt) => dt.to_string(),
        _ => return None,
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn io_error(path: &Path, err: std::io::Error) -> CapabilityError {
    use std::io::ErrorKind;
    let msg = format!("{}: {}", path.display(), err);
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            CapabilityError::Transient(msg)
        }
        _ => CapabilityError::Permanent(msg),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn unix_secs(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Position in the filesystem change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FsToken {
    millis: i64,
    seq: u64,
}

impl FsToken {
    /// Accepts `<millis>-<seq>` and bare `<millis>`.
    fn parse(raw: &str) -> Option<Self> {
        let (millis, seq) = match raw.split_once('-') {
            Some((millis, seq)) => (millis.parse().ok()?, seq.parse().ok()?),
            None => (raw.parse().ok()?, 0),
        };
        Some(Self { millis, seq })
    }
}

impl std::fmt::Display for FsToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

struct FsEntry {
    path: PathBuf,
    id: String,
    modified: i64,
}

/// Removal baselines for outstanding poll tokens.
#[derive(Default)]
struct Snapshots {
    next_seq: u64,
    /// Start token waiting for the enumeration that pairs with it.
    issued: Option<FsToken>,
    by_token: BTreeMap<FsToken, BTreeSet<String>>,
}

impl Snapshots {
    fn issue(&mut self) -> FsToken {
        let token = FsToken {
            millis: Utc::now().timestamp_millis(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        token
    }

    /// Ids present when `since` was issued. Older tokens can no longer be
    /// polled once the cursor has reached `since`, so they are dropped.
    fn baseline(&mut self, since: FsToken) -> Option<BTreeSet<String>> {
        self.by_token = self.by_token.split_off(&since);
        self.by_token.get(&since).cloned()
    }
}

pub struct FilesystemSource {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    default_core: bool,
    default_audience: BTreeSet<String>,
    snapshots: Mutex<Snapshots>,
}

impl FilesystemSource {
    pub fn new(config: &FilesystemSourceConfig) -> Result<Self> {
        if !config.root.exists() {
            bail!(
                "Filesystem source root does not exist: {}",
                config.root.display()
            );
        }

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
            default_core: config.default_core,
            default_audience: config.default_audience.iter().cloned().collect(),
            snapshots: Mutex::new(Snapshots::default()),
        })
    }

    fn matches(&self, rel: &str) -> bool {
        !self.exclude.is_match(rel) && self.include.is_match(rel)
    }

    /// All matching files, sorted by id.
    fn scan(&self) -> Result<Vec<FsEntry>, CapabilityError> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry.map_err(|e| CapabilityError::transient(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let id = relative.to_string_lossy().replace('\\', "/");
            if !self.matches(&id) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| CapabilityError::transient(e.to_string()))?;
            entries.push(FsEntry {
                path: path.to_path_buf(),
                id,
                modified: meta.modified().map(unix_millis).unwrap_or(0),
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    fn snapshots(&self) -> std::sync::MutexGuard<'_, Snapshots> {
        match self.snapshots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn resolve(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Build the metadata snapshot for one file. `None` when the file is
    /// gone.
    fn describe_path(&self, path: &Path, id: &str) -> Option<DocumentRef> {
        let (modified, revision) = match std::fs::metadata(path) {
            Ok(meta) => {
                let modified = meta.modified().map(unix_secs).unwrap_or(0);
                (Some(modified), Some(format!("{}:{}", modified, meta.len())))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                // Extraction hits the same error and records it on the document.
                tracing::warn!(document_id = %id, error = %err, "cannot stat file");
                (None, None)
            }
        };
        let content_type = content_type_for_path(path).unwrap_or(FALLBACK_CONTENT_TYPE);

        let front = if is_text_type(content_type) {
            let text = std::fs::read_to_string(path).unwrap_or_default();
            match parse_front_matter(id, &text) {
                Ok((front, _)) => front,
                Err(err) => {
                    tracing::warn!(document_id = %id, error = %err, "using default metadata");
                    FrontMatter::default()
                }
            }
        } else {
            FrontMatter::default()
        };

        let rel = Path::new(id);
        let path_segments: Vec<String> = rel
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let parent_id = if path_segments.is_empty() {
            None
        } else {
            Some(path_segments.join("/"))
        };

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| id.to_string());

        let audience = match front.audience {
            Some(list) => list.into_iter().collect(),
            None => self.default_audience.clone(),
        };

        Some(DocumentRef {
            id: id.to_string(),
            parent_id,
            path: path_segments,
            content_type: content_type.to_string(),
            title: front.title.unwrap_or(file_name),
            revision,
            modified_at: modified.and_then(|m| DateTime::from_timestamp(m, 0)),
            last_reviewed_at: front.last_reviewed_at.as_ref().and_then(parse_review_date),
            access: AccessAttributes {
                core: front.core.unwrap_or(self.default_core),
                audience,
                age_levels: front.age_levels.into_iter().collect(),
                geographies: front.geographies.into_iter().collect(),
                governance: front.governance.into_iter().collect(),
                vouchers: front.vouchers,
            },
            created_by: None,
            maintained_by: front.maintained_by,
        })
    }
}

#[async_trait]
impl ChangeSource for FilesystemSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn start_token(&self) -> Result<String, CapabilityError> {
        let mut snapshots = self.snapshots();
        let token = snapshots.issue();
        snapshots.issued = Some(token);
        Ok(token.to_string())
    }

    async fn bootstrap(&self) -> Result<DocumentStream, CapabilityError> {
        let entries = self.scan()?;
        {
            let mut snapshots = self.snapshots();
            if let Some(token) = snapshots.issued.take() {
                let ids: BTreeSet<String> = entries.iter().map(|e| e.id.clone()).collect();
                snapshots.by_token.insert(token, ids);
            }
        }

        let refs: Vec<Result<DocumentRef, CapabilityError>> = entries
            .iter()
            .filter_map(|e| self.describe_path(&e.path, &e.id))
            .map(Ok)
            .collect();
        tracing::debug!(count = refs.len(), root = %self.root.display(), "filesystem enumeration");
        Ok(Box::pin(stream::iter(refs)))
    }

    async fn poll_changes(&self, token: &str) -> Result<ChangeBatch, CapabilityError> {
        let since = FsToken::parse(token)
            .ok_or_else(|| CapabilityError::permanent(format!("invalid filesystem token: {}", token)))?;

        let (next, baseline, entries) = {
            let mut snapshots = self.snapshots();
            let next = snapshots.issue();
            let entries = self.scan()?;
            let current: BTreeSet<String> = entries.iter().map(|e| e.id.clone()).collect();
            let baseline = snapshots.baseline(since);
            snapshots.by_token.insert(next, current);
            (next, baseline, entries)
        };

        let mut events = Vec::new();
        for entry in entries.iter().filter(|e| e.modified >= since.millis - MTIME_SLACK_MS) {
            events.push(match self.describe_path(&entry.path, &entry.id) {
                Some(doc) => ChangeEvent::Upserted(doc),
                None => ChangeEvent::Removed { id: entry.id.clone() },
            });
        }
        if let Some(baseline) = baseline {
            let current: BTreeSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
            for id in baseline.iter().filter(|id| !current.contains(id.as_str())) {
                events.push(ChangeEvent::Removed { id: id.clone() });
            }
        }

        Ok(ChangeBatch {
            events,
            next_token: next.to_string(),
        })
    }

    async fn describe(&self, id: &str) -> Result<Option<DocumentRef>, CapabilityError> {
        let path = self.resolve(id);
        if !path.is_file() || !self.matches(id) {
            return Ok(None);
        }
        Ok(self.describe_path(&path, id))
    }
}

#[async_trait]
impl Extractor for FilesystemSource {
    async fn extract(&self, doc: &DocumentRef) -> Result<Extraction, CapabilityError> {
        let path = self.resolve(&doc.id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))?;

        let text = if is_text_type(&doc.content_type) {
            let raw = extract_text(&bytes, &doc.content_type)?;
            parse_front_matter(&doc.id, &raw)?.1.to_string()
        } else {
            let content_type = doc.content_type.clone();
            tokio::task::spawn_blocking(move || extract_text(&bytes, &content_type))
                .await
                .map_err(|e| CapabilityError::transient(e.to_string()))??
        };

        Ok(Extraction::from_raw(&text))
    }
}
