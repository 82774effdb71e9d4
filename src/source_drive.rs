//! Google Drive change source and extractor (Drive v3 REST).
//!
//! The managed hierarchy is everything below `root_folder_id`. Folders are
//! walked but never indexed. Access attributes are read from the file's
//! `appProperties` (`km_core`, `km_audience`, ...); list values are
//! comma-separated.
//!
//! A renamed or moved folder is re-walked so its descendants pick up the
//! new breadcrumbs; a folder trashed or moved out of the hierarchy removes
//! them. A file whose location cannot be resolved is reported as a
//! per-document failure instead of failing the batch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::{stream, FutureExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use docsync_core::capability::{ChangeSource, DocumentStream, Extractor};
use docsync_core::error::CapabilityError;
use docsync_core::models::{AccessAttributes, ChangeBatch, ChangeEvent, DocumentRef, Extraction};

use crate::config::DriveSourceConfig;
use crate::drive_auth::DriveAuth;
use crate::extract::{extract_text, is_text_type, MIME_DOCX, MIME_PDF, MIME_PPTX, MIME_XLSX};
use crate::retry::{classify_status, classify_transport, with_backoff, RetryPolicy};

pub const MIME_FOLDER: &str = "application/vnd.google-apps.folder";
const GOOGLE_APPS_PREFIX: &str = "application/vnd.google-apps.";

const FILE_FIELDS: &str =
    "id,name,mimeType,parents,md5Checksum,modifiedTime,trashed,appProperties,owners(emailAddress)";

/// Parent-chain walks stop after this many hops.
const MAX_DEPTH: usize = 64;

/// Export format for Google-native document types.
pub fn export_mime(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "application/vnd.google-apps.document" => Some("text/plain"),
        "application/vnd.google-apps.spreadsheet" => Some("text/csv"),
        "application/vnd.google-apps.presentation" => Some("text/plain"),
        _ => None,
    }
}

fn downloadable(mime_type: &str) -> bool {
    matches!(mime_type, MIME_PDF | MIME_DOCX | MIME_PPTX | MIME_XLSX) || is_text_type(mime_type)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub md5_checksum: Option<String>,
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub app_properties: HashMap<String, String>,
    #[serde(default)]
    pub owners: Vec<DriveOwner>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveOwner {
    pub email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveChange {
    file_id: Option<String>,
    #[serde(default)]
    removed: bool,
    file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeList {
    #[serde(default)]
    changes: Vec<DriveChange>,
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

fn split_list(value: Option<&String>) -> std::collections::BTreeSet<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_flag(value: Option<&String>) -> Option<bool> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("true") | Some("1") | Some("yes") => Some(true),
        Some("false") | Some("0") | Some("no") => Some(false),
        _ => None,
    }
}

fn parse_date(value: Option<&String>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == MIME_FOLDER
    }

    /// Convert to a pipeline snapshot given the resolved ancestor names.
    pub fn to_ref(&self, path: Vec<String>) -> DocumentRef {
        let props = &self.app_properties;
        // Native Google files carry no md5Checksum; modifiedTime stands in.
        let revision = self.md5_checksum.clone().or_else(|| {
            self.modified_time
                .map(|t| format!("modified:{}", t.to_rfc3339()))
        });
        DocumentRef {
            id: self.id.clone(),
            parent_id: self.parents.first().cloned(),
            path,
            content_type: self.mime_type.clone(),
            title: self.name.clone(),
            revision,
            modified_at: self.modified_time,
            last_reviewed_at: parse_date(props.get("km_last_reviewed_at")),
            access: AccessAttributes {
                core: parse_flag(props.get("km_core")).unwrap_or(false),
                audience: split_list(props.get("km_audience")),
                age_levels: split_list(props.get("km_age_levels")),
                geographies: split_list(props.get("km_geographies")),
                governance: split_list(props.get("km_governance")),
                vouchers: parse_flag(props.get("km_vouchers")),
            },
            created_by: self.owners.iter().find_map(|o| o.email_address.clone()),
            maintained_by: props.get("km_maintained_by").cloned(),
        }
    }
}

/// Thin Drive v3 client. Every call is a single attempt unless noted.
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    auth: DriveAuth,
    page_size: u32,
}

impl DriveClient {
    pub fn new(config: &DriveSourceConfig, auth: DriveAuth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth,
            page_size: config.page_size,
        })
    }

    /// One authorized request. A 401 drops the cached token and is
    /// transient when a fresh token can be minted.
    async fn send(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, CapabilityError> {
        let token = self.auth.bearer().await?;
        let response = self
            .http
            .get(format!("{}/{}", self.api_base, path))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED && self.auth.reject().await {
            return Err(CapabilityError::transient("Drive rejected the access token"));
        }
        Ok(response)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, CapabilityError> {
        let response = self.send(path, query).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CapabilityError> {
        self.get(path, query)
            .await?
            .json()
            .await
            .map_err(|e| CapabilityError::permanent(format!("invalid Drive response: {}", e)))
    }

    /// Metadata for one file; `None` when Drive answers 404.
    pub async fn get_file(&self, id: &str) -> Result<Option<DriveFile>, CapabilityError> {
        let response = self
            .send(
                &format!("files/{}", id),
                &[("fields", FILE_FIELDS), ("supportsAllDrives", "true")],
            )
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| CapabilityError::permanent(format!("invalid Drive response: {}", e)))
    }

    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        include_trashed: bool,
    ) -> Result<FileList, CapabilityError> {
        let q = if include_trashed {
            format!("'{}' in parents", folder_id)
        } else {
            format!("'{}' in parents and trashed = false", folder_id)
        };
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let page_size = self.page_size.to_string();
        let mut query = vec![
            ("q", q.as_str()),
            ("fields", fields.as_str()),
            ("pageSize", page_size.as_str()),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        self.get_json("files", &query).await
    }

    async fn start_page_token(&self) -> Result<String, CapabilityError> {
        let token: StartPageToken = self
            .get_json("changes/startPageToken", &[("supportsAllDrives", "true")])
            .await?;
        Ok(token.start_page_token)
    }

    async fn changes(&self, page_token: &str) -> Result<ChangeList, CapabilityError> {
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,file({}))",
            FILE_FIELDS
        );
        let page_size = self.page_size.to_string();
        self.get_json(
            "changes",
            &[
                ("pageToken", page_token),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
                ("includeRemoved", "true"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ],
        )
        .await
    }

    async fn export(&self, id: &str, mime: &str) -> Result<Vec<u8>, CapabilityError> {
        let response = self
            .get(&format!("files/{}/export", id), &[("mimeType", mime)])
            .await?;
        Ok(response.bytes().await.map_err(classify_transport)?.to_vec())
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, CapabilityError> {
        let response = self
            .get(
                &format!("files/{}", id),
                &[("alt", "media"), ("supportsAllDrives", "true")],
            )
            .await?;
        Ok(response.bytes().await.map_err(classify_transport)?.to_vec())
    }
}

/// Breadth-first enumeration of the documents below one folder.
struct Walk {
    client: Arc<DriveClient>,
    retry: RetryPolicy,
    folders: VecDeque<(String, Vec<String>)>,
    page: Option<(String, Vec<String>, String)>,
    pending: VecDeque<DocumentRef>,
    /// Also list trashed children; used to find what a trashed folder held.
    include_trashed: bool,
    failed: bool,
}

impl Walk {
    fn new(client: Arc<DriveClient>, retry: RetryPolicy, folder_id: String, path: Vec<String>) -> Self {
        Self {
            client,
            retry,
            folders: VecDeque::from([(folder_id, path)]),
            page: None,
            pending: VecDeque::new(),
            include_trashed: false,
            failed: false,
        }
    }

    fn including_trashed(mut self) -> Self {
        self.include_trashed = true;
        self
    }

    async fn next_doc(&mut self) -> Option<Result<DocumentRef, CapabilityError>> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(doc) = self.pending.pop_front() {
                return Some(Ok(doc));
            }
            let (folder, path, token) = match self.page.take() {
                Some((folder, path, token)) => (folder, path, Some(token)),
                None => match self.folders.pop_front() {
                    Some((folder, path)) => (folder, path, None),
                    None => return None,
                },
            };

            let client = self.client.as_ref();
            let (folder_id, page_token) = (folder.as_str(), token.as_deref());
            let include_trashed = self.include_trashed;
            let listing = with_backoff(&self.retry, "drive.files.list", move || {
                client
                    .list_children(folder_id, page_token, include_trashed)
                    .boxed()
            })
            .await;

            match listing {
                Ok(list) => {
                    for file in list.files {
                        if file.trashed && !self.include_trashed {
                            continue;
                        }
                        if file.is_folder() {
                            let mut child = path.clone();
                            child.push(file.name.clone());
                            self.folders.push_back((file.id, child));
                        } else {
                            self.pending.push_back(file.to_ref(path.clone()));
                        }
                    }
                    if let Some(next) = list.next_page_token {
                        self.page = Some((folder, path, next));
                    }
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

pub struct DriveSource {
    client: Arc<DriveClient>,
    root_folder_id: String,
    retry: RetryPolicy,
    /// Folder id → (name, parent id).
    folders: Mutex<HashMap<String, (String, Option<String>)>>,
}

impl DriveSource {
    /// Build a source with the credentials the config names.
    pub fn new(config: &DriveSourceConfig, retry: RetryPolicy) -> Result<Self> {
        Self::with_auth(config, DriveAuth::from_config(config)?, retry)
    }

    pub fn with_auth(config: &DriveSourceConfig, auth: DriveAuth, retry: RetryPolicy) -> Result<Self> {
        tracing::info!(root = %config.root_folder_id, credentials = ?auth, "Drive source configured");
        Ok(Self {
            client: Arc::new(DriveClient::new(config, auth)?),
            root_folder_id: config.root_folder_id.clone(),
            retry,
            folders: Mutex::new(HashMap::new()),
        })
    }

    fn cached_folder(&self, id: &str) -> Option<(String, Option<String>)> {
        self.folders.lock().ok()?.get(id).cloned()
    }

    fn cache_folder(&self, id: &str, entry: (String, Option<String>)) {
        if let Ok(mut folders) = self.folders.lock() {
            folders.insert(id.to_string(), entry);
        }
    }

    fn forget_folder(&self, id: &str) {
        if let Ok(mut folders) = self.folders.lock() {
            folders.remove(id);
        }
    }

    /// Ancestor folder names below the root, or `None` when the file is not
    /// inside the managed hierarchy.
    async fn resolve_path(&self, file: &DriveFile) -> Result<Option<Vec<String>>, CapabilityError> {
        let mut segments = Vec::new();
        let mut current = file.parents.first().cloned();
        while let Some(id) = current {
            if id == self.root_folder_id {
                segments.reverse();
                return Ok(Some(segments));
            }
            if segments.len() >= MAX_DEPTH {
                break;
            }
            let (name, parent) = match self.cached_folder(&id) {
                Some(entry) => entry,
                None => match self.client.get_file(&id).await? {
                    Some(folder) => {
                        let entry = (folder.name.clone(), folder.parents.first().cloned());
                        self.cache_folder(&id, entry.clone());
                        entry
                    }
                    None => return Ok(None),
                },
            };
            segments.push(name);
            current = parent;
        }
        Ok(None)
    }

    async fn change_events(&self, change: DriveChange) -> Result<Vec<ChangeEvent>, CapabilityError> {
        let Some(id) = change.file_id.or_else(|| change.file.as_ref().map(|f| f.id.clone())) else {
            return Ok(Vec::new());
        };
        let file = match change.file {
            Some(file) if file.is_folder() => return self.folder_events(&file, change.removed).await,
            Some(file) if !change.removed && !file.trashed => file,
            _ => {
                self.forget_folder(&id);
                return Ok(vec![ChangeEvent::Removed { id }]);
            }
        };
        match self.resolve_path(&file).await {
            Ok(Some(path)) => Ok(vec![ChangeEvent::Upserted(file.to_ref(path))]),
            Ok(None) => Ok(vec![ChangeEvent::Removed { id }]),
            Err(err) if err.is_transient() => Err(err),
            Err(err) => Ok(vec![ChangeEvent::Failed {
                id,
                reason: format!("cannot resolve location: {}", err),
            }]),
        }
    }

    /// Re-describe everything below a changed folder: upserts with the new
    /// breadcrumbs while it sits inside the hierarchy, removals once it is
    /// trashed or moved out.
    async fn folder_events(&self, folder: &DriveFile, removed: bool) -> Result<Vec<ChangeEvent>, CapabilityError> {
        if folder.id == self.root_folder_id {
            return Ok(Vec::new());
        }
        let gone = removed || folder.trashed;
        let location = if gone {
            self.forget_folder(&folder.id);
            None
        } else {
            self.cache_folder(&folder.id, (folder.name.clone(), folder.parents.first().cloned()));
            match self.resolve_path(folder).await {
                Ok(location) => location,
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        folder_id = %folder.id,
                        error = %err,
                        "cannot resolve changed folder; descendants keep their breadcrumbs"
                    );
                    return Ok(Vec::new());
                }
            }
        };

        let mut walk = match &location {
            Some(ancestors) => {
                let mut path = ancestors.clone();
                path.push(folder.name.clone());
                Walk::new(self.client.clone(), self.retry, folder.id.clone(), path)
            }
            None => Walk::new(self.client.clone(), self.retry, folder.id.clone(), Vec::new())
                .including_trashed(),
        };
        let mut events = Vec::new();
        while let Some(doc) = walk.next_doc().await {
            let doc = doc?;
            events.push(if location.is_some() {
                ChangeEvent::Upserted(doc)
            } else {
                ChangeEvent::Removed { id: doc.id }
            });
        }
        tracing::debug!(
            folder_id = %folder.id,
            descendants = events.len(),
            inside = location.is_some(),
            "re-walked changed folder"
        );
        Ok(events)
    }
}

#[async_trait]
impl ChangeSource for DriveSource {
    fn name(&self) -> &str {
        "drive"
    }

    async fn start_token(&self) -> Result<String, CapabilityError> {
        self.client.start_page_token().await
    }

    async fn bootstrap(&self) -> Result<DocumentStream, CapabilityError> {
        let walk = Walk::new(
            self.client.clone(),
            self.retry,
            self.root_folder_id.clone(),
            Vec::new(),
        );
        let docs = stream::unfold(walk, |mut walk| async move {
            walk.next_doc().await.map(|item| (item, walk))
        });
        Ok(Box::pin(docs))
    }

    async fn poll_changes(&self, token: &str) -> Result<ChangeBatch, CapabilityError> {
        let mut events = Vec::new();
        let mut page_token = token.to_string();
        loop {
            let list = self.client.changes(&page_token).await?;
            for change in list.changes {
                events.extend(self.change_events(change).await?);
            }
            match (list.next_page_token, list.new_start_page_token) {
                (Some(next), _) => page_token = next,
                (None, Some(next_token)) => return Ok(ChangeBatch { events, next_token }),
                (None, None) => {
                    return Err(CapabilityError::permanent(
                        "Drive changes response carried neither nextPageToken nor newStartPageToken",
                    ))
                }
            }
        }
    }

    async fn describe(&self, id: &str) -> Result<Option<DocumentRef>, CapabilityError> {
        let Some(file) = self.client.get_file(id).await? else {
            return Ok(None);
        };
        if file.trashed || file.is_folder() {
            return Ok(None);
        }
        Ok(self.resolve_path(&file).await?.map(|path| file.to_ref(path)))
    }
}

#[async_trait]
impl Extractor for DriveSource {
    async fn extract(&self, doc: &DocumentRef) -> Result<Extraction, CapabilityError> {
        let text = if let Some(export) = export_mime(&doc.content_type) {
            let bytes = self.client.export(&doc.id, export).await?;
            extract_text(&bytes, export)?
        } else if !doc.content_type.starts_with(GOOGLE_APPS_PREFIX) && downloadable(&doc.content_type) {
            let bytes = self.client.download(&doc.id).await?;
            let content_type = doc.content_type.clone();
            tokio::task::spawn_blocking(move || extract_text(&bytes, &content_type))
                .await
                .map_err(|e| CapabilityError::transient(e.to_string()))??
        } else {
            return Err(CapabilityError::Unsupported(doc.content_type.clone()));
        };
        Ok(Extraction::from_raw(&text))
    }
}
