//! SQLite-backed [`Store`] and [`CursorStore`].
//!
//! Tables: `documents`, `chunks`, `chunks_fts` (FTS5), `chunk_vectors`
//! and the singleton `sync_cursor`. Access tag sets are stored as JSON
//! arrays so the visibility rule can be evaluated in SQL with `json_each`.

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use docsync_core::chunk::chunk_id;
use docsync_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docsync_core::models::{
    AccessAttributes, CursorState, DocumentRef, DocumentStatus, SourceDocument, StoredChunkState,
};
use docsync_core::reconcile::{ChunkSet, EmbeddingUpdate, ReconcileReport};
use docsync_core::search::AccessContext;
use docsync_core::store::{CandidateDocument, ChunkCandidate, CursorStore, Store};

/// Visibility rule shared by both candidate queries. Expects the caller's
/// audience as a JSON array bound to the single placeholder.
const VISIBLE_SQL: &str = r#"
    c.embed_error IS NULL
    AND d.status NOT IN ('error', 'deleted')
    AND (
        d.core = 1
        OR EXISTS (
            SELECT 1 FROM json_each(d.audience) a
            WHERE a.value IN (SELECT value FROM json_each(?))
        )
    )
"#;

/// SQLite implementation of the storage traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ts(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp())
}

fn from_ts(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t, 0))
}

fn tags_to_json(tags: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(tags)?)
}

fn tags_from_json(raw: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(raw).with_context(|| format!("malformed tag set: {}", raw))
}

fn path_from_json(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).with_context(|| format!("malformed path: {}", raw))
}

fn document_from_row(row: &SqliteRow) -> Result<SourceDocument> {
    let status: String = row.get("status");
    let vouchers: Option<i64> = row.get("vouchers");
    Ok(SourceDocument {
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        path: path_from_json(row.get("path_json"))?,
        content_type: row.get("content_type"),
        title: row.get("title"),
        fingerprint: row.get("fingerprint"),
        source_revision: row.get("source_revision"),
        modified_at: from_ts(row.get("modified_at")),
        last_reviewed_at: from_ts(row.get("last_reviewed_at")),
        access: AccessAttributes {
            core: row.get::<i64, _>("core") != 0,
            audience: tags_from_json(row.get("audience"))?,
            age_levels: tags_from_json(row.get("age_levels"))?,
            geographies: tags_from_json(row.get("geographies"))?,
            governance: tags_from_json(row.get("governance"))?,
            vouchers: vouchers.map(|v| v != 0),
        },
        created_by: row.get("created_by"),
        maintained_by: row.get("maintained_by"),
        status: status.parse()?,
        error: row.get("error"),
        chunk_count: row.get("chunk_count"),
        last_synced_at: from_ts(row.get("last_synced_at")),
    })
}

fn candidate_from_row(row: &SqliteRow, raw_score: f64) -> Result<ChunkCandidate> {
    let status: String = row.get("status");
    Ok(ChunkCandidate {
        chunk_id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        raw_score,
        text: row.get("text"),
        document: CandidateDocument {
            title: row.get("title"),
            path: path_from_json(row.get("path_json"))?,
            core: row.get::<i64, _>("core") != 0,
            audience: tags_from_json(row.get("audience"))?,
            status: status.parse()?,
            last_reviewed_at: from_ts(row.get("last_reviewed_at")),
        },
    })
}

/// Turn free text into an FTS5 query that cannot trip the query syntax:
/// every alphanumeric run becomes a quoted term, joined with OR.
pub fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

async fn write_vector(
    tx: &mut Transaction<'_, Sqlite>,
    chunk_id: &str,
    doc_id: &str,
    hash: &str,
    update: &EmbeddingUpdate,
) -> Result<()> {
    match update {
        EmbeddingUpdate::Set { vector, model } => {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, embedding, model, dims, hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    embedding = excluded.embedding,
                    model = excluded.model,
                    dims = excluded.dims,
                    hash = excluded.hash,
                    created_at = excluded.created_at
                "#,
            )
            .bind(chunk_id)
            .bind(doc_id)
            .bind(vec_to_blob(vector))
            .bind(model)
            .bind(vector.len() as i64)
            .bind(hash)
            .bind(Utc::now().timestamp())
            .execute(&mut **tx)
            .await?;
        }
        EmbeddingUpdate::Keep | EmbeddingUpdate::Missing | EmbeddingUpdate::Failed { .. } => {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

fn embed_error(update: &EmbeddingUpdate) -> Option<&str> {
    match update {
        EmbeddingUpdate::Failed { reason } => Some(reason.as_str()),
        _ => None,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn upsert_document(&self, doc: &DocumentRef, status: DocumentStatus) -> Result<String> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO documents (id, parent_id, path_json, content_type, title,
                                   modified_at, last_reviewed_at, core, audience,
                                   age_levels, geographies, governance, vouchers,
                                   created_by, maintained_by, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                path_json = excluded.path_json,
                content_type = excluded.content_type,
                title = excluded.title,
                modified_at = excluded.modified_at,
                last_reviewed_at = excluded.last_reviewed_at,
                core = excluded.core,
                audience = excluded.audience,
                age_levels = excluded.age_levels,
                geographies = excluded.geographies,
                governance = excluded.governance,
                vouchers = excluded.vouchers,
                created_by = excluded.created_by,
                maintained_by = excluded.maintained_by,
                status = excluded.status,
                error = CASE WHEN excluded.status = 'error' THEN documents.error ELSE NULL END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.parent_id)
        .bind(serde_json::to_string(&doc.path)?)
        .bind(&doc.content_type)
        .bind(&doc.title)
        .bind(to_ts(doc.modified_at))
        .bind(to_ts(doc.last_reviewed_at))
        .bind(doc.access.core as i64)
        .bind(tags_to_json(&doc.access.audience)?)
        .bind(tags_to_json(&doc.access.age_levels)?)
        .bind(tags_to_json(&doc.access.geographies)?)
        .bind(tags_to_json(&doc.access.governance)?)
        .bind(doc.access.vouchers.map(|v| v as i64))
        .bind(&doc.created_by)
        .bind(&doc.maintained_by)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(doc.id.clone())
    }

    async fn chunk_states(&self, doc_id: &str) -> Result<Vec<StoredChunkState>> {
        let rows = sqlx::query(
            r#"
            SELECT c.chunk_index, c.hash, c.embed_error, cv.model
            FROM chunks c
            LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
            WHERE c.document_id = ?
            ORDER BY c.chunk_index ASC
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let model: Option<String> = row.get("model");
                StoredChunkState {
                    index: row.get("chunk_index"),
                    hash: row.get("hash"),
                    has_vector: model.is_some(),
                    embedding_model: model,
                    embed_error: row.get("embed_error"),
                }
            })
            .collect())
    }

    async fn replace_chunks(&self, set: &ChunkSet) -> Result<ReconcileReport> {
        let doc_id = set.document_id();
        let new_len = set.len() as i64;
        let mut report = ReconcileReport::default();
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM documents WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            bail!("cannot replace chunks of unknown document {}", doc_id);
        }

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ? AND chunk_index >= ?)",
        )
        .bind(doc_id)
        .bind(new_len)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ? AND chunk_index >= ?)",
        )
        .bind(doc_id)
        .bind(new_len)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE document_id = ? AND chunk_index >= ?")
            .bind(doc_id)
            .bind(new_len)
            .execute(&mut *tx)
            .await?;
        report.deleted = deleted.rows_affected() as usize;

        let existing: HashMap<i64, (String, String)> =
            sqlx::query("SELECT id, chunk_index, hash FROM chunks WHERE document_id = ?")
                .bind(doc_id)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| {
                    (
                        row.get::<i64, _>("chunk_index"),
                        (row.get::<String, _>("id"), row.get::<String, _>("hash")),
                    )
                })
                .collect();

        for write in set.writes() {
            let draft = &write.draft;
            match existing.get(&draft.index) {
                Some((_, hash))
                    if *hash == draft.hash && write.embedding == EmbeddingUpdate::Keep =>
                {
                    report.unchanged += 1;
                }
                Some((id, hash)) => {
                    let text_changed = *hash != draft.hash;
                    sqlx::query(
                        "UPDATE chunks SET text = ?, hash = ?, token_count = ?, embed_error = ? WHERE id = ?",
                    )
                    .bind(&draft.text)
                    .bind(&draft.hash)
                    .bind(draft.token_count)
                    .bind(embed_error(&write.embedding))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;

                    if text_changed {
                        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                        sqlx::query(
                            "INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)",
                        )
                        .bind(id)
                        .bind(doc_id)
                        .bind(&draft.text)
                        .execute(&mut *tx)
                        .await?;
                    }

                    write_vector(&mut tx, id, doc_id, &draft.hash, &write.embedding).await?;
                    report.updated += 1;
                }
                None => {
                    let id = chunk_id(doc_id, draft.index);
                    sqlx::query(
                        r#"
                        INSERT INTO chunks (id, document_id, chunk_index, text, hash, token_count, embed_error)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&id)
                    .bind(doc_id)
                    .bind(draft.index)
                    .bind(&draft.text)
                    .bind(&draft.hash)
                    .bind(draft.token_count)
                    .bind(embed_error(&write.embedding))
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                        .bind(&id)
                        .bind(doc_id)
                        .bind(&draft.text)
                        .execute(&mut *tx)
                        .await?;

                    if let EmbeddingUpdate::Set { .. } = write.embedding {
                        write_vector(&mut tx, &id, doc_id, &draft.hash, &write.embedding).await?;
                    }
                    report.inserted += 1;
                }
            }
        }

        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE documents
            SET fingerprint = ?, source_revision = ?, status = 'indexed', error = NULL,
                chunk_count = ?, last_synced_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(set.fingerprint())
        .bind(set.source_revision())
        .bind(new_len)
        .bind(now)
        .bind(now)
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(report)
    }

    async fn mark_error(&self, doc_id: &str, reason: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'error', error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(Utc::now().timestamp())
        .bind(doc_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("cannot mark unknown document {} as failed", doc_id);
        }
        Ok(())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(&mut *tx)
            .await?;
        match status.as_deref() {
            None | Some("deleted") => return Ok(false),
            Some(_) => {}
        }

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE documents
            SET status = 'deleted', fingerprint = NULL, source_revision = NULL,
                error = NULL, chunk_count = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn active_document_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM documents WHERE status != 'deleted' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn keyword_search(
        &self,
        query: &str,
        access: &AccessContext,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            r#"
            SELECT chunks_fts.chunk_id AS chunk_id, chunks_fts.document_id AS document_id,
                   chunks_fts.rank AS rank, c.chunk_index, c.text,
                   d.title, d.path_json, d.core, d.audience, d.status, d.last_reviewed_at
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            JOIN documents d ON d.id = chunks_fts.document_id
            WHERE chunks_fts MATCH ?
              AND {}
            ORDER BY rank
            LIMIT ?
            "#,
            VISIBLE_SQL
        );

        let rows = sqlx::query(&sql)
            .bind(match_expr)
            .bind(serde_json::to_string(&access.audience)?)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                candidate_from_row(row, -rank)
            })
            .collect()
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        access: &AccessContext,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let sql = format!(
            r#"
            SELECT cv.chunk_id AS chunk_id, cv.document_id AS document_id, cv.embedding,
                   c.chunk_index, c.text,
                   d.title, d.path_json, d.core, d.audience, d.status, d.last_reviewed_at
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
            WHERE {}
            "#,
            VISIBLE_SQL
        );

        let rows = sqlx::query(&sql)
            .bind(serde_json::to_string(&access.audience)?)
            .fetch_all(&self.pool)
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob)?;
            let similarity = cosine_similarity(query_vec, &vector) as f64;
            candidates.push(candidate_from_row(row, similarity)?);
        }

        candidates.sort_by(|a, b| {
            b.raw_score
                .total_cmp(&a.raw_score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn status_counts(&self) -> Result<Vec<(DocumentStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok((status.parse()?, row.get::<i64, _>("n")))
            })
            .collect()
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn load(&self) -> Result<Option<CursorState>> {
        let row = sqlx::query("SELECT token, applied_at FROM sync_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| CursorState {
            token: r.get("token"),
            applied_at: from_ts(Some(r.get("applied_at"))).unwrap_or_else(Utc::now),
        }))
    }

    async fn commit(&self, expected: Option<&str>, next: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO sync_cursor (id, token, applied_at) VALUES (1, ?, ?) ON CONFLICT(id) DO NOTHING",
                )
                .bind(next)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query("UPDATE sync_cursor SET token = ?, applied_at = ? WHERE id = 1 AND token = ?")
                    .bind(next)
                    .bind(now)
                    .bind(expected)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn reset(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_cursor").execute(&self.pool).await?;
        Ok(())
    }
}
