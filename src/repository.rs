//! Document repository: the sole owner of the persistent collection.
//!
//! Implements CRUD, soft/hard deletion, filtered listing with pagination,
//! version supersession, and vector search over the SQLite-backed store.
//! Embedding vectors live in a side table (`document_vectors`) as
//! little-endian f32 BLOBs; similarity is computed in Rust over fetched
//! vectors.
//!
//! Supersession (`deactivate_siblings`) is serialized per `source_id` via an
//! in-process lock map, so two concurrent insertions for the same logical
//! document cannot both believe they are the latest version. No lock is held
//! while an embedding call is in flight.

use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::error::{EngineError, Result};
use crate::models::{
    generate_document_id, Document, DocumentFilter, DocumentInput, DocumentMetadata, DocumentPage,
    MetadataPatch, QueryHit,
};

/// Hard upper bound on `page_size`; larger requests are clamped.
const MAX_PAGE_SIZE: u64 = 100;

/// Aggregate statistics over the stored corpus.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStats {
    pub total_documents: u64,
    pub active_documents: u64,
    pub unique_sources: u64,
    pub unique_source_ids: u64,
    pub tags_distribution: BTreeMap<String, u64>,
    pub version_distribution: BTreeMap<String, u64>,
}

pub struct DocumentRepository {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    /// Group size for batch embedding calls; bounds concurrency toward the
    /// provider.
    batch_size: usize,
    supersession_locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            pool,
            embedder,
            batch_size: batch_size.max(1),
            supersession_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== Lifecycle operations ====================

    /// Add a document: embed its content, persist document + vector, and —
    /// when `auto_deactivate` is set and the new document is active —
    /// deactivate all other active documents sharing its `source_id`.
    ///
    /// Re-adding an identical (source_id, version, content) triple produces
    /// the same deterministic id and upserts in place.
    pub async fn add(&self, input: DocumentInput, auto_deactivate: bool) -> Result<String> {
        validate_input("add", &input)?;

        // Embed before taking the supersession lock.
        let vector = self
            .embedder
            .embed_one(&input.content)
            .await
            .map_err(|e| EngineError::embedding("add", e))?;

        let lock = self.source_lock(&input.source_id);
        let _guard = lock.lock().await;

        let id = self.persist(&input, &vector).await?;

        if auto_deactivate && input.is_active {
            let count = self.deactivate_siblings_inner("add", &input.source_id, &id).await?;
            if count > 0 {
                debug!(source_id = %input.source_id, deactivated = count, "superseded older versions");
            }
        }

        info!(id = %id, source_id = %input.source_id, version = %input.version, "document added");
        Ok(id)
    }

    /// Best-effort batch add: one outcome per input, in input order. A
    /// failure embedding or persisting one item never aborts the others, so
    /// callers can retry only the failed subset. Embedding happens in
    /// `batch_size` groups rather than unbounded parallel calls.
    pub async fn add_batch(
        &self,
        inputs: Vec<DocumentInput>,
        auto_deactivate: bool,
    ) -> Vec<Result<String>> {
        let mut outcomes: Vec<Option<Result<String>>> = Vec::with_capacity(inputs.len());
        let mut pending: Vec<(usize, DocumentInput)> = Vec::new();

        for (idx, input) in inputs.into_iter().enumerate() {
            match validate_input("add_batch", &input) {
                Ok(()) => {
                    outcomes.push(None);
                    pending.push((idx, input));
                }
                Err(e) => outcomes.push(Some(Err(e))),
            }
        }

        for group in pending.chunks(self.batch_size) {
            let contents: Vec<String> = group.iter().map(|(_, i)| i.content.clone()).collect();

            let vectors = match self.embedder.embed(&contents).await {
                Ok(v) => v,
                Err(e) => {
                    // The whole group failed to embed; mark each item.
                    let msg = e.to_string();
                    for (idx, _) in group {
                        outcomes[*idx] = Some(Err(EngineError::embedding(
                            "add_batch",
                            anyhow::anyhow!("{}", msg),
                        )));
                    }
                    continue;
                }
            };

            for ((idx, input), vector) in group.iter().zip(vectors.iter()) {
                let outcome = async {
                    let lock = self.source_lock(&input.source_id);
                    let _guard = lock.lock().await;
                    let id = self.persist(input, vector).await?;
                    if auto_deactivate && input.is_active {
                        self.deactivate_siblings_inner("add_batch", &input.source_id, &id)
                            .await?;
                    }
                    Ok(id)
                }
                .await;
                outcomes[*idx] = Some(outcome);
            }
        }

        let results: Vec<Result<String>> = outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Err(EngineError::validation("add_batch", "item skipped"))))
            .collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        info!(total = results.len(), ok, failed = results.len() - ok, "batch add finished");
        results
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let row = sqlx::query(
            "SELECT id, content, source, source_id, version, is_active, tags_json, custom_json, created_at, updated_at \
             FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::storage("get", e))?;

        match row {
            Some(row) => Ok(row_to_document(&row)),
            None => Err(EngineError::not_found(id)),
        }
    }

    /// Partial update. The document id never changes and no new version
    /// entry is created; content is re-embedded only when it actually
    /// changed. `custom` entries in the patch are merged into the existing
    /// extension map.
    pub async fn update(
        &self,
        id: &str,
        content: Option<String>,
        patch: MetadataPatch,
    ) -> Result<()> {
        let existing = self.get(id).await?;

        let new_content = content.unwrap_or_else(|| existing.content.clone());
        let content_changed = new_content != existing.content;

        let mut meta = existing.metadata.clone();
        if let Some(source) = patch.source {
            meta.source = source;
        }
        if let Some(source_id) = patch.source_id {
            meta.source_id = source_id;
        }
        if let Some(version) = patch.version {
            meta.version = version;
        }
        if let Some(is_active) = patch.is_active {
            meta.is_active = is_active;
        }
        if let Some(tags) = patch.tags {
            meta.tags = tags;
        }
        if let Some(custom) = patch.custom {
            meta.custom.extend(custom);
        }

        // Re-embed only when the content changed.
        let vector = if content_changed {
            Some(
                self.embedder
                    .embed_one(&new_content)
                    .await
                    .map_err(|e| EngineError::embedding("update", e))?,
            )
        } else {
            None
        };

        let now = chrono::Utc::now().timestamp();
        let tags_json = serde_json::to_string(&meta.tags).unwrap_or_else(|_| "[]".to_string());
        let custom_json = serde_json::to_string(&meta.custom).unwrap_or_else(|_| "{}".to_string());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::storage("update", e))?;

        sqlx::query(
            "UPDATE documents SET content = ?, source = ?, source_id = ?, version = ?, \
             is_active = ?, tags_json = ?, custom_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&new_content)
        .bind(&meta.source)
        .bind(&meta.source_id)
        .bind(&meta.version)
        .bind(meta.is_active)
        .bind(&tags_json)
        .bind(&custom_json)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::storage("update", e))?;

        if let Some(vector) = vector {
            sqlx::query(
                "INSERT OR REPLACE INTO document_vectors (document_id, embedding, dims, model) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(vec_to_blob(&vector))
            .bind(vector.len() as i64)
            .bind(self.embedder.model_name())
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::storage("update", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::storage("update", e))?;

        info!(id = %id, content_changed, "document updated");
        Ok(())
    }

    /// Mark a document inactive. Idempotent: soft-deleting an already
    /// inactive document succeeds. Unknown ids fail with `NotFound`.
    pub async fn soft_delete(&self, id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE documents SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::storage("soft_delete", e))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(id));
        }

        info!(id = %id, "document soft-deleted");
        Ok(())
    }

    /// Permanently remove a document and its vector. Unknown ids fail with
    /// `NotFound`, for symmetry with `get`.
    pub async fn hard_delete(&self, id: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::storage("hard_delete", e))?;

        sqlx::query("DELETE FROM document_vectors WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::storage("hard_delete", e))?;

        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::storage("hard_delete", e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| EngineError::storage("hard_delete", e))?;
            return Err(EngineError::not_found(id));
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::storage("hard_delete", e))?;

        info!(id = %id, "document hard-deleted");
        Ok(())
    }

    /// Deactivate every active document with this `source_id` except
    /// `except_id`. Returns the number deactivated. Serialized per
    /// `source_id` against concurrent `add` calls.
    pub async fn deactivate_siblings(&self, source_id: &str, except_id: &str) -> Result<u64> {
        let lock = self.source_lock(source_id);
        let _guard = lock.lock().await;
        self.deactivate_siblings_inner("deactivate_siblings", source_id, except_id)
            .await
    }

    async fn deactivate_siblings_inner(
        &self,
        operation: &'static str,
        source_id: &str,
        except_id: &str,
    ) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        // Single statement, so readers never observe a partial supersession.
        let result = sqlx::query(
            "UPDATE documents SET is_active = 0, updated_at = ? \
             WHERE source_id = ? AND id != ? AND is_active = 1",
        )
        .bind(now)
        .bind(source_id)
        .bind(except_id)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::storage(operation, e))?;

        Ok(result.rows_affected())
    }

    // ==================== Listing & counting ====================

    /// List documents matching the filter, ordered by `created_at`
    /// ascending with ties broken by id, so pagination is stable.
    /// `page` is 1-indexed.
    pub async fn list(
        &self,
        filter: &DocumentFilter,
        page: u64,
        page_size: u64,
    ) -> Result<DocumentPage> {
        if page < 1 {
            return Err(EngineError::validation("list", "page must be >= 1"));
        }
        if page_size < 1 {
            return Err(EngineError::validation("list", "page_size must be >= 1"));
        }
        let page_size = page_size.min(MAX_PAGE_SIZE);

        let matched = self.fetch_filtered("list", filter).await?;

        let total = matched.len() as u64;
        let total_pages = total.div_ceil(page_size);
        let start = ((page - 1) * page_size) as usize;
        let documents: Vec<Document> = matched
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();

        Ok(DocumentPage {
            documents,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    pub async fn count(&self, filter: &DocumentFilter) -> Result<u64> {
        if filter.tags.is_empty() {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM documents WHERE 1=1");
            push_filter_clauses(&mut qb, filter);
            let count: i64 = qb
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| EngineError::storage("count", e))?;
            return Ok(count as u64);
        }

        // Tag membership is decided in Rust, so fall back to a full fetch.
        Ok(self.fetch_filtered("count", filter).await?.len() as u64)
    }

    async fn fetch_filtered(
        &self,
        operation: &'static str,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, content, source, source_id, version, is_active, tags_json, custom_json, \
             created_at, updated_at FROM documents WHERE 1=1",
        );
        push_filter_clauses(&mut qb, filter);
        qb.push(" ORDER BY created_at ASC, id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::storage(operation, e))?;

        Ok(rows
            .iter()
            .map(row_to_document)
            .filter(|doc| filter.matches_tags(&doc.metadata.tags))
            .collect())
    }

    // ==================== Vector search ====================

    /// Nearest-neighbor search by cosine similarity under the given filter.
    /// Inactive documents are excluded unless the filter explicitly asks
    /// for them. Returns up to `n` hits, best first.
    pub async fn search_similar(
        &self,
        query_vec: &[f32],
        n: usize,
        filter: &DocumentFilter,
    ) -> Result<Vec<QueryHit>> {
        // Default to active documents only.
        let mut effective = filter.clone();
        if effective.is_active.is_none() {
            effective.is_active = Some(true);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT d.id, d.content, d.source, d.source_id, d.version, d.is_active, \
             d.tags_json, d.custom_json, d.created_at, d.updated_at, v.embedding \
             FROM documents d JOIN document_vectors v ON v.document_id = d.id WHERE 1=1",
        );
        push_filter_clauses_aliased(&mut qb, &effective);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::storage("query", e))?;

        let mut hits: Vec<QueryHit> = rows
            .iter()
            .filter_map(|row| {
                let doc = row_to_document(row);
                if !effective.matches_tags(&doc.metadata.tags) {
                    return None;
                }
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let score = cosine_similarity(query_vec, &vec);
                Some(QueryHit {
                    document: doc,
                    score,
                })
            })
            .collect();

        // Sort by similarity desc, ties broken by id for determinism.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        hits.truncate(n);

        Ok(hits)
    }

    // ==================== Statistics & health ====================

    pub async fn stats(&self) -> Result<RepositoryStats> {
        let rows = sqlx::query(
            "SELECT source, source_id, version, is_active, tags_json FROM documents",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::storage("stats", e))?;

        let mut sources = std::collections::HashSet::new();
        let mut source_ids = std::collections::HashSet::new();
        let mut tags_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut version_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut active: u64 = 0;

        for row in &rows {
            let source: String = row.get("source");
            let source_id: String = row.get("source_id");
            let version: String = row.get("version");
            let is_active: bool = row.get("is_active");
            let tags_json: String = row.get("tags_json");
            let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

            if is_active {
                active += 1;
            }
            sources.insert(source);
            source_ids.insert(source_id);
            *version_distribution.entry(version).or_insert(0) += 1;
            for tag in tags {
                *tags_distribution.entry(tag).or_insert(0) += 1;
            }
        }

        Ok(RepositoryStats {
            total_documents: rows.len() as u64,
            active_documents: active,
            unique_sources: sources.len() as u64,
            unique_source_ids: source_ids.len() as u64,
            tags_distribution,
            version_distribution,
        })
    }

    /// Storage reachability probe.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngineError::storage("ping", e))?;
        Ok(())
    }

    // ==================== Internals ====================

    async fn persist(&self, input: &DocumentInput, vector: &[f32]) -> Result<String> {
        let id = generate_document_id(&input.source_id, &input.version, &input.content);
        let now = chrono::Utc::now().timestamp();
        let tags_json = serde_json::to_string(&input.tags).unwrap_or_else(|_| "[]".to_string());
        let custom_json = serde_json::to_string(&input.custom).unwrap_or_else(|_| "{}".to_string());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::storage("add", e))?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, content, source, source_id, version, is_active, tags_json, custom_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                source = excluded.source,
                is_active = excluded.is_active,
                tags_json = excluded.tags_json,
                custom_json = excluded.custom_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&input.content)
        .bind(&input.source)
        .bind(&input.source_id)
        .bind(&input.version)
        .bind(input.is_active)
        .bind(&tags_json)
        .bind(&custom_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::storage("add", e))?;

        sqlx::query(
            "INSERT OR REPLACE INTO document_vectors (document_id, embedding, dims, model) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(self.embedder.model_name())
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::storage("add", e))?;

        tx.commit()
            .await
            .map_err(|e| EngineError::storage("add", e))?;

        Ok(id)
    }

    fn source_lock(&self, source_id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self
            .supersession_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }
}

fn validate_input(operation: &'static str, input: &DocumentInput) -> Result<()> {
    if input.content.trim().is_empty() {
        return Err(EngineError::validation(operation, "content is required"));
    }
    if input.source.trim().is_empty() {
        return Err(EngineError::validation(operation, "source is required"));
    }
    if input.source_id.trim().is_empty() {
        return Err(EngineError::validation(operation, "source_id is required"));
    }
    if input.version.trim().is_empty() {
        return Err(EngineError::validation(operation, "version is required"));
    }
    Ok(())
}

fn push_filter_clauses(qb: &mut QueryBuilder<'_, Sqlite>, filter: &DocumentFilter) {
    if let Some(ref source) = filter.source {
        qb.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(ref source_id) = filter.source_id {
        qb.push(" AND source_id = ").push_bind(source_id.clone());
    }
    if let Some(ref version) = filter.version {
        qb.push(" AND version = ").push_bind(version.clone());
    }
    if let Some(is_active) = filter.is_active {
        qb.push(" AND is_active = ").push_bind(is_active);
    }
}

fn push_filter_clauses_aliased(qb: &mut QueryBuilder<'_, Sqlite>, filter: &DocumentFilter) {
    if let Some(ref source) = filter.source {
        qb.push(" AND d.source = ").push_bind(source.clone());
    }
    if let Some(ref source_id) = filter.source_id {
        qb.push(" AND d.source_id = ").push_bind(source_id.clone());
    }
    if let Some(ref version) = filter.version {
        qb.push(" AND d.version = ").push_bind(version.clone());
    }
    if let Some(is_active) = filter.is_active {
        qb.push(" AND d.is_active = ").push_bind(is_active);
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let tags_json: String = row.get("tags_json");
    let custom_json: String = row.get("custom_json");
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let custom: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&custom_json).unwrap_or_default();

    Document {
        id: row.get("id"),
        content: row.get("content"),
        metadata: DocumentMetadata {
            source: row.get("source"),
            source_id: row.get("source_id"),
            version: row.get("version"),
            is_active: row.get("is_active"),
            tags,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            custom,
        },
    }
}
