//! Retrieval engine: wires the repository, embedder, cache, and re-ranker
//! into the query pipeline.
//!
//! Query flow: embed the query, consult the semantic cache, over-fetch
//! candidates by vector similarity, drop irrelevant and near-duplicate
//! candidates, optionally re-rank, truncate to `top_k`, assemble the
//! context, and cache the answer. Only the query embedding is fatal; a
//! failing re-ranker degrades to vector ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, SemanticCache};
use crate::config::{Config, RetrievalConfig};
use crate::context::build_context;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{EngineError, Result};
use crate::models::{DocumentFilter, QueryResponse};
use crate::rank::{drop_near_duplicates, filter_by_distance};
use crate::repository::{DocumentRepository, RepositoryStats};
use crate::rerank::{HttpReranker, Reranker};

#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    pub total: u64,
    pub cached: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub repository: RepositoryStats,
    pub queries: QueryStats,
    pub cache: Option<CacheStats>,
}

/// Component health, reported without failing the call. `embedding_ok` is
/// false when the provider is disabled or unreachable.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub storage_ok: bool,
    pub embedding_ok: bool,
    pub reranker_configured: bool,
    pub total_documents: u64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.storage_ok
    }
}

pub struct Engine {
    repository: Arc<DocumentRepository>,
    embedder: Arc<dyn Embedder>,
    cache: Option<Arc<SemanticCache>>,
    reranker: Option<Arc<dyn Reranker>>,
    retrieval: RetrievalConfig,
    query_total: AtomicU64,
    query_cached: AtomicU64,
    query_latency_ms: AtomicU64,
}

impl Engine {
    /// Build an engine from configuration: open the database, run
    /// migrations, and construct the configured providers.
    pub async fn init(config: &Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(&config.db).await?;
        crate::migrate::run_migrations(&pool).await?;

        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);

        let cache = if config.cache.enabled {
            Some(Arc::new(SemanticCache::new(
                config.cache.ttl_secs,
                config.cache.similarity_threshold,
                config.cache.max_entries,
            )))
        } else {
            None
        };

        let reranker: Option<Arc<dyn Reranker>> = if config.reranker.enabled {
            Some(Arc::new(HttpReranker::from_config(&config.reranker)?))
        } else {
            None
        };

        info!(
            db = %config.db.path.display(),
            embedding = %config.embedding.provider,
            cache = config.cache.enabled,
            reranker = config.reranker.enabled,
            "engine initialized"
        );

        Ok(Self::with_components(
            pool,
            embedder,
            cache,
            reranker,
            config.retrieval.clone(),
            config.embedding.batch_size,
        ))
    }

    /// Construct from pre-built components. This is the seam tests use to
    /// inject deterministic embedders and scripted re-rankers.
    pub fn with_components(
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        cache: Option<Arc<SemanticCache>>,
        reranker: Option<Arc<dyn Reranker>>,
        retrieval: RetrievalConfig,
        batch_size: usize,
    ) -> Self {
        let repository = Arc::new(DocumentRepository::new(
            pool,
            Arc::clone(&embedder),
            batch_size,
        ));
        Self {
            repository,
            embedder,
            cache,
            reranker,
            retrieval,
            query_total: AtomicU64::new(0),
            query_cached: AtomicU64::new(0),
            query_latency_ms: AtomicU64::new(0),
        }
    }

    /// Document lifecycle operations live on the repository.
    pub fn repository(&self) -> &DocumentRepository {
        &self.repository
    }

    /// Answer a natural-language query with ranked hits and an assembled
    /// context block.
    ///
    /// `top_k` defaults to the configured value and is clamped to the
    /// configured maximum; zero is rejected. An empty result set is a valid
    /// answer (sentinel context, no sources) and is never cached.
    ///
    /// Cache hits are matched on the query embedding alone: repeating the
    /// same text with a different `filter` or `top_k` within the TTL may be
    /// served the earlier call's answer. Callers that change filters
    /// between calls and need exact answers should [`clear_cache`] first.
    ///
    /// [`clear_cache`]: Engine::clear_cache
    pub async fn query(
        &self,
        text: &str,
        top_k: Option<usize>,
        filter: &DocumentFilter,
    ) -> Result<QueryResponse> {
        if text.trim().is_empty() {
            return Err(EngineError::validation("query", "query text is required"));
        }
        if top_k == Some(0) {
            return Err(EngineError::validation("query", "top_k must be >= 1"));
        }
        let k = top_k
            .unwrap_or(self.retrieval.default_top_k)
            .min(self.retrieval.max_top_k);

        let started = Instant::now();

        // The query embedding is the one step with no fallback.
        let query_vec = self
            .embedder
            .embed_one(text)
            .await
            .map_err(|e| EngineError::embedding("query", e))?;

        if let Some(ref cache) = self.cache {
            if let Some((hits, context, sources)) = cache.lookup(&query_vec) {
                self.record_query(started, true);
                return Ok(QueryResponse {
                    hits,
                    context,
                    sources,
                    cached: true,
                });
            }
        }

        // Over-fetch so the later stages have material to discard.
        let candidates = k * self.retrieval.candidate_multiplier;
        let hits = self
            .repository
            .search_similar(&query_vec, candidates, filter)
            .await?;

        let mut hits = filter_by_distance(hits, self.retrieval.distance_threshold);
        debug!(candidates, relevant = hits.len(), "vector search done");

        if let Some(ref reranker) = self.reranker {
            if !hits.is_empty() {
                let documents: Vec<String> =
                    hits.iter().map(|h| h.document.content.clone()).collect();
                match reranker.rerank(text, &documents).await {
                    Ok(scores) => {
                        for (hit, score) in hits.iter_mut().zip(scores.iter()) {
                            hit.score = *score;
                        }
                        hits.sort_by(|a, b| {
                            b.score
                                .partial_cmp(&a.score)
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then_with(|| a.document.id.cmp(&b.document.id))
                        });
                    }
                    Err(e) => {
                        // Degrade to vector ordering.
                        warn!(reranker = reranker.name(), error = %e, "re-ranking failed, using vector order");
                    }
                }
            }
        }

        let mut hits = drop_near_duplicates(hits, self.retrieval.max_overlap);
        hits.truncate(k);

        let (context, sources) = build_context(&hits, self.retrieval.max_context_chars);

        if !hits.is_empty() {
            if let Some(ref cache) = self.cache {
                cache.store(query_vec, hits.clone(), context.clone(), sources.clone());
            }
        }

        self.record_query(started, false);
        Ok(QueryResponse {
            hits,
            context,
            sources,
            cached: false,
        })
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let repository = self.repository.stats().await?;
        let total = self.query_total.load(Ordering::Relaxed);
        let cached = self.query_cached.load(Ordering::Relaxed);
        let latency = self.query_latency_ms.load(Ordering::Relaxed);

        Ok(EngineStats {
            repository,
            queries: QueryStats {
                total,
                cached,
                avg_latency_ms: if total == 0 {
                    0.0
                } else {
                    latency as f64 / total as f64
                },
            },
            cache: self.cache.as_ref().map(|c| c.stats()),
        })
    }

    /// Probe each component. Never fails; degraded components are reported
    /// in the result.
    pub async fn health(&self) -> HealthReport {
        let storage_ok = self.repository.ping().await.is_ok();
        let total_documents = if storage_ok {
            self.repository
                .count(&DocumentFilter::default())
                .await
                .unwrap_or(0)
        } else {
            0
        };
        let embedding_ok = self.embedder.embed_one("health probe").await.is_ok();

        HealthReport {
            storage_ok,
            embedding_ok,
            reranker_configured: self.reranker.is_some(),
            total_documents,
        }
    }

    pub fn clear_cache(&self) {
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
    }

    /// Flush and close the database pool.
    pub async fn shutdown(&self) {
        self.repository.pool().close().await;
    }

    fn record_query(&self, started: Instant, cached: bool) {
        self.query_total.fetch_add(1, Ordering::Relaxed);
        if cached {
            self.query_cached.fetch_add(1, Ordering::Relaxed);
        }
        self.query_latency_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}
