//! Semantic query cache.
//!
//! Stores fully-assembled query answers keyed by the query's embedding
//! vector. A lookup hits when a stored fingerprint is cosine-similar to the
//! incoming one above the configured threshold and the entry is younger than
//! the TTL, so paraphrased repeats of a question are served without touching
//! the vector store. Expiry is lazy: stale entries are dropped when a lookup
//! walks past them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::models::QueryHit;

struct CacheEntry {
    fingerprint: Vec<f32>,
    hits: Vec<QueryHit>,
    context: String,
    sources: Vec<String>,
    created_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Approximate-match answer cache. Interior mutability so the engine can
/// share one instance across concurrent queries.
pub struct SemanticCache {
    entries: RwLock<Vec<CacheEntry>>,
    ttl: Duration,
    similarity_threshold: f32,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SemanticCache {
    pub fn new(ttl_secs: u64, similarity_threshold: f32, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            ttl: Duration::from_secs(ttl_secs),
            similarity_threshold,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an answer for a query fingerprint. Returns the best match at
    /// or above the similarity threshold, skipping expired entries.
    pub fn lookup(&self, fingerprint: &[f32]) -> Option<(Vec<QueryHit>, String, Vec<String>)> {
        let now = Instant::now();

        // Drop expired entries before scanning.
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.retain(|e| now.duration_since(e.created_at) < self.ttl);
        }

        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<(&CacheEntry, f32)> = None;
        for entry in entries.iter() {
            let sim = cosine_similarity(fingerprint, &entry.fingerprint);
            if sim >= self.similarity_threshold
                && best.map(|(_, s)| sim > s).unwrap_or(true)
            {
                best = Some((entry, sim));
            }
        }

        match best {
            Some((entry, sim)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(similarity = sim, "semantic cache hit");
                Some((entry.hits.clone(), entry.context.clone(), entry.sources.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an answer. When the cache is full the oldest entry is evicted.
    /// Last write wins for near-identical fingerprints.
    pub fn store(
        &self,
        fingerprint: Vec<f32>,
        hits: Vec<QueryHit>,
        context: String,
        sources: Vec<String>,
    ) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.max_entries {
            entries.remove(0);
        }
        entries.push(CacheEntry {
            fingerprint,
            hits,
            context,
            sources,
            created_at: Instant::now(),
        });
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.len(),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer() -> (Vec<QueryHit>, String, Vec<String>) {
        (
            Vec::new(),
            "[Document 1]\nWazuh triage guide".to_string(),
            vec!["docs/wazuh.md".to_string()],
        )
    }

    #[test]
    fn test_exact_fingerprint_hits() {
        let cache = SemanticCache::new(3600, 0.95, 16);
        let (hits, context, sources) = answer();
        cache.store(vec![1.0, 0.0], hits, context.clone(), sources.clone());

        let found = cache.lookup(&[1.0, 0.0]).expect("exact match should hit");
        assert_eq!(found.1, context);
        assert_eq!(found.2, sources);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_similar_fingerprint_hits_dissimilar_misses() {
        let cache = SemanticCache::new(3600, 0.95, 16);
        let (hits, context, sources) = answer();
        cache.store(vec![1.0, 0.0], hits, context, sources);

        // Slightly rotated vector, similarity ~0.995.
        assert!(cache.lookup(&[0.995, 0.0998]).is_some());
        // Orthogonal vector, similarity 0.
        assert!(cache.lookup(&[0.0, 1.0]).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = SemanticCache::new(0, 0.95, 16);
        let (hits, context, sources) = answer();
        cache.store(vec![1.0, 0.0], hits, context, sources);

        // ttl = 0 means every entry is already expired at lookup time.
        assert!(cache.lookup(&[1.0, 0.0]).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = SemanticCache::new(3600, 0.99, 2);
        for i in 0..3 {
            let (hits, context, sources) = answer();
            let mut fp = vec![0.0; 3];
            fp[i] = 1.0;
            cache.store(fp, hits, context, sources);
        }
        assert_eq!(cache.len(), 2);
        // The first entry was evicted.
        assert!(cache.lookup(&[1.0, 0.0, 0.0]).is_none());
        assert!(cache.lookup(&[0.0, 0.0, 1.0]).is_some());
    }

    #[test]
    fn test_clear() {
        let cache = SemanticCache::new(3600, 0.95, 16);
        let (hits, context, sources) = answer();
        cache.store(vec![1.0, 0.0], hits, context, sources);
        cache.clear();
        assert!(cache.is_empty());
    }
}
