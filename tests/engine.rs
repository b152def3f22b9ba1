//! End-to-end tests for the retrieval engine.
//!
//! Uses a deterministic bag-of-words embedder so vector similarity is
//! reproducible without a network, a temporary SQLite database per test,
//! and scripted re-rankers for the degradation paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;

use sentinel_kb::cache::SemanticCache;
use sentinel_kb::config::{DbConfig, RetrievalConfig};
use sentinel_kb::db;
use sentinel_kb::embedding::Embedder;
use sentinel_kb::error::EngineError;
use sentinel_kb::migrate;
use sentinel_kb::models::{DocumentFilter, DocumentInput, MetadataPatch};
use sentinel_kb::rerank::Reranker;
use sentinel_kb::service::Engine;

const DIMS: usize = 32;

/// Deterministic embedder: hashes words into a fixed-size bag-of-words
/// vector, normalized to unit length. Texts sharing words are similar;
/// disjoint texts are (near-)orthogonal.
struct HashEmbedder;

fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text.to_lowercase().split_whitespace() {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> AnyResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

/// Scores 1.0 for documents containing the keyword, 0.1 otherwise.
struct KeywordReranker {
    keyword: String,
}

#[async_trait]
impl Reranker for KeywordReranker {
    fn name(&self) -> &str {
        "keyword"
    }
    async fn rerank(&self, _query: &str, documents: &[String]) -> AnyResult<Vec<f32>> {
        Ok(documents
            .iter()
            .map(|d| if d.contains(&self.keyword) { 1.0 } else { 0.1 })
            .collect())
    }
}

struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    fn name(&self) -> &str {
        "failing"
    }
    async fn rerank(&self, _query: &str, _documents: &[String]) -> AnyResult<Vec<f32>> {
        anyhow::bail!("scoring service unavailable")
    }
}

struct TestSetup {
    _dir: tempfile::TempDir,
    engine: Engine,
}

async fn setup() -> TestSetup {
    setup_with(RetrievalConfig::default(), None).await
}

async fn setup_with(
    retrieval: RetrievalConfig,
    reranker: Option<Arc<dyn Reranker>>,
) -> TestSetup {
    let dir = tempfile::tempdir().unwrap();
    let db_config = DbConfig {
        path: dir.path().join("kb.sqlite"),
    };
    let pool = db::connect(&db_config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let cache = Arc::new(SemanticCache::new(3600, 0.95, 64));
    let engine = Engine::with_components(
        pool,
        Arc::new(HashEmbedder),
        Some(cache),
        reranker,
        retrieval,
        8,
    );

    TestSetup { _dir: dir, engine }
}

fn doc(content: &str, source_id: &str, version: &str) -> DocumentInput {
    DocumentInput::new(content, format!("docs/{source_id}.md"), source_id, version)
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_add_and_get_roundtrip() {
    let t = setup().await;
    let repo = t.engine.repository();

    let mut input = doc("Wazuh alert triage guide", "wazuh-triage", "v1.0.0")
        .with_tags(vec!["wazuh".to_string(), "triage".to_string()]);
    input
        .custom
        .insert("author".to_string(), serde_json::json!("soc-team"));

    let id = repo.add(input, true).await.unwrap();
    assert!(id.starts_with("doc_"));

    let fetched = repo.get(&id).await.unwrap();
    assert_eq!(fetched.content, "Wazuh alert triage guide");
    assert_eq!(fetched.metadata.source_id, "wazuh-triage");
    assert_eq!(fetched.metadata.version, "v1.0.0");
    assert!(fetched.metadata.is_active);
    assert_eq!(fetched.metadata.tags, vec!["wazuh", "triage"]);
    assert_eq!(
        fetched.metadata.custom.get("author"),
        Some(&serde_json::json!("soc-team"))
    );
    assert!(fetched.metadata.created_at > 0);
    assert_eq!(fetched.metadata.created_at, fetched.metadata.updated_at);
}

#[tokio::test]
async fn test_add_rejects_missing_required_fields() {
    let t = setup().await;
    let repo = t.engine.repository();

    let missing_content = DocumentInput::new("", "docs/x.md", "x", "v1");
    assert!(matches!(
        repo.add(missing_content, true).await,
        Err(EngineError::Validation { .. })
    ));

    let missing_source_id = DocumentInput::new("text", "docs/x.md", "", "v1");
    assert!(matches!(
        repo.add(missing_source_id, true).await,
        Err(EngineError::Validation { .. })
    ));

    let missing_version = DocumentInput::new("text", "docs/x.md", "x", "  ");
    assert!(matches!(
        repo.add(missing_version, true).await,
        Err(EngineError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_new_version_supersedes_old() {
    let t = setup().await;
    let repo = t.engine.repository();

    let v1 = repo
        .add(doc("Firewall guide first edition", "fw-guide", "v1"), true)
        .await
        .unwrap();
    let v2 = repo
        .add(doc("Firewall guide second edition", "fw-guide", "v2"), true)
        .await
        .unwrap();
    assert_ne!(v1, v2);

    assert!(!repo.get(&v1).await.unwrap().metadata.is_active);
    assert!(repo.get(&v2).await.unwrap().metadata.is_active);
}

#[tokio::test]
async fn test_only_latest_version_stays_active() {
    let t = setup().await;
    let repo = t.engine.repository();

    let mut last = String::new();
    for i in 1..=5 {
        last = repo
            .add(doc(&format!("Playbook edition {i}"), "playbook", &format!("v{i}")), true)
            .await
            .unwrap();
    }

    let active = repo
        .count(&DocumentFilter {
            source_id: Some("playbook".to_string()),
            is_active: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active, 1);

    let total = repo
        .count(&DocumentFilter {
            source_id: Some("playbook".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 5);

    assert!(repo.get(&last).await.unwrap().metadata.is_active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_leave_single_active_version() {
    let t = setup().await;
    let engine = Arc::new(t.engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .repository()
                .add(
                    doc(&format!("Hardening guide revision {i}"), "guide", &format!("v{i}")),
                    true,
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // However the insertions interleave, exactly one version survives
    // active.
    let repo = engine.repository();
    let active = repo
        .count(&DocumentFilter {
            source_id: Some("guide".to_string()),
            is_active: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active, 1);

    let total = repo
        .count(&DocumentFilter {
            source_id: Some("guide".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 16);
}

#[tokio::test]
async fn test_supersession_can_be_disabled() {
    let t = setup().await;
    let repo = t.engine.repository();

    let v1 = repo
        .add(doc("Topology map north", "topology", "v1"), true)
        .await
        .unwrap();
    let v2 = repo
        .add(doc("Topology map south", "topology", "v2"), false)
        .await
        .unwrap();

    assert!(repo.get(&v1).await.unwrap().metadata.is_active);
    assert!(repo.get(&v2).await.unwrap().metadata.is_active);
}

#[tokio::test]
async fn test_identical_readd_is_idempotent() {
    let t = setup().await;
    let repo = t.engine.repository();

    let a = repo
        .add(doc("Same exact content", "dup", "v1"), true)
        .await
        .unwrap();
    let b = repo
        .add(doc("Same exact content", "dup", "v1"), true)
        .await
        .unwrap();

    assert_eq!(a, b);
    let total = repo
        .count(&DocumentFilter {
            source_id: Some("dup".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert!(repo.get(&a).await.unwrap().metadata.is_active);
}

#[tokio::test]
async fn test_soft_delete_semantics() {
    let t = setup().await;
    let repo = t.engine.repository();

    let id = repo
        .add(doc("Suricata rule tuning notes", "suricata", "v1"), true)
        .await
        .unwrap();

    repo.soft_delete(&id).await.unwrap();

    // Still readable by id, flagged inactive.
    let fetched = repo.get(&id).await.unwrap();
    assert!(!fetched.metadata.is_active);

    // Excluded from queries.
    let response = t
        .engine
        .query("suricata rule tuning", None, &DocumentFilter::default())
        .await
        .unwrap();
    assert!(response.hits.is_empty());

    // Idempotent on an already inactive document.
    repo.soft_delete(&id).await.unwrap();

    // Unknown ids fail.
    assert!(matches!(
        repo.soft_delete("doc_does_not_exist").await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_hard_delete_removes_document() {
    let t = setup().await;
    let repo = t.engine.repository();

    let id = repo
        .add(doc("Decommissioned runbook", "old-runbook", "v1"), true)
        .await
        .unwrap();

    repo.hard_delete(&id).await.unwrap();
    assert!(matches!(
        repo.get(&id).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        repo.hard_delete(&id).await,
        Err(EngineError::NotFound { .. })
    ));

    // Gone from query results under every filter, including ones that
    // would match inactive documents.
    let response = t
        .engine
        .query("decommissioned runbook", None, &DocumentFilter::default())
        .await
        .unwrap();
    assert!(response.hits.is_empty());

    let response = t
        .engine
        .query(
            "decommissioned runbook",
            None,
            &DocumentFilter {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.hits.is_empty());
}

#[tokio::test]
async fn test_update_preserves_id_and_merges_metadata() {
    let t = setup().await;
    let repo = t.engine.repository();

    let mut input = doc("Original phishing playbook", "phishing", "v1");
    input
        .custom
        .insert("owner".to_string(), serde_json::json!("tier1"));
    let id = repo.add(input, true).await.unwrap();

    let mut custom = BTreeMap::new();
    custom.insert("reviewed".to_string(), serde_json::json!(true));
    repo.update(
        &id,
        Some("Revised phishing containment playbook".to_string()),
        MetadataPatch {
            tags: Some(vec!["playbook".to_string()]),
            custom: Some(custom),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let fetched = repo.get(&id).await.unwrap();
    assert_eq!(fetched.content, "Revised phishing containment playbook");
    assert_eq!(fetched.metadata.tags, vec!["playbook"]);
    // Merge, not replace.
    assert_eq!(
        fetched.metadata.custom.get("owner"),
        Some(&serde_json::json!("tier1"))
    );
    assert_eq!(
        fetched.metadata.custom.get("reviewed"),
        Some(&serde_json::json!(true))
    );

    // The new content is what queries now match.
    let response = t
        .engine
        .query(
            "revised phishing containment playbook",
            None,
            &DocumentFilter::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.hits[0].document.id, id);

    assert!(matches!(
        repo.update("doc_missing", None, MetadataPatch::default()).await,
        Err(EngineError::NotFound { .. })
    ));
}

// ==================== Listing & filtering ====================

#[tokio::test]
async fn test_tag_filtering_is_and_semantics() {
    let t = setup().await;
    let repo = t.engine.repository();

    repo.add(
        doc("Wazuh network monitoring", "d1", "v1")
            .with_tags(vec!["wazuh".to_string(), "network".to_string()]),
        true,
    )
    .await
    .unwrap();
    repo.add(
        doc("Suricata deployment", "d2", "v1").with_tags(vec!["suricata".to_string()]),
        true,
    )
    .await
    .unwrap();
    repo.add(
        doc("Wazuh agent installation", "d3", "v1").with_tags(vec!["wazuh".to_string()]),
        true,
    )
    .await
    .unwrap();

    let wazuh = repo
        .list(
            &DocumentFilter {
                tags: vec!["wazuh".to_string()],
                ..Default::default()
            },
            1,
            50,
        )
        .await
        .unwrap();
    assert_eq!(wazuh.total, 2);
    let ids: Vec<&str> = wazuh
        .documents
        .iter()
        .map(|d| d.metadata.source_id.as_str())
        .collect();
    assert!(ids.contains(&"d1"));
    assert!(ids.contains(&"d3"));

    let both = repo
        .list(
            &DocumentFilter {
                tags: vec!["wazuh".to_string(), "network".to_string()],
                ..Default::default()
            },
            1,
            50,
        )
        .await
        .unwrap();
    assert_eq!(both.total, 1);
    assert_eq!(both.documents[0].metadata.source_id, "d1");
}

#[tokio::test]
async fn test_pagination_is_stable_and_complete() {
    let t = setup().await;
    let repo = t.engine.repository();

    for i in 0..5 {
        repo.add(doc(&format!("Reference sheet number {i}"), &format!("ref-{i}"), "v1"), true)
            .await
            .unwrap();
    }

    let filter = DocumentFilter::default();
    let p1 = repo.list(&filter, 1, 2).await.unwrap();
    let p2 = repo.list(&filter, 2, 2).await.unwrap();
    let p3 = repo.list(&filter, 3, 2).await.unwrap();
    let p4 = repo.list(&filter, 4, 2).await.unwrap();

    assert_eq!(p1.total, 5);
    assert_eq!(p1.total_pages, 3);
    assert_eq!(p1.documents.len(), 2);
    assert_eq!(p2.documents.len(), 2);
    assert_eq!(p3.documents.len(), 1);
    assert!(p4.documents.is_empty());

    let mut all: Vec<String> = p1
        .documents
        .iter()
        .chain(&p2.documents)
        .chain(&p3.documents)
        .map(|d| d.id.clone())
        .collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 5);

    assert!(matches!(
        repo.list(&filter, 0, 2).await,
        Err(EngineError::Validation { .. })
    ));
    assert!(matches!(
        repo.list(&filter, 1, 0).await,
        Err(EngineError::Validation { .. })
    ));
}

// ==================== Query pipeline ====================

#[tokio::test]
async fn test_query_returns_ranked_hits_and_context() {
    let t = setup().await;
    let repo = t.engine.repository();

    repo.add(doc("Wazuh alert triage procedure for analysts", "w1", "v1"), true)
        .await
        .unwrap();
    repo.add(doc("Coffee machine maintenance schedule", "c1", "v1"), true)
        .await
        .unwrap();

    let response = t
        .engine
        .query("wazuh alert triage", None, &DocumentFilter::default())
        .await
        .unwrap();

    assert!(!response.cached);
    assert!(!response.hits.is_empty());
    assert_eq!(response.hits[0].document.metadata.source_id, "w1");
    for pair in response.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(response.context.starts_with("[Document 1]\n"));
    assert!(response.sources.contains(&"docs/w1.md".to_string()));
}

#[tokio::test]
async fn test_query_validation_and_top_k_clamp() {
    let t = setup_with(
        RetrievalConfig {
            max_top_k: 3,
            ..Default::default()
        },
        None,
    )
    .await;
    let repo = t.engine.repository();

    for i in 0..6 {
        repo.add(
            doc(&format!("incident response note {i}"), &format!("n-{i}"), "v1"),
            true,
        )
        .await
        .unwrap();
    }

    assert!(matches!(
        t.engine.query("", None, &DocumentFilter::default()).await,
        Err(EngineError::Validation { .. })
    ));
    assert!(matches!(
        t.engine
            .query("incident", Some(0), &DocumentFilter::default())
            .await,
        Err(EngineError::Validation { .. })
    ));

    let response = t
        .engine
        .query("incident response note", Some(10), &DocumentFilter::default())
        .await
        .unwrap();
    assert!(response.hits.len() <= 3);
}

#[tokio::test]
async fn test_query_with_tag_filter_limits_candidates() {
    let t = setup().await;
    let repo = t.engine.repository();

    repo.add(
        doc("Network segmentation overview", "net-1", "v1")
            .with_tags(vec!["network".to_string()]),
        true,
    )
    .await
    .unwrap();
    repo.add(
        doc("Network capture analysis", "net-2", "v1")
            .with_tags(vec!["pcap".to_string()]),
        true,
    )
    .await
    .unwrap();

    let response = t
        .engine
        .query(
            "network analysis",
            None,
            &DocumentFilter {
                tags: vec!["network".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].document.metadata.source_id, "net-1");
}

#[tokio::test]
async fn test_no_relevant_match_is_valid_and_uncached() {
    // Tight threshold so disjoint-vocabulary hits are discarded.
    let t = setup_with(
        RetrievalConfig {
            distance_threshold: 0.3,
            ..Default::default()
        },
        None,
    )
    .await;
    t.engine
        .repository()
        .add(doc("Kernel module signing procedure", "kmod", "v1"), true)
        .await
        .unwrap();

    for _ in 0..2 {
        let response = t
            .engine
            .query("tropical fruit salad recipe", None, &DocumentFilter::default())
            .await
            .unwrap();
        assert!(response.hits.is_empty());
        assert_eq!(response.context, "No relevant context found.");
        assert!(response.sources.is_empty());
        // Empty answers are never served from the cache.
        assert!(!response.cached);
    }
}

#[tokio::test]
async fn test_semantic_cache_serves_paraphrased_repeat() {
    let t = setup().await;
    t.engine
        .repository()
        .add(doc("Wazuh alert triage steps for analysts", "w1", "v1"), true)
        .await
        .unwrap();

    let first = t
        .engine
        .query("wazuh alert triage steps", None, &DocumentFilter::default())
        .await
        .unwrap();
    assert!(!first.cached);

    // Same words, different order: identical fingerprint under the
    // bag-of-words embedder, similar enough under a real one.
    let second = t
        .engine
        .query("triage steps wazuh alert", None, &DocumentFilter::default())
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.sources, first.sources);
    assert_eq!(second.context, first.context);

    t.engine.clear_cache();
    let third = t
        .engine
        .query("wazuh alert triage steps", None, &DocumentFilter::default())
        .await
        .unwrap();
    assert!(!third.cached);
}

#[tokio::test]
async fn test_reranker_reorders_hits() {
    let t = setup_with(
        RetrievalConfig::default(),
        Some(Arc::new(KeywordReranker {
            keyword: "containment".to_string(),
        })),
    )
    .await;
    let repo = t.engine.repository();

    // Vector-closest to the query, but lacks the keyword.
    repo.add(doc("malware malware malware overview", "m1", "v1"), true)
        .await
        .unwrap();
    repo.add(doc("malware containment checklist", "m2", "v1"), true)
        .await
        .unwrap();

    let response = t
        .engine
        .query("malware", None, &DocumentFilter::default())
        .await
        .unwrap();

    assert_eq!(response.hits[0].document.metadata.source_id, "m2");
    for pair in response.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn test_failing_reranker_degrades_to_vector_order() {
    let t = setup_with(RetrievalConfig::default(), Some(Arc::new(FailingReranker))).await;
    let repo = t.engine.repository();

    repo.add(doc("ransomware response playbook steps", "r1", "v1"), true)
        .await
        .unwrap();
    repo.add(doc("printer toner replacement", "p1", "v1"), true)
        .await
        .unwrap();

    let response = t
        .engine
        .query("ransomware response playbook", None, &DocumentFilter::default())
        .await
        .unwrap();

    // The query still succeeds, ordered by vector similarity.
    assert!(!response.hits.is_empty());
    assert_eq!(response.hits[0].document.metadata.source_id, "r1");
}

// ==================== Batch, stats, health ====================

#[tokio::test]
async fn test_batch_add_reports_per_item_outcomes() {
    let t = setup().await;
    let repo = t.engine.repository();

    let inputs = vec![
        doc("First valid document", "b1", "v1"),
        DocumentInput::new("", "docs/bad.md", "b2", "v1"),
        doc("Third valid document", "b3", "v1"),
    ];

    let results = repo.add_batch(inputs, true).await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(EngineError::Validation { .. })));
    assert!(results[2].is_ok());

    let id = results[0].as_ref().unwrap();
    assert!(repo.get(id).await.is_ok());
}

#[tokio::test]
async fn test_stats_reflect_corpus_and_queries() {
    let t = setup().await;
    let repo = t.engine.repository();

    repo.add(
        doc("Wazuh basics", "w1", "v1").with_tags(vec!["wazuh".to_string()]),
        true,
    )
    .await
    .unwrap();
    repo.add(doc("Wazuh basics refreshed", "w1", "v2"), true)
        .await
        .unwrap();

    t.engine
        .query("wazuh basics", None, &DocumentFilter::default())
        .await
        .unwrap();
    t.engine
        .query("wazuh basics", None, &DocumentFilter::default())
        .await
        .unwrap();

    let stats = t.engine.stats().await.unwrap();
    assert_eq!(stats.repository.total_documents, 2);
    assert_eq!(stats.repository.active_documents, 1);
    assert_eq!(stats.repository.unique_source_ids, 1);
    assert_eq!(stats.repository.tags_distribution.get("wazuh"), Some(&1));
    assert_eq!(stats.queries.total, 2);
    assert_eq!(stats.queries.cached, 1);

    let cache = stats.cache.expect("cache enabled in tests");
    assert_eq!(cache.hits, 1);
}

#[tokio::test]
async fn test_health_reports_components() {
    let t = setup().await;
    t.engine
        .repository()
        .add(doc("Any document", "h1", "v1"), true)
        .await
        .unwrap();

    let report = t.engine.health().await;
    assert!(report.storage_ok);
    assert!(report.embedding_ok);
    assert!(!report.reranker_configured);
    assert_eq!(report.total_documents, 1);
    assert!(report.is_healthy());
}
