//! Core data models used throughout Sentinel KB.
//!
//! These types represent the documents, filters, and query results that flow
//! through the storage and retrieval pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Metadata attached to every stored document.
///
/// `source`, `source_id`, and `version` are required at creation time.
/// `created_at` and `updated_at` are Unix seconds set by the engine, never
/// by the caller. `custom` is an open extension map, opaque to the engine;
/// the reserved keys (`source`, `source_id`, `version`, `is_active`, `tags`)
/// live as typed fields and never appear in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Human-readable origin (file path, URL, module name). Not unique.
    pub source: String,
    /// Logical identifier grouping all versions of the same document.
    pub source_id: String,
    /// Free-form version label (e.g. "v1.0.0", an ISO date, a commit hash).
    pub version: String,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

/// A stored document: the unit of knowledge.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// Caller-supplied fields for creating a document.
#[derive(Debug, Clone, Default)]
pub struct DocumentInput {
    pub content: String,
    pub source: String,
    pub source_id: String,
    pub version: String,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl DocumentInput {
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        source_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            source_id: source_id.into(),
            version: version.into(),
            is_active: true,
            tags: Vec::new(),
            custom: BTreeMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Partial metadata update. `None` fields are left untouched; `custom`
/// entries are merged into the existing extension map.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub source: Option<String>,
    pub source_id: Option<String>,
    pub version: Option<String>,
    pub is_active: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub custom: Option<BTreeMap<String, serde_json::Value>>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.source_id.is_none()
            && self.version.is_none()
            && self.is_active.is_none()
            && self.tags.is_none()
            && self.custom.is_none()
    }
}

/// Exact-match filters for listings, counts, and queries. Tag filtering is
/// set-membership with AND semantics: a document matches only if it carries
/// every listed tag.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub source: Option<String>,
    pub source_id: Option<String>,
    pub version: Option<String>,
    pub is_active: Option<bool>,
    pub tags: Vec<String>,
}

impl DocumentFilter {
    pub fn matches_tags(&self, doc_tags: &[String]) -> bool {
        self.tags.iter().all(|t| doc_tags.iter().any(|d| d == t))
    }
}

/// One page of a listing, with the total match count across all pages.
#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

/// A retrieved document with its relevance score (higher = more relevant).
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub document: Document,
    pub score: f32,
}

/// The result of a retrieval query: hits ordered by decreasing relevance,
/// the assembled context, the deduplicated source list, and whether the
/// answer was served from the semantic cache.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub hits: Vec<QueryHit>,
    pub context: String,
    pub sources: Vec<String>,
    pub cached: bool,
}

/// Deterministic document id: `doc_` + 24 hex chars derived from the
/// (source_id, version, content) triple. Re-adding an identical triple
/// yields the same id, making such adds idempotent upserts.
pub fn generate_document_id(source_id: &str, version: &str, content: &str) -> String {
    let content_hash = {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    };
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", source_id, version, &content_hash[..16]).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("doc_{}", &digest[..24])
}
