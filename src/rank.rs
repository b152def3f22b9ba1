//! Relevance filtering and near-duplicate pruning for retrieved candidates.

use crate::models::QueryHit;

/// Drop candidates whose cosine distance (1 - similarity) from the query
/// exceeds the threshold. Order is preserved.
pub fn filter_by_distance(hits: Vec<QueryHit>, distance_threshold: f32) -> Vec<QueryHit> {
    hits.into_iter()
        .filter(|h| (1.0 - h.score) <= distance_threshold)
        .collect()
}

/// Word-set Jaccard overlap between two texts, case-insensitive. Returns a
/// value in [0, 1]; empty texts overlap fully with nothing.
pub fn text_overlap(a: &str, b: &str) -> f32 {
    let set_a: std::collections::HashSet<String> = a
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    let set_b: std::collections::HashSet<String> = b
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f32 / union as f32
}

/// Keep candidates in ranked order, dropping any whose content overlaps an
/// already-kept candidate beyond `max_overlap`. The best-ranked copy of a
/// near-duplicate always survives, so scores stay non-increasing.
pub fn drop_near_duplicates(hits: Vec<QueryHit>, max_overlap: f32) -> Vec<QueryHit> {
    let mut kept: Vec<QueryHit> = Vec::with_capacity(hits.len());
    for hit in hits {
        let duplicate = kept
            .iter()
            .any(|k| text_overlap(&k.document.content, &hit.document.content) > max_overlap);
        if !duplicate {
            kept.push(hit);
        }
    }
    kept
}
