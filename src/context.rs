//! Context assembly: turn ranked hits into a bounded prompt block.

use crate::models::QueryHit;

/// Separator between document blocks in the assembled context.
const SEPARATOR: &str = "\n\n---\n\n";

/// Returned when no hit survives ranking.
pub const NO_CONTEXT: &str = "No relevant context found.";

/// Assemble the context string and deduplicated source list for a set of
/// ranked hits.
///
/// Each hit becomes a `[Document N]` block; blocks are joined by a `---`
/// separator. When the assembled string would exceed `max_chars`, hits are
/// dropped from the bottom of the ranking. If even the single best hit is
/// too long on its own, its content is truncated at a character boundary so
/// the caller always gets something. Sources keep first-seen order, one
/// entry per distinct source.
pub fn build_context(hits: &[QueryHit], max_chars: usize) -> (String, Vec<String>) {
    if hits.is_empty() {
        return (NO_CONTEXT.to_string(), Vec::new());
    }

    // Find the largest prefix of hits that fits.
    let mut included = 0;
    let mut length = 0;
    for (i, hit) in hits.iter().enumerate() {
        let block_len = block_header_len(i + 1) + hit.document.content.chars().count();
        let sep_len = if i == 0 { 0 } else { SEPARATOR.len() };
        if length + sep_len + block_len > max_chars {
            break;
        }
        length += sep_len + block_len;
        included = i + 1;
    }

    let blocks: Vec<String>;
    let used: &[QueryHit];

    if included == 0 {
        // Even the top hit alone is over budget: truncate its content.
        let header = block_header(1);
        let budget = max_chars.saturating_sub(header.chars().count());
        let content: String = hits[0].document.content.chars().take(budget).collect();
        blocks = vec![format!("{header}{content}")];
        used = &hits[..1];
    } else {
        blocks = hits[..included]
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("{}{}", block_header(i + 1), hit.document.content))
            .collect();
        used = &hits[..included];
    }

    let mut sources = Vec::new();
    for hit in used {
        let source = &hit.document.metadata.source;
        if !sources.iter().any(|s: &String| s == source) {
            sources.push(source.clone());
        }
    }

    (blocks.join(SEPARATOR), sources)
}

fn block_header(n: usize) -> String {
    format!("[Document {n}]\n")
}

fn block_header_len(n: usize) -> usize {
    block_header(n).chars().count()
}
