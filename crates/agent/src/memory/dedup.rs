use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use concierge_core::similarity::text_similarity;
use concierge_core::MemoryEntry;

#[derive(Clone, Debug, PartialEq)]
pub struct DuplicatePair {
    pub first: String,
    pub second: String,
    pub similarity: f64,
}

/// Every pair of entries whose content similarity reaches `threshold`, in input order.
pub fn find_duplicates(entries: &[MemoryEntry], threshold: f64) -> Vec<DuplicatePair> {
    let mut pairs = Vec::new();
    for (index, first) in entries.iter().enumerate() {
        for second in &entries[index + 1..] {
            let similarity = text_similarity(&first.content, &second.content);
            if similarity >= threshold {
                pairs.push(DuplicatePair {
                    first: first.id.clone(),
                    second: second.id.clone(),
                    similarity,
                });
            }
        }
    }
    pairs
}

/// Folds two near-duplicates into one.
///
/// The higher-confidence entry (or, on a tie, the more recently updated one) keeps its id and
/// content. Returns `(merged, subsumed)`; the subsumed entry comes back archived.
pub fn merge_entries(
    left: MemoryEntry,
    right: MemoryEntry,
    now: DateTime<Utc>,
) -> (MemoryEntry, MemoryEntry) {
    let left_wins = left.confidence > right.confidence
        || (left.confidence == right.confidence && left.updated_at > right.updated_at);
    let (base, mut other) = if left_wins { (left, right) } else { (right, left) };

    let mut merged = base.clone();
    let mut metadata = other.metadata.clone();
    metadata.extend(base.metadata.clone());
    metadata.insert("merged_from".to_string(), json!([base.id, other.id]));
    merged.metadata = metadata;

    merged.created_at = base.created_at.min(other.created_at);
    merged.updated_at = now;
    merged.user_id = base.user_id.clone().or_else(|| other.user_id.clone());
    merged.confidence = base.confidence.max(other.confidence);
    merged.access_count = base.access_count.saturating_add(other.access_count);

    let mut source_ids = base.source_ids.clone();
    for id in other.source_ids.iter().chain(std::iter::once(&other.id)) {
        if !source_ids.contains(id) {
            source_ids.push(id.clone());
        }
    }
    merged.source_ids = source_ids;

    other.archived = true;
    other.metadata.insert("merged_into".to_string(), Value::String(base.id));
    (merged, other)
}
