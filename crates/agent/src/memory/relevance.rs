use chrono::{DateTime, Utc};

use concierge_core::similarity::text_similarity;
use concierge_core::MemoryEntry;

const RECENCY_WEIGHT: f64 = 0.3;
const FREQUENCY_WEIGHT: f64 = 0.2;
const CONFIDENCE_WEIGHT: f64 = 0.2;
const SIMILARITY_WEIGHT: f64 = 0.3;
/// Similarity assumed when no query is given.
const NEUTRAL_SIMILARITY: f64 = 0.5;
const RECENCY_WINDOW_HOURS: f64 = 7.0 * 24.0;
const FREQUENCY_CAP: f64 = 10.0;

/// Composite ranking score over recency, access frequency, confidence, and query similarity.
pub fn relevance_score(entry: &MemoryEntry, query: &str, now: DateTime<Utc>) -> f64 {
    let age_hours = ((now - entry.updated_at).num_seconds().max(0) as f64) / 3600.0;
    let recency = (-age_hours / RECENCY_WINDOW_HOURS).exp();
    let frequency = (f64::from(entry.access_count) / FREQUENCY_CAP).min(1.0);
    let similarity = if query.trim().is_empty() {
        NEUTRAL_SIMILARITY
    } else {
        text_similarity(query, &entry.content)
    };

    RECENCY_WEIGHT * recency
        + FREQUENCY_WEIGHT * frequency
        + CONFIDENCE_WEIGHT * entry.confidence
        + SIMILARITY_WEIGHT * similarity
}

/// Sorts best first; equal scores keep their incoming order.
pub fn rank(entries: &mut [MemoryEntry], query: &str, now: DateTime<Utc>) {
    entries.sort_by(|left, right| {
        relevance_score(right, query, now).total_cmp(&relevance_score(left, query, now))
    });
}
