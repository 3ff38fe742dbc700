//! Text similarity and content-addressed ids for memory entries.

use sha2::{Digest, Sha256};
use similar::TextDiff;

/// Number of hex characters kept from the SHA-256 digest.
pub const ENTRY_ID_LEN: usize = 16;

/// Case-insensitive character-level similarity ratio in `[0, 1]`.
///
/// Two empty strings are identical; one empty string against text scores 0.
pub fn text_similarity(left: &str, right: &str) -> f64 {
    let left = left.trim().to_lowercase();
    let right = right.trim().to_lowercase();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    f64::from(TextDiff::from_chars(left.as_str(), right.as_str()).ratio())
}

/// Deterministic id for a memory entry: SHA-256 over `owner:content`, or over the content
/// alone when there is no owner.
pub fn entry_id(owner: Option<&str>, content: &str) -> String {
    let mut hasher = Sha256::new();
    match owner {
        Some(owner) => hasher.update(format!("{owner}:{content}").as_bytes()),
        None => hasher.update(content.as_bytes()),
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..ENTRY_ID_LEN].to_string()
}
