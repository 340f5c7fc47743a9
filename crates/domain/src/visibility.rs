//! Tag-union visibility rules.
//!
//! A server is visible to a client iff either side has no tags, or the two
//! tag sets intersect. Both the client registry and the snapshot filters
//! use this single definition.

/// Trim, lowercase, de-duplicate, and sort a tag list. Empty entries are
/// dropped. The result is suitable for `binary_search`.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Tag-union visibility. Both sides must be normalized.
pub fn visible(client_tags: &[String], server_tags: &[String]) -> bool {
    if server_tags.is_empty() || client_tags.is_empty() {
        return true;
    }
    client_tags
        .iter()
        .any(|t| server_tags.binary_search(t).is_ok())
}
