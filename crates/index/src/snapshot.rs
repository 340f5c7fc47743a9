//! Immutable catalog snapshots and their ETags.
//!
//! A snapshot is rebuilt as a whole on every refresh: entries are sorted
//! by `(specKey, entryName)` and the ETag is a content hash of the
//! ordered entries, so byte-equal snapshots always share an ETag —
//! including filtered per-client views, whose ETags are computed over the
//! filtered entry list with the same function.

use std::collections::BTreeMap;

use mcpv_domain::SpecKey;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One aggregated catalog entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Entry<T> {
    pub spec_key: SpecKey,
    /// Human server name from the spec.
    pub server_name: String,
    /// Client-facing name after namespacing (tools) or the native
    /// name/URI (resources, prompts).
    pub display_name: String,
    pub def: T,
}

/// An immutable aggregated snapshot of one catalog kind.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snapshot<T> {
    pub entries: Vec<Entry<T>>,
    pub etag: String,
    /// Entries grouped per spec, in snapshot order.
    pub by_server: BTreeMap<SpecKey, Vec<String>>,
}

impl<T: Serialize + Clone> Snapshot<T> {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            etag: etag_of::<T>(&[]),
            by_server: BTreeMap::new(),
        }
    }

    /// Build from entries. The caller passes them in any order; the
    /// snapshot sorts deterministically and derives etag + byServer.
    pub fn build(mut entries: Vec<Entry<T>>) -> Self {
        entries.sort_by(|a, b| {
            (&a.spec_key, &a.display_name).cmp(&(&b.spec_key, &b.display_name))
        });
        let etag = etag_of(&entries);
        let mut by_server: BTreeMap<SpecKey, Vec<String>> = BTreeMap::new();
        for entry in &entries {
            by_server
                .entry(entry.spec_key.clone())
                .or_default()
                .push(entry.display_name.clone());
        }
        Self {
            entries,
            etag,
            by_server,
        }
    }

    /// A filtered view containing only entries from visible specs, with
    /// its own content ETag so client-scoped caches stay stable.
    pub fn filtered(&self, visible: &dyn Fn(&SpecKey) -> bool) -> Snapshot<T> {
        let entries: Vec<Entry<T>> = self
            .entries
            .iter()
            .filter(|e| visible(&e.spec_key))
            .cloned()
            .collect();
        Snapshot::build(entries)
    }

    /// Resolve a display name to its spec and native entry.
    pub fn resolve(&self, display_name: &str) -> Option<&Entry<T>> {
        self.entries.iter().find(|e| e.display_name == display_name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Content hash over the ordered entries.
pub fn etag_of<T: Serialize>(entries: &[Entry<T>]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.spec_key.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(entry.display_name.as_bytes());
        hasher.update([0]);
        // Defs are serde types with stable field order.
        if let Ok(bytes) = serde_json::to_vec(&entry.def) {
            hasher.update(&bytes);
        }
        hasher.update([0]);
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(spec: &str, name: &str, payload: &str) -> Entry<String> {
        Entry {
            spec_key: SpecKey::from_raw(spec),
            server_name: format!("server-{spec}"),
            display_name: name.to_string(),
            def: payload.to_string(),
        }
    }

    #[test]
    fn build_sorts_by_spec_then_name() {
        let snapshot = Snapshot::build(vec![
            entry("b", "z", "1"),
            entry("a", "m", "2"),
            entry("b", "a", "3"),
        ]);
        let order: Vec<(&str, &str)> = snapshot
            .entries
            .iter()
            .map(|e| (e.spec_key.as_str(), e.display_name.as_str()))
            .collect();
        assert_eq!(order, vec![("a", "m"), ("b", "a"), ("b", "z")]);
    }

    #[test]
    fn etag_is_content_function() {
        let a = Snapshot::build(vec![entry("a", "x", "1"), entry("b", "y", "2")]);
        // Same content, different insertion order.
        let b = Snapshot::build(vec![entry("b", "y", "2"), entry("a", "x", "1")]);
        assert_eq!(a.etag, b.etag);

        let c = Snapshot::build(vec![entry("a", "x", "other"), entry("b", "y", "2")]);
        assert_ne!(a.etag, c.etag);
    }

    #[test]
    fn empty_snapshots_share_etag() {
        assert_eq!(Snapshot::<String>::empty().etag, Snapshot::<String>::empty().etag);
    }

    #[test]
    fn filtered_view_has_own_stable_etag() {
        let full = Snapshot::build(vec![entry("a", "x", "1"), entry("b", "y", "2")]);
        let only_a = full.filtered(&|k: &SpecKey| k.as_str() == "a");
        assert_eq!(only_a.len(), 1);
        // Equal to a snapshot built directly from the same content.
        let direct = Snapshot::build(vec![entry("a", "x", "1")]);
        assert_eq!(only_a.etag, direct.etag);
        assert_ne!(only_a.etag, full.etag);
    }

    #[test]
    fn by_server_groups_entries() {
        let snapshot = Snapshot::build(vec![
            entry("a", "x", "1"),
            entry("a", "y", "2"),
            entry("b", "z", "3"),
        ]);
        assert_eq!(
            snapshot.by_server[&SpecKey::from_raw("a")],
            vec!["x".to_string(), "y".to_string()]
        );
        assert_eq!(snapshot.by_server[&SpecKey::from_raw("b")], vec!["z".to_string()]);
    }

    #[test]
    fn resolve_finds_display_name() {
        let snapshot = Snapshot::build(vec![entry("a", "github.search", "1")]);
        assert!(snapshot.resolve("github.search").is_some());
        assert!(snapshot.resolve("missing").is_none());
    }
}
