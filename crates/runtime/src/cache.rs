//! Metadata cache — last-known tool/resource/prompt sets per spec.
//!
//! Hydrates list operations when no Ready instance exists. Writers are
//! the bootstrap manager (first successful fetch) and the aggregation
//! indexes (successful refresh). Readers take a read lock and receive a
//! deep copy; the cache never hands out references into its own maps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mcpv_domain::SpecKey;
use mcpv_proto::mcp::{PromptDef, ResourceDef, ToolDef};
use parking_lot::RwLock;

/// Cached catalog sets for one spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedMeta {
    pub tools: Vec<ToolDef>,
    pub resources: Vec<ResourceDef>,
    pub prompts: Vec<PromptDef>,
    pub etag: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Process-wide metadata cache.
#[derive(Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<SpecKey, CachedMeta>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-copied snapshot for one spec. A miss returns `None`; callers
    /// treat that as an empty contribution, not an error.
    pub fn get(&self, spec_key: &SpecKey) -> Option<CachedMeta> {
        self.entries.read().get(spec_key).cloned()
    }

    /// Replace the whole entry for a spec.
    pub fn upsert(&self, spec_key: SpecKey, meta: CachedMeta) {
        let mut meta = meta;
        meta.updated_at = Some(Utc::now());
        self.entries.write().insert(spec_key, meta);
    }

    /// Update only the tool set, preserving the other kinds.
    pub fn upsert_tools(&self, spec_key: &SpecKey, tools: Vec<ToolDef>) {
        let mut entries = self.entries.write();
        let entry = entries.entry(spec_key.clone()).or_default();
        entry.tools = tools;
        entry.updated_at = Some(Utc::now());
    }

    pub fn upsert_resources(&self, spec_key: &SpecKey, resources: Vec<ResourceDef>) {
        let mut entries = self.entries.write();
        let entry = entries.entry(spec_key.clone()).or_default();
        entry.resources = resources;
        entry.updated_at = Some(Utc::now());
    }

    pub fn upsert_prompts(&self, spec_key: &SpecKey, prompts: Vec<PromptDef>) {
        let mut entries = self.entries.write();
        let entry = entries.entry(spec_key.clone()).or_default();
        entry.prompts = prompts;
        entry.updated_at = Some(Utc::now());
    }

    /// Drop a spec's entry (catalog removal or circuit-break eviction).
    pub fn evict(&self, spec_key: &SpecKey) -> bool {
        self.entries.write().remove(spec_key).is_some()
    }

    /// Retain only the given specs; everything else is evicted. Called on
    /// catalog apply.
    pub fn retain_specs(&self, keep: &std::collections::HashSet<SpecKey>) {
        self.entries.write().retain(|k, _| keep.contains(k));
    }

    /// Deep-copied snapshot of the whole cache (debug export).
    pub fn snapshot(&self) -> HashMap<SpecKey, CachedMeta> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SpecKey {
        SpecKey::from_raw(s)
    }

    fn tool(name: &str) -> ToolDef {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    #[test]
    fn round_trip_returns_deep_copy() {
        let cache = MetadataCache::new();
        let k = key("k1");
        cache.upsert_tools(&k, vec![tool("alpha")]);

        let mut copy = cache.get(&k).unwrap();
        assert_eq!(copy.tools[0].name, "alpha");

        // Mutating the copy does not touch the cache.
        copy.tools[0].name = "mutated".into();
        assert_eq!(cache.get(&k).unwrap().tools[0].name, "alpha");
    }

    #[test]
    fn miss_returns_none() {
        let cache = MetadataCache::new();
        assert!(cache.get(&key("missing")).is_none());
    }

    #[test]
    fn kind_updates_preserve_other_kinds() {
        let cache = MetadataCache::new();
        let k = key("k1");
        cache.upsert_tools(&k, vec![tool("t")]);
        cache.upsert_prompts(
            &k,
            vec![serde_json::from_value(serde_json::json!({ "name": "p" })).unwrap()],
        );
        let meta = cache.get(&k).unwrap();
        assert_eq!(meta.tools.len(), 1);
        assert_eq!(meta.prompts.len(), 1);
        assert!(meta.resources.is_empty());
    }

    #[test]
    fn retain_specs_evicts_removed() {
        let cache = MetadataCache::new();
        cache.upsert_tools(&key("a"), vec![]);
        cache.upsert_tools(&key("b"), vec![]);
        let keep: std::collections::HashSet<SpecKey> = [key("a")].into_iter().collect();
        cache.retain_specs(&keep);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
    }

    #[test]
    fn evict_reports_presence() {
        let cache = MetadataCache::new();
        cache.upsert_tools(&key("a"), vec![]);
        assert!(cache.evict(&key("a")));
        assert!(!cache.evict(&key("a")));
    }
}
