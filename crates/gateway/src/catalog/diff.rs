//! Catalog diffing.
//!
//! Pool identity is the spec fingerprint, not the server name: a renamed
//! server whose fingerprint is unchanged is a name-only update, while the
//! same name with a new fingerprint is a *replacement* (rolling restart).
//! Tag-only edits are flagged separately and must never churn pools.

use std::collections::BTreeSet;

use mcpv_domain::SpecKey;
use serde::Serialize;

use super::CatalogState;

/// Difference between two catalog states.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogDiff {
    pub added: Vec<SpecKey>,
    pub removed: Vec<SpecKey>,
    /// `(old, new)` fingerprints sharing a server name.
    pub replaced: Vec<(SpecKey, SpecKey)>,
    /// Same fingerprint, different tuning (in-place update).
    pub updated: Vec<SpecKey>,
    pub plugins_added: Vec<String>,
    pub plugins_removed: Vec<String>,
    pub plugins_updated: Vec<String>,
    pub runtime_changed: bool,
    /// Visibility-only change; bumps the visibility revision.
    pub tags_changed: bool,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.replaced.is_empty()
            && self.updated.is_empty()
            && self.plugins_added.is_empty()
            && self.plugins_removed.is_empty()
            && self.plugins_updated.is_empty()
            && !self.runtime_changed
            && !self.tags_changed
    }

    /// Whether any pool-affecting change is present.
    pub fn pools_affected(&self) -> bool {
        !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.replaced.is_empty()
            || !self.updated.is_empty()
    }

    /// One-line human summary for the reload response.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no changes".into();
        }
        let mut parts = Vec::new();
        let mut push = |label: &str, n: usize| {
            if n > 0 {
                parts.push(format!("{n} {label}"));
            }
        };
        push("added", self.added.len());
        push("removed", self.removed.len());
        push("replaced", self.replaced.len());
        push("updated", self.updated.len());
        push("plugins added", self.plugins_added.len());
        push("plugins removed", self.plugins_removed.len());
        push("plugins updated", self.plugins_updated.len());
        if self.runtime_changed {
            parts.push("runtime changed".into());
        }
        if self.tags_changed {
            parts.push("tags changed".into());
        }
        parts.join(", ")
    }
}

/// Compute the diff from `old` to `new`.
pub fn diff(old: &CatalogState, new: &CatalogState) -> CatalogDiff {
    let mut out = CatalogDiff {
        runtime_changed: old.catalog.runtime != new.catalog.runtime,
        ..Default::default()
    };

    let old_keys: BTreeSet<&SpecKey> = old.spec_registry.keys().collect();
    let new_keys: BTreeSet<&SpecKey> = new.spec_registry.keys().collect();

    // Replacements: same name, different key.
    let mut replaced_old = BTreeSet::new();
    let mut replaced_new = BTreeSet::new();
    for (name, new_key) in &new.name_index {
        if let Some(old_key) = old.name_index.get(name) {
            if old_key != new_key {
                out.replaced.push((old_key.clone(), new_key.clone()));
                replaced_old.insert(old_key.clone());
                replaced_new.insert(new_key.clone());
            }
        }
    }

    for key in new_keys.difference(&old_keys) {
        if !replaced_new.contains(*key) {
            out.added.push((*key).clone());
        }
    }
    for key in old_keys.difference(&new_keys) {
        if !replaced_old.contains(*key) {
            out.removed.push((*key).clone());
        }
    }

    // Same key in both generations: in-place update vs tag-only change.
    for key in old_keys.intersection(&new_keys) {
        let old_spec = &old.spec_registry[*key];
        let new_spec = &new.spec_registry[*key];
        if old_spec == new_spec {
            continue;
        }
        if old_spec.tags != new_spec.tags {
            out.tags_changed = true;
        }
        let mut old_sans_tags = (**old_spec).clone();
        let mut new_sans_tags = (**new_spec).clone();
        old_sans_tags.tags.clear();
        new_sans_tags.tags.clear();
        if old_sans_tags != new_sans_tags {
            out.updated.push((*key).clone());
        }
    }

    // Plugins by name.
    for plugin in &new.catalog.plugins {
        match old.catalog.plugins.iter().find(|p| p.name == plugin.name) {
            None => out.plugins_added.push(plugin.name.clone()),
            Some(old_plugin) if old_plugin != plugin => {
                out.plugins_updated.push(plugin.name.clone())
            }
            Some(_) => {}
        }
    }
    for plugin in &old.catalog.plugins {
        if !new.catalog.plugins.iter().any(|p| p.name == plugin.name) {
            out.plugins_removed.push(plugin.name.clone());
        }
    }

    out.added.sort();
    out.removed.sort();
    out.updated.sort();
    out.replaced.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogState;
    use mcpv_domain::config::Config;

    fn state(yaml: &str) -> CatalogState {
        CatalogState::from_config(Config::from_yaml_str(yaml).unwrap(), 1)
    }

    const BASE: &str = r#"
servers:
  - name: github
    cmd: npx
    args: [server-github]
    tags: [dev]
"#;

    #[test]
    fn identical_catalogs_have_empty_diff() {
        let a = state(BASE);
        let b = state(BASE);
        let d = diff(&a, &b);
        assert!(d.is_empty(), "{d:?}");
        assert_eq!(d.summary(), "no changes");
    }

    #[test]
    fn tag_only_change_never_touches_pools() {
        let a = state(BASE);
        let b = state(&BASE.replace("[dev]", "[dev, chat]"));
        let d = diff(&a, &b);
        assert!(d.tags_changed);
        assert!(!d.pools_affected(), "{d:?}");
    }

    #[test]
    fn tuning_change_is_in_place_update() {
        let a = state(BASE);
        let b = state(&format!("{BASE}    maxConcurrent: 9\n"));
        let d = diff(&a, &b);
        assert_eq!(d.updated.len(), 1);
        assert!(d.added.is_empty() && d.removed.is_empty() && d.replaced.is_empty());
    }

    #[test]
    fn same_name_new_cmd_is_replacement() {
        let a = state(BASE);
        let b = state(&BASE.replace("cmd: npx", "cmd: bun"));
        let d = diff(&a, &b);
        assert_eq!(d.replaced.len(), 1);
        assert!(d.added.is_empty(), "{d:?}");
        assert!(d.removed.is_empty(), "{d:?}");
        let (old_key, new_key) = &d.replaced[0];
        assert_ne!(old_key, new_key);
    }

    #[test]
    fn rename_preserving_fingerprint_is_update() {
        let a = state(BASE);
        let b = state(&BASE.replace("name: github", "name: gh"));
        let d = diff(&a, &b);
        // Same fingerprint, new name: in-place update, no pool churn.
        assert!(d.added.is_empty(), "{d:?}");
        assert!(d.removed.is_empty(), "{d:?}");
        assert!(d.replaced.is_empty(), "{d:?}");
        assert_eq!(d.updated.len(), 1);
    }

    #[test]
    fn add_and_remove_servers() {
        let a = state(BASE);
        let b = state("servers:\n  - name: search\n    endpoint: http://localhost:9000/mcp\n");
        let d = diff(&a, &b);
        assert_eq!(d.added.len(), 1);
        assert_eq!(d.removed.len(), 1);
    }

    #[test]
    fn disabling_a_server_removes_it() {
        let a = state(BASE);
        let b = state(&format!("{BASE}    disabled: true\n"));
        let d = diff(&a, &b);
        assert_eq!(d.removed.len(), 1);
        assert!(d.added.is_empty());
    }

    #[test]
    fn runtime_and_plugin_changes_flagged() {
        let a = state(BASE);
        let b = state(&format!("routeTimeoutSeconds: 99\n{BASE}"));
        assert!(diff(&a, &b).runtime_changed);

        let with_plugin = state(&format!(
            "{BASE}plugins:\n  - name: audit\n    category: audit\n    cmd: ./p\n"
        ));
        let d = diff(&a, &with_plugin);
        assert_eq!(d.plugins_added, vec!["audit".to_string()]);
        let d = diff(&with_plugin, &a);
        assert_eq!(d.plugins_removed, vec!["audit".to_string()]);
    }
}
