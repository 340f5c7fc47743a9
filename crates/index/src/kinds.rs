//! Per-kind hooks for the generic aggregation index.

use mcpv_domain::config::{NamespaceStrategy, ServerSpec};
use mcpv_domain::{Result, SpecKey};
use mcpv_proto::mcp::{
    methods, ListChangedKind, PromptDef, PromptsListResult, ResourceDef, ResourcesListResult,
    ToolDef, ToolsListResult,
};
use mcpv_runtime::cache::CachedMeta;
use mcpv_runtime::MetadataCache;
use serde_json::Value;

/// Hooks specializing [`GenericIndex`](crate::generic::GenericIndex) for
/// one catalog kind.
pub trait IndexKind: Send + Sync + 'static {
    type Def: Clone + serde::Serialize + PartialEq + Send + Sync + 'static;

    /// Which `list_changed` notifications target this index.
    const KIND: ListChangedKind;
    /// The downstream list method.
    const METHOD: &'static str;
    /// Log label.
    const NAME: &'static str;

    /// Native entry name (tool name, resource URI, prompt name).
    fn entry_name(def: &Self::Def) -> &str;

    /// Parse the list result payload.
    fn parse(result: Value) -> Result<Vec<Self::Def>>;

    fn cache_get(meta: &CachedMeta) -> Vec<Self::Def>;
    fn cache_put(cache: &MetadataCache, spec_key: &SpecKey, defs: Vec<Self::Def>);

    /// Client-facing display name. Only tools participate in
    /// namespacing; resources and prompts keep their native names.
    fn display_name(def: &Self::Def, server_name: &str, strategy: NamespaceStrategy) -> String {
        let _ = (server_name, strategy);
        Self::entry_name(def).to_string()
    }

    /// Whether a spec's allow-list admits this entry. Only meaningful for
    /// tools.
    fn exposed(def: &Self::Def, spec: &ServerSpec, global: Option<&[String]>) -> bool {
        let _ = (def, spec, global);
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolKind;

impl IndexKind for ToolKind {
    type Def = ToolDef;
    const KIND: ListChangedKind = ListChangedKind::Tools;
    const METHOD: &'static str = methods::TOOLS_LIST;
    const NAME: &'static str = "tools";

    fn entry_name(def: &ToolDef) -> &str {
        &def.name
    }

    fn parse(result: Value) -> Result<Vec<ToolDef>> {
        let parsed: ToolsListResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    fn cache_get(meta: &CachedMeta) -> Vec<ToolDef> {
        meta.tools.clone()
    }

    fn cache_put(cache: &MetadataCache, spec_key: &SpecKey, defs: Vec<ToolDef>) {
        cache.upsert_tools(spec_key, defs);
    }

    fn display_name(def: &ToolDef, server_name: &str, strategy: NamespaceStrategy) -> String {
        match strategy {
            NamespaceStrategy::Prefix => format!("{server_name}.{}", def.name),
            NamespaceStrategy::Flat => def.name.clone(),
        }
    }

    fn exposed(def: &ToolDef, spec: &ServerSpec, global: Option<&[String]>) -> bool {
        if let Some(allow) = &spec.expose_tools {
            if !allow.iter().any(|n| n == &def.name) {
                return false;
            }
        }
        if let Some(allow) = global {
            if !allow.iter().any(|n| n == &def.name) {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resources
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ResourceKind;

impl IndexKind for ResourceKind {
    type Def = ResourceDef;
    const KIND: ListChangedKind = ListChangedKind::Resources;
    const METHOD: &'static str = methods::RESOURCES_LIST;
    const NAME: &'static str = "resources";

    fn entry_name(def: &ResourceDef) -> &str {
        &def.uri
    }

    fn parse(result: Value) -> Result<Vec<ResourceDef>> {
        let parsed: ResourcesListResult = serde_json::from_value(result)?;
        Ok(parsed.resources)
    }

    fn cache_get(meta: &CachedMeta) -> Vec<ResourceDef> {
        meta.resources.clone()
    }

    fn cache_put(cache: &MetadataCache, spec_key: &SpecKey, defs: Vec<ResourceDef>) {
        cache.upsert_resources(spec_key, defs);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PromptKind;

impl IndexKind for PromptKind {
    type Def = PromptDef;
    const KIND: ListChangedKind = ListChangedKind::Prompts;
    const METHOD: &'static str = methods::PROMPTS_LIST;
    const NAME: &'static str = "prompts";

    fn entry_name(def: &PromptDef) -> &str {
        &def.name
    }

    fn parse(result: Value) -> Result<Vec<PromptDef>> {
        let parsed: PromptsListResult = serde_json::from_value(result)?;
        Ok(parsed.prompts)
    }

    fn cache_get(meta: &CachedMeta) -> Vec<PromptDef> {
        meta.prompts.clone()
    }

    fn cache_put(cache: &MetadataCache, spec_key: &SpecKey, defs: Vec<PromptDef>) {
        cache.upsert_prompts(spec_key, defs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolDef {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    #[test]
    fn tool_namespacing() {
        let def = tool("search");
        assert_eq!(
            ToolKind::display_name(&def, "github", NamespaceStrategy::Prefix),
            "github.search"
        );
        assert_eq!(
            ToolKind::display_name(&def, "github", NamespaceStrategy::Flat),
            "search"
        );
    }

    #[test]
    fn expose_tools_filters() {
        let spec: ServerSpec =
            serde_yaml::from_str("name: s\ncmd: echo\nexposeTools: [allowed]\n").unwrap();
        assert!(ToolKind::exposed(&tool("allowed"), &spec, None));
        assert!(!ToolKind::exposed(&tool("hidden"), &spec, None));

        // Global allow-list applies on top.
        let open: ServerSpec = serde_yaml::from_str("name: s\ncmd: echo\n").unwrap();
        let global = vec!["only".to_string()];
        assert!(ToolKind::exposed(&tool("only"), &open, Some(&global)));
        assert!(!ToolKind::exposed(&tool("other"), &open, Some(&global)));
    }

    #[test]
    fn resources_keep_native_uri() {
        let def: ResourceDef =
            serde_json::from_value(serde_json::json!({ "uri": "file:///a" })).unwrap();
        assert_eq!(
            ResourceKind::display_name(&def, "srv", NamespaceStrategy::Prefix),
            "file:///a"
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ToolKind::parse(serde_json::json!({ "tools": "nope" })).is_err());
        assert!(PromptKind::parse(serde_json::json!({ "prompts": [{ "name": "p" }] })).is_ok());
    }
}
