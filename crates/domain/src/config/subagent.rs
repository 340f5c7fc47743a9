//! Sub-agent (automation) configuration: model-backed tool filtering.

use serde::{Deserialize, Serialize};

use super::ConfigIssue;

/// Configuration for the sub-agent tool filter.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentConfig {
    #[serde(default)]
    pub enabled: bool,
    /// When non-empty, the sub-agent only activates for clients whose tags
    /// intersect this set.
    #[serde(default)]
    pub enabled_tags: Vec<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Inline API key. Prefer `apiKeyEnvVar` in checked-in configs.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(rename = "baseURL", default)]
    pub base_url: Option<String>,
    #[serde(default = "d_max_tools")]
    pub max_tools_per_request: usize,
    /// Prompt template; `{tools}` and `{request}` are substituted.
    #[serde(default)]
    pub filter_prompt: Option<String>,
}

fn d_max_tools() -> usize {
    20
}

impl SubAgentConfig {
    /// Resolve the API key: inline value wins, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        self.api_key_env_var
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }

    /// Whether the sub-agent applies to a client with the given
    /// (normalized) tags.
    pub fn enabled_for(&self, client_tags: &[String]) -> bool {
        if !self.enabled {
            return false;
        }
        if self.enabled_tags.is_empty() {
            return true;
        }
        let gate = crate::visibility::normalize_tags(&self.enabled_tags);
        client_tags.iter().any(|t| gate.binary_search(t).is_ok())
    }

    pub fn validate(&self, out: &mut Vec<ConfigIssue>) {
        if !self.enabled {
            return;
        }
        if self.model.is_none() {
            out.push(ConfigIssue::error(
                "subAgent.model",
                "subAgent.enabled requires a model",
            ));
        }
        if self.api_key.is_none() && self.api_key_env_var.is_none() {
            out.push(ConfigIssue::warning(
                "subAgent.apiKey",
                "no apiKey or apiKeyEnvVar configured; sub-agent calls will fail",
            ));
        }
        if self.max_tools_per_request == 0 {
            out.push(ConfigIssue::error(
                "subAgent.maxToolsPerRequest",
                "maxToolsPerRequest must be > 0",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_applies() {
        let cfg = SubAgentConfig::default();
        assert!(!cfg.enabled_for(&["chat".into()]));
    }

    #[test]
    fn empty_gate_applies_to_all() {
        let cfg = SubAgentConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(cfg.enabled_for(&[]));
        assert!(cfg.enabled_for(&["anything".into()]));
    }

    #[test]
    fn tag_gate_requires_intersection() {
        let cfg = SubAgentConfig {
            enabled: true,
            enabled_tags: vec!["Chat".into()],
            ..Default::default()
        };
        assert!(cfg.enabled_for(&["chat".into()]));
        assert!(!cfg.enabled_for(&["vscode".into()]));
        assert!(!cfg.enabled_for(&[]));
    }
}
