//! Governance plugin specification.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ConfigIssue;

/// Fixed execution categories, listed in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    Observability,
    Authentication,
    Authorization,
    RateLimiting,
    Validation,
    Content,
    Audit,
}

impl PluginCategory {
    /// All categories in the order the pipeline executes them.
    pub const ORDER: [PluginCategory; 7] = [
        PluginCategory::Observability,
        PluginCategory::Authentication,
        PluginCategory::Authorization,
        PluginCategory::RateLimiting,
        PluginCategory::Validation,
        PluginCategory::Content,
        PluginCategory::Audit,
    ];
}

/// Which pipeline phases a plugin participates in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginFlow {
    Request,
    Response,
}

fn d_flows() -> Vec<PluginFlow> {
    vec![PluginFlow::Request, PluginFlow::Response]
}

/// Configuration for one out-of-process governance plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    /// Unique plugin name.
    pub name: String,
    pub category: PluginCategory,
    /// Required plugins block startup on failure; optional plugins are
    /// logged and marked unhealthy.
    #[serde(default)]
    pub required: bool,

    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,

    /// Optional pin: the plugin's reported commit hash must match.
    #[serde(default)]
    pub commit_hash: Option<String>,

    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "d_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "d_flows")]
    pub flows: Vec<PluginFlow>,

    /// Opaque configuration pushed to the plugin at startup.
    #[serde(rename = "configJSON", default)]
    pub config_json: serde_json::Value,

    #[serde(default)]
    pub disabled: bool,
}

fn d_timeout_ms() -> u64 {
    5_000
}
fn d_handshake_timeout_ms() -> u64 {
    10_000
}

impl PluginSpec {
    pub fn handles(&self, flow: PluginFlow) -> bool {
        self.flows.contains(&flow)
    }

    pub fn validate(&self, out: &mut Vec<ConfigIssue>) {
        let field = |suffix: &str| format!("plugins.{}.{suffix}", self.name);
        if self.name.trim().is_empty() {
            out.push(ConfigIssue::error("plugins.name", "plugin name must not be empty"));
        }
        if self.cmd.trim().is_empty() {
            out.push(ConfigIssue::error(field("cmd"), "plugin requires a command"));
        }
        if self.flows.is_empty() {
            out.push(ConfigIssue::error(
                field("flows"),
                "plugin must handle at least one of request/response",
            ));
        }
        if self.timeout_ms == 0 {
            out.push(ConfigIssue::error(field("timeoutMs"), "timeoutMs must be > 0"));
        }
    }
}
