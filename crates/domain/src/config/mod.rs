//! Gateway configuration model.
//!
//! The config is a single YAML document. Loading happens in three steps:
//! parse to a raw value, expand `${VAR}` references against the process
//! environment (missing variables warn and expand to empty), then
//! deserialize into [`Config`] and normalize. Validation is separate and
//! returns severity-tagged issues so the caller decides whether warnings
//! are fatal.

mod plugin;
mod proxy;
mod rpc;
mod server;
mod subagent;

pub use plugin::{PluginCategory, PluginFlow, PluginSpec};
pub use proxy::{ProxyConfig, ProxyMode};
pub use rpc::{ObservabilityConfig, RpcConfig, TlsConfig};
pub use server::{ActivationMode, ServerSpec, Strategy, TransportKind, RESERVED_HTTP_HEADERS};
pub use subagent::SubAgentConfig;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime knobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Policy for applying a catalog update that touches runtime-wide fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// Reject the whole update when any runtime-wide field changed.
    #[default]
    Strict,
    /// Apply the non-disruptive subset and warn about the rest.
    Lenient,
}

/// Startup catalog preflight behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapMode {
    /// Fetch each spec's catalogs once at startup to hydrate the cache.
    #[default]
    Metadata,
    /// No preflight; indexes serve empty until first refresh.
    Disabled,
}

/// How duplicate tool names across specs are disambiguated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceStrategy {
    /// `<serverName>.<toolName>` for every entry.
    #[default]
    Prefix,
    /// Bare tool names; duplicates resolve last-writer-wins with a warning.
    Flat,
}

/// Runtime-wide tuning. These fields are *not* hot-reloadable; the reload
/// manager guards them per `reloadMode`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default = "d_route_timeout")]
    pub route_timeout_seconds: u64,
    #[serde(default = "d_ping_interval")]
    pub ping_interval_seconds: u64,
    #[serde(default = "d_tool_refresh")]
    pub tool_refresh_seconds: u64,
    #[serde(default = "d_tool_refresh_concurrency")]
    pub tool_refresh_concurrency: usize,
    #[serde(default = "d_client_check")]
    pub client_check_seconds: u64,
    #[serde(default = "d_client_inactive")]
    pub client_inactive_seconds: u64,
    #[serde(default = "d_init_retry_base")]
    pub server_init_retry_base_seconds: u64,
    #[serde(default = "d_init_retry_max")]
    pub server_init_retry_max_seconds: u64,
    #[serde(default = "d_init_max_retries")]
    pub server_init_max_retries: u32,
    #[serde(default)]
    pub reload_mode: ReloadMode,
    #[serde(default)]
    pub bootstrap_mode: BootstrapMode,
    #[serde(default = "d_bootstrap_concurrency")]
    pub bootstrap_concurrency: usize,
    #[serde(default = "d_bootstrap_timeout")]
    pub bootstrap_timeout_seconds: u64,
    #[serde(default = "d_activation_mode")]
    pub default_activation_mode: ActivationMode,
    /// Global tool allow-list applied on top of per-spec `exposeTools`.
    #[serde(default)]
    pub expose_tools: Option<Vec<String>>,
    #[serde(default)]
    pub tool_namespace_strategy: NamespaceStrategy,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub sub_agent: SubAgentConfig,
}

fn d_route_timeout() -> u64 {
    30
}
fn d_ping_interval() -> u64 {
    30
}
fn d_tool_refresh() -> u64 {
    60
}
fn d_tool_refresh_concurrency() -> usize {
    4
}
fn d_client_check() -> u64 {
    10
}
fn d_client_inactive() -> u64 {
    60
}
fn d_init_retry_base() -> u64 {
    1
}
fn d_init_retry_max() -> u64 {
    5
}
fn d_init_max_retries() -> u32 {
    3
}
fn d_bootstrap_concurrency() -> usize {
    4
}
fn d_bootstrap_timeout() -> u64 {
    30
}
fn d_activation_mode() -> ActivationMode {
    ActivationMode::OnDemand
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default RuntimeConfig")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

impl Config {
    /// Parse a YAML document: expand `${VAR}` references, deserialize,
    /// and normalize every spec.
    pub fn from_yaml_str(raw: &str) -> Result<Config> {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("parse: {e}")))?;
        for missing in expand_env(&mut value, &|var| std::env::var(var).ok()) {
            tracing::warn!(var = %missing, "config references undefined environment variable");
        }
        let mut config: Config = serde_yaml::from_value(value)
            .map_err(|e| Error::Config(format!("deserialize: {e}")))?;
        config.normalize();
        Ok(config)
    }

    /// Resolve implicit transports and normalize tags on every spec.
    pub fn normalize(&mut self) {
        for spec in &mut self.servers {
            spec.normalize();
        }
    }

    /// The effective activation mode for a spec.
    pub fn activation_mode(&self, spec: &ServerSpec) -> ActivationMode {
        spec.activation_mode
            .unwrap_or(self.runtime.default_activation_mode)
    }

    /// Validate the whole catalog. Errors make the config unusable;
    /// warnings are surfaced but non-fatal.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let mut seen = HashSet::new();
        for spec in &self.servers {
            if !seen.insert(spec.name.clone()) {
                issues.push(ConfigIssue::error(
                    "servers",
                    format!("duplicate server name {:?}", spec.name),
                ));
            }
            spec.validate(&mut issues);
        }

        let mut seen_plugins = HashSet::new();
        for plugin in &self.plugins {
            if !seen_plugins.insert(plugin.name.clone()) {
                issues.push(ConfigIssue::error(
                    "plugins",
                    format!("duplicate plugin name {:?}", plugin.name),
                ));
            }
            plugin.validate(&mut issues);
        }

        self.runtime.sub_agent.validate(&mut issues);

        if self.runtime.route_timeout_seconds == 0 {
            issues.push(ConfigIssue::error(
                "routeTimeoutSeconds",
                "routeTimeoutSeconds must be > 0",
            ));
        }
        if self.runtime.tool_refresh_concurrency == 0 {
            issues.push(ConfigIssue::error(
                "toolRefreshConcurrency",
                "toolRefreshConcurrency must be > 0",
            ));
        }

        issues
    }

    /// True when any issue is an error.
    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env expansion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Expand `${VAR}` references in every string value. Returns the names of
/// variables that were referenced but not defined (expanded to empty).
pub fn expand_env(
    value: &mut serde_yaml::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Vec<String> {
    let mut missing = Vec::new();
    expand_value(value, lookup, &mut missing);
    missing.sort();
    missing.dedup();
    missing
}

fn expand_value(
    value: &mut serde_yaml::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
    missing: &mut Vec<String>,
) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_str(s, lookup, missing);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                expand_value(item, lookup, missing);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_value(v, lookup, missing);
            }
        }
        _ => {}
    }
}

fn expand_str(s: &str, lookup: &dyn Fn(&str) -> Option<String>, missing: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                match lookup(var) {
                    Some(val) => out.push_str(&val),
                    None => missing.push(var.to_string()),
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference, keep it literal.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
routeTimeoutSeconds: 20
toolNamespaceStrategy: prefix
reloadMode: lenient
servers:
  - name: github
    cmd: npx
    args: ["-y", "@modelcontextprotocol/server-github"]
    tags: [dev, Chat]
  - name: search
    endpoint: http://localhost:9000/mcp
    tags: []
plugins:
  - name: audit
    category: audit
    cmd: ./audit-plugin
"#;

    #[test]
    fn parse_sample() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.runtime.route_timeout_seconds, 20);
        assert_eq!(config.runtime.reload_mode, ReloadMode::Lenient);
        assert_eq!(config.servers.len(), 2);
        // Normalization ran: implicit transport resolved, tags sorted.
        assert_eq!(
            config.servers[1].transport,
            Some(TransportKind::StreamableHttp)
        );
        assert_eq!(config.servers[0].tags, vec!["chat", "dev"]);
        let issues = config.validate();
        assert!(!Config::has_errors(&issues), "{issues:?}");
    }

    #[test]
    fn duplicate_server_names_rejected() {
        let raw = "servers:\n  - {name: a, cmd: echo}\n  - {name: a, cmd: echo}\n";
        let config = Config::from_yaml_str(raw).unwrap();
        let issues = config.validate();
        assert!(Config::has_errors(&issues));
    }

    #[test]
    fn duplicate_plugin_names_rejected() {
        let raw = "plugins:\n  - {name: p, category: audit, cmd: ./p}\n  - {name: p, category: content, cmd: ./p}\n";
        let config = Config::from_yaml_str(raw).unwrap();
        assert!(Config::has_errors(&config.validate()));
    }

    #[test]
    fn env_expansion_with_missing_vars() {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str("token: \"${MCPV_TEST_TOKEN}\"\nhome: \"${MCPV_TEST_MISSING}/x\"")
                .unwrap();
        let lookup = |var: &str| {
            (var == "MCPV_TEST_TOKEN").then(|| "sekrit".to_string())
        };
        let missing = expand_env(&mut value, &lookup);
        assert_eq!(missing, vec!["MCPV_TEST_MISSING".to_string()]);
        assert_eq!(value["token"], serde_yaml::Value::String("sekrit".into()));
        assert_eq!(value["home"], serde_yaml::Value::String("/x".into()));
    }

    #[test]
    fn unterminated_reference_kept_literal() {
        let mut missing = Vec::new();
        let out = expand_str("${OOPS", &|_| None, &mut missing);
        assert_eq!(out, "${OOPS");
        assert!(missing.is_empty());
    }

    #[test]
    fn activation_mode_falls_back_to_default() {
        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(
            config.activation_mode(&config.servers[0].clone()),
            ActivationMode::OnDemand
        );
        config.servers[0].activation_mode = Some(ActivationMode::AlwaysOn);
        assert_eq!(
            config.activation_mode(&config.servers[0].clone()),
            ActivationMode::AlwaysOn
        );
    }
}
