//! Downstream server specification — the unit of configuration for one
//! MCP server managed by the gateway.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::proxy::ProxyConfig;
use super::ConfigIssue;

/// Transport used to reach a downstream server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
}

/// Instance pooling strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Any Ready instance may serve any request.
    #[default]
    Stateless,
    /// Requests with the same routing key stick to one instance until the
    /// session TTL expires.
    Stateful,
    /// Instances are never reaped once Ready.
    Persistent,
    /// At most one instance exists per spec.
    Singleton,
}

/// Whether the pool is kept warm without client demand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationMode {
    OnDemand,
    AlwaysOn,
}

/// Headers the HTTP transport reserves for itself; user-supplied headers
/// must not collide with these.
pub const RESERVED_HTTP_HEADERS: &[&str] = &[
    "mcp-protocol-version",
    "mcp-session-id",
    "content-type",
    "accept",
];

/// Configuration for one downstream MCP server.
///
/// BTreeMaps keep env/header iteration deterministic, which the spec
/// fingerprint depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Unique server name. Shown to clients and used for tool namespacing.
    pub name: String,

    /// Transport. When absent, validation infers streamable-http if HTTP
    /// fields are present and stdio otherwise (with a warning).
    #[serde(default)]
    pub transport: Option<TransportKind>,

    // ── stdio ────────────────────────────────────────────────────────
    /// Command to spawn for stdio transport.
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,

    // ── streamable-http ──────────────────────────────────────────────
    /// Endpoint URL for streamable-http transport.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    /// Per-spec proxy override; falls back to the runtime default.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    // ── Pool tuning ──────────────────────────────────────────────────
    /// Seconds of inactivity before an instance is reaped.
    #[serde(default = "d_idle_seconds")]
    pub idle_seconds: u64,
    /// Maximum concurrent calls per instance, and the instance cap for
    /// non-singleton pools.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub strategy: Strategy,
    /// Sliding session window for the stateful strategy.
    #[serde(rename = "sessionTTLSeconds", default = "d_session_ttl_seconds")]
    pub session_ttl_seconds: u64,
    /// Minimum Ready instances maintained while the spec is activated.
    #[serde(default)]
    pub min_ready: u32,
    /// Defaults to the runtime `defaultActivationMode` when absent.
    #[serde(default)]
    pub activation_mode: Option<ActivationMode>,
    #[serde(default = "d_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,

    // ── Protocol & visibility ────────────────────────────────────────
    /// MCP protocol version to advertise (YYYY-MM-DD).
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// Allow-list of tool names exposed from this server.
    #[serde(default)]
    pub expose_tools: Option<Vec<String>>,
    /// Visibility tags matched against client tags (union semantics).
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

fn d_max_retries() -> u32 {
    3
}
fn d_idle_seconds() -> u64 {
    300
}
fn d_max_concurrent() -> u32 {
    4
}
fn d_session_ttl_seconds() -> u64 {
    600
}
fn d_drain_timeout_seconds() -> u64 {
    10
}

impl ServerSpec {
    /// The effective transport after implicit detection.
    pub fn effective_transport(&self) -> TransportKind {
        match self.transport {
            Some(t) => t,
            None if self.endpoint.is_some() => TransportKind::StreamableHttp,
            None => TransportKind::Stdio,
        }
    }

    /// Normalize in place: resolve implicit transport, trim/lowercase/sort
    /// tags, and drop empty tag entries.
    pub fn normalize(&mut self) {
        if self.transport.is_none() {
            let inferred = self.effective_transport();
            if inferred == TransportKind::StreamableHttp {
                tracing::warn!(
                    server = %self.name,
                    "transport unspecified but HTTP endpoint present, inferring streamable-http"
                );
            }
            self.transport = Some(inferred);
        }
        self.tags = crate::visibility::normalize_tags(&self.tags);
    }

    /// Validate this spec, appending issues to `out`.
    pub fn validate(&self, out: &mut Vec<ConfigIssue>) {
        let field = |suffix: &str| format!("servers.{}.{suffix}", self.name);

        if self.name.trim().is_empty() {
            out.push(ConfigIssue::error("servers.name", "server name must not be empty"));
        }
        if self.max_concurrent == 0 {
            out.push(ConfigIssue::error(
                field("maxConcurrent"),
                "maxConcurrent must be >= 1",
            ));
        }
        match self.effective_transport() {
            TransportKind::Stdio => {
                if self.cmd.trim().is_empty() {
                    out.push(ConfigIssue::error(
                        field("cmd"),
                        "stdio transport requires a command",
                    ));
                }
                if self.endpoint.is_some() && self.transport == Some(TransportKind::Stdio) {
                    out.push(ConfigIssue::error(
                        field("endpoint"),
                        "endpoint is not valid for stdio transport",
                    ));
                }
            }
            TransportKind::StreamableHttp => {
                if self.endpoint.is_none() {
                    out.push(ConfigIssue::error(
                        field("endpoint"),
                        "streamable-http transport requires an endpoint",
                    ));
                }
                for key in self.headers.keys() {
                    if RESERVED_HTTP_HEADERS.contains(&key.to_ascii_lowercase().as_str()) {
                        out.push(ConfigIssue::error(
                            field("headers"),
                            format!("header {key:?} collides with a reserved header"),
                        ));
                    }
                }
            }
        }
        if let Some(version) = &self.protocol_version {
            if !is_protocol_date(version) {
                out.push(ConfigIssue::error(
                    field("protocolVersion"),
                    format!("{version:?} is not a YYYY-MM-DD protocol version"),
                ));
            }
        }
        if self.strategy != Strategy::Stateful && self.session_ttl_seconds != d_session_ttl_seconds()
        {
            out.push(ConfigIssue::warning(
                field("sessionTTLSeconds"),
                "sessionTTLSeconds only applies to the stateful strategy",
            ));
        }
        if self.strategy == Strategy::Singleton && self.min_ready > 1 {
            out.push(ConfigIssue::warning(
                field("minReady"),
                "singleton strategy caps minReady at 1",
            ));
        }
    }
}

/// Check `YYYY-MM-DD` shape without pulling in a date parser.
fn is_protocol_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSeverity;

    fn minimal_stdio(name: &str) -> ServerSpec {
        serde_yaml::from_str(&format!("name: {name}\ncmd: echo\n")).unwrap()
    }

    #[test]
    fn defaults_applied() {
        let spec = minimal_stdio("s1");
        assert_eq!(spec.idle_seconds, 300);
        assert_eq!(spec.max_concurrent, 4);
        assert_eq!(spec.strategy, Strategy::Stateless);
        assert_eq!(spec.drain_timeout_seconds, 10);
        assert!(!spec.disabled);
    }

    #[test]
    fn implicit_transport_inference() {
        let spec = minimal_stdio("s1");
        assert_eq!(spec.effective_transport(), TransportKind::Stdio);

        let http: ServerSpec =
            serde_yaml::from_str("name: h1\nendpoint: http://localhost:9000/mcp\n").unwrap();
        assert_eq!(http.effective_transport(), TransportKind::StreamableHttp);
    }

    #[test]
    fn normalize_sorts_and_dedupes_tags() {
        let mut spec = minimal_stdio("s1");
        spec.tags = vec![" Chat ".into(), "vscode".into(), "chat".into(), "".into()];
        spec.normalize();
        assert_eq!(spec.tags, vec!["chat".to_string(), "vscode".to_string()]);
        assert_eq!(spec.transport, Some(TransportKind::Stdio));
    }

    #[test]
    fn zero_max_concurrent_rejected() {
        let mut spec = minimal_stdio("s1");
        spec.max_concurrent = 0;
        let mut issues = Vec::new();
        spec.validate(&mut issues);
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field.contains("maxConcurrent")));
    }

    #[test]
    fn stdio_requires_cmd() {
        let spec: ServerSpec = serde_yaml::from_str("name: broken\n").unwrap();
        let mut issues = Vec::new();
        spec.validate(&mut issues);
        assert!(issues.iter().any(|i| i.field.contains("cmd")));
    }

    #[test]
    fn reserved_header_collision_rejected() {
        let spec: ServerSpec = serde_yaml::from_str(
            "name: h1\nendpoint: http://localhost:9000/mcp\nheaders:\n  MCP-Protocol-Version: \"2024-01-01\"\n",
        )
        .unwrap();
        let mut issues = Vec::new();
        spec.validate(&mut issues);
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field.contains("headers")));
    }

    #[test]
    fn protocol_version_shape_checked() {
        let mut spec = minimal_stdio("s1");
        spec.protocol_version = Some("2025-11-25".into());
        let mut issues = Vec::new();
        spec.validate(&mut issues);
        assert!(issues.is_empty());

        spec.protocol_version = Some("v1".into());
        spec.validate(&mut issues);
        assert!(issues.iter().any(|i| i.field.contains("protocolVersion")));
    }

    #[test]
    fn camel_case_keys_accepted() {
        let spec: ServerSpec = serde_yaml::from_str(
            "name: s1\ncmd: echo\nidleSeconds: 60\nmaxConcurrent: 2\nsessionTTLSeconds: 30\nstrategy: stateful\n",
        )
        .unwrap();
        assert_eq!(spec.idle_seconds, 60);
        assert_eq!(spec.max_concurrent, 2);
        assert_eq!(spec.session_ttl_seconds, 30);
        assert_eq!(spec.strategy, Strategy::Stateful);
    }
}
