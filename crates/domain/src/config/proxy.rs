//! HTTP proxy configuration for streamable-http transports.

use serde::{Deserialize, Serialize};

/// How the HTTP client resolves its proxy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyMode {
    /// Use the environment's proxy settings.
    #[default]
    System,
    /// Use the configured `url`.
    CustomUrl,
    /// No proxy at all.
    Disabled,
    /// Per-spec only: fall back to the runtime default.
    Inherit,
}

/// Proxy settings, usable both as the runtime default and as a per-spec
/// override.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub mode: ProxyMode,
    #[serde(default)]
    pub url: Option<String>,
    /// Comma-separated host suffixes that bypass the proxy.
    #[serde(default)]
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Resolve the effective proxy: per-spec override unless it inherits.
    pub fn effective<'a>(spec: Option<&'a ProxyConfig>, runtime: &'a ProxyConfig) -> &'a ProxyConfig {
        match spec {
            Some(p) if p.mode != ProxyMode::Inherit => p,
            _ => runtime,
        }
    }
}
