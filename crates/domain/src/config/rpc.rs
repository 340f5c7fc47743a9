//! Control-plane listener configuration (RPC surface + observability).

use serde::{Deserialize, Serialize};

/// TLS material for the RPC listener.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub ca_file: Option<String>,
}

/// Settings for the control-plane listener the RPC/UI layers connect to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    /// `host:port` for TCP, or a `unix:` path for a local socket.
    #[serde(default = "d_listen_address")]
    pub listen_address: String,
    #[serde(default = "d_max_msg_size")]
    pub max_recv_msg_size: usize,
    #[serde(default = "d_max_msg_size")]
    pub max_send_msg_size: usize,
    #[serde(default = "d_keepalive_time")]
    pub keepalive_time_seconds: u64,
    #[serde(default = "d_keepalive_timeout")]
    pub keepalive_timeout_seconds: u64,
    /// Octal mode applied to a unix listen socket.
    #[serde(default = "d_socket_mode")]
    pub socket_mode: u32,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn d_listen_address() -> String {
    "127.0.0.1:8490".into()
}
fn d_max_msg_size() -> usize {
    16 * 1024 * 1024
}
fn d_keepalive_time() -> u64 {
    30
}
fn d_keepalive_timeout() -> u64 {
    10
}
fn d_socket_mode() -> u32 {
    0o600
}

impl Default for RpcConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default RpcConfig")
    }
}

/// Observability surface (metrics scrape endpoint lives outside the core;
/// only the bind address is configured here).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityConfig {
    #[serde(default = "d_observability_address")]
    pub listen_address: String,
}

fn d_observability_address() -> String {
    "127.0.0.1:8491".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            listen_address: d_observability_address(),
        }
    }
}
