//! Plugin wire protocol.
//!
//! Each plugin listens on its own unix socket and speaks newline-delimited
//! JSON-RPC. The manager is the only caller and plugins never push
//! messages of their own, so request/response cycles are serialized over
//! one stream with a cycle lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mcpv_domain::{Error, Result};
use mcpv_proto::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

pub mod methods {
    pub const GET_METADATA: &str = "plugin/getMetadata";
    pub const CONFIGURE: &str = "plugin/configure";
    pub const CHECK_READY: &str = "plugin/checkReady";
    pub const HANDLE_REQUEST: &str = "plugin/handleRequest";
    pub const HANDLE_RESPONSE: &str = "plugin/handleResponse";
    pub const SHUTDOWN: &str = "plugin/shutdown";
}

/// Identity a plugin reports during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

/// A plugin's verdict on one request or response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginDecision {
    /// `false` rejects; the pipeline decides what that means based on
    /// the plugin's category and required flag.
    #[serde(rename = "continue")]
    pub continue_: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// Mutated payload; only honored for the `content` category.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl PluginDecision {
    pub fn pass() -> Self {
        Self {
            continue_: true,
            reason: None,
            payload: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            continue_: false,
            reason: Some(reason.into()),
            payload: None,
        }
    }
}

/// Client side of one plugin socket.
#[derive(Debug)]
pub struct PluginClient {
    stream: Mutex<BufReader<UnixStream>>,
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl PluginClient {
    /// Dial the plugin's socket, retrying until `handshake_timeout`
    /// elapses (the child needs a moment to bind).
    pub async fn dial(socket_path: &Path, handshake_timeout: Duration) -> Result<PluginClient> {
        let deadline = tokio::time::Instant::now() + handshake_timeout;
        let stream = loop {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::io("plugin_dial", e));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        Ok(PluginClient {
            stream: Mutex::new(BufReader::new(stream)),
            socket_path: socket_path.to_path_buf(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// One serialized request/response cycle with a deadline.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)?;

        let mut stream = self.stream.lock().await;
        let cycle = async {
            stream
                .get_mut()
                .write_all(line.as_bytes())
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            stream
                .get_mut()
                .write_all(b"\n")
                .await
                .map_err(|_| Error::ConnectionClosed)?;

            loop {
                let mut buf = String::new();
                let n = stream
                    .read_line(&mut buf)
                    .await
                    .map_err(|_| Error::ConnectionClosed)?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
                let trimmed = buf.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response: JsonRpcResponse = serde_json::from_str(trimmed)?;
                if response.id_u64() == Some(id) {
                    return response.into_result().map_err(Error::from);
                }
                tracing::debug!(method, "plugin answered with mismatched id, skipping");
            }
        };

        match tokio::time::timeout(timeout, cycle).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded { op: "plugin_call" }),
        }
    }

    pub async fn get_metadata(&self, timeout: Duration) -> Result<PluginMetadata> {
        let value = self.call(methods::GET_METADATA, None, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn configure(&self, config: Value, timeout: Duration) -> Result<()> {
        self.call(methods::CONFIGURE, Some(config), timeout)
            .await
            .map(|_| ())
    }

    pub async fn check_ready(&self, timeout: Duration) -> Result<()> {
        self.call(methods::CHECK_READY, None, timeout).await.map(|_| ())
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.call(methods::SHUTDOWN, None, timeout).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal in-test plugin server answering a fixed set of methods.
    async fn serve_one(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let request: JsonRpcRequest = serde_json::from_str(line.trim()).unwrap();
            let result = match request.method.as_str() {
                methods::GET_METADATA => {
                    serde_json::json!({ "name": "test-plugin", "version": "1.0.0", "commitHash": "abc123" })
                }
                methods::HANDLE_REQUEST => serde_json::json!({ "continue": true }),
                _ => serde_json::json!({}),
            };
            let response = JsonRpcResponse::success(serde_json::json!(request.id), result);
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            reader.get_mut().write_all(out.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn dial_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_one(listener));

        let client = PluginClient::dial(&path, Duration::from_secs(1)).await.unwrap();
        let metadata = client.get_metadata(Duration::from_secs(1)).await.unwrap();
        assert_eq!(metadata.name, "test-plugin");
        assert_eq!(metadata.commit_hash.as_deref(), Some("abc123"));

        let decision: PluginDecision = serde_json::from_value(
            client
                .call(methods::HANDLE_REQUEST, None, Duration::from_secs(1))
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(decision.continue_);
    }

    #[tokio::test]
    async fn dial_retries_until_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");
        let bind_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = UnixListener::bind(&bind_path).unwrap();
            serve_one(listener).await;
        });

        let client = PluginClient::dial(&path, Duration::from_secs(2)).await.unwrap();
        client.check_ready(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn dial_times_out_when_nothing_listens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.sock");
        let err = PluginClient::dial(&path, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn decision_serde_uses_continue_keyword() {
        let decision: PluginDecision =
            serde_json::from_str(r#"{ "continue": false, "reason": "quota" }"#).unwrap();
        assert!(!decision.continue_);
        assert_eq!(decision.reason.as_deref(), Some("quota"));
        let round = serde_json::to_string(&PluginDecision::pass()).unwrap();
        assert!(round.contains("\"continue\":true"));
    }
}
