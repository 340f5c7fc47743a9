//! Streamable-http channel.
//!
//! One logical downstream connection over HTTP: every JSON-RPC message is
//! POSTed to the endpoint, and the response body is either a single JSON
//! message or a short SSE stream carrying several. The channel tracks the
//! `Mcp-Session-Id` the server assigns and injects the reserved
//! `MCP-Protocol-Version` header on every request.

use mcpv_domain::config::{ProxyConfig, ProxyMode, ServerSpec};
use mcpv_domain::{Error, Result};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

/// HTTP channel to one streamable-http downstream.
pub struct HttpChannel {
    client: reqwest::Client,
    endpoint: String,
    user_headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<String>,
}

impl HttpChannel {
    /// Build the channel: resolve the effective proxy (per-spec override
    /// or runtime default) and pre-validate user headers.
    pub fn connect(spec: &ServerSpec, runtime_proxy: &ProxyConfig) -> Result<Self> {
        let endpoint = spec
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config(format!("server {:?} has no endpoint", spec.name)))?;

        let proxy = ProxyConfig::effective(spec.proxy.as_ref(), runtime_proxy);
        let mut builder = reqwest::Client::builder();
        builder = match proxy.mode {
            ProxyMode::Disabled => builder.no_proxy(),
            ProxyMode::CustomUrl => {
                let url = proxy.url.as_deref().ok_or_else(|| {
                    Error::Config("proxy mode custom-url requires a url".into())
                })?;
                builder.proxy(
                    reqwest::Proxy::all(url)
                        .map_err(|e| Error::Config(format!("invalid proxy url: {e}")))?,
                )
            }
            // reqwest honors the environment proxy settings by default.
            ProxyMode::System | ProxyMode::Inherit => builder,
        };

        let mut user_headers = HeaderMap::new();
        for (key, value) in &spec.headers {
            let name: HeaderName = key
                .parse()
                .map_err(|_| Error::Config(format!("invalid header name {key:?}")))?;
            let value: HeaderValue = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid header value for {key:?}")))?;
            user_headers.insert(name, value);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            user_headers,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(mcpv_proto::mcp::STDIO_PROTOCOL_VERSION.to_string()),
        })
    }

    /// Record the protocol version negotiated during initialize; later
    /// requests advertise it.
    pub fn set_protocol_version(&self, version: &str) {
        *self.protocol_version.lock() = version.to_string();
    }

    /// POST one JSON-RPC message and return every JSON-RPC message the
    /// server answered with (0 for notifications, 1+ for calls; SSE
    /// responses may interleave server notifications).
    pub async fn exchange(&self, message: Value) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .headers(self.user_headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .header(PROTOCOL_HEADER, self.protocol_version.lock().clone());
        if let Some(session) = self.session_id.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .json(&message)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Error::Internal(format!(
                "downstream returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Internal(format!("reading downstream body: {e}")))?;

        if content_type.starts_with("text/event-stream") {
            Ok(parse_sse(&body))
        } else if body.trim().is_empty() {
            Ok(Vec::new())
        } else {
            let value: Value = serde_json::from_str(&body)?;
            Ok(vec![value])
        }
    }
}

fn classify_send_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::DeadlineExceeded { op: "http_call" }
    } else if e.is_connect() {
        Error::ConnectionClosed
    } else {
        Error::Internal(format!("http send: {e}"))
    }
}

/// Extract JSON messages from an SSE body (`data:` lines, blank-line
/// delimited events).
fn parse_sse(body: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut data = String::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.is_empty() && !data.is_empty() {
            if let Ok(value) = serde_json::from_str::<Value>(&data) {
                messages.push(value);
            }
            data.clear();
        }
    }
    if !data.is_empty() {
        if let Ok(value) = serde_json::from_str::<Value>(&data) {
            messages.push(value);
        }
    }
    messages
}
