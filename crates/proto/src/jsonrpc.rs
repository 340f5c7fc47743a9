//! JSON-RPC 2.0 types for the MCP protocol.
//!
//! Each message is a single line of JSON (newline-delimited on stdio, one
//! HTTP body for streamable-http). Unlike a plain client, the gateway
//! speaks full duplex: downstream servers send responses, their own
//! requests (sampling/elicitation), and notifications, so incoming lines
//! are classified before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// MCP: the server needs the user to visit a URL before the call can
/// proceed. Must be propagated to the caller, never converted into a
/// tool-result payload.
pub const URL_ELICITATION_REQUIRED: i64 = -32042;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests & notifications
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 request (has an `id` — expects a response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no `id` — fire-and-forget).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// A request initiated by the *downstream server* (sampling, elicitation).
/// The id is kept as raw JSON and echoed back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 response. The `id` stays raw: servers reply with the id
/// as whatever JSON number shape they use, and [`JsonRpcResponse::id_u64`]
/// normalizes it for table matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response echoing a server request's raw id.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response echoing a server request's raw id.
    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Normalize the id to `u64` regardless of JSON number representation
    /// (integers, negative-free int64s, or float-shaped integers).
    pub fn id_u64(&self) -> Option<u64> {
        normalize_id(&self.id)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Extract the result value, returning the error if present.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// Normalize a JSON-RPC id value to `u64`.
pub fn normalize_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else if let Some(i) = n.as_i64() {
                u64::try_from(i).ok()
            } else {
                // Some servers echo ids as floats (e.g. 3.0).
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .map(|f| f as u64)
            }
        }
        _ => None,
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not supported: {method}"))
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

impl From<JsonRpcError> for mcpv_domain::Error {
    fn from(e: JsonRpcError) -> Self {
        mcpv_domain::Error::Protocol {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incoming classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A classified incoming message from a downstream server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Response to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated request (sampling/elicitation); needs a reply.
    Request(ServerRequest),
    /// Server-initiated notification (e.g. `notifications/*/list_changed`).
    Notification(JsonRpcNotification),
}

/// Classify a raw JSON line. Messages with a `method` field are requests
/// (id present) or notifications (id absent); everything else is treated
/// as a response.
pub fn classify(line: &str) -> Result<Incoming, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    let has_method = value.get("method").is_some();
    let has_id = value.get("id").map(|v| !v.is_null()).unwrap_or(false);
    if has_method && has_id {
        serde_json::from_value(value).map(Incoming::Request)
    } else if has_method {
        serde_json::from_value(value).map(Incoming::Notification)
    } else {
        serde_json::from_value(value).map(Incoming::Response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let req = JsonRpcRequest::new(1, "initialize", Some(serde_json::json!({"x": 1})));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
    }

    #[test]
    fn serialize_request_without_params() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn classify_response() {
        let msg = classify(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        match msg {
            Incoming::Response(resp) => assert_eq!(resp.id_u64(), Some(7)),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let msg =
            classify(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#).unwrap();
        match msg {
            Incoming::Notification(n) => {
                assert_eq!(n.method, "notifications/tools/list_changed")
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classify_server_request() {
        let msg = classify(
            r#"{"jsonrpc":"2.0","id":"srv-1","method":"sampling/createMessage","params":{}}"#,
        )
        .unwrap();
        match msg {
            Incoming::Request(req) => {
                assert_eq!(req.method, "sampling/createMessage");
                assert_eq!(req.id, serde_json::json!("srv-1"));
            }
            other => panic!("expected server request, got {other:?}"),
        }
    }

    #[test]
    fn id_normalization_handles_number_shapes() {
        assert_eq!(normalize_id(&serde_json::json!(3)), Some(3));
        assert_eq!(normalize_id(&serde_json::json!(3i64)), Some(3));
        assert_eq!(normalize_id(&serde_json::json!(3.0)), Some(3));
        assert_eq!(normalize_id(&serde_json::json!(3.5)), None);
        assert_eq!(normalize_id(&serde_json::json!(-1)), None);
        assert_eq!(normalize_id(&serde_json::json!("3")), None);
    }

    #[test]
    fn error_response_roundtrip() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32042,"message":"visit url","data":{"url":"https://example.com"}}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.is_error());
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, URL_ELICITATION_REQUIRED);
        let domain: mcpv_domain::Error = err.into();
        match domain {
            mcpv_domain::Error::Protocol { code, .. } => assert_eq!(code, -32042),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failure_echoes_raw_id() {
        let resp = JsonRpcResponse::failure(
            serde_json::json!("abc"),
            JsonRpcError::method_not_found("roots/list"),
        );
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"id\":\"abc\""));
        assert!(json.contains("-32601"));
    }
}
