//! HTTP/WS surface of the control plane.
//!
//! Every handler is a thin wrapper over the control-plane services; the
//! single [`ApiError`] mapper translates the domain error taxonomy into
//! HTTP statuses, so no handler invents status codes of its own.

mod watch;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Json;
use mcpv_domain::{Error, ErrorCode};
use mcpv_runtime::probe::ExportMode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::control::{self, discovery, observability};
use crate::state::AppState;

/// Build the axum router over the shared state.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        // ── Registry ─────────────────────────────────────────────────
        .route("/v1/clients/register", post(register_client))
        .route("/v1/clients/heartbeat", post(heartbeat))
        .route("/v1/clients/unregister", post(unregister_client))
        .route("/v1/clients", get(list_clients))
        .route("/v1/clients/watch", get(watch::clients))
        // ── Discovery ────────────────────────────────────────────────
        .route("/v1/tools", get(list_tools))
        .route("/v1/tools/watch", get(watch::tools))
        .route("/v1/tools/call", post(call_tool))
        .route("/v1/resources", get(list_resources))
        .route("/v1/resources/watch", get(watch::resources))
        .route("/v1/resources/read", post(read_resource))
        .route("/v1/prompts", get(list_prompts))
        .route("/v1/prompts/watch", get(watch::prompts))
        .route("/v1/prompts/get", post(get_prompt))
        // ── Observability ────────────────────────────────────────────
        .route("/v1/logs/stream", get(watch::logs))
        .route("/v1/status/runtime", get(runtime_status))
        .route("/v1/status/runtime/watch", get(watch::runtime_status))
        .route("/v1/status/init", get(init_status))
        .route("/v1/status/init/watch", get(watch::init_status))
        // ── Automation ───────────────────────────────────────────────
        .route("/v1/automation/filter-tools", post(filter_tools))
        // ── Admin ────────────────────────────────────────────────────
        .route("/v1/admin/tools", get(admin_tools))
        .route("/v1/admin/resources", get(admin_resources))
        .route("/v1/admin/prompts", get(admin_prompts))
        .route("/v1/admin/status", get(admin_status))
        .route("/v1/admin/export", get(admin_export))
        .route("/v1/admin/logs/stream", get(watch::admin_logs))
        .route("/v1/reload", post(reload))
        // ── Reserved task surface ────────────────────────────────────
        .route("/v1/tasks", any(tasks_unimplemented))
        .route("/v1/tasks/*rest", any(tasks_unimplemented))
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The one place domain errors become HTTP responses.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

fn http_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::FailedPrecondition => StatusCode::CONFLICT,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Canceled => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::NotImplemented => StatusCode::NOT_IMPLEMENTED,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let mut body = json!({
            "code": code.to_string(),
            "message": self.0.to_string(),
        });
        // JSON-RPC protocol errors (notably -32042) keep their code and
        // data so clients can act on them.
        if let Error::Protocol {
            code: rpc_code,
            data,
            ..
        } = &self.0
        {
            body["jsonrpcCode"] = json!(rpc_code);
            if let Some(data) = data {
                body["data"] = data.clone();
            }
        }
        (http_status(code), Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct RegisterBody {
    name: String,
    pid: u32,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

#[derive(Deserialize)]
pub(crate) struct ClientQuery {
    #[serde(default)]
    pub client: String,
}

#[derive(Deserialize)]
struct CallBody {
    #[serde(default)]
    client: String,
    name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default, alias = "routingKey")]
    routing_key: Option<String>,
}

#[derive(Deserialize)]
struct ReadBody {
    #[serde(default)]
    client: String,
    uri: String,
    #[serde(default, alias = "routingKey")]
    routing_key: Option<String>,
}

#[derive(Deserialize)]
struct FilterBody {
    #[serde(default)]
    client: String,
    request: String,
}

#[derive(Deserialize)]
struct ExportQuery {
    #[serde(default)]
    mode: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn register_client(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<Json<control::RegisterResponse>> {
    if body.name.trim().is_empty() {
        return Err(Error::InvalidArgument("client name must not be empty".into()).into());
    }
    Ok(Json(
        control::register_client(&state, &body.name, body.pid, &body.tags).await,
    ))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(body): Json<NameBody>,
) -> ApiResult<StatusCode> {
    control::heartbeat(&state, &body.name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unregister_client(
    State(state): State<AppState>,
    Json(body): Json<NameBody>,
) -> StatusCode {
    control::unregister_client(&state, &body.name).await;
    StatusCode::NO_CONTENT
}

async fn list_clients(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "clients": state.registry.list() }))
}

async fn list_tools(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
) -> Json<Value> {
    let snapshot = discovery::list_tools(&state, &query.client);
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

async fn list_resources(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
) -> Json<Value> {
    let snapshot = discovery::list_resources(&state, &query.client);
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

async fn list_prompts(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
) -> Json<Value> {
    let snapshot = discovery::list_prompts(&state, &query.client);
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

async fn call_tool(
    State(state): State<AppState>,
    Json(body): Json<CallBody>,
) -> ApiResult<Json<Value>> {
    let result = discovery::call_tool(
        &state,
        &body.client,
        &body.name,
        body.arguments,
        body.routing_key,
    )
    .await?;
    Ok(Json(result))
}

async fn read_resource(
    State(state): State<AppState>,
    Json(body): Json<ReadBody>,
) -> ApiResult<Json<Value>> {
    let result =
        discovery::read_resource(&state, &body.client, &body.uri, body.routing_key).await?;
    Ok(Json(result))
}

async fn get_prompt(
    State(state): State<AppState>,
    Json(body): Json<CallBody>,
) -> ApiResult<Json<Value>> {
    let result = discovery::get_prompt(
        &state,
        &body.client,
        &body.name,
        body.arguments,
        body.routing_key,
    )
    .await?;
    Ok(Json(result))
}

async fn runtime_status(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
) -> Json<Value> {
    let visible = discovery::visible_keys(&state, &query.client);
    Json(json!({ "servers": observability::runtime_status(&state, Some(&visible)) }))
}

async fn init_status(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
) -> Json<Value> {
    let visible = discovery::visible_keys(&state, &query.client);
    Json(json!({ "servers": observability::init_status(&state, Some(&visible)) }))
}

async fn filter_tools(
    State(state): State<AppState>,
    Json(body): Json<FilterBody>,
) -> Json<Value> {
    let tools = control::filter_tools_for_request(&state, &body.client, &body.request).await;
    Json(json!({ "tools": tools }))
}

async fn admin_tools(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(discovery::list_all_tools(&state)).unwrap_or_default())
}

async fn admin_resources(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(discovery::list_all_resources(&state)).unwrap_or_default())
}

async fn admin_prompts(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(discovery::list_all_prompts(&state)).unwrap_or_default())
}

async fn admin_status(State(state): State<AppState>) -> Json<Value> {
    state.status.refresh();
    Json(json!({
        "catalog": state.provider.snapshot().summary,
        "revision": state.provider.snapshot().revision,
        "servers": observability::runtime_status(&state, None),
        "init": observability::init_status(&state, None),
        "plugins": state
            .plugin_manager
            .statuses()
            .into_iter()
            .map(|(name, healthy)| json!({ "name": name, "healthy": healthy }))
            .collect::<Vec<_>>(),
        "clients": state.registry.len(),
    }))
}

async fn admin_export(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Json<Value>> {
    let mode = match query.mode.as_deref() {
        None | Some("safe") => ExportMode::Safe,
        Some("raw") => ExportMode::Raw,
        Some(other) => {
            return Err(Error::InvalidArgument(format!("unknown export mode {other:?}")).into())
        }
    };
    let bundle = observability::export_bundle(&state, mode);
    Ok(Json(serde_json::to_value(&bundle).unwrap_or_default()))
}

async fn reload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let summary = control::reload_config(&state).await?;
    Ok(Json(json!({ "diffSummary": summary })))
}

/// Task RPCs are reserved; calling them reports NOT_IMPLEMENTED rather
/// than silently succeeding.
async fn tasks_unimplemented() -> ApiError {
    ApiError(Error::NotImplemented("task RPCs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert_eq!(http_status(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            http_status(ErrorCode::Unavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            http_status(ErrorCode::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            http_status(ErrorCode::NotImplemented),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            http_status(ErrorCode::PermissionDenied),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn protocol_error_body_keeps_jsonrpc_code() {
        let err = ApiError(Error::Protocol {
            code: -32042,
            message: "visit url".into(),
            data: Some(json!({ "url": "https://example.com/auth" })),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["jsonrpcCode"], -32042);
        assert_eq!(body["data"]["url"], "https://example.com/auth");
    }

    #[tokio::test]
    async fn sentinel_errors_map_to_503() {
        let response = ApiError(Error::NoCapacity).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
