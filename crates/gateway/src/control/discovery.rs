//! Discovery service: list/watch/call/read/get over the aggregated
//! catalogs, filtered by client visibility and wrapped by governance.

use std::collections::HashSet;

use mcpv_domain::{Error, Result, SpecKey};
use mcpv_governance::GovernanceContext;
use mcpv_index::Snapshot;
use mcpv_proto::mcp::{methods, PromptDef, ResourceDef, ToolDef};
use serde_json::Value;

use crate::clients::ClientRegistry;
use crate::router::{RouteContext, RouteOptions};
use crate::state::AppState;

/// A client's normalized tags; unknown clients are untagged.
pub fn client_tags(state: &AppState, client: &str) -> Vec<String> {
    state.registry.tags_of(client).unwrap_or_default()
}

/// The spec keys the client may see.
pub fn visible_keys(state: &AppState, client: &str) -> HashSet<SpecKey> {
    let catalog = state.provider.snapshot();
    ClientRegistry::visible_keys(&catalog, &client_tags(state, client))
}

// ── Lists ────────────────────────────────────────────────────────────

pub fn list_tools(state: &AppState, client: &str) -> Snapshot<ToolDef> {
    let visible = visible_keys(state, client);
    state
        .tool_index
        .snapshot()
        .filtered(&|key: &SpecKey| visible.contains(key))
}

pub fn list_resources(state: &AppState, client: &str) -> Snapshot<ResourceDef> {
    let visible = visible_keys(state, client);
    state
        .resource_index
        .snapshot()
        .filtered(&|key: &SpecKey| visible.contains(key))
}

pub fn list_prompts(state: &AppState, client: &str) -> Snapshot<PromptDef> {
    let visible = visible_keys(state, client);
    state
        .prompt_index
        .snapshot()
        .filtered(&|key: &SpecKey| visible.contains(key))
}

/// Admin variants: the unfiltered snapshots.
pub fn list_all_tools(state: &AppState) -> Snapshot<ToolDef> {
    (*state.tool_index.snapshot()).clone()
}

pub fn list_all_resources(state: &AppState) -> Snapshot<ResourceDef> {
    (*state.resource_index.snapshot()).clone()
}

pub fn list_all_prompts(state: &AppState) -> Snapshot<PromptDef> {
    (*state.prompt_index.snapshot()).clone()
}

// ── Calls ────────────────────────────────────────────────────────────

/// Resolve a display name against the client's visible world. Entries
/// outside it do not exist as far as the client can tell.
fn resolve_visible<'s, T: serde::Serialize + Clone>(
    snapshot: &'s Snapshot<T>,
    visible: &HashSet<SpecKey>,
    display_name: &str,
    what: &str,
) -> Result<&'s mcpv_index::Entry<T>> {
    let entry = snapshot
        .resolve(display_name)
        .ok_or_else(|| Error::NotFound(format!("{what} {display_name:?}")))?;
    if !visible.contains(&entry.spec_key) {
        return Err(Error::NotFound(format!("{what} {display_name:?}")));
    }
    Ok(entry)
}

/// `CallTool`: visibility, governance (both phases), route.
pub async fn call_tool(
    state: &AppState,
    client: &str,
    display_name: &str,
    arguments: Value,
    routing_key: Option<String>,
) -> Result<Value> {
    let visible = visible_keys(state, client);
    let snapshot = state.tool_index.snapshot();
    let entry = resolve_visible(&snapshot, &visible, display_name, "tool")?;
    let spec_key = entry.spec_key.clone();
    let native_name = entry.def.name.clone();

    let request = serde_json::json!({
        "name": native_name,
        "arguments": arguments,
    });
    governed_call(
        state,
        client,
        &spec_key,
        methods::TOOLS_CALL,
        request,
        routing_key,
    )
    .await
}

/// `ReadResource`: same shape, resources are addressed by URI.
pub async fn read_resource(
    state: &AppState,
    client: &str,
    uri: &str,
    routing_key: Option<String>,
) -> Result<Value> {
    let visible = visible_keys(state, client);
    let snapshot = state.resource_index.snapshot();
    let entry = resolve_visible(&snapshot, &visible, uri, "resource")?;
    let spec_key = entry.spec_key.clone();

    let request = serde_json::json!({ "uri": entry.def.uri });
    governed_call(
        state,
        client,
        &spec_key,
        methods::RESOURCES_READ,
        request,
        routing_key,
    )
    .await
}

/// `GetPrompt`.
pub async fn get_prompt(
    state: &AppState,
    client: &str,
    name: &str,
    arguments: Value,
    routing_key: Option<String>,
) -> Result<Value> {
    let visible = visible_keys(state, client);
    let snapshot = state.prompt_index.snapshot();
    let entry = resolve_visible(&snapshot, &visible, name, "prompt")?;
    let spec_key = entry.spec_key.clone();

    let request = serde_json::json!({
        "name": entry.def.name,
        "arguments": arguments,
    });
    governed_call(
        state,
        client,
        &spec_key,
        methods::PROMPTS_GET,
        request,
        routing_key,
    )
    .await
}

/// Governance request phase → route → governance response phase.
async fn governed_call(
    state: &AppState,
    client: &str,
    spec_key: &SpecKey,
    method: &'static str,
    request: Value,
    routing_key: Option<String>,
) -> Result<Value> {
    let route_ctx = RouteContext {
        client: Some(client.to_string()),
        profile: None,
    };
    let gov_ctx = GovernanceContext {
        client: Some(client.to_string()),
        profile: None,
        method: method.to_string(),
        server: Some(spec_key.short().to_string()),
    };
    let router = state.router.clone();
    let opts = RouteOptions::allow_start(routing_key);

    state
        .executor
        .execute(&gov_ctx, request, |governed| async move {
            router
                .route(&route_ctx, spec_key, method, Some(governed), &opts)
                .await
                .map_err(|e| e.into_error())
        })
        .await
}
