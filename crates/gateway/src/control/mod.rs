//! Control-plane services: discovery, observability, automation, and the
//! client registry operations. The API layer is a thin mapping onto
//! these functions; everything here works on [`AppState`].

pub mod discovery;
pub mod observability;

use serde::Serialize;

use crate::clients::ClientRegistry;
use crate::state::AppState;

/// Response to `RegisterClient`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub tags: Vec<String>,
    pub visible_server_count: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Register (or re-register) a client and recompute activation.
pub async fn register_client(
    state: &AppState,
    name: &str,
    pid: u32,
    tags: &[String],
) -> RegisterResponse {
    let normalized = state.registry.register(name, pid, tags);
    let catalog = state.provider.snapshot();
    state
        .activation
        .recompute(&catalog, &state.registry, "client_registered")
        .await;
    let visible = ClientRegistry::visible_keys(&catalog, &normalized);
    RegisterResponse {
        tags: normalized,
        visible_server_count: visible.len(),
    }
}

pub fn heartbeat(state: &AppState, name: &str) -> mcpv_domain::Result<()> {
    if state.registry.heartbeat(name) {
        Ok(())
    } else {
        Err(mcpv_domain::Error::NotFound(format!("client {name:?}")))
    }
}

pub async fn unregister_client(state: &AppState, name: &str) {
    if state.registry.unregister(name) {
        let catalog = state.provider.snapshot();
        state
            .activation
            .recompute(&catalog, &state.registry, "client_unregistered")
            .await;
    }
}

/// One pass of the client reaper: evict dead clients, then recompute
/// activation so orphaned specs quiesce.
pub async fn reap_clients(state: &AppState) {
    let inactive = std::time::Duration::from_secs(state.runtime.client_inactive_seconds);
    let evicted = state.registry.reap(inactive);
    if !evicted.is_empty() {
        let catalog = state.provider.snapshot();
        state
            .activation
            .recompute(&catalog, &state.registry, "client_evicted")
            .await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `ReloadConfig`: shadow load, transactional apply, publish.
pub async fn reload_config(state: &AppState) -> mcpv_domain::Result<String> {
    let previous = state.provider.snapshot();
    let (candidate, diff) = state.provider.shadow_load()?;
    if diff.is_empty() {
        return Ok(diff.summary());
    }
    state
        .reload
        .apply(&candidate, &previous, &diff, state.runtime.reload_mode)
        .await?;
    let summary = diff.summary();
    state.provider.publish(candidate, diff, "reload_rpc");
    Ok(summary)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Automation (sub-agent)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pick the tool subset for a request. Without an applicable sub-agent
/// the full visible set is returned.
pub async fn filter_tools_for_request(
    state: &AppState,
    client: &str,
    request: &str,
) -> Vec<String> {
    let tools = discovery::list_tools(state, client);
    let names: Vec<String> = tools
        .entries
        .iter()
        .map(|e| e.display_name.clone())
        .collect();

    let Some(subagent) = &state.subagent else {
        return names;
    };
    let tags = state.registry.tags_of(client).unwrap_or_default();
    if !subagent.config().enabled_for(&tags) {
        return names;
    }
    subagent.filter_tools(request, &names).await
}
