//! WebSocket watch streams.
//!
//! Every watcher sends the current (filtered) value immediately, then
//! re-emits on change. Snapshot watchers also re-emit when the
//! visibility revision bumps (tag-only catalog changes), so a client's
//! filtered view tracks both content and visibility. `watch` channels
//! give slow consumers the coalesced-latest value in publication order.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use mcpv_runtime::LogLevel;
use serde::Deserialize;
use serde_json::json;

use super::ClientQuery;
use crate::clients::ClientEvent;
use crate::control::{discovery, observability};
use crate::state::AppState;

async fn send_json(socket: &mut WebSocket, value: &impl serde::Serialize) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    }
}

/// Shared loop for the three snapshot watchers.
macro_rules! snapshot_watcher {
    ($name:ident, $subscribe:ident, $filtered:ident) => {
        pub async fn $name(
            State(state): State<AppState>,
            Query(query): Query<ClientQuery>,
            upgrade: WebSocketUpgrade,
        ) -> Response {
            upgrade.on_upgrade(move |mut socket| async move {
                let mut snapshots = state.$subscribe.subscribe();
                let mut visibility = state.registry.subscribe_visibility();
                loop {
                    let filtered = discovery::$filtered(&state, &query.client);
                    if !send_json(&mut socket, &filtered).await {
                        return;
                    }
                    tokio::select! {
                        changed = snapshots.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        changed = visibility.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = state.root.cancelled() => return,
                    }
                }
            })
        }
    };
}

snapshot_watcher!(tools, tool_index, list_tools);
snapshot_watcher!(resources, resource_index, list_resources);
snapshot_watcher!(prompts, prompt_index, list_prompts);

/// `WatchActiveClients`: current list, then the event feed.
pub async fn clients(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |mut socket| async move {
        let mut events = state.registry.subscribe();
        if !send_json(&mut socket, &json!({ "clients": state.registry.list() })).await {
            return;
        }
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        let kind = match &event {
                            ClientEvent::Registered(_) => "registered",
                            ClientEvent::Unregistered(_) => "unregistered",
                            ClientEvent::Evicted(_) => "evicted",
                        };
                        let name = match &event {
                            ClientEvent::Registered(n)
                            | ClientEvent::Unregistered(n)
                            | ClientEvent::Evicted(n) => n.clone(),
                        };
                        let payload = json!({
                            "event": kind,
                            "name": name,
                            "clients": state.registry.list(),
                        });
                        if !send_json(&mut socket, &payload).await {
                            return;
                        }
                    }
                    Err(_) => return,
                },
                _ = state.root.cancelled() => return,
            }
        }
    })
}

#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub client: String,
    #[serde(default, alias = "minLevel")]
    pub min_level: Option<String>,
}

async fn stream_logs_filtered(state: AppState, mut socket: WebSocket, query: LogQuery, admin: bool) {
    let min_level = query
        .min_level
        .as_deref()
        .and_then(LogLevel::parse)
        .unwrap_or(LogLevel::Info);
    let visible = (!admin).then(|| discovery::visible_keys(&state, &query.client));
    let mut records = state.logs.subscribe();
    loop {
        tokio::select! {
            record = records.recv() => match record {
                Ok(record) => {
                    if !observability::log_filter(&record, min_level, visible.as_ref()) {
                        continue;
                    }
                    if !send_json(&mut socket, &*record).await {
                        return;
                    }
                }
                // Lossy stream: lagging drops records, never blocks.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
            _ = state.root.cancelled() => return,
        }
    }
}

/// `StreamLogs`: level + visibility filtered.
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| stream_logs_filtered(state, socket, query, false))
}

/// Admin variant: unfiltered by visibility.
pub async fn admin_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| stream_logs_filtered(state, socket, query, true))
}

/// `WatchRuntimeStatus`.
pub async fn runtime_status(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |mut socket| async move {
        let mut statuses = state.status.watch_runtime();
        loop {
            let visible = discovery::visible_keys(&state, &query.client);
            let rows = observability::runtime_status(&state, Some(&visible));
            if !send_json(&mut socket, &json!({ "servers": rows })).await {
                return;
            }
            tokio::select! {
                changed = statuses.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = state.root.cancelled() => return,
            }
        }
    })
}

/// `WatchServerInitStatus`.
pub async fn init_status(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |mut socket| async move {
        let mut statuses = state.status.watch_init();
        loop {
            let visible = discovery::visible_keys(&state, &query.client);
            let rows = observability::init_status(&state, Some(&visible));
            if !send_json(&mut socket, &json!({ "servers": rows })).await {
                return;
            }
            tokio::select! {
                changed = statuses.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = state.root.cancelled() => return,
            }
        }
    })
}
