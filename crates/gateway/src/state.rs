//! Shared application state passed to all control-plane services and API
//! handlers.

use std::sync::Arc;

use mcpv_domain::config::RuntimeConfig;
use mcpv_governance::{Executor, PluginManager};
use mcpv_index::{PromptIndex, ResourceIndex, ToolIndex};
use mcpv_runtime::probe::DiagnosticsProbe;
use mcpv_runtime::{LogHub, MetadataCache, Scheduler};
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogProvider;
use crate::clients::{Activation, ClientRegistry};
use crate::metrics::Metrics;
use crate::reload::ReloadManager;
use crate::router::MetricRouter;
use crate::status::StatusHub;
use crate::subagent::SubAgent;

/// Shared application state.
///
/// Fields are grouped by concern:
/// - **Catalog** — provider, runtime knobs frozen at startup
/// - **Runtime core** — scheduler, metadata cache, diagnostics probe
/// - **Aggregation** — the three indexes
/// - **Governance** — plugin manager and executor
/// - **Clients & routing** — registry, activation, router
/// - **Observability** — metrics, log hub, status hub
#[derive(Clone)]
pub struct AppState {
    // ── Catalog ──────────────────────────────────────────────────────
    pub provider: Arc<CatalogProvider>,
    /// Runtime-wide knobs; not hot-reloadable.
    pub runtime: Arc<RuntimeConfig>,

    // ── Runtime core ─────────────────────────────────────────────────
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<MetadataCache>,
    pub probe: Arc<DiagnosticsProbe>,

    // ── Aggregation ──────────────────────────────────────────────────
    pub tool_index: Arc<ToolIndex>,
    pub resource_index: Arc<ResourceIndex>,
    pub prompt_index: Arc<PromptIndex>,

    // ── Governance ───────────────────────────────────────────────────
    pub plugin_manager: Arc<PluginManager>,
    pub executor: Arc<Executor>,

    // ── Clients & routing ────────────────────────────────────────────
    pub registry: Arc<ClientRegistry>,
    pub activation: Arc<Activation>,
    pub router: Arc<MetricRouter>,
    pub reload: Arc<ReloadManager>,

    // ── Observability ────────────────────────────────────────────────
    pub metrics: Arc<Metrics>,
    pub logs: LogHub,
    pub status: Arc<StatusHub>,
    /// Sub-agent tool filter. `None` when disabled.
    pub subagent: Option<Arc<SubAgent>>,

    /// Application root; cancelling it stops every background loop.
    pub root: CancellationToken,
}
