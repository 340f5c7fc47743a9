//! Pipeline engine — ordered category execution over request/response
//! JSON.
//!
//! Categories run in the fixed order
//! `observability → authentication → authorization → rate_limiting →
//! validation → content → audit`. Observability plugins run in parallel
//! and can neither reject nor mutate; every other category runs its
//! plugins sequentially in declaration order, where the first
//! `continue=false` short-circuits the category (required plugins
//! propagate the rejection, optional ones demote it to a log). Content
//! mutations replace the working buffer for the rest of the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use mcpv_domain::config::{PluginCategory, PluginFlow};
use mcpv_domain::{Error, Result};
use serde_json::Value;

use crate::rpc::PluginDecision;

/// Request metadata handed to every plugin call.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GovernanceContext {
    pub client: Option<String>,
    pub profile: Option<String>,
    pub method: String,
    pub server: Option<String>,
}

/// One pluggable governance handler. Out-of-process plugins implement
/// this over their socket RPC; tests use in-process fakes.
#[async_trait]
pub trait GovernancePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> PluginCategory;
    fn required(&self) -> bool;
    fn handles(&self, flow: PluginFlow) -> bool;
    /// Unhealthy plugins are skipped (optional plugins that failed
    /// configure/ready).
    fn healthy(&self) -> bool {
        true
    }
    async fn handle(
        &self,
        flow: PluginFlow,
        payload: &Value,
        ctx: &GovernanceContext,
    ) -> Result<PluginDecision>;
}

/// Category-ordered pipeline over a plugin list (declaration order).
#[derive(Default)]
pub struct Pipeline {
    plugins: Vec<Arc<dyn GovernancePlugin>>,
}

impl Pipeline {
    pub fn new(plugins: Vec<Arc<dyn GovernancePlugin>>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run one phase (request or response) over the payload. Returns the
    /// possibly-mutated payload, or the first propagated rejection.
    pub async fn run(
        &self,
        flow: PluginFlow,
        payload: Value,
        ctx: &GovernanceContext,
    ) -> Result<Value> {
        let mut current = payload;

        for category in PluginCategory::ORDER {
            let members: Vec<Arc<dyn GovernancePlugin>> = self
                .plugins
                .iter()
                .filter(|p| p.category() == category && p.handles(flow) && p.healthy())
                .cloned()
                .collect();
            if members.is_empty() {
                continue;
            }

            if category == PluginCategory::Observability {
                self.run_observability(&members, flow, &current, ctx).await;
                continue;
            }

            for plugin in members {
                let decision = call_isolated(plugin.clone(), flow, current.clone(), ctx.clone())
                    .await;
                match decision {
                    Ok(decision) => {
                        if !decision.continue_ {
                            let reason = decision
                                .reason
                                .unwrap_or_else(|| "rejected".to_string());
                            if plugin.required() {
                                return Err(Error::Rejected {
                                    plugin: plugin.name().to_string(),
                                    reason,
                                });
                            }
                            tracing::warn!(
                                plugin = plugin.name(),
                                category = ?category,
                                reason = %reason,
                                "reason=optional_rejected"
                            );
                            // Short-circuit the category, keep the pipeline.
                            break;
                        }
                        if category == PluginCategory::Content {
                            if let Some(mutated) = decision.payload {
                                current = mutated;
                            }
                        }
                    }
                    Err(e) => {
                        if plugin.required() {
                            return Err(Error::Internal(format!(
                                "required plugin {} failed: {e}",
                                plugin.name()
                            )));
                        }
                        tracing::warn!(
                            plugin = plugin.name(),
                            category = ?category,
                            error = %e,
                            "optional plugin failed, continuing"
                        );
                    }
                }
            }
        }

        Ok(current)
    }

    /// Observability runs all members concurrently; their decisions
    /// cannot reject and their mutations are ignored.
    async fn run_observability(
        &self,
        members: &[Arc<dyn GovernancePlugin>],
        flow: PluginFlow,
        payload: &Value,
        ctx: &GovernanceContext,
    ) {
        let calls = members.iter().map(|plugin| {
            call_isolated(plugin.clone(), flow, payload.clone(), ctx.clone())
        });
        for (plugin, result) in members.iter().zip(join_all(calls).await) {
            if let Err(e) = result {
                tracing::warn!(plugin = plugin.name(), error = %e, "observability plugin failed");
            }
        }
    }
}

/// Run one plugin call on its own task so a panicking plugin adapter
/// cannot take the request down with it.
async fn call_isolated(
    plugin: Arc<dyn GovernancePlugin>,
    flow: PluginFlow,
    payload: Value,
    ctx: GovernanceContext,
) -> Result<PluginDecision> {
    let handle =
        tokio::spawn(async move { plugin.handle(flow, &payload, &ctx).await });
    match handle.await {
        Ok(result) => result,
        Err(join) => Err(Error::Internal(format!("plugin call panicked: {join}"))),
    }
}
