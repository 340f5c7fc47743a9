//! Startup bootstrap — hydrate the metadata cache before the indexes
//! serve their first snapshot.
//!
//! In `metadata` mode each spec is started once (scheduler `acquire`),
//! its three catalogs are listed and written to the cache, and the
//! instance is released so idle reaping can quiesce the pool again.
//! In `disabled` mode nothing is prefetched and indexes serve empty
//! until the first caller wakes a downstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use mcpv_domain::config::{BootstrapMode, ServerSpec};
use mcpv_domain::{Error, SpecKey};
use mcpv_proto::mcp::methods;
use mcpv_runtime::probe::{steps, DiagnosticsProbe, Phase};
use mcpv_runtime::{MetadataCache, Scheduler};

/// Bootstrap tuning taken from the runtime config.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapSettings {
    pub mode: BootstrapMode,
    pub concurrency: usize,
    pub timeout: Duration,
}

/// Outcome summary, mostly for startup logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Run the bootstrap preflight over every enabled spec.
pub async fn run(
    scheduler: &Arc<Scheduler>,
    cache: &Arc<MetadataCache>,
    probe: &Arc<DiagnosticsProbe>,
    specs: &HashMap<SpecKey, Arc<ServerSpec>>,
    settings: BootstrapSettings,
) -> BootstrapReport {
    if settings.mode == BootstrapMode::Disabled {
        tracing::info!("bootstrap disabled, indexes start empty");
        return BootstrapReport {
            skipped: specs.len(),
            ..Default::default()
        };
    }

    let targets: Vec<(SpecKey, Arc<ServerSpec>)> = specs
        .iter()
        .filter(|(_, s)| !s.disabled)
        .map(|(k, s)| (k.clone(), s.clone()))
        .collect();
    let skipped = specs.len() - targets.len();

    let results: Vec<bool> = futures_util::stream::iter(targets)
        .map(|(spec_key, spec)| async move {
            let result = tokio::time::timeout(
                settings.timeout,
                bootstrap_spec(scheduler, cache, &spec_key, &spec),
            )
            .await
            .unwrap_or(Err(Error::DeadlineExceeded { op: "bootstrap" }));

            match result {
                Ok(()) => {
                    probe.record(
                        &spec_key,
                        &spec.name,
                        "bootstrap",
                        steps::SNAPSHOT_DONE,
                        Phase::Exit,
                        None,
                        None,
                        None,
                    );
                    true
                }
                Err(e) => {
                    probe.record(
                        &spec_key,
                        &spec.name,
                        "bootstrap",
                        steps::SNAPSHOT_DONE,
                        Phase::Error,
                        None,
                        Some(&e.to_string()),
                        None,
                    );
                    tracing::warn!(
                        server = %spec.name,
                        spec_key = %spec_key.short(),
                        error = %e,
                        "bootstrap fetch failed"
                    );
                    false
                }
            }
        })
        .buffer_unordered(settings.concurrency.max(1))
        .collect()
        .await;

    let succeeded = results.iter().filter(|ok| **ok).count();
    let report = BootstrapReport {
        succeeded,
        failed: results.len() - succeeded,
        skipped,
    };
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "bootstrap complete"
    );
    report
}

/// Bootstrap one spec: acquire, list all three catalogs, cache, release.
async fn bootstrap_spec(
    scheduler: &Arc<Scheduler>,
    cache: &Arc<MetadataCache>,
    spec_key: &SpecKey,
    spec: &Arc<ServerSpec>,
) -> mcpv_domain::Result<()> {
    let instance = scheduler.acquire(spec_key, None).await?;
    let result = async {
        let tools = instance.conn.call(methods::TOOLS_LIST, None).await?;
        let parsed: mcpv_proto::mcp::ToolsListResult = serde_json::from_value(tools)?;
        cache.upsert_tools(spec_key, parsed.tools);

        // Servers without resource/prompt capability answer with
        // method-not-found; an empty set is recorded either way.
        match instance.conn.call(methods::RESOURCES_LIST, None).await {
            Ok(value) => {
                let parsed: mcpv_proto::mcp::ResourcesListResult =
                    serde_json::from_value(value)?;
                cache.upsert_resources(spec_key, parsed.resources);
            }
            Err(Error::Protocol { .. }) => cache.upsert_resources(spec_key, Vec::new()),
            Err(e) => return Err(e),
        }
        match instance.conn.call(methods::PROMPTS_LIST, None).await {
            Ok(value) => {
                let parsed: mcpv_proto::mcp::PromptsListResult = serde_json::from_value(value)?;
                cache.upsert_prompts(spec_key, parsed.prompts);
            }
            Err(Error::Protocol { .. }) => cache.upsert_prompts(spec_key, Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(())
    }
    .await;
    // Release even on failure so idle reap can clean up.
    scheduler.release(&instance);
    tracing::debug!(server = %spec.name, "bootstrap fetch finished");
    result
}
