//! Reload manager — applies an accepted catalog candidate
//! transactionally across the runtime.
//!
//! Steps run in a fixed order (runtime guard, plugins, scheduler,
//! indexes, activation, visibility); each carries a rollback, and a
//! failure unwinds the already-applied steps in reverse so the running
//! state ends equal to the pre-update state. Only after every step
//! succeeds is the candidate published. Tag-only changes bump the
//! visibility revision and are never allowed to ripple into pool churn.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mcpv_domain::config::{ReloadMode, ServerSpec};
use mcpv_domain::{Error, Result, SpecKey};
use mcpv_governance::{Executor, PluginManager};
use mcpv_index::{PromptIndex, ResourceIndex, ToolIndex};
use mcpv_runtime::scheduler::SpecChanges;
use mcpv_runtime::{MetadataCache, Scheduler};

use crate::catalog::{CatalogDiff, CatalogState};
use crate::clients::{Activation, ClientRegistry};

/// One transactional step.
struct Step<'a> {
    name: &'static str,
    apply: BoxFuture<'a, Result<()>>,
    rollback: BoxFuture<'a, ()>,
}

pub struct ReloadManager {
    scheduler: Arc<Scheduler>,
    plugin_manager: Arc<PluginManager>,
    executor: Arc<Executor>,
    tool_index: Arc<ToolIndex>,
    resource_index: Arc<ResourceIndex>,
    prompt_index: Arc<PromptIndex>,
    cache: Arc<MetadataCache>,
    registry: Arc<ClientRegistry>,
    activation: Arc<Activation>,
}

impl ReloadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<Scheduler>,
        plugin_manager: Arc<PluginManager>,
        executor: Arc<Executor>,
        tool_index: Arc<ToolIndex>,
        resource_index: Arc<ResourceIndex>,
        prompt_index: Arc<PromptIndex>,
        cache: Arc<MetadataCache>,
        registry: Arc<ClientRegistry>,
        activation: Arc<Activation>,
    ) -> ReloadManager {
        ReloadManager {
            scheduler,
            plugin_manager,
            executor,
            tool_index,
            resource_index,
            prompt_index,
            cache,
            registry,
            activation,
        }
    }

    /// Apply a shadow-loaded candidate. On success the caller publishes
    /// it; on failure the running state is unchanged.
    pub async fn apply(
        &self,
        candidate: &Arc<CatalogState>,
        previous: &Arc<CatalogState>,
        diff: &CatalogDiff,
        mode: ReloadMode,
    ) -> Result<()> {
        // Step 1 — runtime guard. Runtime-wide fields are not
        // hot-reloadable; strict mode rejects the whole update.
        if diff.runtime_changed {
            match mode {
                ReloadMode::Strict => {
                    return Err(Error::FailedPrecondition {
                        op: "reload",
                        message: "runtime-wide fields changed; restart required (reloadMode=strict)"
                            .into(),
                    });
                }
                ReloadMode::Lenient => {
                    tracing::warn!(
                        "runtime-wide fields changed; applying the non-disruptive subset \
                         (new runtime values take effect on restart)"
                    );
                }
            }
        }

        let changes = spec_changes(diff);
        let inverse = inverse_changes(diff);
        let plugin_changed = !diff.plugins_added.is_empty()
            || !diff.plugins_removed.is_empty()
            || !diff.plugins_updated.is_empty();

        let mut steps: Vec<Step<'_>> = Vec::new();

        if plugin_changed {
            steps.push(Step {
                name: "plugins",
                apply: async {
                    self.plugin_manager
                        .apply_changes(&candidate.catalog.plugins)
                        .await?;
                    self.executor.replace_pipeline(self.plugin_manager.pipeline());
                    Ok(())
                }
                .boxed(),
                rollback: async {
                    if let Err(e) = self
                        .plugin_manager
                        .apply_changes(&previous.catalog.plugins)
                        .await
                    {
                        tracing::error!(error = %e, "plugin rollback failed");
                    }
                    self.executor.replace_pipeline(self.plugin_manager.pipeline());
                }
                .boxed(),
            });
        }

        steps.push(Step {
            name: "scheduler",
            apply: async {
                self.scheduler
                    .apply_spec_changes(&changes, &candidate.spec_registry)
                    .await;
                Ok(())
            }
            .boxed(),
            rollback: async {
                self.scheduler
                    .apply_spec_changes(&inverse, &previous.spec_registry)
                    .await;
            }
            .boxed(),
        });

        steps.push(Step {
            name: "indexes",
            apply: async {
                self.update_indexes(candidate);
                Ok(())
            }
            .boxed(),
            rollback: async {
                self.update_indexes(previous);
            }
            .boxed(),
        });

        steps.push(Step {
            name: "activation",
            apply: async {
                self.activation
                    .recompute(candidate, &self.registry, "reload")
                    .await;
                Ok(())
            }
            .boxed(),
            rollback: async {
                self.activation
                    .recompute(previous, &self.registry, "reload_rollback")
                    .await;
            }
            .boxed(),
        });

        if diff.tags_changed {
            steps.push(Step {
                name: "visibility",
                apply: async {
                    self.registry.bump_visibility();
                    Ok(())
                }
                .boxed(),
                // Watchers re-emit on every bump; bumping again restores
                // the old filtered views.
                rollback: async {
                    self.registry.bump_visibility();
                }
                .boxed(),
            });
        }

        let mut rollbacks: Vec<(&'static str, BoxFuture<'_, ()>)> = Vec::new();
        for step in steps {
            tracing::debug!(step = step.name, "reload step");
            match step.apply.await {
                Ok(()) => rollbacks.push((step.name, step.rollback)),
                Err(e) => {
                    tracing::error!(step = step.name, error = %e, "reload step failed, unwinding");
                    for (name, rollback) in rollbacks.into_iter().rev() {
                        tracing::debug!(step = name, "reload rollback");
                        rollback.await;
                    }
                    return Err(e);
                }
            }
        }

        // Post-commit cleanup: evict cache entries for specs that left
        // the catalog (not part of the transaction; a rollback must not
        // lose cache state).
        let keep: HashSet<SpecKey> = candidate.spec_registry.keys().cloned().collect();
        self.cache.retain_specs(&keep);

        Ok(())
    }

    fn update_indexes(&self, state: &Arc<CatalogState>) {
        let specs: HashMap<SpecKey, Arc<ServerSpec>> = state
            .spec_registry
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let namespace = state.catalog.runtime.tool_namespace_strategy;
        let expose = state.catalog.runtime.expose_tools.clone();
        self.tool_index
            .update_specs(specs.clone(), namespace, expose.clone());
        self.resource_index
            .update_specs(specs.clone(), namespace, expose.clone());
        self.prompt_index.update_specs(specs, namespace, expose);
        self.tool_index.rebuild_and_publish();
        self.resource_index.rebuild_and_publish();
        self.prompt_index.rebuild_and_publish();
    }
}

/// Forward spec changes from a diff.
pub fn spec_changes(diff: &CatalogDiff) -> SpecChanges {
    SpecChanges {
        added: diff.added.clone(),
        removed: diff.removed.clone(),
        replaced: diff.replaced.clone(),
        updated: diff.updated.clone(),
    }
}

/// The inverse, for rollback: adds become removals, replacements flip.
pub fn inverse_changes(diff: &CatalogDiff) -> SpecChanges {
    SpecChanges {
        added: diff.removed.clone(),
        removed: diff.added.clone(),
        replaced: diff.replaced.iter().map(|(a, b)| (b.clone(), a.clone())).collect(),
        updated: diff.updated.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use async_trait::async_trait;
    use mcpv_domain::config::Config;
    use mcpv_index::ListFetcher;
    use mcpv_runtime::probe::DiagnosticsProbe;
    use mcpv_runtime::scheduler::NoopSchedulerMetrics;
    use mcpv_runtime::{Instance, InstanceFactory};
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    struct NeverFetch;

    #[async_trait]
    impl ListFetcher for NeverFetch {
        async fn fetch(&self, _spec_key: &SpecKey, _method: &'static str) -> Result<Value> {
            Err(Error::NoReadyInstance)
        }
    }

    struct NeverFactory;

    #[async_trait]
    impl InstanceFactory for NeverFactory {
        async fn start_instance(
            &self,
            _spec_key: &SpecKey,
            _spec: Arc<ServerSpec>,
        ) -> Result<Arc<Instance>> {
            Err(Error::Internal("unused".into()))
        }
        async fn stop_instance(&self, _instance: &Instance, _reason: &str) {}
    }

    fn state(yaml: &str, revision: u64) -> Arc<CatalogState> {
        Arc::new(CatalogState::from_config(
            Config::from_yaml_str(yaml).unwrap(),
            revision,
        ))
    }

    struct Fixture {
        scheduler: Arc<Scheduler>,
        manager: ReloadManager,
        cache: Arc<MetadataCache>,
    }

    fn fixture() -> Fixture {
        let scheduler = Scheduler::new(
            Arc::new(NeverFactory),
            Arc::new(DiagnosticsProbe::default()),
            Arc::new(NoopSchedulerMetrics),
            CancellationToken::new(),
        );
        let cache = Arc::new(MetadataCache::new());
        let fetcher: Arc<dyn ListFetcher> = Arc::new(NeverFetch);
        let tool_index = ToolIndex::new(fetcher.clone(), cache.clone(), 2);
        let resource_index = ResourceIndex::new(fetcher.clone(), cache.clone(), 2);
        let prompt_index = PromptIndex::new(fetcher, cache.clone(), 2);
        let registry = Arc::new(ClientRegistry::new());
        let activation = Arc::new(Activation::new(scheduler.clone()));
        let manager = ReloadManager::new(
            scheduler.clone(),
            Arc::new(PluginManager::new(std::env::temp_dir().join("mcpv-reload-test"))),
            Arc::new(Executor::disabled()),
            tool_index,
            resource_index,
            prompt_index,
            cache.clone(),
            registry,
            activation,
        );
        Fixture {
            scheduler,
            manager,
            cache,
        }
    }

    const OLD: &str = "servers:\n  - name: github\n    cmd: npx\n";
    const NEW: &str = "servers:\n  - name: github\n    cmd: npx\n  - name: extra\n    cmd: echo\n";

    #[tokio::test]
    async fn apply_adds_pools_and_evicts_cache() {
        let fx = fixture();
        let old = state(OLD, 1);
        let new = state(NEW, 2);
        // Seed pools from the old generation, plus a cache entry for a
        // spec the new generation drops.
        for (key, spec) in &old.spec_registry {
            fx.scheduler.ensure_pool(key.clone(), spec.clone());
        }
        let ghost = SpecKey::from_raw("ghost");
        fx.cache.upsert_tools(&ghost, vec![]);

        let diff = catalog::diff::diff(&old, &new);
        fx.manager
            .apply(&new, &old, &diff, ReloadMode::Strict)
            .await
            .unwrap();

        assert_eq!(fx.scheduler.pool_keys().len(), 2);
        assert!(fx.cache.get(&ghost).is_none());
    }

    #[tokio::test]
    async fn strict_mode_rejects_runtime_change_untouched() {
        let fx = fixture();
        let old = state(OLD, 1);
        let new = state(&format!("routeTimeoutSeconds: 99\n{NEW}"), 2);
        for (key, spec) in &old.spec_registry {
            fx.scheduler.ensure_pool(key.clone(), spec.clone());
        }

        let diff = catalog::diff::diff(&old, &new);
        let err = fx
            .manager
            .apply(&new, &old, &diff, ReloadMode::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition { .. }));
        // Nothing was applied: still one pool.
        assert_eq!(fx.scheduler.pool_keys().len(), 1);
    }

    #[tokio::test]
    async fn lenient_mode_applies_spec_subset() {
        let fx = fixture();
        let old = state(OLD, 1);
        let new = state(&format!("routeTimeoutSeconds: 99\n{NEW}"), 2);
        for (key, spec) in &old.spec_registry {
            fx.scheduler.ensure_pool(key.clone(), spec.clone());
        }
        let diff = catalog::diff::diff(&old, &new);
        fx.manager
            .apply(&new, &old, &diff, ReloadMode::Lenient)
            .await
            .unwrap();
        assert_eq!(fx.scheduler.pool_keys().len(), 2);
    }

    #[tokio::test]
    async fn failing_plugin_step_unwinds_before_scheduler() {
        let fx = fixture();
        let old = state(OLD, 1);
        // New generation adds both a server and a required plugin that
        // cannot start.
        let new = state(
            &format!(
                "{NEW}plugins:\n  - name: gate\n    category: authentication\n    cmd: /nonexistent/plugin\n    required: true\n    handshakeTimeoutMs: 100\n"
            ),
            2,
        );
        for (key, spec) in &old.spec_registry {
            fx.scheduler.ensure_pool(key.clone(), spec.clone());
        }

        let diff = catalog::diff::diff(&old, &new);
        assert!(fx
            .manager
            .apply(&new, &old, &diff, ReloadMode::Strict)
            .await
            .is_err());
        // The scheduler step never ran: pool set is unchanged.
        assert_eq!(fx.scheduler.pool_keys().len(), 1);
    }

    #[test]
    fn inverse_changes_flip_direction() {
        let diff = CatalogDiff {
            added: vec![SpecKey::from_raw("a")],
            removed: vec![SpecKey::from_raw("r")],
            replaced: vec![(SpecKey::from_raw("x"), SpecKey::from_raw("y"))],
            ..Default::default()
        };
        let inverse = inverse_changes(&diff);
        assert_eq!(inverse.added, vec![SpecKey::from_raw("r")]);
        assert_eq!(inverse.removed, vec![SpecKey::from_raw("a")]);
        assert_eq!(
            inverse.replaced,
            vec![(SpecKey::from_raw("y"), SpecKey::from_raw("x"))]
        );
    }

    #[tokio::test]
    async fn tag_only_change_bumps_visibility_without_pool_churn() {
        let fx = fixture();
        let old = state("servers:\n  - name: a\n    cmd: echo\n    tags: [dev]\n", 1);
        let new = state("servers:\n  - name: a\n    cmd: echo\n    tags: [dev, chat]\n", 2);
        for (key, spec) in &old.spec_registry {
            fx.scheduler.ensure_pool(key.clone(), spec.clone());
        }
        let rev_before = fx.manager.registry.visibility_rev();
        let generation_before = fx.scheduler.pool_statuses()[0].generation;

        let diff = catalog::diff::diff(&old, &new);
        assert!(diff.tags_changed && !diff.pools_affected());
        fx.manager
            .apply(&new, &old, &diff, ReloadMode::Strict)
            .await
            .unwrap();

        assert_eq!(fx.manager.registry.visibility_rev(), rev_before + 1);
        assert_eq!(
            fx.scheduler.pool_statuses()[0].generation,
            generation_before
        );
    }
}
