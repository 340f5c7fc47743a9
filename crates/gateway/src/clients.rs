//! Client registry and activation bookkeeping.
//!
//! Clients register with normalized tags and keep themselves alive via
//! heartbeats. The reaper evicts a client when its pid is gone *or* the
//! heartbeat TTL lapses. Activation derives each spec's warm target from
//! the surviving clients: a spec is activated when it is `always-on` or
//! at least one active client can see it; a spec falling out of
//! activation is stopped and its pool quiesces.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mcpv_domain::config::ActivationMode;
use mcpv_domain::{visibility, SpecKey};
use mcpv_runtime::Scheduler;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::catalog::CatalogState;

/// One registered client.
#[derive(Clone)]
pub struct ActiveClient {
    pub name: String,
    pub pid: u32,
    /// Normalized: trimmed, lowercased, de-duplicated, sorted.
    pub tags: Vec<String>,
    pub registered_at: DateTime<Utc>,
    last_heartbeat: Instant,
}

/// Summary returned by list endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub pid: u32,
    pub tags: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub idle_seconds: u64,
}

/// Registry change events for `WatchActiveClients`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Registered(String),
    Unregistered(String),
    Evicted(String),
}

/// Thread-safe registry of active clients.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, ActiveClient>>,
    /// Bumped whenever per-client visibility may have changed (tag-only
    /// catalog updates); watchers re-emit filtered snapshots on a bump.
    visibility: watch::Sender<u64>,
    events: broadcast::Sender<ClientEvent>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(64);
        let (visibility, _) = watch::channel(0);
        Self {
            clients: Mutex::new(HashMap::new()),
            visibility,
            events,
        }
    }

    /// Register (or overwrite) a client. Returns the normalized tags.
    pub fn register(&self, name: &str, pid: u32, tags: &[String]) -> Vec<String> {
        let tags = visibility::normalize_tags(tags);
        let client = ActiveClient {
            name: name.to_string(),
            pid,
            tags: tags.clone(),
            registered_at: Utc::now(),
            last_heartbeat: Instant::now(),
        };
        let replaced = self.clients.lock().insert(name.to_string(), client);
        tracing::info!(
            client = name,
            pid,
            tags = ?tags,
            replaced = replaced.is_some(),
            "client registered"
        );
        let _ = self.events.send(ClientEvent::Registered(name.to_string()));
        tags
    }

    /// Record a heartbeat. Returns false for unknown clients.
    pub fn heartbeat(&self, name: &str) -> bool {
        match self.clients.lock().get_mut(name) {
            Some(client) => {
                client.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.clients.lock().remove(name).is_some();
        if removed {
            tracing::info!(client = name, "client unregistered");
            let _ = self.events.send(ClientEvent::Unregistered(name.to_string()));
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<ActiveClient> {
        self.clients.lock().get(name).cloned()
    }

    /// Normalized tags for a client; `None` when unregistered. Unknown
    /// clients are treated as untagged by list operations.
    pub fn tags_of(&self, name: &str) -> Option<Vec<String>> {
        self.clients.lock().get(name).map(|c| c.tags.clone())
    }

    /// All clients. The sort happens after the lock is dropped.
    pub fn list(&self) -> Vec<ClientInfo> {
        let snapshot: Vec<ActiveClient> = self.clients.lock().values().cloned().collect();
        let mut out: Vec<ClientInfo> = snapshot
            .into_iter()
            .map(|c| ClientInfo {
                name: c.name,
                pid: c.pid,
                tags: c.tags,
                registered_at: c.registered_at,
                idle_seconds: c.last_heartbeat.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn visibility_rev(&self) -> u64 {
        *self.visibility.borrow()
    }

    /// Tag-only catalog change: make watchers re-emit filtered views.
    pub fn bump_visibility(&self) {
        self.visibility.send_modify(|rev| *rev += 1);
    }

    /// Watchers re-emit their filtered snapshots when this changes.
    pub fn subscribe_visibility(&self) -> watch::Receiver<u64> {
        self.visibility.subscribe()
    }

    /// The spec keys visible to the given (normalized) client tags.
    pub fn visible_keys(catalog: &CatalogState, client_tags: &[String]) -> HashSet<SpecKey> {
        catalog
            .spec_registry
            .iter()
            .filter(|(_, spec)| visibility::visible(client_tags, &spec.tags))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Evict clients whose pid died or whose heartbeat lapsed. Returns
    /// the evicted names.
    pub fn reap(&self, inactive_after: Duration) -> Vec<String> {
        let evicted: Vec<String> = {
            let mut clients = self.clients.lock();
            let dead: Vec<String> = clients
                .values()
                .filter(|c| c.last_heartbeat.elapsed() > inactive_after || !pid_alive(c.pid))
                .map(|c| c.name.clone())
                .collect();
            for name in &dead {
                clients.remove(name);
            }
            dead
        };
        for name in &evicted {
            tracing::info!(client = %name, "client evicted");
            let _ = self.events.send(ClientEvent::Evicted(name.clone()));
        }
        evicted
    }
}

/// Whether a process with this pid exists (signal 0 probe).
fn pid_alive(pid: u32) -> bool {
    // Reject pids that cannot be valid; a negative pid_t would address a
    // process group instead of a process.
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Activation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Derives warm-pool targets from the active client set and the catalog.
pub struct Activation {
    scheduler: Arc<Scheduler>,
    /// Specs currently activated; used to detect deactivation edges.
    active: Mutex<HashSet<SpecKey>>,
}

impl Activation {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Recompute every spec's warm target. Specs leaving activation are
    /// stopped so their pools quiesce promptly.
    pub async fn recompute(&self, catalog: &CatalogState, registry: &ClientRegistry, cause: &str) {
        let client_tags: Vec<Vec<String>> = {
            let clients = registry.clients.lock();
            clients.values().map(|c| c.tags.clone()).collect()
        };

        let mut now_active = HashSet::new();
        for (key, spec) in &catalog.spec_registry {
            let mode = catalog.catalog.activation_mode(spec);
            let referenced = client_tags
                .iter()
                .any(|tags| visibility::visible(tags, &spec.tags));
            let target = match mode {
                ActivationMode::AlwaysOn => spec.min_ready.max(1),
                ActivationMode::OnDemand if referenced => spec.min_ready.max(1),
                ActivationMode::OnDemand => 0,
            };
            if target > 0 {
                now_active.insert(key.clone());
            }
            self.scheduler.set_desired_min_ready(key, target, cause);
        }

        let deactivated: Vec<SpecKey> = {
            let mut active = self.active.lock();
            let dropped = active.difference(&now_active).cloned().collect();
            *active = now_active;
            dropped
        };
        for key in deactivated {
            self.scheduler.stop_spec(&key, "deactivated").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpv_domain::config::Config;

    fn catalog(yaml: &str) -> CatalogState {
        CatalogState::from_config(Config::from_yaml_str(yaml).unwrap(), 1)
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_normalizes_and_overwrites() {
        let registry = ClientRegistry::new();
        let normalized = registry.register("ide", std::process::id(), &tags(&[" VSCode ", "chat"]));
        assert_eq!(normalized, tags(&["chat", "vscode"]));
        assert_eq!(registry.len(), 1);

        // Duplicate name overwrites the prior entry.
        registry.register("ide", std::process::id(), &tags(&["other"]));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tags_of("ide").unwrap(), tags(&["other"]));
    }

    #[test]
    fn heartbeat_only_for_known_clients() {
        let registry = ClientRegistry::new();
        assert!(!registry.heartbeat("ghost"));
        registry.register("c1", std::process::id(), &[]);
        assert!(registry.heartbeat("c1"));
    }

    #[test]
    fn visible_keys_follow_tag_union() {
        let state = catalog(
            "servers:\n  - {name: a, cmd: echo, tags: []}\n  - {name: b, cmd: echo, tags: [chat]}\n  - {name: c, cmd: echo, tags: [vscode]}\n",
        );
        let visible = ClientRegistry::visible_keys(&state, &tags(&["vscode"]));
        assert_eq!(visible.len(), 2);
        assert!(visible.contains(&state.name_index["a"]));
        assert!(visible.contains(&state.name_index["c"]));

        // Untagged client sees everything.
        let all = ClientRegistry::visible_keys(&state, &[]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn reap_evicts_dead_pid_and_stale_heartbeat() {
        let registry = ClientRegistry::new();
        // Far above any real pid_max.
        registry.register("dead", 999_999_999, &[]);
        registry.register("alive", std::process::id(), &[]);

        let evicted = registry.reap(Duration::from_secs(3600));
        assert_eq!(evicted, vec!["dead".to_string()]);
        assert_eq!(registry.len(), 1);

        // Zero TTL evicts even the live-pid client.
        let evicted = registry.reap(Duration::from_nanos(0));
        assert_eq!(evicted, vec!["alive".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn list_is_sorted_by_name() {
        let registry = ClientRegistry::new();
        registry.register("zeta", std::process::id(), &[]);
        registry.register("alpha", std::process::id(), &[]);
        let names: Vec<String> = registry.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn visibility_rev_bumps() {
        let registry = ClientRegistry::new();
        let before = registry.visibility_rev();
        registry.bump_visibility();
        assert_eq!(registry.visibility_rev(), before + 1);
    }

    mod activation {
        use super::*;
        use async_trait::async_trait;
        use mcpv_domain::config::ServerSpec;
        use mcpv_domain::Error;
        use mcpv_runtime::probe::DiagnosticsProbe;
        use mcpv_runtime::scheduler::NoopSchedulerMetrics;
        use mcpv_runtime::{Instance, InstanceFactory};
        use tokio_util::sync::CancellationToken;

        struct NeverFactory;

        #[async_trait]
        impl InstanceFactory for NeverFactory {
            async fn start_instance(
                &self,
                _spec_key: &SpecKey,
                _spec: Arc<ServerSpec>,
            ) -> mcpv_domain::Result<Arc<Instance>> {
                Err(Error::Internal("not started in this test".into()))
            }
            async fn stop_instance(&self, _instance: &Instance, _reason: &str) {}
        }

        fn scheduler() -> Arc<Scheduler> {
            Scheduler::new(
                Arc::new(NeverFactory),
                Arc::new(DiagnosticsProbe::default()),
                Arc::new(NoopSchedulerMetrics),
                CancellationToken::new(),
            )
        }

        #[tokio::test]
        async fn warm_targets_follow_referrers() {
            let state = catalog(
                "servers:\n  - {name: a, cmd: echo, tags: [vscode], minReady: 2}\n  - {name: b, cmd: echo, tags: [chat]}\n  - {name: warm, cmd: echo, activationMode: always-on}\n",
            );
            let sched = scheduler();
            for (key, spec) in &state.spec_registry {
                sched.ensure_pool(key.clone(), spec.clone());
            }
            let registry = ClientRegistry::new();
            registry.register("ide", std::process::id(), &tags(&["vscode"]));

            let activation = Activation::new(sched.clone());
            activation.recompute(&state, &registry, "test").await;

            let by_name: HashMap<String, u32> = sched
                .pool_statuses()
                .into_iter()
                .map(|s| (s.server_name, s.min_ready))
                .collect();
            // Referenced: max(1, minReady=2) = 2.
            assert_eq!(by_name["a"], 2);
            // Not referenced by any client: quiesced.
            assert_eq!(by_name["b"], 0);
            // Always-on: warm regardless of clients.
            assert_eq!(by_name["warm"], 1);
        }

        #[tokio::test]
        async fn deactivation_stops_the_spec() {
            let state = catalog("servers:\n  - {name: a, cmd: echo, tags: [vscode]}\n");
            let sched = scheduler();
            for (key, spec) in &state.spec_registry {
                sched.ensure_pool(key.clone(), spec.clone());
            }
            let registry = ClientRegistry::new();
            registry.register("ide", std::process::id(), &tags(&["vscode"]));

            let activation = Activation::new(sched.clone());
            activation.recompute(&state, &registry, "register").await;
            let generation_before = sched.pool_statuses()[0].generation;

            registry.unregister("ide");
            activation.recompute(&state, &registry, "evict").await;
            // StopSpec ran: the generation advanced and the target is 0.
            let status = &sched.pool_statuses()[0];
            assert_eq!(status.min_ready, 0);
            assert!(status.generation > generation_before);
        }
    }
}
