//! Generic aggregation index.
//!
//! One instance per catalog kind (tools, resources, prompts). The index
//! owns the authoritative snapshot for its kind, refreshes it
//! periodically and on targeted `list_changed` triggers, falls back to
//! the metadata cache when a spec has no Ready instance, and
//! circuit-breaks specs that keep failing.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use mcpv_domain::config::{NamespaceStrategy, ServerSpec};
use mcpv_domain::{Error, Result, SpecKey};
use mcpv_runtime::{ListChange, MetadataCache};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::kinds::IndexKind;
use crate::snapshot::{Entry, Snapshot};

/// Consecutive refresh failures before a spec is evicted from the
/// snapshot and the cache.
pub const FAIL_THRESHOLD: u32 = 3;

/// How long a targeted refresh waits to coalesce bursts of
/// `list_changed` notifications.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// List access used by index refreshes. The gateway router implements
/// this over `AcquireReady` routes, so refreshes can never cold-start a
/// downstream.
#[async_trait]
pub trait ListFetcher: Send + Sync {
    async fn fetch(&self, spec_key: &SpecKey, method: &'static str) -> Result<Value>;
}

pub struct GenericIndex<K: IndexKind> {
    fetcher: Arc<dyn ListFetcher>,
    cache: Arc<MetadataCache>,
    specs: RwLock<HashMap<SpecKey, Arc<ServerSpec>>>,
    namespace: RwLock<NamespaceStrategy>,
    global_expose: RwLock<Option<Vec<String>>>,
    concurrency: usize,
    snapshot_tx: watch::Sender<Arc<Snapshot<K::Def>>>,
    /// Consecutive failure counts per spec.
    fail: Mutex<HashMap<SpecKey, u32>>,
    /// Specs currently circuit-broken out of the snapshot.
    evicted: Mutex<HashSet<SpecKey>>,
    /// Specs with a pending targeted refresh.
    pending: Mutex<HashSet<SpecKey>>,
    _kind: PhantomData<K>,
}

impl<K: IndexKind> GenericIndex<K> {
    pub fn new(
        fetcher: Arc<dyn ListFetcher>,
        cache: Arc<MetadataCache>,
        concurrency: usize,
    ) -> Arc<Self> {
        let (snapshot_tx, _rx) = watch::channel(Arc::new(Snapshot::empty()));
        Arc::new(Self {
            fetcher,
            cache,
            specs: RwLock::new(HashMap::new()),
            namespace: RwLock::new(NamespaceStrategy::default()),
            global_expose: RwLock::new(None),
            concurrency: concurrency.max(1),
            snapshot_tx,
            fail: Mutex::new(HashMap::new()),
            evicted: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashSet::new()),
            _kind: PhantomData,
        })
    }

    /// Swap in the current spec set (catalog apply). Subscriber channels
    /// survive; state for dropped specs is forgotten.
    pub fn update_specs(
        &self,
        specs: HashMap<SpecKey, Arc<ServerSpec>>,
        namespace: NamespaceStrategy,
        global_expose: Option<Vec<String>>,
    ) {
        {
            let keep: HashSet<&SpecKey> = specs.keys().collect();
            self.fail.lock().retain(|k, _| keep.contains(k));
            self.evicted.lock().retain(|k| keep.contains(k));
            self.pending.lock().retain(|k| keep.contains(k));
        }
        *self.specs.write() = specs;
        *self.namespace.write() = namespace;
        *self.global_expose.write() = global_expose;
    }

    /// The current published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot<K::Def>> {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch snapshot publications. `watch` semantics give slow
    /// consumers the coalesced-latest value without re-ordering.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot<K::Def>>> {
        self.snapshot_tx.subscribe()
    }

    /// Queue a targeted refresh for one spec (list_changed trigger).
    pub fn schedule_refresh(&self, spec_key: SpecKey) {
        self.pending.lock().insert(spec_key);
    }

    /// Refresh every known spec, then rebuild and publish.
    pub async fn refresh_all(&self) {
        let keys: Vec<SpecKey> = self.specs.read().keys().cloned().collect();
        self.refresh_specs(keys).await;
    }

    /// Refresh the given specs (bounded concurrency), then rebuild and
    /// publish.
    pub async fn refresh_specs(&self, keys: Vec<SpecKey>) {
        let targets: Vec<(SpecKey, Arc<ServerSpec>)> = {
            let specs = self.specs.read();
            keys.into_iter()
                .filter_map(|k| specs.get(&k).map(|s| (k, s.clone())))
                .collect()
        };

        futures_util::stream::iter(targets)
            .for_each_concurrent(self.concurrency, |(key, _spec)| async move {
                self.fetch_one(&key).await;
            })
            .await;

        self.rebuild_and_publish();
    }

    /// Drain the pending set and run a targeted refresh for it. Returns
    /// the number of specs refreshed.
    pub async fn drain_pending(&self) -> usize {
        let keys: Vec<SpecKey> = self.pending.lock().drain().collect();
        if keys.is_empty() {
            return 0;
        }
        let count = keys.len();
        self.refresh_specs(keys).await;
        count
    }

    /// One spec's refresh: fetch, fall back, or trip the breaker.
    async fn fetch_one(&self, spec_key: &SpecKey) {
        match self.fetcher.fetch(spec_key, K::METHOD).await {
            Ok(value) => match K::parse(value) {
                Ok(defs) => {
                    self.fail.lock().remove(spec_key);
                    self.evicted.lock().remove(spec_key);
                    K::cache_put(&self.cache, spec_key, defs);
                }
                Err(e) => self.note_failure(spec_key, &e),
            },
            // No Ready instance is not a failure; the cache entry (or an
            // empty contribution) stands in.
            Err(Error::NoReadyInstance) => {}
            Err(e) => self.note_failure(spec_key, &e),
        }
    }

    fn note_failure(&self, spec_key: &SpecKey, error: &Error) {
        let count = {
            let mut fail = self.fail.lock();
            let count = fail.entry(spec_key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        tracing::warn!(
            index = K::NAME,
            spec_key = %spec_key.short(),
            consecutive_failures = count,
            error = %error,
            "catalog refresh failed"
        );
        if count >= FAIL_THRESHOLD {
            self.cache.evict(spec_key);
            self.evicted.lock().insert(spec_key.clone());
            tracing::warn!(
                index = K::NAME,
                spec_key = %spec_key.short(),
                "circuit break: spec evicted from snapshot until a refresh succeeds"
            );
        }
    }

    /// Rebuild the snapshot from the metadata cache and publish it if the
    /// content changed.
    pub fn rebuild_and_publish(&self) {
        let specs: Vec<(SpecKey, Arc<ServerSpec>)> = self
            .specs
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let namespace = *self.namespace.read();
        let global_expose = self.global_expose.read().clone();
        let evicted = self.evicted.lock().clone();

        let mut entries: Vec<Entry<K::Def>> = Vec::new();
        for (spec_key, spec) in specs {
            if spec.disabled || evicted.contains(&spec_key) {
                continue;
            }
            // A spec that never loaded contributes nothing, and no error.
            let Some(meta) = self.cache.get(&spec_key) else {
                continue;
            };
            for def in K::cache_get(&meta) {
                if !K::exposed(&def, &spec, global_expose.as_deref()) {
                    continue;
                }
                let display_name = K::display_name(&def, &spec.name, namespace);
                entries.push(Entry {
                    spec_key: spec_key.clone(),
                    server_name: spec.name.clone(),
                    display_name,
                    def,
                });
            }
        }

        if namespace == NamespaceStrategy::Flat {
            entries = dedupe_flat::<K>(entries);
        }

        let snapshot = Arc::new(Snapshot::build(entries));
        self.snapshot_tx.send_if_modified(|current| {
            if current.etag == snapshot.etag {
                false
            } else {
                tracing::debug!(
                    index = K::NAME,
                    entries = snapshot.len(),
                    etag = %snapshot.etag,
                    "snapshot published"
                );
                *current = snapshot.clone();
                true
            }
        });
    }

    /// Periodic + notification-driven refresh loop.
    pub async fn run_loop(
        self: Arc<Self>,
        period: Duration,
        mut changes: broadcast::Receiver<ListChange>,
        root: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_all().await;
                }
                change = changes.recv() => {
                    match change {
                        Ok(change) if change.kind == K::KIND => {
                            self.schedule_refresh(change.spec_key);
                            // Let a burst of notifications coalesce into
                            // one targeted refresh.
                            tokio::time::sleep(COALESCE_WINDOW).await;
                            while let Ok(more) = changes.try_recv() {
                                if more.kind == K::KIND {
                                    self.schedule_refresh(more.spec_key);
                                }
                            }
                            self.drain_pending().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(index = K::NAME, skipped, "list-change hub lagged, refreshing everything");
                            self.refresh_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = root.cancelled() => return,
            }
        }
    }
}

/// Flat namespacing: duplicate display names resolve last-writer-wins in
/// `(specKey, name)` order, with a warning per shadowed entry.
fn dedupe_flat<K: IndexKind>(mut entries: Vec<Entry<K::Def>>) -> Vec<Entry<K::Def>> {
    entries.sort_by(|a, b| (&a.spec_key, &a.display_name).cmp(&(&b.spec_key, &b.display_name)));
    let mut winners: HashMap<String, Entry<K::Def>> = HashMap::new();
    for entry in entries {
        if let Some(shadowed) = winners.insert(entry.display_name.clone(), entry) {
            tracing::warn!(
                index = K::NAME,
                name = %shadowed.display_name,
                shadowed_server = %shadowed.server_name,
                "duplicate flat name, last writer wins"
            );
        }
    }
    winners.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::ToolKind;
    use mcpv_proto::mcp::methods;

    /// Scriptable fetcher: per-spec behavior set by tests.
    #[derive(Default)]
    struct FakeFetcher {
        behavior: Mutex<HashMap<SpecKey, FetchBehavior>>,
        calls: Mutex<Vec<SpecKey>>,
    }

    #[derive(Clone)]
    enum FetchBehavior {
        Tools(Vec<&'static str>),
        NoReady,
        Fail,
    }

    impl FakeFetcher {
        fn set(&self, key: &SpecKey, behavior: FetchBehavior) {
            self.behavior.lock().insert(key.clone(), behavior);
        }
    }

    #[async_trait]
    impl ListFetcher for FakeFetcher {
        async fn fetch(&self, spec_key: &SpecKey, method: &'static str) -> Result<Value> {
            assert_eq!(method, methods::TOOLS_LIST);
            self.calls.lock().push(spec_key.clone());
            match self.behavior.lock().get(spec_key).cloned() {
                Some(FetchBehavior::Tools(names)) => {
                    let tools: Vec<Value> = names
                        .iter()
                        .map(|n| serde_json::json!({ "name": n }))
                        .collect();
                    Ok(serde_json::json!({ "tools": tools }))
                }
                Some(FetchBehavior::NoReady) => Err(Error::NoReadyInstance),
                Some(FetchBehavior::Fail) | None => Err(Error::Internal("boom".into())),
            }
        }
    }

    fn spec(name: &str) -> Arc<ServerSpec> {
        Arc::new(
            serde_yaml::from_str(&format!("name: {name}\ncmd: echo\n")).unwrap(),
        )
    }

    fn setup(
        specs: &[(&str, &str)],
    ) -> (Arc<FakeFetcher>, Arc<MetadataCache>, Arc<GenericIndex<ToolKind>>) {
        let fetcher = Arc::new(FakeFetcher::default());
        let cache = Arc::new(MetadataCache::new());
        let index = GenericIndex::<ToolKind>::new(fetcher.clone(), cache.clone(), 4);
        let map: HashMap<SpecKey, Arc<ServerSpec>> = specs
            .iter()
            .map(|(key, name)| (SpecKey::from_raw(*key), spec(name)))
            .collect();
        index.update_specs(map, NamespaceStrategy::Prefix, None);
        (fetcher, cache, index)
    }

    #[tokio::test]
    async fn refresh_builds_namespaced_snapshot() {
        let (fetcher, _cache, index) = setup(&[("k1", "github"), ("k2", "search")]);
        fetcher.set(&SpecKey::from_raw("k1"), FetchBehavior::Tools(vec!["issues"]));
        fetcher.set(&SpecKey::from_raw("k2"), FetchBehavior::Tools(vec!["query"]));

        index.refresh_all().await;
        let snapshot = index.snapshot();
        let names: Vec<&str> = snapshot.entries.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, vec!["github.issues", "search.query"]);
    }

    #[tokio::test]
    async fn no_ready_instance_falls_back_to_cache() {
        let (fetcher, cache, index) = setup(&[("k1", "github")]);
        let key = SpecKey::from_raw("k1");

        // First refresh succeeds and hydrates the cache.
        fetcher.set(&key, FetchBehavior::Tools(vec!["issues"]));
        index.refresh_all().await;
        assert_eq!(index.snapshot().len(), 1);

        // Instance goes away: snapshot still serves the cached set.
        fetcher.set(&key, FetchBehavior::NoReady);
        index.refresh_all().await;
        assert_eq!(index.snapshot().len(), 1);
        assert!(cache.get(&key).is_some());
    }

    #[tokio::test]
    async fn never_loaded_spec_contributes_nothing() {
        let (fetcher, _cache, index) = setup(&[("k1", "github")]);
        fetcher.set(&SpecKey::from_raw("k1"), FetchBehavior::NoReady);
        index.refresh_all().await;
        assert!(index.snapshot().is_empty());
    }

    #[tokio::test]
    async fn circuit_break_evicts_then_success_reinstates() {
        let (fetcher, cache, index) = setup(&[("k1", "github")]);
        let key = SpecKey::from_raw("k1");

        fetcher.set(&key, FetchBehavior::Tools(vec!["issues"]));
        index.refresh_all().await;
        assert_eq!(index.snapshot().len(), 1);

        // Threshold consecutive failures evict cache entry and snapshot.
        fetcher.set(&key, FetchBehavior::Fail);
        for _ in 0..FAIL_THRESHOLD {
            index.refresh_all().await;
        }
        assert!(index.snapshot().is_empty());
        assert!(cache.get(&key).is_none());

        // A successful refresh reinstates the spec.
        fetcher.set(&key, FetchBehavior::Tools(vec!["issues"]));
        index.refresh_all().await;
        assert_eq!(index.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn etag_changes_iff_entries_changed() {
        let (fetcher, _cache, index) = setup(&[("k1", "github")]);
        let key = SpecKey::from_raw("k1");
        fetcher.set(&key, FetchBehavior::Tools(vec!["a"]));
        index.refresh_all().await;
        let first = index.snapshot().etag.clone();

        // Same content: same etag, no publication.
        let mut rx = index.subscribe();
        rx.borrow_and_update();
        index.refresh_all().await;
        assert_eq!(index.snapshot().etag, first);
        assert!(!rx.has_changed().unwrap());

        // Changed content: new etag, subscriber sees it.
        fetcher.set(&key, FetchBehavior::Tools(vec!["a", "b"]));
        index.refresh_all().await;
        assert_ne!(index.snapshot().etag, first);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn targeted_refresh_only_touches_scheduled_spec() {
        let (fetcher, _cache, index) = setup(&[("k1", "github"), ("k2", "search")]);
        fetcher.set(&SpecKey::from_raw("k1"), FetchBehavior::Tools(vec!["a"]));
        fetcher.set(&SpecKey::from_raw("k2"), FetchBehavior::Tools(vec!["b"]));
        index.refresh_all().await;
        fetcher.calls.lock().clear();

        index.schedule_refresh(SpecKey::from_raw("k2"));
        let refreshed = index.drain_pending().await;
        assert_eq!(refreshed, 1);
        let calls = fetcher.calls.lock().clone();
        assert_eq!(calls, vec![SpecKey::from_raw("k2")]);
    }

    #[tokio::test]
    async fn update_specs_drops_stale_state() {
        let (fetcher, _cache, index) = setup(&[("k1", "github")]);
        let key = SpecKey::from_raw("k1");
        fetcher.set(&key, FetchBehavior::Fail);
        for _ in 0..FAIL_THRESHOLD {
            index.refresh_all().await;
        }
        assert!(!index.evicted.lock().is_empty());

        // Catalog drops the spec; breaker state goes with it.
        index.update_specs(HashMap::new(), NamespaceStrategy::Prefix, None);
        assert!(index.evicted.lock().is_empty());
        assert!(index.fail.lock().is_empty());
        index.refresh_all().await;
        assert!(index.snapshot().is_empty());
    }

    #[tokio::test]
    async fn flat_strategy_last_writer_wins() {
        let fetcher = Arc::new(FakeFetcher::default());
        let cache = Arc::new(MetadataCache::new());
        let index = GenericIndex::<ToolKind>::new(fetcher.clone(), cache, 4);
        let map: HashMap<SpecKey, Arc<ServerSpec>> = [
            (SpecKey::from_raw("k1"), spec("alpha")),
            (SpecKey::from_raw("k2"), spec("beta")),
        ]
        .into_iter()
        .collect();
        index.update_specs(map, NamespaceStrategy::Flat, None);

        fetcher.set(&SpecKey::from_raw("k1"), FetchBehavior::Tools(vec!["shared"]));
        fetcher.set(&SpecKey::from_raw("k2"), FetchBehavior::Tools(vec!["shared"]));
        index.refresh_all().await;

        let snapshot = index.snapshot();
        assert_eq!(snapshot.len(), 1);
        // Last writer in (specKey, name) order is k2.
        assert_eq!(snapshot.entries[0].spec_key, SpecKey::from_raw("k2"));
    }

    #[tokio::test]
    async fn disabled_spec_is_skipped() {
        let fetcher = Arc::new(FakeFetcher::default());
        let cache = Arc::new(MetadataCache::new());
        let index = GenericIndex::<ToolKind>::new(fetcher.clone(), cache, 4);
        let mut disabled = (*spec("github")).clone();
        disabled.disabled = true;
        let map: HashMap<SpecKey, Arc<ServerSpec>> =
            [(SpecKey::from_raw("k1"), Arc::new(disabled))].into_iter().collect();
        index.update_specs(map, NamespaceStrategy::Prefix, None);

        fetcher.set(&SpecKey::from_raw("k1"), FetchBehavior::Tools(vec!["a"]));
        index.refresh_all().await;
        assert!(index.snapshot().is_empty());
    }
}
