//! Instance scheduler — per-spec pools with strategy-aware acquire and
//! release, idle reaping, warm-pool maintenance, drain semantics, ping
//! probes, and generation-coherent StopSpec.
//!
//! Locking: each pool has one mutex guarding its [`pool::PoolState`]. The
//! maintenance and ping loops take pool locks one at a time and never
//! hold two at once. Waiting for capacity parks on the pool's `Notify`
//! with a registered-then-recheck pattern so wakeups are never lost.

mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpv_domain::config::{ServerSpec, Strategy};
use mcpv_domain::{Error, Result, SpecKey};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::instance::{Instance, InstanceState};
use crate::lifecycle::InstanceFactory;
use crate::probe::{steps, DiagnosticsProbe, Phase};
use pool::{Pool, StickyBinding};

/// How often the maintenance loop (reap + warm-up + session expiry) runs.
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(1);

/// Budget for one ping round trip.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool lifecycle events for the runtime status service.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    InstanceStarted { spec_key: SpecKey },
    InstanceStopped { spec_key: SpecKey, reason: String },
    InstanceFailed { spec_key: SpecKey, error: String },
    PoolChanged { spec_key: SpecKey },
}

impl SchedulerEvent {
    pub fn spec_key(&self) -> &SpecKey {
        match self {
            SchedulerEvent::InstanceStarted { spec_key }
            | SchedulerEvent::InstanceStopped { spec_key, .. }
            | SchedulerEvent::InstanceFailed { spec_key, .. }
            | SchedulerEvent::PoolChanged { spec_key } => spec_key,
        }
    }
}

/// Metrics seam; the gateway injects its recorder, tests the no-op.
pub trait SchedulerMetrics: Send + Sync {
    fn observe_pool_capacity(&self, _spec_key: &SpecKey, _ratio: f64) {}
    fn inc_instance_stopped(&self, _reason: &str) {}
}

/// Default recorder that drops everything.
pub struct NoopSchedulerMetrics;

impl SchedulerMetrics for NoopSchedulerMetrics {}

/// Spec changes derived from a catalog diff, keyed by fingerprint.
#[derive(Debug, Default)]
pub struct SpecChanges {
    pub added: Vec<SpecKey>,
    pub removed: Vec<SpecKey>,
    /// `(old, new)`: same server name, different fingerprint.
    pub replaced: Vec<(SpecKey, SpecKey)>,
    /// Same fingerprint, different tuning; applied in place.
    pub updated: Vec<SpecKey>,
}

/// Point-in-time counts for one pool, for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub ready: usize,
    pub starting: usize,
    pub draining: usize,
    pub busy_sum: u32,
    pub min_ready: u32,
    pub generation: u64,
}

pub struct Scheduler {
    pools: RwLock<HashMap<SpecKey, Arc<Pool>>>,
    factory: Arc<dyn InstanceFactory>,
    probe: Arc<DiagnosticsProbe>,
    metrics: Arc<dyn SchedulerMetrics>,
    events: broadcast::Sender<SchedulerEvent>,
    root: CancellationToken,
    /// Total instances stopped over the scheduler's lifetime.
    stops: Arc<AtomicU64>,
}

enum Plan {
    Got(Arc<Instance>),
    /// Start a new instance recorded under this generation.
    Start(u64),
    Wait,
}

impl Scheduler {
    pub fn new(
        factory: Arc<dyn InstanceFactory>,
        probe: Arc<DiagnosticsProbe>,
        metrics: Arc<dyn SchedulerMetrics>,
        root: CancellationToken,
    ) -> Arc<Scheduler> {
        let (events, _rx) = broadcast::channel(256);
        Arc::new(Scheduler {
            pools: RwLock::new(HashMap::new()),
            factory,
            probe,
            metrics,
            events,
            root,
            stops: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Register a pool for a spec (idempotent).
    pub fn ensure_pool(&self, spec_key: SpecKey, spec: Arc<ServerSpec>) {
        let mut pools = self.pools.write();
        pools.entry(spec_key).or_insert_with(|| Pool::new(spec));
    }

    pub fn pool_keys(&self) -> Vec<SpecKey> {
        self.pools.read().keys().cloned().collect()
    }

    /// Status snapshot for every pool, sorted by server name.
    pub fn pool_statuses(&self) -> Vec<PoolStatus> {
        let pools: Vec<(SpecKey, Arc<Pool>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();
        let mut out: Vec<PoolStatus> = pools
            .into_iter()
            .map(|(spec_key, pool)| {
                let state = pool.state.lock();
                PoolStatus {
                    spec_key,
                    server_name: state.spec.name.clone(),
                    ready: state.ready_count(),
                    starting: state.starts_in_flight as usize,
                    draining: state.draining.len(),
                    busy_sum: state.busy_sum(),
                    min_ready: state.min_ready,
                    generation: state.generation,
                }
            })
            .collect();
        out.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        out
    }

    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    fn pool(&self, spec_key: &SpecKey) -> Result<Arc<Pool>> {
        self.pools
            .read()
            .get(spec_key)
            .cloned()
            .ok_or_else(|| Error::SpecNotFound(spec_key.short().to_string()))
    }

    // ── Acquire / release ────────────────────────────────────────────

    /// Acquire an instance, starting one if capacity allows. Waits for
    /// capacity when the pool is saturated; callers bound the wait with
    /// their own deadline.
    pub async fn acquire(
        &self,
        spec_key: &SpecKey,
        routing_key: Option<&str>,
    ) -> Result<Arc<Instance>> {
        self.acquire_inner(spec_key, routing_key, true).await
    }

    /// Acquire only an already-Ready instance; never triggers a start.
    /// Used by list-refresh paths so list operations cannot cold-start a
    /// downstream.
    pub async fn acquire_ready(
        &self,
        spec_key: &SpecKey,
        routing_key: Option<&str>,
    ) -> Result<Arc<Instance>> {
        self.acquire_inner(spec_key, routing_key, false).await
    }

    async fn acquire_inner(
        &self,
        spec_key: &SpecKey,
        routing_key: Option<&str>,
        allow_start: bool,
    ) -> Result<Arc<Instance>> {
        loop {
            let pool = self.pool(spec_key)?;

            let plan = {
                let mut state = pool.state.lock();
                self.plan(&mut state, routing_key, allow_start)?
            };
            let plan = match plan {
                Plan::Wait => {
                    // Register interest before the re-check so a release
                    // landing in between cannot be missed.
                    let notified = pool.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    let second = {
                        let mut state = pool.state.lock();
                        self.plan(&mut state, routing_key, allow_start)?
                    };
                    match second {
                        Plan::Wait => {
                            notified.await;
                            continue;
                        }
                        other => other,
                    }
                }
                other => other,
            };

            match plan {
                Plan::Got(instance) => {
                    self.emit_capacity(&pool, spec_key);
                    return Ok(instance);
                }
                Plan::Start(generation) => {
                    self.start_and_admit(&pool, spec_key, generation).await?;
                    // Loop back and take a slot (possibly on the new
                    // instance, possibly on one another waiter freed).
                }
                Plan::Wait => unreachable!("wait handled above"),
            }
        }
    }

    /// Decide what to do for one acquire pass. Runs under the pool lock.
    fn plan(
        &self,
        state: &mut pool::PoolState,
        routing_key: Option<&str>,
        allow_start: bool,
    ) -> Result<Plan> {
        let strategy = state.spec.strategy;
        let max_busy = state.spec.max_concurrent;

        // Step 1: live sticky binding or singleton instance.
        if strategy == Strategy::Stateful {
            if let Some(key) = routing_key {
                let bound = state
                    .sticky
                    .get(key)
                    .and_then(|b| state.instance_by_id(&b.instance_id))
                    .filter(|i| i.state() == InstanceState::Ready);
                match bound {
                    Some(instance) if instance.busy() < max_busy => {
                        if let Some(binding) = state.sticky.get_mut(key) {
                            binding.last_access = std::time::Instant::now();
                        }
                        instance.inc_busy();
                        instance.touch();
                        return Ok(Plan::Got(instance));
                    }
                    // Bound instance saturated: the session must wait for
                    // it, never spill onto another instance.
                    Some(_) => return Ok(Plan::Wait),
                    None => {
                        state.sticky.remove(key);
                    }
                }
            }
        }

        // Step 2: any Ready instance with a free busy slot.
        if let Some(instance) = state.least_busy_ready() {
            if strategy == Strategy::Stateful {
                if let Some(key) = routing_key {
                    state.sticky.insert(
                        key.to_string(),
                        StickyBinding {
                            instance_id: instance.id.clone(),
                            last_access: std::time::Instant::now(),
                        },
                    );
                    instance.set_sticky_key(Some(key.to_string()));
                }
            }
            instance.inc_busy();
            instance.touch();
            return Ok(Plan::Got(instance));
        }

        // Step 3: start a new instance when the cap allows.
        if allow_start && state.can_start() {
            state.starts_in_flight += 1;
            return Ok(Plan::Start(state.generation));
        }

        if !allow_start && state.ready_count() == 0 {
            return Err(Error::NoReadyInstance);
        }

        // Step 5: capacity exhausted; wait for a release or an admit.
        Ok(Plan::Wait)
    }

    /// Run the start on a detached task so an abandoned caller cannot
    /// kill a half-started instance, then admit it under the generation
    /// recorded at reservation time.
    async fn start_and_admit(
        &self,
        pool: &Arc<Pool>,
        spec_key: &SpecKey,
        generation: u64,
    ) -> Result<()> {
        let spec = pool.state.lock().spec.clone();
        let factory = self.factory.clone();
        let pool = pool.clone();
        let spec_key = spec_key.clone();
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        let stops = self.stops.clone();

        let handle: tokio::task::JoinHandle<Result<()>> = tokio::spawn(async move {
            let started = factory.start_instance(&spec_key, spec).await;
            let admitted = {
                let mut state = pool.state.lock();
                state.starts_in_flight -= 1;
                match &started {
                    Ok(instance) if state.generation == generation => {
                        state.instances.push(instance.clone());
                        true
                    }
                    _ => false,
                }
            };
            pool.notify.notify_waiters();

            match (started, admitted) {
                (Ok(_), true) => {
                    let _ = events.send(SchedulerEvent::InstanceStarted {
                        spec_key: spec_key.clone(),
                    });
                    Ok(())
                }
                (Ok(instance), false) => {
                    // StopSpec fired while we were starting; the new
                    // instance loses the generation race.
                    factory
                        .stop_instance(&instance, "canceled_by_stop_spec")
                        .await;
                    stops.fetch_add(1, Ordering::Relaxed);
                    metrics.inc_instance_stopped("canceled_by_stop_spec");
                    Err(Error::NoCapacity)
                }
                (Err(e), _) => {
                    let _ = events.send(SchedulerEvent::InstanceFailed {
                        spec_key: spec_key.clone(),
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        });

        match handle.await {
            Ok(result) => result,
            Err(join) => Err(Error::Internal(format!("start task panicked: {join}"))),
        }
    }

    /// Release an acquired instance. Always succeeds; drain gates fire
    /// here when the last busy slot clears.
    pub fn release(&self, instance: &Arc<Instance>) {
        let remaining = instance.dec_busy();
        instance.touch();
        if instance.state() == InstanceState::Draining && remaining == 0 {
            instance.signal_drain_done();
        }
        if let Some(pool) = self.pools.read().get(&instance.spec_key).cloned() {
            pool.notify.notify_waiters();
            self.emit_capacity(&pool, &instance.spec_key);
        }
    }

    fn emit_capacity(&self, pool: &Arc<Pool>, spec_key: &SpecKey) {
        let ratio = pool.state.lock().capacity_ratio();
        self.metrics.observe_pool_capacity(spec_key, ratio);
    }

    // ── StopSpec ─────────────────────────────────────────────────────

    /// Stop every instance of a spec. Busy instances drain (bounded by
    /// the spec's drain timeout); idle ones stop immediately. Bumps the
    /// pool generation so in-flight starts lose the admission race.
    pub async fn stop_spec(&self, spec_key: &SpecKey, reason: &str) {
        let Ok(pool) = self.pool(spec_key) else {
            return;
        };

        let (to_drain, to_stop, drain_timeout) = {
            let mut state = pool.state.lock();
            state.generation += 1;
            state.sticky.clear();
            let instances = std::mem::take(&mut state.instances);
            let mut to_drain = Vec::new();
            let mut to_stop = Vec::new();
            for instance in instances {
                if instance.busy() > 0 {
                    instance.set_state(InstanceState::Draining);
                    state.draining.push(instance.clone());
                    to_drain.push(instance);
                } else {
                    to_stop.push(instance);
                }
            }
            (
                to_drain,
                to_stop,
                Duration::from_secs(state.spec.drain_timeout_seconds),
            )
        };
        pool.notify.notify_waiters();

        tracing::info!(
            spec_key = %spec_key.short(),
            reason,
            draining = to_drain.len(),
            stopping = to_stop.len(),
            "stopping spec"
        );

        for instance in to_stop {
            self.stop_now(instance, reason.to_string());
        }
        for instance in to_drain {
            self.drain_then_stop(pool.clone(), instance, drain_timeout, reason.to_string());
        }
        let _ = self.events.send(SchedulerEvent::PoolChanged {
            spec_key: spec_key.clone(),
        });
    }

    fn stop_now(&self, instance: Arc<Instance>, reason: String) {
        let factory = self.factory.clone();
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        self.stops.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            factory.stop_instance(&instance, &reason).await;
            metrics.inc_instance_stopped(&reason);
            let _ = events.send(SchedulerEvent::InstanceStopped {
                spec_key: instance.spec_key.clone(),
                reason,
            });
        });
    }

    fn drain_then_stop(
        &self,
        pool: Arc<Pool>,
        instance: Arc<Instance>,
        timeout: Duration,
        reason: String,
    ) {
        let factory = self.factory.clone();
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        self.stops.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            tokio::select! {
                _ = instance.wait_drain_done() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(
                        spec_key = %instance.spec_key.short(),
                        instance = %instance.id,
                        "drain timeout expired with busy slots remaining"
                    );
                }
            }
            factory.stop_instance(&instance, &reason).await;
            {
                let mut state = pool.state.lock();
                state.draining.retain(|d| d.id != instance.id);
            }
            pool.notify.notify_waiters();
            metrics.inc_instance_stopped(&reason);
            let _ = events.send(SchedulerEvent::InstanceStopped {
                spec_key: instance.spec_key.clone(),
                reason,
            });
        });
    }

    // ── Activation / warm pool ───────────────────────────────────────

    /// Set the desired warm size for a spec. The maintenance loop closes
    /// the gap in both directions.
    pub fn set_desired_min_ready(&self, spec_key: &SpecKey, n: u32, cause: &str) {
        let Ok(pool) = self.pool(spec_key) else {
            return;
        };
        let changed = {
            let mut state = pool.state.lock();
            let changed = state.min_ready != n;
            state.min_ready = n;
            changed
        };
        if changed {
            self.probe.record(
                spec_key,
                "",
                cause,
                steps::SET_MIN_READY,
                Phase::Exit,
                None,
                None,
                Some(serde_json::json!({ "minReady": n, "cause": cause })),
            );
            tracing::debug!(spec_key = %spec_key.short(), min_ready = n, cause, "warm target updated");
        }
    }

    // ── Catalog apply ────────────────────────────────────────────────

    /// Apply a catalog diff: add/remove/replace/update pool entries.
    /// Tag-only changes never reach this method.
    pub async fn apply_spec_changes(
        &self,
        changes: &SpecChanges,
        registry: &HashMap<SpecKey, Arc<ServerSpec>>,
    ) {
        for key in &changes.added {
            if let Some(spec) = registry.get(key) {
                self.ensure_pool(key.clone(), spec.clone());
            }
        }
        for (old, new) in &changes.replaced {
            self.stop_spec(old, "spec_replaced").await;
            self.pools.write().remove(old);
            self.probe.forget(old);
            if let Some(spec) = registry.get(new) {
                self.ensure_pool(new.clone(), spec.clone());
            }
        }
        for key in &changes.updated {
            if let (Ok(pool), Some(spec)) = (self.pool(key), registry.get(key)) {
                let mut state = pool.state.lock();
                state.spec = spec.clone();
            }
        }
        for key in &changes.removed {
            self.stop_spec(key, "spec_removed").await;
            self.pools.write().remove(key);
            self.probe.forget(key);
        }
    }

    // ── Background loops ─────────────────────────────────────────────

    /// Idle reap + sticky expiry + warm-up. Runs until the root token
    /// cancels.
    pub async fn run_maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(MAINTENANCE_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.maintenance_tick(),
                _ = self.root.cancelled() => return,
            }
        }
    }

    /// One maintenance pass over every pool.
    pub fn maintenance_tick(&self) {
        let pools: Vec<(SpecKey, Arc<Pool>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();

        for (spec_key, pool) in pools {
            let (to_reap, start_gap, generation) = {
                let mut state = pool.state.lock();
                let strategy = state.spec.strategy;
                let session_ttl = Duration::from_secs(state.spec.session_ttl_seconds);
                let idle_after = Duration::from_secs(state.spec.idle_seconds);

                // Expire sticky bindings past their sliding TTL.
                if strategy == Strategy::Stateful {
                    let expired: Vec<String> = state
                        .sticky
                        .iter()
                        .filter(|(_, b)| b.last_access.elapsed() > session_ttl)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in expired {
                        if let Some(binding) = state.sticky.remove(&key) {
                            if !state.has_binding(&binding.instance_id) {
                                if let Some(instance) = state.instance_by_id(&binding.instance_id)
                                {
                                    instance.set_sticky_key(None);
                                }
                            }
                        }
                    }
                }

                // Idle reap.
                let mut to_reap = Vec::new();
                if !matches!(strategy, Strategy::Persistent | Strategy::Singleton) {
                    let mut ready: Vec<Arc<Instance>> = state
                        .instances
                        .iter()
                        .filter(|i| i.state() == InstanceState::Ready)
                        .cloned()
                        .collect();
                    // Least-recently-active first so surplus rotates by LRU.
                    ready.sort_by_key(|i| std::cmp::Reverse(i.idle_for()));
                    let mut ready_count = ready.len();
                    for instance in ready {
                        if ready_count <= state.min_ready as usize {
                            break;
                        }
                        if instance.busy() > 0 {
                            continue;
                        }
                        if strategy == Strategy::Stateful && state.has_binding(&instance.id) {
                            continue;
                        }
                        let reap = state.min_ready == 0 || instance.idle_for() >= idle_after;
                        if reap {
                            instance.set_state(InstanceState::Draining);
                            state.remove_instance(&instance.id);
                            to_reap.push(instance);
                            ready_count -= 1;
                        }
                    }
                }

                // Warm-up toward the desired min_ready.
                let ready_and_starting = state.ready_count() + state.starts_in_flight as usize;
                let mut start_gap = (state.min_ready as usize).saturating_sub(ready_and_starting);
                while start_gap > 0 && state.can_start() {
                    state.starts_in_flight += 1;
                    start_gap -= 1;
                }
                let reserved =
                    (state.min_ready as usize).saturating_sub(ready_and_starting) - start_gap;

                (to_reap, reserved, state.generation)
            };

            for instance in to_reap {
                tracing::debug!(
                    spec_key = %spec_key.short(),
                    instance = %instance.id,
                    "reaping idle instance"
                );
                self.stop_now(instance, "idle_reap".into());
            }
            for _ in 0..start_gap {
                self.spawn_warm_start(pool.clone(), spec_key.clone(), generation);
            }
        }
    }

    /// Warm-pool start: same admission rules as an acquire-path start,
    /// but nobody is waiting on the result.
    fn spawn_warm_start(&self, pool: Arc<Pool>, spec_key: SpecKey, generation: u64) {
        let factory = self.factory.clone();
        let events = self.events.clone();
        let spec = pool.state.lock().spec.clone();
        tokio::spawn(async move {
            let started = factory.start_instance(&spec_key, spec).await;
            let admitted = {
                let mut state = pool.state.lock();
                state.starts_in_flight -= 1;
                match &started {
                    Ok(instance) if state.generation == generation => {
                        state.instances.push(instance.clone());
                        true
                    }
                    _ => false,
                }
            };
            pool.notify.notify_waiters();
            match started {
                Ok(instance) if !admitted => {
                    factory
                        .stop_instance(&instance, "canceled_by_stop_spec")
                        .await;
                }
                Ok(_) => {
                    let _ = events.send(SchedulerEvent::InstanceStarted {
                        spec_key: spec_key.clone(),
                    });
                }
                Err(e) => {
                    tracing::debug!(spec_key = %spec_key.short(), error = %e, "warm start failed");
                    let _ = events.send(SchedulerEvent::InstanceFailed {
                        spec_key: spec_key.clone(),
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    /// Ping every routable instance; failures transition to Failed and
    /// stop. Runs until the root token cancels.
    pub async fn run_ping_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.ping_tick().await,
                _ = self.root.cancelled() => return,
            }
        }
    }

    pub async fn ping_tick(&self) {
        let pools: Vec<(SpecKey, Arc<Pool>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();

        for (spec_key, pool) in pools {
            let instances: Vec<Arc<Instance>> = {
                let state = pool.state.lock();
                state
                    .instances
                    .iter()
                    .filter(|i| i.state() == InstanceState::Ready)
                    .cloned()
                    .collect()
            };
            for instance in instances {
                let result = tokio::time::timeout(PING_TIMEOUT, instance.conn.ping()).await;
                match result {
                    Ok(Ok(())) => instance.mark_heartbeat(),
                    Ok(Err(e)) => self.handle_ping_failure(&pool, &spec_key, instance, &e.to_string()),
                    Err(_) => {
                        self.handle_ping_failure(&pool, &spec_key, instance, "ping timed out")
                    }
                }
            }
        }
    }

    fn handle_ping_failure(
        &self,
        pool: &Arc<Pool>,
        spec_key: &SpecKey,
        instance: Arc<Instance>,
        error: &str,
    ) {
        tracing::warn!(
            spec_key = %spec_key.short(),
            instance = %instance.id,
            error,
            "ping_failure"
        );
        instance.set_state(InstanceState::Failed);
        {
            let mut state = pool.state.lock();
            state.remove_instance(&instance.id);
            state
                .sticky
                .retain(|_, binding| binding.instance_id != instance.id);
        }
        pool.notify.notify_waiters();
        let _ = self.events.send(SchedulerEvent::InstanceFailed {
            spec_key: spec_key.clone(),
            error: error.to_string(),
        });
        self.stop_now(instance, "ping_failure".into());
    }

    /// Stop every pool; used on shutdown.
    pub async fn shutdown(&self, reason: &str) {
        for key in self.pool_keys() {
            self.stop_spec(&key, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Conn, ConnHandlers};
    use crate::hub::ListChangeHub;
    use crate::launcher::{LaunchedIo, StopHandle};
    use async_trait::async_trait;
    use mcpv_proto::mcp::ServerCapabilities;
    use std::sync::atomic::AtomicU32;

    /// Factory producing instances with an HTTP conn that is never used.
    /// Starts can be gated to simulate a blocked launcher.
    struct FakeFactory {
        started: AtomicU32,
        stopped: AtomicU32,
        gate: tokio::sync::Semaphore,
        gated: std::sync::atomic::AtomicBool,
    }

    impl FakeFactory {
        fn new() -> Arc<FakeFactory> {
            Arc::new(FakeFactory {
                started: AtomicU32::new(0),
                stopped: AtomicU32::new(0),
                gate: tokio::sync::Semaphore::new(0),
                gated: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn gated() -> Arc<FakeFactory> {
            let f = Self::new();
            f.gated.store(true, Ordering::SeqCst);
            f
        }

        fn open_gate(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl InstanceFactory for FakeFactory {
        async fn start_instance(
            &self,
            spec_key: &SpecKey,
            spec: Arc<ServerSpec>,
        ) -> Result<Arc<Instance>> {
            if self.gated.load(Ordering::SeqCst) {
                let permit = self.gate.acquire().await.expect("gate closed");
                permit.forget();
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            let channel = crate::conn::http::HttpChannel::connect(&spec, &Default::default())
                .expect("http channel");
            let conn = Conn::connect(
                spec_key.clone(),
                LaunchedIo::Http { channel },
                ListChangeHub::default(),
                ConnHandlers::default(),
            );
            Ok(Instance::new(
                spec_key.clone(),
                spec,
                conn,
                ServerCapabilities::default(),
                StopHandle::noop(),
            ))
        }

        async fn stop_instance(&self, instance: &Instance, _reason: &str) {
            instance.set_state(InstanceState::Stopped);
            instance.shutdown().await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spec(yaml: &str) -> Arc<ServerSpec> {
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn http_spec(extra: &str) -> Arc<ServerSpec> {
        spec(&format!(
            "name: fake\nendpoint: http://127.0.0.1:1/mcp\n{extra}"
        ))
    }

    fn scheduler(factory: Arc<FakeFactory>) -> Arc<Scheduler> {
        Scheduler::new(
            factory,
            Arc::new(DiagnosticsProbe::default()),
            Arc::new(NoopSchedulerMetrics),
            CancellationToken::new(),
        )
    }

    fn key_of(spec: &ServerSpec) -> SpecKey {
        SpecKey::of(spec)
    }

    #[tokio::test]
    async fn acquire_starts_then_reuses() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("maxConcurrent: 2\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let a = sched.acquire(&key, None).await.unwrap();
        assert_eq!(factory.started.load(Ordering::SeqCst), 1);
        assert_eq!(a.busy(), 1);

        let b = sched.acquire(&key, None).await.unwrap();
        // Second slot lands on the same instance (busy 2 < cap... cap is 2,
        // the pool may also have started another; either way no more than 2
        // instances exist).
        assert!(factory.started.load(Ordering::SeqCst) <= 2);

        sched.release(&a);
        sched.release(&b);
        // Balanced: all busy counts return to zero.
        let statuses = sched.pool_statuses();
        assert_eq!(statuses[0].busy_sum, 0);
    }

    #[tokio::test]
    async fn acquire_ready_never_starts() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let err = sched.acquire_ready(&key, None).await.unwrap_err();
        assert!(matches!(err, Error::NoReadyInstance));
        assert_eq!(factory.started.load(Ordering::SeqCst), 0);

        // After a normal acquire, acquire_ready succeeds.
        let a = sched.acquire(&key, None).await.unwrap();
        sched.release(&a);
        let b = sched.acquire_ready(&key, None).await.unwrap();
        sched.release(&b);
        assert_eq!(factory.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_spec_is_not_found() {
        let sched = scheduler(FakeFactory::new());
        let err = sched
            .acquire(&SpecKey::from_raw("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpecNotFound(_)));
    }

    #[tokio::test]
    async fn stop_spec_cancels_inflight_start() {
        let factory = FakeFactory::gated();
        let sched = scheduler(factory.clone());
        let spec = http_spec("");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        // G1 blocks inside the gated factory start.
        let g1 = {
            let sched = sched.clone();
            let key = key.clone();
            tokio::spawn(async move { sched.acquire(&key, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // StopSpec bumps the generation while the start is in flight.
        sched.stop_spec(&key, "test").await;
        factory.open_gate();

        let err = tokio::time::timeout(Duration::from_secs(2), g1)
            .await
            .expect("acquire stuck")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::NoCapacity));

        // Exactly one stop for the canceled instance; pool is empty.
        assert_eq!(factory.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(sched.stop_count(), 1);
        let statuses = sched.pool_statuses();
        assert_eq!(statuses[0].ready, 0);
        assert_eq!(statuses[0].starting, 0);
    }

    #[tokio::test]
    async fn drain_on_release() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("drainTimeoutSeconds: 2\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let instance = sched.acquire(&key, None).await.unwrap();
        sched.stop_spec(&key, "test").await;

        // Busy instance drains instead of stopping.
        assert_eq!(instance.state(), InstanceState::Draining);
        assert_eq!(factory.stopped.load(Ordering::SeqCst), 0);

        sched.release(&instance);
        // The drainer fires promptly once busy hits zero.
        tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                if factory.stopped.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("drained instance was not stopped within 200ms");
        assert_eq!(instance.state(), InstanceState::Stopped);
        let statuses = sched.pool_statuses();
        assert_eq!(statuses[0].draining, 0);
    }

    #[tokio::test]
    async fn drain_timeout_forces_stop() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("drainTimeoutSeconds: 0\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let instance = sched.acquire(&key, None).await.unwrap();
        sched.stop_spec(&key, "test").await;
        // Never released; the zero-second timeout still stops it.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if factory.stopped.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("drain timeout did not stop the instance");
        let _ = instance;
    }

    #[tokio::test]
    async fn stateful_binding_sticks_to_one_instance() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("strategy: stateful\nsessionTTLSeconds: 600\nmaxConcurrent: 4\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let a = sched.acquire(&key, Some("session-1")).await.unwrap();
        sched.release(&a);
        let b = sched.acquire(&key, Some("session-1")).await.unwrap();
        assert_eq!(a.id, b.id, "same routing key must stick to one instance");
        sched.release(&b);
        assert_eq!(factory.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stateful_binding_expires_after_session_ttl() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("strategy: stateful\nsessionTTLSeconds: 0\nmaxConcurrent: 4\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let a = sched.acquire(&key, Some("session-1")).await.unwrap();
        sched.release(&a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        sched.maintenance_tick();

        let pool = sched.pool(&key).unwrap();
        {
            let state = pool.state.lock();
            assert!(state.sticky.is_empty(), "TTL-expired binding must be dropped");
        }
        assert_eq!(a.sticky_key(), None);
    }

    #[tokio::test]
    async fn singleton_caps_at_one_instance() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("strategy: singleton\nmaxConcurrent: 2\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let a = sched.acquire(&key, None).await.unwrap();
        let b = sched.acquire(&key, None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(factory.started.load(Ordering::SeqCst), 1);

        // Third acquire must wait (busy cap 2 reached); release unblocks it.
        let third = {
            let sched = sched.clone();
            let key = key.clone();
            tokio::spawn(async move { sched.acquire(&key, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());
        sched.release(&a);
        let c = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .expect("waiter not woken")
            .unwrap()
            .unwrap();
        assert_eq!(c.id, b.id);
        sched.release(&b);
        sched.release(&c);
    }

    #[tokio::test]
    async fn min_ready_zero_reaps_idle_instances() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("idleSeconds: 9999\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec);

        let a = sched.acquire(&key, None).await.unwrap();
        sched.release(&a);
        // Desired warm size is 0: the next tick reaps regardless of idle.
        sched.maintenance_tick();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if factory.stopped.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("idle instance not reaped");
    }

    #[tokio::test]
    async fn min_ready_preserves_warm_instances() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec = http_spec("idleSeconds: 9999\n");
        let key = key_of(&spec);
        sched.ensure_pool(key.clone(), spec.clone());
        sched.set_desired_min_ready(&key, 1, "test");

        // Warm-up starts one instance without any acquire.
        sched.maintenance_tick();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if sched.pool_statuses()[0].ready == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("warm pool never came up");

        // Further ticks do not reap it.
        sched.maintenance_tick();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sched.pool_statuses()[0].ready, 1);
        assert_eq!(factory.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn apply_spec_changes_add_update_remove() {
        let factory = FakeFactory::new();
        let sched = scheduler(factory.clone());
        let spec_a = http_spec("maxConcurrent: 2\n");
        let key_a = key_of(&spec_a);

        let mut registry = HashMap::new();
        registry.insert(key_a.clone(), spec_a.clone());
        let changes = SpecChanges {
            added: vec![key_a.clone()],
            ..Default::default()
        };
        sched.apply_spec_changes(&changes, &registry).await;
        assert_eq!(sched.pool_keys().len(), 1);

        // In-place update keeps the pool and its instances.
        let a = sched.acquire(&key_a, None).await.unwrap();
        let mut updated = (*spec_a).clone();
        updated.max_concurrent = 8;
        registry.insert(key_a.clone(), Arc::new(updated));
        let changes = SpecChanges {
            updated: vec![key_a.clone()],
            ..Default::default()
        };
        sched.apply_spec_changes(&changes, &registry).await;
        assert_eq!(factory.stopped.load(Ordering::SeqCst), 0);
        sched.release(&a);

        // Removal stops and drops the pool.
        let changes = SpecChanges {
            removed: vec![key_a.clone()],
            ..Default::default()
        };
        sched.apply_spec_changes(&changes, &registry).await;
        assert!(sched.pool_keys().is_empty());
        let err = sched.acquire(&key_a, None).await.unwrap_err();
        assert!(matches!(err, Error::SpecNotFound(_)));
    }
}
