//! A running downstream instance and its lifecycle state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcpv_domain::config::ServerSpec;
use mcpv_domain::SpecKey;
use mcpv_proto::mcp::ServerCapabilities;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::conn::Conn;
use crate::launcher::StopHandle;

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Ready,
    Draining,
    Stopped,
    Failed,
}

/// One downstream instance. Owned exclusively by its pool entry; never
/// shared across specs.
pub struct Instance {
    pub id: String,
    pub spec_key: SpecKey,
    pub spec: Arc<ServerSpec>,
    pub conn: Arc<Conn>,
    pub capabilities: ServerCapabilities,
    stop: StopHandle,

    state: Mutex<InstanceState>,
    busy: AtomicU32,
    last_active: Mutex<Instant>,
    last_heartbeat: Mutex<Instant>,
    sticky_key: Mutex<Option<String>>,
    /// Fires when a draining instance's busy count reaches zero.
    /// `CancellationToken` gives the idempotent close-once gate.
    drain_done: CancellationToken,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("spec_key", &self.spec_key)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Instance {
    pub fn new(
        spec_key: SpecKey,
        spec: Arc<ServerSpec>,
        conn: Arc<Conn>,
        capabilities: ServerCapabilities,
        stop: StopHandle,
    ) -> Arc<Instance> {
        let now = Instant::now();
        Arc::new(Instance {
            id: uuid::Uuid::new_v4().to_string(),
            spec_key,
            spec,
            conn,
            capabilities,
            stop,
            state: Mutex::new(InstanceState::Ready),
            busy: AtomicU32::new(0),
            last_active: Mutex::new(now),
            last_heartbeat: Mutex::new(now),
            sticky_key: Mutex::new(None),
            drain_done: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: InstanceState) {
        *self.state.lock() = state;
    }

    pub fn busy(&self) -> u32 {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn inc_busy(&self) -> u32 {
        self.busy.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement busy, returning the new count.
    pub fn dec_busy(&self) -> u32 {
        let prev = self.busy.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "busy count underflow");
        prev - 1
    }

    /// Record activity (acquire/release) for idle accounting.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn sticky_key(&self) -> Option<String> {
        self.sticky_key.lock().clone()
    }

    pub fn set_sticky_key(&self, key: Option<String>) {
        *self.sticky_key.lock() = key;
    }

    /// Signal that a draining instance finished its last busy slot.
    /// Tolerates concurrent signalers.
    pub fn signal_drain_done(&self) {
        self.drain_done.cancel();
    }

    /// Wait until the drain gate fires. Returns immediately if it already
    /// has.
    pub async fn wait_drain_done(&self) {
        self.drain_done.cancelled().await;
    }

    /// Close the connection and stop the underlying process. Used by the
    /// scheduler once the instance leaves the pool.
    pub async fn shutdown(&self) {
        self.conn.close();
        self.stop.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnHandlers;
    use crate::hub::ListChangeHub;
    use crate::launcher::{Launcher, StdioLauncher};
    use crate::logs::LogHub;

    pub(crate) async fn cat_instance() -> Arc<Instance> {
        let spec: ServerSpec = serde_yaml::from_str("name: cat\ncmd: cat\n").unwrap();
        let key = SpecKey::of(&spec);
        let launcher = StdioLauncher::new(LogHub::default(), Default::default());
        let launched = launcher.start(&key, &spec).await.unwrap();
        let conn = Conn::connect(
            key.clone(),
            launched.io,
            ListChangeHub::default(),
            ConnHandlers::default(),
        );
        Instance::new(
            key,
            Arc::new(spec),
            conn,
            ServerCapabilities::default(),
            launched.stop,
        )
    }

    #[tokio::test]
    async fn busy_counting() {
        let instance = cat_instance().await;
        assert_eq!(instance.busy(), 0);
        assert_eq!(instance.inc_busy(), 1);
        assert_eq!(instance.inc_busy(), 2);
        assert_eq!(instance.dec_busy(), 1);
        assert_eq!(instance.dec_busy(), 0);
        instance.shutdown().await;
    }

    #[tokio::test]
    async fn drain_gate_tolerates_concurrent_signalers() {
        let instance = cat_instance().await;
        let waiter = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.wait_drain_done().await })
        };
        instance.signal_drain_done();
        instance.signal_drain_done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain gate never fired")
            .unwrap();
        // Late waiters return immediately.
        instance.wait_drain_done().await;
        instance.shutdown().await;
    }

    #[tokio::test]
    async fn state_transitions() {
        let instance = cat_instance().await;
        assert_eq!(instance.state(), InstanceState::Ready);
        instance.set_state(InstanceState::Draining);
        assert_eq!(instance.state(), InstanceState::Draining);
        instance.set_state(InstanceState::Stopped);
        instance.shutdown().await;
    }
}
