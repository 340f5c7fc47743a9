//! Runtime and server-init status services.
//!
//! A single hub task subscribes to scheduler events and republishes two
//! watch channels: per-pool runtime status (ready/starting/draining
//! counts, warm targets, last error) and per-spec init status (current
//! handshake step, attempt age, last error) derived from the
//! diagnostics probe. Watchers filter by client visibility at the API
//! layer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mcpv_domain::SpecKey;
use mcpv_runtime::probe::DiagnosticsProbe;
use mcpv_runtime::scheduler::PoolStatus;
use mcpv_runtime::{Scheduler, SchedulerEvent};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One pool's externally visible status.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRuntimeStatus {
    #[serde(flatten)]
    pub pool: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Per-spec handshake progress.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInitStatus {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub step: String,
    pub since: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Publishes status snapshots on scheduler events.
pub struct StatusHub {
    scheduler: Arc<Scheduler>,
    probe: Arc<DiagnosticsProbe>,
    last_errors: Mutex<HashMap<SpecKey, String>>,
    runtime_tx: watch::Sender<Arc<Vec<ServerRuntimeStatus>>>,
    init_tx: watch::Sender<Arc<Vec<ServerInitStatus>>>,
}

impl StatusHub {
    pub fn new(scheduler: Arc<Scheduler>, probe: Arc<DiagnosticsProbe>) -> Arc<StatusHub> {
        let (runtime_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (init_tx, _) = watch::channel(Arc::new(Vec::new()));
        Arc::new(StatusHub {
            scheduler,
            probe,
            last_errors: Mutex::new(HashMap::new()),
            runtime_tx,
            init_tx,
        })
    }

    pub fn watch_runtime(&self) -> watch::Receiver<Arc<Vec<ServerRuntimeStatus>>> {
        self.runtime_tx.subscribe()
    }

    pub fn watch_init(&self) -> watch::Receiver<Arc<Vec<ServerInitStatus>>> {
        self.init_tx.subscribe()
    }

    /// Rebuild both snapshots and publish them.
    pub fn refresh(&self) {
        let last_errors = self.last_errors.lock().clone();
        let runtime: Vec<ServerRuntimeStatus> = self
            .scheduler
            .pool_statuses()
            .into_iter()
            .map(|pool| {
                let last_error = last_errors.get(&pool.spec_key).cloned();
                ServerRuntimeStatus { pool, last_error }
            })
            .collect();
        self.runtime_tx.send_replace(Arc::new(runtime));

        let init: Vec<ServerInitStatus> = self
            .probe
            .stuck_summary()
            .into_iter()
            .map(|(spec_key, entry)| ServerInitStatus {
                spec_key,
                server_name: entry.server_name,
                step: entry.step.to_string(),
                since: entry.since,
                duration_ms: entry.duration_ms,
                last_error: entry.last_error,
            })
            .collect();
        self.init_tx.send_replace(Arc::new(init));
    }

    /// Event pump; runs until the root token cancels.
    pub async fn run(self: Arc<Self>, root: CancellationToken) {
        let mut events = self.scheduler.subscribe();
        self.refresh();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let SchedulerEvent::InstanceFailed { spec_key, error } = &event {
                            self.last_errors
                                .lock()
                                .insert(spec_key.clone(), error.clone());
                        }
                        if let SchedulerEvent::InstanceStarted { spec_key } = &event {
                            self.last_errors.lock().remove(spec_key);
                        }
                        self.refresh();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => self.refresh(),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = root.cancelled() => return,
            }
        }
    }
}
