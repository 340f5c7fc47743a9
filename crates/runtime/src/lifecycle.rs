//! Lifecycle manager — turns a `ServerSpec` into a ready [`Instance`].
//!
//! Start sequence: launch, connect, `initialize` (advertising sampling/
//! elicitation capabilities iff handlers are wired), verify the protocol
//! version, store server capabilities, send `notifications/initialized`.
//! Transient failures retry silently with bounded linear delay. The whole
//! start runs under the *application* root token, not the caller's
//! context, so a caller abandoning its acquire does not kill a freshly
//! started instance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mcpv_domain::config::{RuntimeConfig, ServerSpec, TransportKind};
use mcpv_domain::{Error, Result, SpecKey};
use mcpv_proto::mcp::{
    self, methods, ClientCapabilities, ClientInfo, InitializeParams, InitializeResult,
};
use tokio_util::sync::CancellationToken;

use crate::conn::{Conn, ConnHandlers};
use crate::hub::ListChangeHub;
use crate::instance::{Instance, InstanceState};
use crate::launcher::Launcher;
use crate::probe::{steps, DiagnosticsProbe, Phase};

/// Budget for one handshake attempt (launch through initialized).
const START_ATTEMPT_BUDGET: Duration = Duration::from_secs(30);

/// Retry tuning, taken from the runtime config.
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub base: Duration,
    pub max: Duration,
    pub retries: u32,
}

impl RetrySettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            base: Duration::from_secs(runtime.server_init_retry_base_seconds),
            max: Duration::from_secs(runtime.server_init_retry_max_seconds),
            retries: runtime.server_init_max_retries,
        }
    }

    /// Linear backoff: `base × attempt`, capped at `max`.
    fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.max)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            retries: 3,
        }
    }
}

/// Seam between the scheduler and the lifecycle layer; tests inject fakes.
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    /// Start and hand over a Ready instance.
    async fn start_instance(&self, spec_key: &SpecKey, spec: Arc<ServerSpec>)
        -> Result<Arc<Instance>>;

    /// Tear an instance down. Must be idempotent.
    async fn stop_instance(&self, instance: &Instance, reason: &str);
}

/// Production lifecycle manager.
pub struct Lifecycle {
    launcher: Arc<dyn Launcher>,
    hub: ListChangeHub,
    handlers: ConnHandlers,
    probe: Arc<DiagnosticsProbe>,
    retry: RetrySettings,
    /// Application root; instance starts outlive any single caller.
    root: CancellationToken,
}

impl Lifecycle {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        hub: ListChangeHub,
        handlers: ConnHandlers,
        probe: Arc<DiagnosticsProbe>,
        retry: RetrySettings,
        root: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            hub,
            handlers,
            probe,
            retry,
            root,
        }
    }

    /// The protocol version to advertise for a spec.
    fn protocol_version(&self, spec: &ServerSpec) -> String {
        spec.protocol_version
            .clone()
            .unwrap_or_else(|| mcp::STDIO_PROTOCOL_VERSION.to_string())
    }

    /// Whether the version a downstream negotiated is acceptable.
    fn version_acceptable(spec: &ServerSpec, version: &str) -> bool {
        match spec.effective_transport() {
            TransportKind::Stdio => version == mcp::STDIO_PROTOCOL_VERSION,
            TransportKind::StreamableHttp => mcp::HTTP_PROTOCOL_VERSIONS.contains(&version),
        }
    }

    async fn try_start(
        &self,
        spec_key: &SpecKey,
        spec: &Arc<ServerSpec>,
        attempt_id: &str,
    ) -> Result<Arc<Instance>> {
        let probe = &self.probe;
        let started = Instant::now();

        probe.record(spec_key, &spec.name, attempt_id, steps::LAUNCHER_START, Phase::Enter, None, None, None);
        let launched = match self.launcher.start(spec_key, spec).await {
            Ok(launched) => launched,
            Err(e) => {
                probe.record(spec_key, &spec.name, attempt_id, steps::LAUNCHER_START, Phase::Error, Some(started.elapsed()), Some(&e.to_string()), None);
                return Err(e);
            }
        };
        probe.record(spec_key, &spec.name, attempt_id, steps::LAUNCHER_START, Phase::Exit, Some(started.elapsed()), None, None);

        probe.record(spec_key, &spec.name, attempt_id, steps::TRANSPORT_CONNECT, Phase::Enter, None, None, None);
        let stop = launched.stop.clone();
        let conn = Conn::connect(
            spec_key.clone(),
            launched.io,
            self.hub.clone(),
            self.handlers.clone(),
        );
        probe.record(spec_key, &spec.name, attempt_id, steps::TRANSPORT_CONNECT, Phase::Exit, None, None, None);

        // Capabilities advertised iff the matching handler exists.
        let capabilities = ClientCapabilities {
            sampling: self.handlers.sampling.as_ref().map(|_| serde_json::json!({})),
            elicitation: self
                .handlers
                .elicitation
                .as_ref()
                .map(|_| serde_json::json!({})),
        };
        let params = InitializeParams {
            protocol_version: self.protocol_version(spec),
            capabilities,
            client_info: ClientInfo::default(),
        };

        probe.record(spec_key, &spec.name, attempt_id, steps::INITIALIZE_CALL, Phase::Enter, None, None, None);
        let init_started = Instant::now();
        let result = conn
            .call(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await;
        let response = match result {
            Ok(value) => value,
            Err(e) => {
                probe.record(spec_key, &spec.name, attempt_id, steps::INITIALIZE_CALL, Phase::Error, Some(init_started.elapsed()), Some(&e.to_string()), None);
                conn.close();
                stop.stop().await;
                return Err(e);
            }
        };
        let init: InitializeResult = serde_json::from_value(response)?;
        probe.record(spec_key, &spec.name, attempt_id, steps::INITIALIZE_RESPONSE, Phase::Exit, Some(init_started.elapsed()), None, None);

        if !Self::version_acceptable(spec, &init.protocol_version) {
            let message = format!(
                "downstream negotiated unsupported protocol version {:?}",
                init.protocol_version
            );
            probe.record(spec_key, &spec.name, attempt_id, steps::INITIALIZE_RESPONSE, Phase::Error, None, Some(&message), None);
            conn.close();
            stop.stop().await;
            return Err(Error::FailedPrecondition {
                op: "initialize",
                message,
            });
        }
        conn.set_protocol_version(&init.protocol_version);

        probe.record(spec_key, &spec.name, attempt_id, steps::NOTIFY_INITIALIZED, Phase::Enter, None, None, None);
        if let Err(e) = conn.notify(methods::INITIALIZED, None).await {
            probe.record(spec_key, &spec.name, attempt_id, steps::NOTIFY_INITIALIZED, Phase::Error, None, Some(&e.to_string()), None);
            conn.close();
            stop.stop().await;
            return Err(e);
        }

        probe.record(spec_key, &spec.name, attempt_id, steps::INSTANCE_READY, Phase::Exit, Some(started.elapsed()), None, None);
        tracing::info!(
            server = %spec.name,
            spec_key = %spec_key.short(),
            protocol = %init.protocol_version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "instance ready"
        );

        Ok(Instance::new(
            spec_key.clone(),
            spec.clone(),
            conn,
            init.capabilities,
            stop,
        ))
    }
}

#[async_trait]
impl InstanceFactory for Lifecycle {
    async fn start_instance(
        &self,
        spec_key: &SpecKey,
        spec: Arc<ServerSpec>,
    ) -> Result<Arc<Instance>> {
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let mut last_err = None;

        for attempt in 0..=self.retry.retries {
            if attempt > 0 {
                let delay = self.retry.delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.root.cancelled() => {
                        return Err(Error::Canceled { op: "start_instance" });
                    }
                }
                tracing::debug!(
                    server = %spec.name,
                    attempt,
                    "retrying downstream start"
                );
            }

            let try_fut = self.try_start(spec_key, &spec, &attempt_id);
            let result = tokio::select! {
                result = tokio::time::timeout(START_ATTEMPT_BUDGET, try_fut) => {
                    result.unwrap_or(Err(Error::DeadlineExceeded { op: "start_instance" }))
                }
                _ = self.root.cancelled() => Err(Error::Canceled { op: "start_instance" }),
            };

            match result {
                Ok(instance) => return Ok(instance),
                Err(e @ Error::Canceled { .. }) | Err(e @ Error::FailedPrecondition { .. }) => {
                    // Not transient; retrying cannot help.
                    return Err(e);
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or(Error::Internal("start never attempted".into()));
        tracing::warn!(
            server = %spec.name,
            spec_key = %spec_key.short(),
            error = %err,
            "downstream failed to start after retries"
        );
        Err(err)
    }

    async fn stop_instance(&self, instance: &Instance, reason: &str) {
        tracing::info!(
            server = %instance.spec.name,
            spec_key = %instance.spec_key.short(),
            instance = %instance.id,
            reason,
            "stopping instance"
        );
        instance.set_state(InstanceState::Stopped);
        instance.shutdown().await;
    }
}
