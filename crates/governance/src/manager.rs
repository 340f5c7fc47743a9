//! Plugin process manager.
//!
//! Allocates short socket paths (unix sockets cap the path at 108
//! bytes), spawns each plugin process with its env/cwd and the socket
//! path in `MCPV_PLUGIN_SOCKET`, dials within the handshake timeout,
//! verifies the commit hash when pinned, pushes `configure`, and blocks
//! on `checkReady`. Required plugins failing any of these block startup;
//! optional ones are logged and kept unhealthy. Stop is idempotent and
//! removes the socket file.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpv_domain::config::{PluginCategory, PluginFlow, PluginSpec};
use mcpv_domain::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::Child;

use crate::pipeline::{GovernanceContext, GovernancePlugin, Pipeline};
use crate::rpc::{methods, PluginClient, PluginDecision};

/// Unix socket paths must fit in `sockaddr_un.sun_path`.
const MAX_SOCKET_PATH: usize = 108;

/// One managed plugin process.
pub struct PluginHandle {
    pub spec: PluginSpec,
    client: Option<PluginClient>,
    child: tokio::sync::Mutex<Option<Child>>,
    socket_path: PathBuf,
    healthy: AtomicBool,
    stopped: AtomicBool,
}

impl PluginHandle {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.spec.timeout_ms)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Stop the plugin: best-effort shutdown RPC, then kill, then remove
    /// the socket file. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.healthy.store(false, Ordering::SeqCst);
        if let Some(client) = &self.client {
            let _ = client.shutdown(Duration::from_secs(2)).await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!(plugin = %self.spec.name, "plugin stopped");
    }
}

#[async_trait]
impl GovernancePlugin for PluginHandle {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn category(&self) -> PluginCategory {
        self.spec.category
    }

    fn required(&self) -> bool {
        self.spec.required
    }

    fn handles(&self, flow: PluginFlow) -> bool {
        self.spec.handles(flow)
    }

    fn healthy(&self) -> bool {
        self.is_healthy()
    }

    async fn handle(
        &self,
        flow: PluginFlow,
        payload: &Value,
        ctx: &GovernanceContext,
    ) -> Result<PluginDecision> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("plugin {} never connected", self.spec.name)))?;
        let method = match flow {
            PluginFlow::Request => methods::HANDLE_REQUEST,
            PluginFlow::Response => methods::HANDLE_RESPONSE,
        };
        let params = serde_json::json!({
            "payload": payload,
            "context": ctx,
        });
        let value = client.call(method, Some(params), self.timeout()).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Manager owning every configured plugin process.
pub struct PluginManager {
    socket_dir: PathBuf,
    /// Declaration order is execution order within a category.
    plugins: Mutex<Vec<Arc<PluginHandle>>>,
}

impl PluginManager {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            plugins: Mutex::new(Vec::new()),
        }
    }

    /// A socket directory under the system tmp dir, namespaced per
    /// process so parallel gateways never collide.
    pub fn default_socket_dir() -> PathBuf {
        std::env::temp_dir().join(format!("mcpv-{}", std::process::id()))
    }

    fn socket_path(&self, spec: &PluginSpec) -> Result<PathBuf> {
        let path = self.socket_dir.join(format!("{}.sock", spec.name));
        let len = path.as_os_str().len();
        if len > MAX_SOCKET_PATH {
            return Err(Error::Config(format!(
                "socket path for plugin {:?} is {len} bytes (max {MAX_SOCKET_PATH}); use a shorter socket dir",
                spec.name
            )));
        }
        Ok(path)
    }

    /// Start every enabled plugin in declaration order. A required
    /// plugin failing aborts startup (already-started plugins are
    /// stopped); optional failures leave an unhealthy handle behind.
    pub async fn start_all(&self, specs: &[PluginSpec]) -> Result<()> {
        std::fs::create_dir_all(&self.socket_dir)
            .map_err(|e| Error::io("plugin_socket_dir", e))?;

        for spec in specs {
            if spec.disabled {
                tracing::info!(plugin = %spec.name, "plugin disabled, not starting");
                continue;
            }
            match self.start_plugin(spec).await {
                Ok(handle) => {
                    self.plugins.lock().push(handle);
                }
                Err(e) if spec.required => {
                    tracing::error!(plugin = %spec.name, error = %e, "required plugin failed to start");
                    self.stop_all().await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(plugin = %spec.name, error = %e, "optional plugin failed to start, marked unhealthy");
                    self.plugins.lock().push(Arc::new(PluginHandle {
                        spec: spec.clone(),
                        client: None,
                        child: tokio::sync::Mutex::new(None),
                        socket_path: self.socket_dir.join(format!("{}.sock", spec.name)),
                        healthy: AtomicBool::new(false),
                        stopped: AtomicBool::new(false),
                    }));
                }
            }
        }
        Ok(())
    }

    async fn start_plugin(&self, spec: &PluginSpec) -> Result<Arc<PluginHandle>> {
        let socket_path = self.socket_path(spec)?;
        // A stale socket from a crashed previous run blocks the bind.
        let _ = std::fs::remove_file(&socket_path);

        let mut cmd = tokio::process::Command::new(&spec.cmd);
        cmd.args(&spec.args)
            .env("MCPV_PLUGIN_SOCKET", &socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let child = cmd.spawn().map_err(|e| Error::io("plugin_spawn", e))?;

        let handshake = Duration::from_millis(spec.handshake_timeout_ms);
        let client = PluginClient::dial(&socket_path, handshake).await?;

        let metadata = client.get_metadata(handshake).await?;
        if let Some(pinned) = &spec.commit_hash {
            match &metadata.commit_hash {
                Some(reported) if reported == pinned => {}
                reported => {
                    return Err(Error::FailedPrecondition {
                        op: "plugin_handshake",
                        message: format!(
                            "plugin {:?} commit hash mismatch: pinned {pinned:?}, reported {reported:?}",
                            spec.name
                        ),
                    });
                }
            }
        }

        client.configure(spec.config_json.clone(), handshake).await?;
        client.check_ready(handshake).await?;

        tracing::info!(
            plugin = %spec.name,
            version = %metadata.version,
            category = ?spec.category,
            "plugin ready"
        );
        Ok(Arc::new(PluginHandle {
            spec: spec.clone(),
            client: Some(client),
            child: tokio::sync::Mutex::new(Some(child)),
            socket_path,
            healthy: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Stop everything (reverse declaration order) and clear the list.
    pub async fn stop_all(&self) {
        let handles: Vec<Arc<PluginHandle>> = {
            let mut plugins = self.plugins.lock();
            plugins.drain(..).collect()
        };
        for handle in handles.into_iter().rev() {
            handle.stop().await;
        }
        let _ = std::fs::remove_dir(&self.socket_dir);
    }

    /// Apply a plugin diff during reload: stop removed, start added,
    /// restart updated (a config change re-runs the configure handshake
    /// from a clean process).
    pub async fn apply_changes(&self, next: &[PluginSpec]) -> Result<()> {
        let current: Vec<Arc<PluginHandle>> = self.plugins.lock().clone();

        // Stop plugins that disappeared or changed.
        let mut kept = Vec::new();
        for handle in current {
            match next.iter().find(|s| s.name == handle.spec.name) {
                Some(spec) if *spec == handle.spec => kept.push(handle),
                _ => handle.stop().await,
            }
        }
        *self.plugins.lock() = kept;

        // Start plugins that are new or changed.
        let running: Vec<String> = self
            .plugins
            .lock()
            .iter()
            .map(|h| h.spec.name.clone())
            .collect();
        let to_start: Vec<PluginSpec> = next
            .iter()
            .filter(|s| !s.disabled && !running.contains(&s.name))
            .cloned()
            .collect();
        if !to_start.is_empty() {
            self.start_all(&to_start).await?;
        }
        Ok(())
    }

    /// Build the pipeline over the current handles.
    pub fn pipeline(&self) -> Pipeline {
        let plugins: Vec<Arc<dyn GovernancePlugin>> = self
            .plugins
            .lock()
            .iter()
            .map(|h| h.clone() as Arc<dyn GovernancePlugin>)
            .collect();
        Pipeline::new(plugins)
    }

    /// Health summary for status surfaces.
    pub fn statuses(&self) -> Vec<(String, bool)> {
        self.plugins
            .lock()
            .iter()
            .map(|h| (h.spec.name.clone(), h.is_healthy()))
            .collect()
    }
}
