//! Launcher — starts or connects to a downstream and hands its I/O to the
//! transport layer.
//!
//! For stdio specs this spawns the child process with the configured
//! env/cwd, mirrors each stderr line as a tagged log record, and returns a
//! stop handle that escalates SIGTERM → SIGKILL after a grace period. For
//! streamable-http specs there is no process; the "I/O" is an HTTP channel.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpv_domain::config::{ProxyConfig, ServerSpec, TransportKind};
use mcpv_domain::{Error, Result, SpecKey};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::conn::http::HttpChannel;
use crate::logs::{LogHub, LogRecord};

/// Grace period between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The I/O a launch produced.
pub enum LaunchedIo {
    Stdio {
        stdin: ChildStdin,
        stdout: ChildStdout,
    },
    Http {
        channel: HttpChannel,
    },
}

/// A launched (or connected) downstream, ready for the transport layer.
pub struct Launched {
    pub io: LaunchedIo,
    pub stop: StopHandle,
}

/// Idempotent stop for a launched downstream.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

struct StopInner {
    /// `None` for HTTP endpoints (nothing to signal).
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    stopped: AtomicBool,
}

impl StopHandle {
    fn for_child(child: Child) -> Self {
        let pid = child.id();
        Self {
            inner: Arc::new(StopInner {
                child: Mutex::new(Some(child)),
                pid,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// A handle with nothing to stop (HTTP endpoints, embedded fakes).
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(StopInner {
                child: Mutex::new(None),
                pid: None,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Stop the downstream: SIGTERM, then SIGKILL after the grace period.
    /// Safe to call any number of times; later calls are no-ops.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.inner.child.lock().await;
        let Some(mut child) = guard.take() else {
            return;
        };

        if let Some(pid) = self.inner.pid {
            // SIGTERM first so the server can flush and exit cleanly.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                // A killed child is normal termination for our purposes.
                tracing::debug!(?status, "downstream process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for downstream process");
            }
            Err(_) => {
                tracing::warn!("downstream did not exit within grace period, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill downstream process");
                }
            }
        }
    }
}

/// Trait seam for starting downstreams; the scheduler/lifecycle tests
/// inject fakes through this.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(&self, spec_key: &SpecKey, spec: &ServerSpec) -> Result<Launched>;
}

/// Production launcher covering both transports.
pub struct StdioLauncher {
    logs: LogHub,
    runtime_proxy: ProxyConfig,
}

impl StdioLauncher {
    pub fn new(logs: LogHub, runtime_proxy: ProxyConfig) -> Self {
        Self {
            logs,
            runtime_proxy,
        }
    }

    fn spawn_child(&self, spec_key: &SpecKey, spec: &ServerSpec) -> Result<(Child, ChildStdin, ChildStdout)> {
        let mut cmd = tokio::process::Command::new(&spec.cmd);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| Error::io("launcher_start", e))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::io(
                "launcher_start",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no child stdin"),
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::io(
                "launcher_start",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no child stdout"),
            )
        })?;

        if let Some(stderr) = child.stderr.take() {
            let logs = self.logs.clone();
            let server_type = spec_key.as_str().to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(
                        log_source = "downstream",
                        stream = "stderr",
                        server_type = %server_type,
                        line = %line,
                        "downstream stderr"
                    );
                    logs.publish(LogRecord::downstream_stderr(server_type.clone(), line));
                }
            });
        }

        Ok((child, stdin, stdout))
    }
}

#[async_trait]
impl Launcher for StdioLauncher {
    async fn start(&self, spec_key: &SpecKey, spec: &ServerSpec) -> Result<Launched> {
        match spec.effective_transport() {
            TransportKind::Stdio => {
                let (child, stdin, stdout) = self.spawn_child(spec_key, spec)?;
                tracing::info!(
                    server = %spec.name,
                    spec_key = %spec_key.short(),
                    cmd = %spec.cmd,
                    "downstream process spawned"
                );
                Ok(Launched {
                    io: LaunchedIo::Stdio { stdin, stdout },
                    stop: StopHandle::for_child(child),
                })
            }
            TransportKind::StreamableHttp => {
                let channel = HttpChannel::connect(spec, &self.runtime_proxy)?;
                tracing::info!(
                    server = %spec.name,
                    spec_key = %spec_key.short(),
                    endpoint = %spec.endpoint.as_deref().unwrap_or_default(),
                    "streamable-http endpoint prepared"
                );
                Ok(Launched {
                    io: LaunchedIo::Http { channel },
                    stop: StopHandle::noop(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_stop_is_idempotent() {
        let handle = StopHandle::noop();
        handle.stop().await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn stdio_launch_spawns_and_stops() {
        let spec: ServerSpec = serde_yaml::from_str("name: cat\ncmd: cat\n").unwrap();
        let launcher = StdioLauncher::new(LogHub::default(), ProxyConfig::default());
        let key = SpecKey::of(&spec);
        let launched = launcher.start(&key, &spec).await.unwrap();
        assert!(matches!(launched.io, LaunchedIo::Stdio { .. }));
        launched.stop.stop().await;
        // Second stop is a no-op.
        launched.stop.stop().await;
    }

    #[tokio::test]
    async fn missing_command_fails() {
        let spec: ServerSpec =
            serde_yaml::from_str("name: ghost\ncmd: /nonexistent/mcpv-test-binary\n").unwrap();
        let launcher = StdioLauncher::new(LogHub::default(), ProxyConfig::default());
        let key = SpecKey::of(&spec);
        assert!(launcher.start(&key, &spec).await.is_err());
    }
}
