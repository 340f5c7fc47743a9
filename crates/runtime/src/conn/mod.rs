//! Transport connection — one duplex JSON-RPC channel to a downstream.
//!
//! A [`Conn`] exposes `call`/`notify`/`ping` and internally runs a reader
//! loop (stdio) or per-exchange dispatch (streamable-http) that routes:
//! - responses to the pending-id table (ids normalized across number
//!   shapes),
//! - server-initiated requests to the sampling/elicitation handlers (or a
//!   `method not supported` error),
//! - `notifications/*/list_changed` into the [`ListChangeHub`].
//!
//! `call` is safe under concurrent tasks; each request takes a fresh id
//! and no id is reused while in flight. Close fails all pending calls
//! with `ConnectionClosed`.

pub mod http;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mcpv_domain::{Error, Result, SpecKey};
use mcpv_proto::jsonrpc::{self, Incoming, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerRequest};
use mcpv_proto::mcp::{methods, ListChangedKind};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::oneshot;

use crate::hub::ListChangeHub;
use crate::launcher::LaunchedIo;
use http::HttpChannel;

/// Handler for a server-initiated request (sampling or elicitation).
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle(
        &self,
        spec_key: &SpecKey,
        params: Option<Value>,
    ) -> std::result::Result<Value, JsonRpcError>;
}

/// Optional handlers wired by the runtime. Capabilities are advertised to
/// the downstream iff the matching handler exists.
#[derive(Clone, Default)]
pub struct ConnHandlers {
    pub sampling: Option<Arc<dyn ServerRequestHandler>>,
    pub elicitation: Option<Arc<dyn ServerRequestHandler>>,
}

enum Channel {
    Stdio {
        stdin: tokio::sync::Mutex<ChildStdin>,
    },
    Http {
        channel: HttpChannel,
    },
}

struct ConnInner {
    spec_key: SpecKey,
    channel: Channel,
    pending: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    hub: ListChangeHub,
    handlers: ConnHandlers,
}

/// A live connection to one downstream instance.
pub struct Conn {
    inner: Arc<ConnInner>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Conn {
    /// Wrap launched I/O into a connection. For stdio this spawns the
    /// reader loop immediately.
    pub fn connect(
        spec_key: SpecKey,
        io: LaunchedIo,
        hub: ListChangeHub,
        handlers: ConnHandlers,
    ) -> Arc<Conn> {
        let (channel, stdout) = match io {
            LaunchedIo::Stdio { stdin, stdout } => (
                Channel::Stdio {
                    stdin: tokio::sync::Mutex::new(stdin),
                },
                Some(stdout),
            ),
            LaunchedIo::Http { channel } => (Channel::Http { channel }, None),
        };

        let inner = Arc::new(ConnInner {
            spec_key,
            channel,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            hub,
            handlers,
        });

        let reader = stdout.map(|stdout| {
            let inner = inner.clone();
            tokio::spawn(async move { read_loop(inner, stdout).await })
        });

        Arc::new(Conn {
            inner,
            reader: Mutex::new(reader),
        })
    }

    pub fn spec_key(&self) -> &SpecKey {
        &self.inner.spec_key
    }

    /// Whether the downstream advertised sampling/elicitation handlers.
    pub fn handlers(&self) -> &ConnHandlers {
        &self.inner.handlers
    }

    /// Send a request and wait for its response. Concurrency-safe; the
    /// pending-id table matches responses to callers.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        match &self.inner.channel {
            Channel::Stdio { .. } => {
                let (tx, rx) = oneshot::channel();
                self.inner.pending.lock().insert(id, tx);
                // Close may race the insert; a second check keeps the
                // entry from outliving the cleared table.
                if self.inner.closed.load(Ordering::SeqCst) {
                    self.inner.pending.lock().remove(&id);
                    return Err(Error::ConnectionClosed);
                }

                if let Err(e) = self.inner.send(serde_json::to_value(&request)?).await {
                    self.inner.pending.lock().remove(&id);
                    return Err(e);
                }

                match rx.await {
                    Ok(response) => response.into_result().map_err(Error::from),
                    // Sender dropped: the reader loop observed EOF.
                    Err(_) => Err(Error::ConnectionClosed),
                }
            }
            Channel::Http { channel } => {
                let messages = channel.exchange(serde_json::to_value(&request)?).await?;
                let mut result = None;
                for message in messages {
                    match jsonrpc::classify(&message.to_string()) {
                        Ok(Incoming::Response(resp)) if resp.id_u64() == Some(id) => {
                            result = Some(resp);
                        }
                        Ok(other) => dispatch(&self.inner, other),
                        Err(e) => {
                            tracing::debug!(spec_key = %self.inner.spec_key.short(), error = %e, "unparseable message from downstream");
                        }
                    }
                }
                match result {
                    Some(resp) => resp.into_result().map_err(Error::from),
                    None => Err(Error::Internal(format!(
                        "no response to {method} from downstream"
                    ))),
                }
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let notification = match params {
            Some(params) => JsonRpcNotification::with_params(method, params),
            None => JsonRpcNotification::new(method),
        };
        match &self.inner.channel {
            Channel::Stdio { .. } => self.inner.send(serde_json::to_value(&notification)?).await,
            Channel::Http { channel } => {
                let messages = channel.exchange(serde_json::to_value(&notification)?).await?;
                for message in messages {
                    if let Ok(incoming) = jsonrpc::classify(&message.to_string()) {
                        dispatch(&self.inner, incoming);
                    }
                }
                Ok(())
            }
        }
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<()> {
        self.call(methods::PING, None).await.map(|_| ())
    }

    /// The negotiated protocol version is advertised on later HTTP
    /// requests; no-op for stdio.
    pub fn set_protocol_version(&self, version: &str) {
        if let Channel::Http { channel } = &self.inner.channel {
            channel.set_protocol_version(version);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection: abort the reader and fail all pending calls
    /// with `ConnectionClosed`. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // Dropping the senders wakes every waiter with ConnectionClosed.
        self.inner.pending.lock().clear();
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

impl ConnInner {
    async fn send(&self, message: Value) -> Result<()> {
        match &self.channel {
            Channel::Stdio { stdin } => {
                let line = serde_json::to_string(&message)?;
                let mut stdin = stdin.lock().await;
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|_| Error::ConnectionClosed)?;
                stdin.write_all(b"\n").await.map_err(|_| Error::ConnectionClosed)?;
                stdin.flush().await.map_err(|_| Error::ConnectionClosed)?;
                Ok(())
            }
            Channel::Http { channel } => {
                channel.exchange(message).await.map(|_| ())
            }
        }
    }
}

/// Reader loop for stdio transports: classify and dispatch each line.
async fn read_loop(inner: Arc<ConnInner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !trimmed.starts_with('{') {
                    // Misbehaving servers log to stdout; skip the noise.
                    tracing::debug!(spec_key = %inner.spec_key.short(), line = %trimmed, "skipping non-JSON line from downstream stdout");
                    continue;
                }
                match jsonrpc::classify(trimmed) {
                    Ok(incoming) => dispatch(&inner, incoming),
                    Err(e) => {
                        tracing::debug!(spec_key = %inner.spec_key.short(), error = %e, "unparseable message from downstream");
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    inner.closed.store(true, Ordering::SeqCst);
    // Fail everything still waiting.
    inner.pending.lock().clear();
    tracing::debug!(spec_key = %inner.spec_key.short(), "downstream stdout closed");
}

/// Route one classified incoming message.
fn dispatch(inner: &Arc<ConnInner>, incoming: Incoming) {
    match incoming {
        Incoming::Response(response) => {
            let Some(id) = response.id_u64() else {
                tracing::debug!(spec_key = %inner.spec_key.short(), "response with non-numeric id");
                return;
            };
            let sender = inner.pending.lock().remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => {
                    tracing::debug!(spec_key = %inner.spec_key.short(), id, "response for unknown request id");
                }
            }
        }
        Incoming::Request(request) => {
            let handler = match request.method.as_str() {
                methods::SAMPLING_CREATE_MESSAGE => inner.handlers.sampling.clone(),
                methods::ELICITATION_CREATE => inner.handlers.elicitation.clone(),
                _ => None,
            };
            let inner = inner.clone();
            tokio::spawn(async move {
                let response = answer_server_request(&inner, handler, &request).await;
                if let Err(e) = inner.send(response).await {
                    tracing::debug!(spec_key = %inner.spec_key.short(), error = %e, "failed to answer server request");
                }
            });
        }
        Incoming::Notification(notification) => {
            match ListChangedKind::from_method(&notification.method) {
                Some(kind) => inner.hub.publish(kind, inner.spec_key.clone()),
                None => {
                    tracing::debug!(
                        spec_key = %inner.spec_key.short(),
                        method = %notification.method,
                        "ignoring downstream notification"
                    );
                }
            }
        }
    }
}

async fn answer_server_request(
    inner: &Arc<ConnInner>,
    handler: Option<Arc<dyn ServerRequestHandler>>,
    request: &ServerRequest,
) -> Value {
    let response = match handler {
        Some(handler) => {
            match handler
                .handle(&inner.spec_key, request.params.clone())
                .await
            {
                Ok(result) => JsonRpcResponse::success(request.id.clone(), result),
                Err(error) => JsonRpcResponse::failure(request.id.clone(), error),
            }
        }
        None => JsonRpcResponse::failure(
            request.id.clone(),
            JsonRpcError::method_not_found(&request.method),
        ),
    };
    serde_json::to_value(&response).unwrap_or(Value::Null)
}
