//! Request router — resolves a spec to an instance via the scheduler,
//! applies the route timeout and allow-start policy, and stages errors
//! so metrics can tell a cold-start timeout from an execution timeout.
//!
//! Release is guaranteed by a drop guard, so cancellation anywhere in
//! the call path still returns the busy slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mcpv_domain::{Error, SpecKey};
use mcpv_runtime::{Instance, Scheduler};
use serde_json::Value;

use crate::metrics::Metrics;

/// Per-request routing metadata (set by control-plane discovery).
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub client: Option<String>,
    pub profile: Option<String>,
}

/// Routing policy for one call.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// `false` routes only to Ready instances (list refresh paths).
    pub allow_start: bool,
    /// Sticky key for stateful pools.
    pub routing_key: Option<String>,
}

impl RouteOptions {
    pub fn allow_start(routing_key: Option<String>) -> Self {
        Self {
            allow_start: true,
            routing_key,
        }
    }

    pub fn ready_only() -> Self {
        Self::default()
    }
}

/// Which portion of the route path failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStage {
    Decode,
    Validate,
    Acquire,
    Call,
}

impl RouteStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStage::Decode => "decode",
            RouteStage::Validate => "validate",
            RouteStage::Acquire => "acquire",
            RouteStage::Call => "call",
        }
    }
}

/// A staged routing failure.
#[derive(Debug)]
pub struct RouteError {
    pub stage: RouteStage,
    /// Metric reason label (`timeout_cold_start`, `timeout_execution`,
    /// `conn_closed`, ...).
    pub reason: &'static str,
    pub cause: Error,
}

impl RouteError {
    fn new(stage: RouteStage, reason: &'static str, cause: Error) -> Self {
        Self {
            stage,
            reason,
            cause,
        }
    }

    pub fn into_error(self) -> Error {
        self.cause
    }
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "route failed at {} ({}): {}",
            self.stage.as_str(),
            self.reason,
            self.cause
        )
    }
}

/// Returns the busy slot even when the call future is dropped.
struct ReleaseGuard {
    scheduler: Arc<Scheduler>,
    instance: Arc<Instance>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.scheduler.release(&self.instance);
    }
}

pub struct Router {
    scheduler: Arc<Scheduler>,
    route_timeout: Duration,
}

impl Router {
    pub fn new(scheduler: Arc<Scheduler>, route_timeout: Duration) -> Self {
        Self {
            scheduler,
            route_timeout,
        }
    }

    /// Route one JSON-RPC call to the spec's pool.
    pub async fn route(
        &self,
        spec_key: &SpecKey,
        method: &str,
        params: Option<Value>,
        opts: &RouteOptions,
    ) -> Result<Value, RouteError> {
        let deadline = Instant::now() + self.route_timeout;
        let routing_key = opts.routing_key.as_deref();

        // Stage: acquire.
        let acquire = async {
            if opts.allow_start {
                self.scheduler.acquire(spec_key, routing_key).await
            } else {
                self.scheduler.acquire_ready(spec_key, routing_key).await
            }
        };
        let instance = match tokio::time::timeout(self.route_timeout, acquire).await {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                let reason = match &e {
                    Error::NoReadyInstance => "no_ready_instance",
                    Error::NoCapacity => "no_capacity",
                    Error::SpecNotFound(_) => "spec_not_found",
                    _ => "acquire_failed",
                };
                return Err(RouteError::new(RouteStage::Acquire, reason, e));
            }
            Err(_) => {
                return Err(RouteError::new(
                    RouteStage::Acquire,
                    "timeout_cold_start",
                    Error::DeadlineExceeded { op: "acquire" },
                ));
            }
        };

        let guard = ReleaseGuard {
            scheduler: self.scheduler.clone(),
            instance: instance.clone(),
        };

        // Stage: call, bounded by what remains of the route budget.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = tokio::time::timeout(remaining, instance.conn.call(method, params)).await;
        drop(guard);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let reason = match &e {
                    Error::ConnectionClosed => "conn_closed",
                    Error::Protocol { .. } => "protocol_error",
                    _ => "call_failed",
                };
                Err(RouteError::new(RouteStage::Call, reason, e))
            }
            Err(_) => Err(RouteError::new(
                RouteStage::Call,
                "timeout_execution",
                Error::DeadlineExceeded { op: "call" },
            )),
        }
    }
}

/// Thin decorator emitting route metrics without embedding them in the
/// routing logic.
pub struct MetricRouter {
    inner: Router,
    metrics: Arc<Metrics>,
}

impl MetricRouter {
    pub fn new(inner: Router, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }

    pub async fn route(
        &self,
        ctx: &RouteContext,
        spec_key: &SpecKey,
        method: &str,
        params: Option<Value>,
        opts: &RouteOptions,
    ) -> Result<Value, RouteError> {
        let started = Instant::now();
        let result = self.inner.route(spec_key, method, params, opts).await;
        let (status, reason) = match &result {
            Ok(_) => ("ok", "ok"),
            Err(e) => ("error", e.reason),
        };
        self.metrics.observe_route(
            spec_key,
            ctx.client.as_deref().unwrap_or(""),
            ctx.profile.as_deref().unwrap_or(""),
            status,
            reason,
            started.elapsed(),
        );
        result
    }
}

/// Index refreshes list through the router with starts disabled, so a
/// list operation can never cold-start a downstream.
#[async_trait::async_trait]
impl mcpv_index::ListFetcher for MetricRouter {
    async fn fetch(&self, spec_key: &SpecKey, method: &'static str) -> mcpv_domain::Result<Value> {
        self.route(
            &RouteContext::default(),
            spec_key,
            method,
            None,
            &RouteOptions::ready_only(),
        )
        .await
        .map_err(RouteError::into_error)
    }
}
