//! Governance executor — wraps a routed call with the request and
//! response pipeline phases.
//!
//! List/watch operations run the request phase only (there is no
//! downstream response to govern); call/read/get run both phases.
//! Downstream protocol errors (including `-32042`) pass through `next`
//! untouched — a rejection can only originate from the pipeline itself.

use std::future::Future;
use std::sync::Arc;

use mcpv_domain::config::PluginFlow;
use mcpv_domain::Result;
use parking_lot::RwLock;
use serde_json::Value;

use crate::pipeline::{GovernanceContext, Pipeline};

/// Executes the governance phases around a request. The pipeline is
/// swappable so plugin reloads do not tear down in-flight executors.
pub struct Executor {
    pipeline: RwLock<Arc<Pipeline>>,
}

impl Executor {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: RwLock::new(Arc::new(pipeline)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Pipeline::default())
    }

    /// Swap the pipeline (plugin reload).
    pub fn replace_pipeline(&self, pipeline: Pipeline) {
        *self.pipeline.write() = Arc::new(pipeline);
    }

    fn current(&self) -> Arc<Pipeline> {
        self.pipeline.read().clone()
    }

    /// Request phase only (list/watch operations).
    pub async fn check_request(&self, ctx: &GovernanceContext, request: Value) -> Result<Value> {
        self.current().run(PluginFlow::Request, request, ctx).await
    }

    /// Full wrap: request phase, the routed call, response phase.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &GovernanceContext,
        request: Value,
        next: F,
    ) -> Result<Value>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let pipeline = self.current();
        let request = pipeline.run(PluginFlow::Request, request, ctx).await?;
        let response = next(request).await?;
        pipeline.run(PluginFlow::Response, response, ctx).await
    }
}
