//! Per-spec pool state. All fields are guarded by the pool mutex in
//! [`super::Scheduler`]; nothing here takes locks of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use mcpv_domain::config::{ServerSpec, Strategy};
use tokio::sync::Notify;

use crate::instance::{Instance, InstanceState};

/// A stateful-session binding from a routing key to an instance.
pub(crate) struct StickyBinding {
    pub instance_id: String,
    pub last_access: Instant,
}

/// Mutable state of one pool.
pub(crate) struct PoolState {
    pub spec: Arc<ServerSpec>,
    /// Instances admitted to the pool (any state except Draining).
    pub instances: Vec<Arc<Instance>>,
    /// Instances finishing their busy slots before stopping.
    pub draining: Vec<Arc<Instance>>,
    /// routing key → binding (stateful strategy only).
    pub sticky: HashMap<String, StickyBinding>,
    /// Bumped by StopSpec; starts admitted only under their own generation.
    pub generation: u64,
    pub starts_in_flight: u32,
    /// Desired warm size, set by the activation bookkeeping.
    pub min_ready: u32,
}

impl PoolState {
    pub fn new(spec: Arc<ServerSpec>) -> Self {
        Self {
            spec,
            instances: Vec::new(),
            draining: Vec::new(),
            sticky: HashMap::new(),
            generation: 0,
            starts_in_flight: 0,
            min_ready: 0,
        }
    }

    /// Instance cap for this pool.
    pub fn max_instances(&self) -> usize {
        match self.spec.strategy {
            Strategy::Singleton => 1,
            _ => self.spec.max_concurrent as usize,
        }
    }

    pub fn ready_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.state() == InstanceState::Ready)
            .count()
    }

    pub fn busy_sum(&self) -> u32 {
        self.instances.iter().map(|i| i.busy()).sum()
    }

    /// `busySum / (maxConcurrent × maxInstances)` for the saturation gauge.
    pub fn capacity_ratio(&self) -> f64 {
        let denominator = self.spec.max_concurrent as f64 * self.max_instances() as f64;
        if denominator == 0.0 {
            0.0
        } else {
            self.busy_sum() as f64 / denominator
        }
    }

    /// The Ready instance with the lowest busy count that still has a
    /// free slot.
    pub fn least_busy_ready(&self) -> Option<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|i| i.state() == InstanceState::Ready)
            .filter(|i| i.busy() < self.spec.max_concurrent)
            .min_by_key(|i| i.busy())
            .cloned()
    }

    pub fn instance_by_id(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.iter().find(|i| i.id == id).cloned()
    }

    pub fn remove_instance(&mut self, id: &str) {
        self.instances.retain(|i| i.id != id);
    }

    /// Whether any sticky binding points at the instance.
    pub fn has_binding(&self, instance_id: &str) -> bool {
        self.sticky.values().any(|b| b.instance_id == instance_id)
    }

    /// Room for another start under the current strategy and cap.
    pub fn can_start(&self) -> bool {
        let live = self.instances.len() + self.starts_in_flight as usize;
        match self.spec.strategy {
            Strategy::Singleton => live == 0,
            _ => live < self.max_instances(),
        }
    }
}

/// One pool: its state plus the condition waiters park on.
pub(crate) struct Pool {
    pub state: parking_lot::Mutex<PoolState>,
    pub notify: Notify,
}

impl Pool {
    pub fn new(spec: Arc<ServerSpec>) -> Arc<Pool> {
        Arc::new(Pool {
            state: parking_lot::Mutex::new(PoolState::new(spec)),
            notify: Notify::new(),
        })
    }
}
