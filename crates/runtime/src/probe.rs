//! Diagnostics probe — a ring buffer of structured phase events emitted
//! at the launcher/transport/lifecycle/scheduler boundaries.
//!
//! Writes never block: the ring is guarded by a `try_lock` and a write
//! that cannot take the lock increments the drop counter instead.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcpv_domain::SpecKey;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Phase boundary names. Kept as constants so emitters and dashboards
/// agree on spelling.
pub mod steps {
    pub const LAUNCHER_START: &str = "launcher_start";
    pub const TRANSPORT_CONNECT: &str = "transport_connect";
    pub const INITIALIZE_CALL: &str = "initialize_call";
    pub const INITIALIZE_RESPONSE: &str = "initialize_response";
    pub const NOTIFY_INITIALIZED: &str = "notify_initialized";
    pub const INSTANCE_READY: &str = "instance_ready";
    pub const SET_MIN_READY: &str = "set_min_ready";
    pub const SNAPSHOT_DONE: &str = "snapshot_done";
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Enter,
    Exit,
    Error,
}

/// One probe event.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsEvent {
    pub spec_key: String,
    pub server_name: String,
    pub attempt_id: String,
    pub step: &'static str,
    pub phase: Phase,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
}

/// Per-spec "where is it now" summary derived from enter/exit pairs.
#[derive(Debug, Clone, Serialize)]
pub struct StuckEntry {
    pub server_name: String,
    pub step: &'static str,
    pub since: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Export mode. `Safe` redacts sensitive attribute fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Safe,
    Raw,
}

const REDACTED_NAMES: &[&str] = &["token", "secret", "authorization", "api_key", "cookie"];

/// Ring buffer of diagnostics events.
pub struct DiagnosticsProbe {
    ring: Mutex<VecDeque<DiagnosticsEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    /// Current step per spec, for the stuck summary.
    inflight: Mutex<HashMap<SpecKey, StuckEntry>>,
}

impl DiagnosticsProbe {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Record an event. Non-blocking: contention drops the event.
    #[allow(clippy::too_many_arguments)]
    pub fn record(&self, spec_key: &SpecKey, server_name: &str, attempt_id: &str, step: &'static str, phase: Phase, duration: Option<Duration>, error: Option<&str>, attributes: Option<Value>) {
        let event = DiagnosticsEvent {
            spec_key: spec_key.as_str().to_string(),
            server_name: server_name.to_string(),
            attempt_id: attempt_id.to_string(),
            step,
            phase,
            ts: Utc::now(),
            duration_ms: duration.map(|d| d.as_millis() as u64),
            error: error.map(str::to_string),
            attributes,
        };

        match phase {
            Phase::Enter => {
                if let Some(mut inflight) = self.inflight.try_lock() {
                    inflight.insert(
                        spec_key.clone(),
                        StuckEntry {
                            server_name: server_name.to_string(),
                            step,
                            since: event.ts,
                            duration_ms: 0,
                            last_error: None,
                        },
                    );
                }
            }
            Phase::Exit => {
                if let Some(mut inflight) = self.inflight.try_lock() {
                    if step == steps::INSTANCE_READY {
                        inflight.remove(spec_key);
                    }
                }
            }
            Phase::Error => {
                if let Some(mut inflight) = self.inflight.try_lock() {
                    if let Some(entry) = inflight.get_mut(spec_key) {
                        entry.last_error = event.error.clone();
                    }
                }
            }
        }

        match self.ring.try_lock() {
            Some(mut ring) => {
                if ring.len() == self.capacity {
                    ring.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                ring.push_back(event);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events in arrival order, optionally filtered by spec.
    pub fn timeline(&self, spec_key: Option<&SpecKey>) -> Vec<DiagnosticsEvent> {
        let ring = self.ring.lock();
        ring.iter()
            .filter(|e| spec_key.map(|k| e.spec_key == k.as_str()).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Per-spec current step + elapsed, for the "stuck" summary.
    pub fn stuck_summary(&self) -> Vec<(SpecKey, StuckEntry)> {
        let now = Utc::now();
        let inflight = self.inflight.lock();
        let mut out: Vec<(SpecKey, StuckEntry)> = inflight
            .iter()
            .map(|(k, entry)| {
                let mut entry = entry.clone();
                entry.duration_ms =
                    (now - entry.since).num_milliseconds().max(0) as u64;
                (k.clone(), entry)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// A spec was dropped from the catalog; forget its inflight state.
    pub fn forget(&self, spec_key: &SpecKey) {
        self.inflight.lock().remove(spec_key);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Export the timeline with the given mode applied to attributes.
    pub fn export(&self, mode: ExportMode) -> Vec<DiagnosticsEvent> {
        let mut events = self.timeline(None);
        if mode == ExportMode::Safe {
            for event in &mut events {
                if let Some(attrs) = &mut event.attributes {
                    redact(attrs);
                }
            }
        }
        events
    }
}

impl Default for DiagnosticsProbe {
    fn default() -> Self {
        Self::new(2048)
    }
}

/// Replace the values of sensitively-named fields, recursively.
fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let lowered = key.to_lowercase();
                if REDACTED_NAMES.iter().any(|n| lowered.contains(n)) {
                    *v = Value::String("[redacted]".into());
                } else {
                    redact(v);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact(item);
            }
        }
        _ => {}
    }
}
