//! In-process metrics recorder.
//!
//! The scrape endpoint lives outside the core; this recorder only keeps
//! labeled counters and gauges in memory, exposes the `Observe*`/`add`
//! methods the runtime calls, and renders a text dump for the
//! diagnostics export bundle.

use std::collections::BTreeMap;
use std::time::Duration;

use mcpv_domain::SpecKey;
use mcpv_runtime::scheduler::SchedulerMetrics;
use parking_lot::Mutex;

/// Labeled counter/gauge store.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
    /// (count, total milliseconds) per series.
    durations: Mutex<BTreeMap<String, (u64, u64)>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, series: impl Into<String>, delta: u64) {
        *self.counters.lock().entry(series.into()).or_insert(0) += delta;
    }

    pub fn set_gauge(&self, series: impl Into<String>, value: f64) {
        self.gauges.lock().insert(series.into(), value);
    }

    fn observe_duration(&self, series: String, duration: Duration) {
        let mut durations = self.durations.lock();
        let entry = durations.entry(series).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += duration.as_millis() as u64;
    }

    /// Route outcome observation emitted by the metric router.
    #[allow(clippy::too_many_arguments)]
    pub fn observe_route(
        &self,
        server_type: &SpecKey,
        client: &str,
        profile: &str,
        status: &str,
        reason: &str,
        duration: Duration,
    ) {
        let labels = format!(
            "server_type={},client={client},profile={profile},status={status},reason={reason}",
            server_type.short()
        );
        self.add(format!("route_total{{{labels}}}"), 1);
        self.observe_duration(format!("route_duration_ms{{{labels}}}"), duration);
    }

    /// Plain-text dump for the export bundle.
    pub fn text_dump(&self) -> String {
        let mut out = String::new();
        for (series, value) in self.counters.lock().iter() {
            out.push_str(&format!("{series} {value}\n"));
        }
        for (series, value) in self.gauges.lock().iter() {
            out.push_str(&format!("{series} {value}\n"));
        }
        for (series, (count, total_ms)) in self.durations.lock().iter() {
            out.push_str(&format!("{series}_count {count}\n"));
            out.push_str(&format!("{series}_sum_ms {total_ms}\n"));
        }
        out
    }
}

impl SchedulerMetrics for Metrics {
    fn observe_pool_capacity(&self, spec_key: &SpecKey, ratio: f64) {
        self.set_gauge(
            format!("pool_capacity_ratio{{server_type={}}}", spec_key.short()),
            ratio,
        );
    }

    fn inc_instance_stopped(&self, reason: &str) {
        self.add(format!("instances_stopped_total{{reason={reason}}}"), 1);
    }
}
