//! Observability service: log streaming, runtime/init status watches,
//! and the diagnostics export bundle.

use std::collections::HashSet;
use std::sync::Arc;

use mcpv_domain::SpecKey;
use mcpv_runtime::probe::ExportMode;
use mcpv_runtime::{LogLevel, LogRecord};
use serde::Serialize;

use crate::state::AppState;
use crate::status::{ServerInitStatus, ServerRuntimeStatus};

pub use mcpv_runtime::logs::LogLevel as MinLevel;

/// Whether a log record should reach a client with the given visible
/// spec set. Gateway records always pass; downstream records pass when
/// their spec is visible.
pub fn log_visible(record: &LogRecord, visible: &HashSet<SpecKey>) -> bool {
    match &record.server_type {
        None => true,
        Some(server_type) => visible
            .iter()
            .any(|key| key.as_str() == server_type.as_str()),
    }
}

/// Level + visibility filter for one subscriber.
pub fn log_filter(
    record: &LogRecord,
    min_level: LogLevel,
    visible: Option<&HashSet<SpecKey>>,
) -> bool {
    if record.level < min_level {
        return false;
    }
    match visible {
        Some(visible) => log_visible(record, visible),
        None => true,
    }
}

/// Runtime status rows for a client (admin passes `None`).
pub fn runtime_status(
    state: &AppState,
    visible: Option<&HashSet<SpecKey>>,
) -> Vec<ServerRuntimeStatus> {
    state
        .status
        .watch_runtime()
        .borrow()
        .iter()
        .filter(|row| visible.map(|v| v.contains(&row.pool.spec_key)).unwrap_or(true))
        .cloned()
        .collect()
}

/// Init status rows for a client (admin passes `None`).
pub fn init_status(
    state: &AppState,
    visible: Option<&HashSet<SpecKey>>,
) -> Vec<ServerInitStatus> {
    state
        .status
        .watch_init()
        .borrow()
        .iter()
        .filter(|row| visible.map(|v| v.contains(&row.spec_key)).unwrap_or(true))
        .cloned()
        .collect()
}

/// The assembled diagnostics export bundle.
#[derive(Serialize)]
pub struct ExportBundle {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub catalog_revision: u64,
    pub pools: Vec<ServerRuntimeStatus>,
    pub stuck: Vec<ServerInitStatus>,
    pub timeline: Vec<mcpv_runtime::probe::DiagnosticsEvent>,
    pub metrics: String,
    pub recent_logs: Vec<Arc<LogRecord>>,
    pub events_dropped: u64,
}

/// Build the export bundle. `safe` mode redacts sensitive attribute
/// fields in the timeline.
pub fn export_bundle(state: &AppState, mode: ExportMode) -> ExportBundle {
    state.status.refresh();
    ExportBundle {
        generated_at: chrono::Utc::now(),
        catalog_revision: state.provider.snapshot().revision,
        pools: runtime_status(state, None),
        stuck: init_status(state, None),
        timeline: state.probe.export(mode),
        metrics: state.metrics.text_dump(),
        recent_logs: state.logs.recent(100),
        events_dropped: state.probe.dropped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::test_support;

    #[test]
    fn log_filtering_by_level_and_visibility() {
        let gateway = LogRecord::gateway(LogLevel::Info, "hello");
        let downstream = LogRecord::downstream_stderr("aaaa", "oops");

        let visible: HashSet<SpecKey> = [SpecKey::from_raw("aaaa")].into_iter().collect();
        let invisible: HashSet<SpecKey> = HashSet::new();

        assert!(log_filter(&gateway, LogLevel::Debug, Some(&visible)));
        assert!(!log_filter(&gateway, LogLevel::Error, Some(&visible)));
        assert!(log_filter(&downstream, LogLevel::Info, Some(&visible)));
        assert!(!log_filter(&downstream, LogLevel::Info, Some(&invisible)));
        // Admin stream: no visibility filter.
        assert!(log_filter(&downstream, LogLevel::Info, None));
    }

    #[tokio::test]
    async fn export_bundle_assembles_all_sections() {
        let app = test_support::app("servers:\n  - name: a\n    cmd: echo\n");
        app.state.metrics.add("test_counter", 1);
        app.state
            .logs
            .publish(LogRecord::gateway(LogLevel::Warn, "note"));

        let bundle = export_bundle(&app.state, ExportMode::Safe);
        assert_eq!(bundle.catalog_revision, 1);
        assert_eq!(bundle.pools.len(), 1);
        assert!(bundle.metrics.contains("test_counter"));
        assert_eq!(bundle.recent_logs.len(), 1);
        // Serializes cleanly for the admin endpoint.
        serde_json::to_string(&bundle).unwrap();
    }
}
