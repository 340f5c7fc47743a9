//! In-process log hub.
//!
//! Structured log records (including downstream stderr lines mirrored by
//! the launcher) are fanned out over a lossy broadcast channel so the
//! control plane can serve `StreamLogs` without back-pressuring the
//! emitters. Slow consumers observe `RecvError::Lagged` and a global drop
//! counter increments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Log severity, ordered so `level >= min_level` filtering works.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    /// Where the record came from: `gateway` or `downstream`.
    pub log_source: &'static str,
    /// Stream tag for downstream records (`stderr`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<&'static str>,
    /// Spec key of the downstream the record belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    pub message: String,
}

impl LogRecord {
    pub fn gateway(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            log_source: "gateway",
            stream: None,
            server_type: None,
            message: message.into(),
        }
    }

    pub fn downstream_stderr(server_type: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: LogLevel::Info,
            log_source: "downstream",
            stream: Some("stderr"),
            server_type: Some(server_type.into()),
            message: line.into(),
        }
    }
}

/// Lossy fan-out of log records.
#[derive(Clone)]
pub struct LogHub {
    tx: broadcast::Sender<Arc<LogRecord>>,
    dropped: Arc<AtomicU64>,
    /// Recent records retained for the diagnostics export bundle.
    recent: Arc<parking_lot::Mutex<std::collections::VecDeque<Arc<LogRecord>>>>,
    recent_cap: usize,
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            recent: Arc::new(parking_lot::Mutex::new(std::collections::VecDeque::new())),
            recent_cap: 256,
        }
    }

    pub fn publish(&self, record: LogRecord) {
        let record = Arc::new(record);
        {
            let mut recent = self.recent.lock();
            if recent.len() == self.recent_cap {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }
        if self.tx.send(record).is_err() {
            // No subscribers; the record still lands in `recent`.
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LogRecord>> {
        self.tx.subscribe()
    }

    /// The most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<LogRecord>> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_supports_min_filtering() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert!(LogLevel::Info > LogLevel::Debug);
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("trace"), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = LogHub::new(16);
        let mut rx = hub.subscribe();
        hub.publish(LogRecord::gateway(LogLevel::Info, "hello"));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.message, "hello");
        assert_eq!(record.log_source, "gateway");
    }

    #[test]
    fn recent_keeps_latest() {
        let hub = LogHub::new(16);
        for i in 0..300 {
            hub.publish(LogRecord::gateway(LogLevel::Debug, format!("m{i}")));
        }
        let recent = hub.recent(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.last().unwrap().message, "m299");
    }

    #[test]
    fn downstream_record_carries_tags() {
        let record = LogRecord::downstream_stderr("abc123", "boom");
        assert_eq!(record.log_source, "downstream");
        assert_eq!(record.stream, Some("stderr"));
        assert_eq!(record.server_type.as_deref(), Some("abc123"));
    }
}
