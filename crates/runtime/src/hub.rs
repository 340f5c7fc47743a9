//! List-change hub.
//!
//! Downstream servers announce catalog changes via
//! `notifications/*/list_changed`. Every [`conn::Conn`](crate::conn::Conn)
//! reader loop publishes the `{kind, specKey}` pair here and the
//! aggregation indexes subscribe to schedule targeted refreshes.

use mcpv_domain::SpecKey;
use mcpv_proto::mcp::ListChangedKind;
use tokio::sync::broadcast;

/// A catalog-change announcement from one downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListChange {
    pub kind: ListChangedKind,
    pub spec_key: SpecKey,
}

/// Broadcast fan-out of list-change announcements.
#[derive(Clone)]
pub struct ListChangeHub {
    tx: broadcast::Sender<ListChange>,
}

impl ListChangeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn publish(&self, kind: ListChangedKind, spec_key: SpecKey) {
        let change = ListChange { kind, spec_key };
        // Nobody listening is fine (e.g. before the indexes start).
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListChange> {
        self.tx.subscribe()
    }
}

impl Default for ListChangeHub {
    fn default() -> Self {
        Self::new(128)
    }
}
