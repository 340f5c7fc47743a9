//! `mcpv-runtime` — the runtime core of mcpv.
//!
//! This crate provides:
//! - The launcher (spawn stdio children / prepare streamable-http
//!   endpoints) and the duplex [`conn::Conn`] with its reader loop.
//! - The lifecycle manager performing the MCP initialize handshake with
//!   bounded retry on a detached root context.
//! - The instance scheduler: per-spec pools with
//!   stateless/stateful/persistent/singleton strategies, idle reaping,
//!   warm-pool maintenance, drain semantics, ping probes, and
//!   generation-based StopSpec cancellation.
//! - The process-wide metadata cache hydrating list operations when no
//!   instance is running.
//! - The diagnostics probe (ring buffer of phase events) and the
//!   in-process hubs for list-change notifications and log records.

pub mod cache;
pub mod conn;
pub mod hub;
pub mod instance;
pub mod launcher;
pub mod lifecycle;
pub mod logs;
pub mod probe;
pub mod scheduler;

// Re-exports for convenience.
pub use cache::MetadataCache;
pub use conn::Conn;
pub use hub::{ListChange, ListChangeHub};
pub use instance::{Instance, InstanceState};
pub use launcher::{Launched, Launcher, StdioLauncher};
pub use lifecycle::{InstanceFactory, Lifecycle};
pub use logs::{LogHub, LogLevel, LogRecord};
pub use probe::DiagnosticsProbe;
pub use scheduler::{Scheduler, SchedulerEvent};
