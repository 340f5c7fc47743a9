//! `mcpv-governance` — out-of-process governance plugins and the
//! category-ordered request/response pipeline.
//!
//! This crate provides:
//! - The plugin wire protocol over per-plugin unix sockets
//!   (metadata/configure/ready/handle/shutdown).
//! - The plugin process manager: socket allocation, spawn, handshake,
//!   commit-hash verification, idempotent stop with socket cleanup.
//! - The pipeline engine executing categories in fixed order with
//!   content mutation and continue-or-reject decisions.
//! - The executor wrapping a routed call with the request and response
//!   phases.

pub mod executor;
pub mod manager;
pub mod pipeline;
pub mod rpc;

// Re-exports for convenience.
pub use executor::Executor;
pub use manager::PluginManager;
pub use pipeline::{GovernanceContext, GovernancePlugin, Pipeline};
pub use rpc::{PluginClient, PluginDecision, PluginMetadata};
