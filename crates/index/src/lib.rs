//! `mcpv-index` — aggregation indexes for tools, resources, and prompts.
//!
//! This crate provides:
//! - [`generic::GenericIndex`], the shared refresh/snapshot engine with
//!   metadata-cache fallback, circuit-break eviction, and
//!   notification-driven targeted refresh.
//! - The per-kind hooks ([`kinds::ToolKind`], [`kinds::ResourceKind`],
//!   [`kinds::PromptKind`]) including tool namespacing and `exposeTools`
//!   filtering.
//! - Immutable [`snapshot::Snapshot`] values with deterministic ETags and
//!   per-client filtered views.
//! - The startup [`bootstrap`] preflight that hydrates the metadata
//!   cache.

pub mod bootstrap;
pub mod generic;
pub mod kinds;
pub mod snapshot;

// Re-exports for convenience.
pub use generic::{GenericIndex, ListFetcher, FAIL_THRESHOLD};
pub use kinds::{IndexKind, PromptKind, ResourceKind, ToolKind};
pub use snapshot::{Entry, Snapshot};

/// The three indexes as the gateway wires them.
pub type ToolIndex = GenericIndex<ToolKind>;
pub type ResourceIndex = GenericIndex<ResourceKind>;
pub type PromptIndex = GenericIndex<PromptKind>;
