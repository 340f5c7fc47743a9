//! `mcpv-domain` — configuration model and shared types for mcpv.
//!
//! This crate provides:
//! - The typed configuration model deserialized from the gateway's YAML
//!   config (`Config`, `ServerSpec`, `PluginSpec`, runtime knobs).
//! - Severity-tagged config validation and `${VAR}` env expansion.
//! - The spec fingerprint (`SpecKey`) used as pool identity across reloads.
//! - Tag-union visibility rules shared by the client registry and indexes.
//! - The error taxonomy used across all mcpv crates.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod visibility;

// Re-exports for convenience.
pub use config::{Config, PluginSpec, RuntimeConfig, ServerSpec};
pub use error::{Error, ErrorCode, Result};
pub use fingerprint::SpecKey;
