//! Catalog provider — file-backed configuration with shadow loads and
//! atomic publication.
//!
//! A reload runs parse → env expansion → normalization → validation
//! entirely off to the side; only a fully valid candidate is published.
//! Consumers take `Arc` snapshots and subscribe to `CatalogUpdate`
//! events. The reload manager applies updates transactionally before
//! they are published, so a failed apply leaves the running state
//! untouched.

pub mod diff;

pub use diff::CatalogDiff;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mcpv_domain::config::{Config, ConfigIssue};
use mcpv_domain::{Error, Result, SpecKey};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Aggregate counts for logs and the admin surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CatalogSummary {
    pub servers: usize,
    pub disabled_servers: usize,
    pub plugins: usize,
}

/// One published catalog generation. Immutable once built.
pub struct CatalogState {
    pub catalog: Config,
    /// Enabled specs by fingerprint.
    pub spec_registry: HashMap<SpecKey, Arc<mcpv_domain::ServerSpec>>,
    /// Enabled server name → fingerprint.
    pub name_index: HashMap<String, SpecKey>,
    pub summary: CatalogSummary,
    pub revision: u64,
    pub loaded_at: DateTime<Utc>,
}

impl CatalogState {
    /// Build a state from an already-normalized config.
    pub fn from_config(catalog: Config, revision: u64) -> CatalogState {
        let mut spec_registry = HashMap::new();
        let mut name_index = HashMap::new();
        let mut disabled = 0usize;
        for spec in &catalog.servers {
            if spec.disabled {
                disabled += 1;
                continue;
            }
            let key = SpecKey::of(spec);
            name_index.insert(spec.name.clone(), key.clone());
            spec_registry.insert(key, Arc::new(spec.clone()));
        }
        let summary = CatalogSummary {
            servers: catalog.servers.len(),
            disabled_servers: disabled,
            plugins: catalog.plugins.iter().filter(|p| !p.disabled).count(),
        };
        CatalogState {
            catalog,
            spec_registry,
            name_index,
            summary,
            revision,
            loaded_at: Utc::now(),
        }
    }

    /// Look up an enabled spec by server name.
    pub fn spec_by_name(&self, name: &str) -> Option<(SpecKey, Arc<mcpv_domain::ServerSpec>)> {
        let key = self.name_index.get(name)?;
        let spec = self.spec_registry.get(key)?;
        Some((key.clone(), spec.clone()))
    }
}

/// An accepted catalog change, broadcast to appliers/watchers.
#[derive(Clone)]
pub struct CatalogUpdate {
    pub state: Arc<CatalogState>,
    pub diff: CatalogDiff,
    pub source: &'static str,
}

/// File-backed provider of [`CatalogState`] snapshots.
pub struct CatalogProvider {
    path: PathBuf,
    state: RwLock<Arc<CatalogState>>,
    updates: broadcast::Sender<CatalogUpdate>,
}

impl CatalogProvider {
    /// Initial load. Validation errors are fatal; warnings are logged.
    pub fn load(path: impl AsRef<Path>) -> Result<CatalogProvider> {
        let path = path.as_ref().to_path_buf();
        let config = Self::read_config(&path)?;
        let state = Arc::new(CatalogState::from_config(config, 1));
        let (updates, _rx) = broadcast::channel(16);
        Ok(CatalogProvider {
            path,
            state: RwLock::new(state),
            updates,
        })
    }

    fn read_config(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io("catalog_read", e))?;
        let config = Config::from_yaml_str(&raw)?;
        let issues = config.validate();
        for issue in &issues {
            match issue.severity {
                mcpv_domain::config::ConfigSeverity::Warning => {
                    tracing::warn!("config: {issue}")
                }
                mcpv_domain::config::ConfigSeverity::Error => {
                    tracing::error!("config: {issue}")
                }
            }
        }
        if Config::has_errors(&issues) {
            return Err(Error::Config(format!(
                "validation failed with {} error(s)",
                issues
                    .iter()
                    .filter(|i| i.severity == mcpv_domain::config::ConfigSeverity::Error)
                    .count()
            )));
        }
        Ok(config)
    }

    /// Validate without publishing (CLI `config validate`).
    pub fn validate_file(path: impl AsRef<Path>) -> Result<(Config, Vec<ConfigIssue>)> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::io("catalog_read", e))?;
        let config = Config::from_yaml_str(&raw)?;
        let issues = config.validate();
        Ok((config, issues))
    }

    /// The current published state.
    pub fn snapshot(&self) -> Arc<CatalogState> {
        self.state.read().clone()
    }

    pub fn watch(&self) -> broadcast::Receiver<CatalogUpdate> {
        self.updates.subscribe()
    }

    /// Shadow load: parse and validate the file and diff it against the
    /// running generation. Nothing is published.
    pub fn shadow_load(&self) -> Result<(Arc<CatalogState>, CatalogDiff)> {
        let config = Self::read_config(&self.path)?;
        let current = self.snapshot();
        let candidate = Arc::new(CatalogState::from_config(config, current.revision + 1));
        let diff = diff::diff(&current, &candidate);
        Ok((candidate, diff))
    }

    /// Publish a candidate produced by [`shadow_load`](Self::shadow_load)
    /// after the reload manager applied it successfully.
    pub fn publish(&self, state: Arc<CatalogState>, diff: CatalogDiff, source: &'static str) {
        tracing::info!(
            revision = state.revision,
            servers = state.summary.servers,
            diff = %diff.summary(),
            source,
            "catalog published"
        );
        *self.state.write() = state.clone();
        let _ = self.updates.send(CatalogUpdate {
            state,
            diff,
            source,
        });
    }
}
