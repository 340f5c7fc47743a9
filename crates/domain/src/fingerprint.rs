//! Spec fingerprint — the identity used for pool continuity across reloads.
//!
//! The fingerprint hashes only the *runtime-affecting* fields of a
//! [`ServerSpec`]: command, args, env, cwd, and the HTTP endpoint/headers.
//! Tag changes, the disabled flag, `exposeTools`, and pool tuning knobs do
//! not change the key, so those edits never churn live pools.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ServerSpec, TransportKind};

/// Deterministic hash of a spec's runtime-affecting fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SpecKey(String);

impl SpecKey {
    /// Compute the fingerprint of a spec.
    pub fn of(spec: &ServerSpec) -> SpecKey {
        let mut hasher = Sha256::new();
        match spec.effective_transport() {
            TransportKind::Stdio => {
                hasher.update(b"stdio\0");
                hasher.update(spec.cmd.as_bytes());
                hasher.update([0]);
                for arg in &spec.args {
                    hasher.update(arg.as_bytes());
                    hasher.update([0]);
                }
                hasher.update([0]);
                // BTreeMap iteration is already key-ordered.
                for (k, v) in &spec.env {
                    hasher.update(k.as_bytes());
                    hasher.update([b'=']);
                    hasher.update(v.as_bytes());
                    hasher.update([0]);
                }
                hasher.update([0]);
                if let Some(cwd) = &spec.cwd {
                    hasher.update(cwd.as_bytes());
                }
                hasher.update([0]);
            }
            TransportKind::StreamableHttp => {
                hasher.update(b"http\0");
                if let Some(endpoint) = &spec.endpoint {
                    hasher.update(endpoint.as_bytes());
                }
                hasher.update([0]);
                for (k, v) in &spec.headers {
                    hasher.update(k.as_bytes());
                    hasher.update([b':']);
                    hasher.update(v.as_bytes());
                    hasher.update([0]);
                }
            }
        }
        SpecKey(hex::encode(hasher.finalize()))
    }

    /// Construct from a known digest string (tests, wire decoding).
    pub fn from_raw(raw: impl Into<String>) -> SpecKey {
        SpecKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log fields.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for SpecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
