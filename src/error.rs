//! Error types for the reconciliation engine
//!
//! Failures fall into two classes:
//! - [`FetchError`]: one cluster API call failed; only that cluster is skipped
//! - [`CycleError`]: the rest of the current pass is abandoned and retried on
//!   the next period

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Step of a reconciliation pass, attached to per-cycle failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Synthesize,
    Detect,
    Write,
    Launch,
    Reload,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Synthesize => "synthesize",
            Phase::Detect => "detect",
            Phase::Write => "write",
            Phase::Launch => "launch",
            Phase::Reload => "reload",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cluster API request failed
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {uri} failed: {source}")]
    Transport {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {uri} returned status {status}")]
    Status { uri: String, status: u16 },

    #[error("invalid cluster document from {uri}: {reason}")]
    Decode { uri: String, reason: String },
}

impl FetchError {
    pub fn uri(&self) -> &str {
        match self {
            FetchError::Transport { uri, .. }
            | FetchError::Status { uri, .. }
            | FetchError::Decode { uri, .. } => uri,
        }
    }
}

/// The current reconciliation pass cannot complete
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to load baseline template {}: {reason}", path.display())]
    Baseline { path: PathBuf, reason: String },

    #[error("failed to serialize configuration model: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to {action} {}: {source}", path.display())]
    Storage {
        phase: Phase,
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch proxy: {0}")]
    Launch(#[source] std::io::Error),

    #[error("failed to reload proxy: {0}")]
    Reload(#[source] std::io::Error),
}

impl CycleError {
    /// Pass step the failure happened in
    pub fn phase(&self) -> Phase {
        match self {
            CycleError::Baseline { .. } | CycleError::Serialize(_) => Phase::Synthesize,
            CycleError::Storage { phase, .. } => *phase,
            CycleError::Launch(_) => Phase::Launch,
            CycleError::Reload(_) => Phase::Reload,
        }
    }

    pub(crate) fn storage(
        phase: Phase,
        action: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        CycleError::Storage {
            phase,
            action,
            path: path.into(),
            source,
        }
    }
}
