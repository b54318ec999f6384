//! Persisting configuration snapshots
//!
//! Every write goes through a private temporary directory created next to
//! the live files, so that the final `rename` stays on one filesystem and
//! replaces each file atomically. The directory is removed when the
//! [`tempfile::TempDir`] guard drops, whatever the outcome.

use crate::config::{PathsConfig, ProxyEnv};
use crate::error::{CycleError, Phase};
use crate::fingerprint;
use crate::model::ConfigModel;
use crate::render::render;
use std::path::Path;
use tracing::{debug, info};

const MODEL_TMP_NAME: &str = "new_haproxy.cfg.json";
const CONFIG_TMP_NAME: &str = "haproxy.cfg";

/// Result of applying a candidate model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The active model already matches the candidate
    Unchanged,
    /// Both live files were replaced
    Replaced { fingerprint: String },
}

impl WriteOutcome {
    pub fn is_replaced(&self) -> bool {
        matches!(self, WriteOutcome::Replaced { .. })
    }
}

/// Writes models and rendered configs to their canonical locations
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    paths: PathsConfig,
}

impl ConfigWriter {
    pub fn new(paths: PathsConfig) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    /// Read the baseline template
    pub fn load_baseline(&self) -> Result<ConfigModel, CycleError> {
        let path = &self.paths.baseline;
        let content = std::fs::read_to_string(path).map_err(|e| CycleError::Baseline {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        ConfigModel::from_json(&content).map_err(|e| CycleError::Baseline {
            path: path.clone(),
            reason: e.to_string(),
        })
    }

    /// Persist `model` if its serialized form differs from the active one.
    ///
    /// The text file is replaced before the model file. The live model is
    /// the change-detection reference, so until both renames succeed it
    /// still differs from the candidate and the next pass rewrites both.
    pub fn apply(&self, model: &ConfigModel, env: &ProxyEnv) -> Result<WriteOutcome, CycleError> {
        let json = model.to_json().map_err(CycleError::Serialize)?;

        let parent = parent_dir(&self.paths.model);
        let tempdir = tempfile::Builder::new()
            .prefix(".proxysync-")
            .tempdir_in(parent)
            .map_err(|e| CycleError::storage(Phase::Write, "create temporary directory in", parent, e))?;

        let model_tmp = tempdir.path().join(MODEL_TMP_NAME);
        write_file(&model_tmp, &json)?;

        let changed = fingerprint::has_changed(&model_tmp, &self.paths.model)
            .map_err(|e| CycleError::storage(Phase::Detect, "fingerprint", &self.paths.model, e))?;
        if !changed {
            debug!(model = %self.paths.model.display(), "Configuration model unchanged");
            return Ok(WriteOutcome::Unchanged);
        }

        let text = render(model, env);
        info!("Using new HAProxy configuration:\n{}", text);

        let config_tmp = tempdir.path().join(CONFIG_TMP_NAME);
        write_file(&config_tmp, &text)?;

        replace(&config_tmp, &self.paths.config)?;
        replace(&model_tmp, &self.paths.model)?;

        let fingerprint = fingerprint::fingerprint_bytes(json.as_bytes());
        info!(
            model = %self.paths.model.display(),
            config = %self.paths.config.display(),
            fingerprint = %fingerprint,
            "Configuration replaced"
        );
        Ok(WriteOutcome::Replaced { fingerprint })
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), CycleError> {
    std::fs::write(path, contents).map_err(|e| CycleError::storage(Phase::Write, "write", path, e))
}

/// Move `from` over `to`, falling back to copy when they sit on different
/// filesystems
fn replace(from: &Path, to: &Path) -> Result<(), CycleError> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            let staged = to.with_extension("proxysync-tmp");
            std::fs::copy(from, &staged)
                .and_then(|_| std::fs::rename(&staged, to))
                .map_err(|e| CycleError::storage(Phase::Write, "replace", to, e))
        }
        Err(e) => Err(CycleError::storage(Phase::Write, "rename into", to, e)),
    }
}

fn is_cross_device(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EXDEV)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}
