//! Symbolic HAProxy configuration model
//!
//! The model is what gets fingerprinted and persisted as JSON. Template
//! placeholders such as `$PORT` stay in the model; they are substituted only
//! when rendering text.

use crate::discovery::EndpointMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Section-structured proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigModel {
    #[serde(default)]
    pub global: Vec<String>,
    #[serde(default)]
    pub defaults: Vec<String>,
    #[serde(default)]
    pub frontend: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub backend: BTreeMap<String, Vec<String>>,
}

impl ConfigModel {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Merge directive lines into a backend.
    ///
    /// A missing backend is inserted as given (deduplicated); an existing one
    /// keeps its lines and order and gains only the lines it lacks.
    pub fn merge_backend(&mut self, name: &str, lines: Vec<String>) {
        let existing = self.backend.entry(name.to_string()).or_default();
        for line in lines {
            if !existing.contains(&line) {
                existing.push(line);
            }
        }
    }
}

/// Server label for an endpoint, stable across endpoint renames
pub fn server_label(backend_name: &str, port: &str) -> String {
    format!("{}-{}", backend_name, port)
}

/// One `server` directive per routable endpoint, in endpoint-name order
pub fn backend_lines(backend_name: &str, endpoints: &EndpointMap) -> Vec<String> {
    endpoints
        .values()
        .filter_map(|endpoint| match endpoint.address() {
            Some((host, port)) => Some(format!(
                "server {} {}:{}",
                server_label(backend_name, port),
                host,
                port
            )),
            None => {
                debug!(
                    endpoint = %endpoint.name,
                    host = ?endpoint.host,
                    port = ?endpoint.port,
                    "Skipping incomplete endpoint"
                );
                None
            }
        })
        .collect()
}

/// Merge the aggregate backend for `endpoints` into a copy of `baseline`
pub fn synthesize(baseline: &ConfigModel, backend_name: &str, endpoints: &EndpointMap) -> ConfigModel {
    let mut model = baseline.clone();
    model.merge_backend(backend_name, backend_lines(backend_name, endpoints));
    model
}
