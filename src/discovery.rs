//! Endpoint discovery from flat key/value environments
//!
//! Sidecar-style links expose each backend as a pair of variables such as
//! `DB_PORT_80_TCP_ADDR=10.0.0.5` and `DB_PORT_80_TCP_PORT=8080`. Cluster APIs
//! are announced as `WEB_TUTUM_API_URL=https://...`. The same rules apply to
//! the process environment and to the `link_variables` of a cluster document.

use std::collections::BTreeMap;
use tracing::debug;

/// A single backend instance, possibly only partially discovered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub host: Option<String>,
    pub port: Option<String>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
            port: None,
        }
    }

    /// Build a fully populated endpoint
    pub fn with_address(
        name: impl Into<String>,
        host: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: Some(host.into()),
            port: Some(port.into()),
        }
    }

    /// Both host and port are known
    pub fn is_complete(&self) -> bool {
        self.address().is_some()
    }

    /// `(host, port)` when the endpoint is routable
    pub fn address(&self) -> Option<(&str, &str)> {
        match (self.host.as_deref(), self.port.as_deref()) {
            (Some(host), Some(port)) if !host.is_empty() && !port.is_empty() => Some((host, port)),
            _ => None,
        }
    }
}

/// Named pointer to a remote API listing the members of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    pub name: String,
    pub uri: String,
}

/// Endpoints keyed by name
pub type EndpointMap = BTreeMap<String, Endpoint>;

/// Everything found in one environment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub endpoints: EndpointMap,
    pub clusters: BTreeMap<String, ClusterRef>,
}

/// Key-matching rules for discovery variables
#[derive(Debug, Clone)]
pub struct Markers {
    endpoint: String,
    addr_suffix: String,
    port_suffix: String,
    cluster: String,
}

impl Markers {
    /// `endpoint` is the per-port marker (e.g. `_PORT_80_TCP`), `cluster` the
    /// suffix of cluster URI variables (e.g. `_TUTUM_API_URL`)
    pub fn new(endpoint: impl Into<String>, cluster: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            addr_suffix: format!("{}_ADDR", endpoint),
            port_suffix: format!("{}_PORT", endpoint),
            endpoint,
            cluster: cluster.into(),
        }
    }

    /// Parse an environment into endpoints and cluster references.
    ///
    /// Never fails: unknown keys are ignored and endpoints missing a field are
    /// kept with that field unset.
    pub fn collect<I, K, V>(&self, vars: I) -> Discovery
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut discovery = Discovery::default();

        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref();

            if let Some(position) = key.find(&self.endpoint) {
                let name = &key[..position];
                let endpoint = discovery
                    .endpoints
                    .entry(name.to_string())
                    .or_insert_with(|| Endpoint::new(name));

                if key.ends_with(&self.addr_suffix) {
                    endpoint.host = Some(value.to_string());
                } else if key.ends_with(&self.port_suffix) {
                    endpoint.port = Some(value.to_string());
                }
            }

            if let Some(name) = key.strip_suffix(&self.cluster) {
                discovery.clusters.insert(
                    name.to_string(),
                    ClusterRef {
                        name: name.to_string(),
                        uri: value.to_string(),
                    },
                );
            }
        }

        let partial = discovery
            .endpoints
            .values()
            .filter(|e| !e.is_complete())
            .count();
        debug!(
            endpoints = discovery.endpoints.len(),
            partial,
            clusters = discovery.clusters.len(),
            "Discovery finished"
        );

        discovery
    }
}
