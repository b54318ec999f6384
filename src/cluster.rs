//! Cluster membership fetching and merging
//!
//! A cluster API answers with a document whose `link_variables` object uses
//! the same key schema as the local environment. Members found there are
//! merged into the working endpoint set, and members of that cluster that
//! are no longer listed are pruned.

use crate::discovery::{ClusterRef, EndpointMap, Markers};
use crate::error::FetchError;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Link variables returned for one cluster
pub type LinkVariables = HashMap<String, String>;

/// Source of cluster membership documents
pub trait ClusterClient {
    fn fetch_links(
        &self,
        cluster: &ClusterRef,
    ) -> impl Future<Output = Result<LinkVariables, FetchError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ClusterDocument {
    link_variables: LinkVariables,
}

/// Cluster client backed by a pooled HTTP connection
#[derive(Debug, Clone)]
pub struct HttpClusterClient {
    http_client: reqwest::Client,
    auth: Option<String>,
}

impl HttpClusterClient {
    pub fn new(auth: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client, auth })
    }
}

impl ClusterClient for HttpClusterClient {
    async fn fetch_links(&self, cluster: &ClusterRef) -> Result<LinkVariables, FetchError> {
        let mut request = self.http_client.get(&cluster.uri);
        if let Some(ref auth) = self.auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let transport = |source| FetchError::Transport {
            uri: cluster.uri.clone(),
            source,
        };

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status {
                uri: cluster.uri.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        let document: ClusterDocument =
            serde_json::from_str(&body).map_err(|e| FetchError::Decode {
                uri: cluster.uri.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            cluster = %cluster.name,
            links = document.link_variables.len(),
            "Fetched cluster document"
        );
        Ok(document.link_variables)
    }
}

/// Merge a cluster's fetched members into `endpoints`.
///
/// Members are re-read through the discovery rules and overwrite entries of
/// the same name. Any endpoint whose name starts with the cluster name but is
/// not among the fetched members is removed. Returns the pruned names.
pub fn merge_cluster(
    endpoints: &mut EndpointMap,
    cluster: &ClusterRef,
    links: &LinkVariables,
    markers: &Markers,
) -> Vec<String> {
    let members = markers.collect(links).endpoints;

    let stale: Vec<String> = endpoints
        .keys()
        .filter(|name| name.starts_with(&cluster.name) && !members.contains_key(*name))
        .cloned()
        .collect();

    for name in &stale {
        endpoints.remove(name);
    }

    endpoints.extend(members);
    stale
}
