//! The reconciliation loop
//!
//! Each pass runs discovery, cluster fetches, synthesis, change detection,
//! writing and, when the on-disk configuration was replaced, a proxy reload.
//! Passes never overlap; a failed pass is logged and retried after the next
//! period.

use crate::cluster::{merge_cluster, ClusterClient};
use crate::config::{process_env, ProxyEnv, Settings};
use crate::discovery::{Discovery, Markers};
use crate::error::CycleError;
use crate::model::synthesize;
use crate::supervisor::Supervisor;
use crate::writer::{ConfigWriter, WriteOutcome};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a single pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Endpoints in the merged set (complete or not)
    pub endpoints: usize,
    /// Clusters whose fetch succeeded
    pub clusters: Vec<String>,
    /// Clusters skipped because their fetch failed
    pub failed_clusters: Vec<String>,
    /// Endpoints removed because their cluster no longer lists them
    pub pruned: Vec<String>,
    /// `None` when nothing was discovered and no write was attempted
    pub outcome: Option<WriteOutcome>,
    /// A proxy process was launched this pass
    pub launched: bool,
    /// The running proxy was reloaded this pass
    pub reloaded: bool,
}

/// Drives discovery, configuration sync and proxy supervision.
///
/// A reload that fails after the files were replaced stays pending and is
/// retried on later passes even when the model is unchanged.
pub struct Reconciler<C> {
    env: ProxyEnv,
    markers: Markers,
    backend_name: String,
    period: Duration,
    writer: ConfigWriter,
    client: C,
    supervisor: Supervisor,
    /// Configuration on disk is newer than what the running proxy loaded
    pending_reload: bool,
}

impl<C: ClusterClient> Reconciler<C> {
    pub fn new(settings: &Settings, env: ProxyEnv, client: C) -> anyhow::Result<Self> {
        let markers = Markers::new(env.endpoint_marker(), settings.reconcile.cluster_marker.clone());
        let supervisor = Supervisor::new(&settings.proxy, settings.paths.config.clone())?;

        Ok(Self {
            env,
            markers,
            backend_name: settings.reconcile.backend_name.clone(),
            period: settings.reconcile.polling_period(),
            writer: ConfigWriter::new(settings.paths.clone()),
            client,
            supervisor,
            pending_reload: false,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Run one pass against the given environment.
    ///
    /// The proxy is launched if it is not running even when the sync part of
    /// the pass failed, so that it serves whatever configuration is on disk.
    pub async fn run_cycle<I, K, V>(&mut self, vars: I) -> Result<CycleReport, CycleError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let discovery = self.markers.collect(vars);
        let sync = self.sync(discovery).await;

        let launched = match self.supervisor.ensure_running() {
            Ok(launched) => launched,
            Err(e) if sync.is_err() => {
                error!(phase = %e.phase(), error = %e, "Failed to launch proxy");
                false
            }
            Err(e) => return Err(e),
        };

        let mut report = sync?;
        report.launched = launched;
        Ok(report)
    }

    async fn sync(&mut self, discovery: Discovery) -> Result<CycleReport, CycleError> {
        let Discovery {
            mut endpoints,
            clusters,
        } = discovery;
        let mut report = CycleReport::default();

        for cluster in clusters.values() {
            match self.client.fetch_links(cluster).await {
                Ok(links) => {
                    let pruned = merge_cluster(&mut endpoints, cluster, &links, &self.markers);
                    if !pruned.is_empty() {
                        info!(cluster = %cluster.name, pruned = ?pruned, "Removed stale cluster members");
                    }
                    report.pruned.extend(pruned);
                    report.clusters.push(cluster.name.clone());
                }
                Err(e) => {
                    warn!(
                        cluster = %cluster.name,
                        uri = %e.uri(),
                        error = %e,
                        "Cluster fetch failed, skipping for this cycle"
                    );
                    report.failed_clusters.push(cluster.name.clone());
                }
            }
        }

        report.endpoints = endpoints.len();
        if endpoints.is_empty() {
            debug!("No endpoints discovered, leaving configuration untouched");
            return Ok(report);
        }

        let baseline = self.writer.load_baseline()?;
        let model = synthesize(&baseline, &self.backend_name, &endpoints);
        let outcome = self.writer.apply(&model, &self.env)?;

        if outcome.is_replaced() || self.pending_reload {
            if self.supervisor.current_pid().is_some() {
                if !outcome.is_replaced() {
                    info!("Retrying reload for configuration already on disk");
                }
                self.pending_reload = true;
                self.supervisor.reload().await?;
                report.reloaded = true;
            }
            // A fresh launch reads the current file
            self.pending_reload = false;
        }

        report.outcome = Some(outcome);
        Ok(report)
    }

    /// Run passes every period until `shutdown` flips to true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_secs = self.period.as_secs(),
            backend = %self.backend_name,
            "Reconciliation loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle(process_env()).await {
                Ok(report) if report.launched || report.reloaded => {
                    info!(
                        endpoints = report.endpoints,
                        launched = report.launched,
                        reloaded = report.reloaded,
                        "Reconciliation cycle applied"
                    );
                }
                Ok(report) => {
                    debug!(
                        endpoints = report.endpoints,
                        failed_clusters = report.failed_clusters.len(),
                        "Reconciliation cycle finished"
                    );
                }
                Err(e) => {
                    error!(phase = %e.phase(), error = %e, "Reconciliation cycle failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    /// Stop the supervised proxy
    pub async fn shutdown(&mut self, grace: Duration) {
        self.supervisor.shutdown(grace).await;
    }
}
