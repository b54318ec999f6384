use proxysync::cluster::HttpClusterClient;
use proxysync::config::{ProxyEnv, Settings};
use proxysync::reconcile::Reconciler;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Grace period for the proxy between SIGTERM and SIGKILL on exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxysync=info".parse().expect("valid log directive")),
        )
        .init();

    // Settings file is optional; defaults match a stock HAProxy layout
    let settings = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let settings = Settings::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load settings");
                e
            })?;
            info!(path = %path.display(), "Settings loaded");
            settings
        }
        None => {
            let settings = Settings::default();
            settings.validate()?;
            settings
        }
    };
    let env = ProxyEnv::from_env();

    info!(
        port = %env.port,
        mode = %env.mode,
        balance = %env.balance,
        maxconn = %env.maxconn,
        marker = %env.endpoint_marker(),
        cluster_auth = env.auth.is_some(),
        config = %settings.paths.config.display(),
        command = %settings.proxy.command,
        "proxysync starting"
    );

    let client = HttpClusterClient::new(env.auth.clone(), settings.reconcile.request_timeout())
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
    let mut reconciler = Reconciler::new(&settings, env, client)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    reconciler.run(shutdown_rx).await;

    info!("Stopping proxy...");
    reconciler.shutdown(SHUTDOWN_GRACE).await;
    info!("proxysync stopped");

    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down after the current cycle...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down after the current cycle...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down after the current cycle...");
    }
}
