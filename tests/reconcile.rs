//! Integration tests for full reconciliation passes

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use proxysync::cluster::{ClusterClient, LinkVariables};
use proxysync::config::{PathsConfig, ProxyCommandConfig, ProxyEnv, Settings};
use proxysync::discovery::ClusterRef;
use proxysync::error::{FetchError, Phase};
use proxysync::reconcile::Reconciler;
use proxysync::writer::WriteOutcome;
use tempfile::TempDir;
use tokio::sync::watch;

/// Stand-in for the proxy binary: honors `-sf <pid>` by terminating the old
/// instance, then idles
const HANDOFF_PROXY: &str =
    r#"sh -c 'if [ "$1" = "-sf" ]; then kill -TERM "$2"; fi; exec sleep 30' proxy"#;

const BASELINE: &str = r#"{
    "global": ["maxconn $MAXCONN"],
    "defaults": ["mode $MODE"],
    "frontend": {"default_frontend": ["bind 0.0.0.0:$PORT $SSL", "default_backend cluster"]},
    "backend": {"cluster": ["balance $BALANCE"]}
}"#;

/// Cluster client answering from a fixed table; `None` simulates a 503
#[derive(Default)]
struct StaticClusters {
    documents: HashMap<String, Option<LinkVariables>>,
}

impl StaticClusters {
    fn with(mut self, uri: &str, links: Option<&[(&str, &str)]>) -> Self {
        let links = links.map(|pairs| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        });
        self.documents.insert(uri.to_string(), links);
        self
    }
}

impl ClusterClient for StaticClusters {
    async fn fetch_links(&self, cluster: &ClusterRef) -> Result<LinkVariables, FetchError> {
        match self.documents.get(&cluster.uri) {
            Some(Some(links)) => Ok(links.clone()),
            _ => Err(FetchError::Status {
                uri: cluster.uri.clone(),
                status: 503,
            }),
        }
    }
}

fn settings(dir: &Path) -> Settings {
    let paths = PathsConfig {
        baseline: dir.join("empty_haproxy.cfg.json"),
        model: dir.join("haproxy.cfg.json"),
        config: dir.join("haproxy.cfg"),
    };
    std::fs::write(&paths.baseline, BASELINE).unwrap();

    Settings {
        paths,
        proxy: ProxyCommandConfig {
            command: HANDOFF_PROXY.to_string(),
            ..ProxyCommandConfig::default()
        },
        ..Settings::default()
    }
}

fn reconciler(dir: &Path, clusters: StaticClusters) -> Reconciler<StaticClusters> {
    Reconciler::new(&settings(dir), ProxyEnv::default(), clusters).unwrap()
}

fn rendered(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("haproxy.cfg")).unwrap()
}

#[tokio::test]
async fn test_linked_endpoint_is_routed() {
    let tmp = TempDir::new().unwrap();
    let mut rec = reconciler(tmp.path(), StaticClusters::default());

    let report = rec
        .run_cycle([
            ("DB_PORT_80_TCP_ADDR", "10.0.0.5"),
            ("DB_PORT_80_TCP_PORT", "8080"),
        ])
        .await
        .unwrap();

    assert_eq!(report.endpoints, 1);
    assert!(report.launched);
    assert!(!report.reloaded);
    assert!(matches!(report.outcome, Some(WriteOutcome::Replaced { .. })));
    assert!(rendered(tmp.path()).contains("backend cluster\n\tbalance roundrobin\n\tserver cluster-8080 10.0.0.5:8080\n"));

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_unchanged_model_does_not_reload() {
    let tmp = TempDir::new().unwrap();
    let mut rec = reconciler(tmp.path(), StaticClusters::default());
    let env = [
        ("DB_PORT_80_TCP_ADDR", "10.0.0.5"),
        ("DB_PORT_80_TCP_PORT", "8080"),
    ];

    rec.run_cycle(env).await.unwrap();
    let pid = rec.supervisor().current_pid().unwrap();

    let report = rec.run_cycle(env).await.unwrap();
    assert_eq!(report.outcome, Some(WriteOutcome::Unchanged));
    assert!(!report.launched);
    assert!(!report.reloaded);
    assert_eq!(rec.supervisor().current_pid(), Some(pid));

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_new_endpoint_triggers_reload() {
    let tmp = TempDir::new().unwrap();
    let mut rec = reconciler(tmp.path(), StaticClusters::default());

    rec.run_cycle([
        ("A_PORT_80_TCP_ADDR", "10.0.0.1"),
        ("A_PORT_80_TCP_PORT", "81"),
    ])
    .await
    .unwrap();
    let old_pid = rec.supervisor().current_pid().unwrap();

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        rec.run_cycle([
            ("A_PORT_80_TCP_ADDR", "10.0.0.1"),
            ("A_PORT_80_TCP_PORT", "81"),
            ("B_PORT_80_TCP_ADDR", "10.0.0.2"),
            ("B_PORT_80_TCP_PORT", "82"),
        ]),
    )
    .await
    .expect("reload should complete")
    .unwrap();

    assert!(report.reloaded);
    assert!(!report.launched);
    assert_ne!(rec.supervisor().current_pid(), Some(old_pid));
    assert!(rendered(tmp.path()).contains("\tserver cluster-82 10.0.0.2:82\n"));

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_cluster_members_are_pruned() {
    let tmp = TempDir::new().unwrap();
    let clusters = StaticClusters::default().with(
        "http://api.local/web/",
        Some(&[
            ("web-1_PORT_80_TCP_ADDR", "10.0.1.1"),
            ("web-1_PORT_80_TCP_PORT", "8001"),
        ]),
    );
    let mut rec = reconciler(tmp.path(), clusters);

    let report = rec
        .run_cycle([
            ("web_TUTUM_API_URL", "http://api.local/web/"),
            ("web-1_PORT_80_TCP_ADDR", "10.0.1.1"),
            ("web-1_PORT_80_TCP_PORT", "8001"),
            ("web-2_PORT_80_TCP_ADDR", "10.0.1.2"),
            ("web-2_PORT_80_TCP_PORT", "8002"),
            ("DB_PORT_80_TCP_ADDR", "10.0.0.5"),
            ("DB_PORT_80_TCP_PORT", "5432"),
        ])
        .await
        .unwrap();

    assert_eq!(report.clusters, vec!["web".to_string()]);
    assert_eq!(report.pruned, vec!["web-2".to_string()]);
    assert_eq!(report.endpoints, 2);

    let text = rendered(tmp.path());
    assert!(text.contains("10.0.1.1:8001"));
    assert!(text.contains("10.0.0.5:5432"));
    assert!(!text.contains("10.0.1.2"));

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_failed_cluster_keeps_known_endpoints() {
    let tmp = TempDir::new().unwrap();
    let clusters = StaticClusters::default().with("http://api.local/web/", None);
    let mut rec = reconciler(tmp.path(), clusters);

    let report = rec
        .run_cycle([
            ("web_TUTUM_API_URL", "http://api.local/web/"),
            ("web-1_PORT_80_TCP_ADDR", "10.0.1.1"),
            ("web-1_PORT_80_TCP_PORT", "8001"),
        ])
        .await
        .unwrap();

    assert_eq!(report.failed_clusters, vec!["web".to_string()]);
    assert!(report.pruned.is_empty());
    assert!(rendered(tmp.path()).contains("10.0.1.1:8001"));

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_partial_endpoint_does_not_abort_cycle() {
    let tmp = TempDir::new().unwrap();
    let mut rec = reconciler(tmp.path(), StaticClusters::default());

    let report = rec
        .run_cycle([
            ("DB_PORT_80_TCP_ADDR", "10.0.0.5"),
            ("WEB_PORT_80_TCP_ADDR", "10.0.0.6"),
            ("WEB_PORT_80_TCP_PORT", "8080"),
        ])
        .await
        .unwrap();

    assert_eq!(report.endpoints, 2);
    let text = rendered(tmp.path());
    assert!(text.contains("10.0.0.6:8080"));
    assert!(!text.contains("10.0.0.5"));

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_empty_environment_only_launches() {
    let tmp = TempDir::new().unwrap();
    let mut rec = reconciler(tmp.path(), StaticClusters::default());

    let report = rec
        .run_cycle(std::iter::empty::<(String, String)>())
        .await
        .unwrap();

    assert_eq!(report.outcome, None);
    assert!(report.launched);
    assert!(!tmp.path().join("haproxy.cfg").exists());

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_broken_baseline_fails_cycle_but_launches() {
    let tmp = TempDir::new().unwrap();
    let mut rec = reconciler(tmp.path(), StaticClusters::default());
    std::fs::write(tmp.path().join("empty_haproxy.cfg.json"), "not json").unwrap();

    let err = rec
        .run_cycle([
            ("DB_PORT_80_TCP_ADDR", "10.0.0.5"),
            ("DB_PORT_80_TCP_PORT", "8080"),
        ])
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Phase::Synthesize);
    assert!(rec.supervisor().current_pid().is_some());

    rec.shutdown(Duration::from_secs(2)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_reload_is_retried_on_next_cycle() {
    let tmp = TempDir::new().unwrap();
    // The proxy binary is reached through a link that can be taken away
    let shell = tmp.path().join("proxy-sh");
    std::os::unix::fs::symlink("/bin/sh", &shell).unwrap();

    let mut settings = settings(tmp.path());
    settings.proxy.command = format!(
        r#"{} -c 'if [ "$1" = "-sf" ]; then kill -TERM "$2"; fi; exec sleep 30' proxy"#,
        shell.display()
    );
    let mut rec = Reconciler::new(&settings, ProxyEnv::default(), StaticClusters::default()).unwrap();

    let env = [
        ("A_PORT_80_TCP_ADDR", "10.0.0.1"),
        ("A_PORT_80_TCP_PORT", "81"),
        ("B_PORT_80_TCP_ADDR", "10.0.0.2"),
        ("B_PORT_80_TCP_PORT", "82"),
    ];
    rec.run_cycle(env[..2].iter().copied()).await.unwrap();
    let old_pid = rec.supervisor().current_pid().unwrap();

    std::fs::remove_file(&shell).unwrap();
    let err = rec.run_cycle(env).await.unwrap_err();
    assert_eq!(err.phase(), Phase::Reload);
    assert_eq!(rec.supervisor().current_pid(), Some(old_pid));
    assert!(rendered(tmp.path()).contains("\tserver cluster-82 10.0.0.2:82\n"));

    std::os::unix::fs::symlink("/bin/sh", &shell).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), rec.run_cycle(env))
        .await
        .expect("reload should complete")
        .unwrap();
    assert_eq!(report.outcome, Some(WriteOutcome::Unchanged));
    assert!(report.reloaded);
    assert_ne!(rec.supervisor().current_pid(), Some(old_pid));

    let report = rec.run_cycle(env).await.unwrap();
    assert!(!report.reloaded);

    rec.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_run_loop_keeps_going_after_failures_and_stops() {
    let tmp = TempDir::new().unwrap();
    let launches = tmp.path().join("launches");

    let mut settings = settings(tmp.path());
    settings.reconcile.polling_period_secs = 1;
    // Exits right away, so every pass relaunches it
    settings.proxy.command = format!(r#"sh -c 'echo launch >> "$0"' {}"#, launches.display());
    std::fs::write(&settings.paths.baseline, "not json").unwrap();

    std::env::set_var("LOOP_PORT_65001_TCP_ADDR", "10.0.9.9");
    std::env::set_var("LOOP_PORT_65001_TCP_PORT", "9000");
    let env = ProxyEnv {
        port: "65001".to_string(),
        ..ProxyEnv::default()
    };
    let mut rec = Reconciler::new(&settings, env, StaticClusters::default()).unwrap();

    let (tx, rx) = watch::channel(false);
    let stop = async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
    };
    tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(rec.run(rx), stop);
    })
    .await
    .expect("loop should stop after shutdown is signalled");

    let count = std::fs::read_to_string(&launches)
        .unwrap()
        .lines()
        .count();
    assert!(count >= 2, "expected a launch per pass, got {count}");
    assert!(!tmp.path().join("haproxy.cfg").exists());

    rec.shutdown(Duration::from_secs(2)).await;
}
