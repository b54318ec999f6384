use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the reconciler
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Locations of the configuration files shared with the proxy
    #[serde(default)]
    pub paths: PathsConfig,

    /// How the proxy process is launched and reloaded
    #[serde(default)]
    pub proxy: ProxyCommandConfig,

    /// Reconciliation loop settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Baseline template in model (JSON) form
    #[serde(default = "default_baseline_path")]
    pub baseline: PathBuf,

    /// Live serialized model, compared against each candidate
    #[serde(default = "default_model_path")]
    pub model: PathBuf,

    /// Live rendered configuration read by the proxy at startup
    #[serde(default = "default_config_path")]
    pub config: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            baseline: default_baseline_path(),
            model: default_model_path(),
            config: default_config_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyCommandConfig {
    /// Command line used to start the proxy (shell-words syntax)
    #[serde(default = "default_proxy_command")]
    pub command: String,

    /// Flag passed together with the outgoing pid on reload
    #[serde(default = "default_reload_flag")]
    pub reload_flag: String,

    /// Interval between "still waiting" warnings while the old process drains
    #[serde(default = "default_drain_warn_interval")]
    pub drain_warn_interval_secs: u64,
}

impl Default for ProxyCommandConfig {
    fn default() -> Self {
        Self {
            command: default_proxy_command(),
            reload_flag: default_reload_flag(),
            drain_warn_interval_secs: default_drain_warn_interval(),
        }
    }
}

impl ProxyCommandConfig {
    /// Split the command line into program and arguments
    pub fn argv(&self) -> anyhow::Result<Vec<String>> {
        let argv = shell_words::split(&self.command)
            .map_err(|e| anyhow::anyhow!("Invalid proxy command '{}': {}", self.command, e))?;
        if argv.is_empty() {
            anyhow::bail!("Proxy command is empty");
        }
        Ok(argv)
    }

    pub fn drain_warn_interval(&self) -> Duration {
        Duration::from_secs(self.drain_warn_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Seconds between two reconciliation passes
    #[serde(default = "default_polling_period")]
    pub polling_period_secs: u64,

    /// Aggregate backend receiving one server line per endpoint
    #[serde(default = "default_backend_name")]
    pub backend_name: String,

    /// Environment key suffix naming a cluster API URI
    #[serde(default = "default_cluster_marker")]
    pub cluster_marker: String,

    /// Timeout for a single cluster API request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            polling_period_secs: default_polling_period(),
            backend_name: default_backend_name(),
            cluster_marker: default_cluster_marker(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ReconcileConfig {
    pub fn polling_period(&self) -> Duration {
        Duration::from_secs(self.polling_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Scalar settings taken from the process environment.
///
/// These feed the placeholder substitution at render time and the
/// discovery markers, so they are read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyEnv {
    pub port: String,
    pub mode: String,
    pub balance: String,
    pub maxconn: String,
    pub ssl: String,
    pub options: Vec<String>,
    pub timeouts: Vec<String>,
    /// Value of the `Authorization` header sent to cluster APIs
    pub auth: Option<String>,
}

impl Default for ProxyEnv {
    fn default() -> Self {
        Self::from_vars(&HashMap::new())
    }
}

impl ProxyEnv {
    pub fn from_env() -> Self {
        Self::from_vars(&process_env().into_iter().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str, default: &str| {
            vars.get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            port: get("PORT", "80"),
            mode: get("MODE", "http"),
            balance: get("BALANCE", "roundrobin"),
            maxconn: get("MAXCONN", "4096"),
            ssl: get("SSL", ""),
            options: split_list(&get("OPTIONS", "redispatch")),
            timeouts: split_list(&get("TIMEOUTS", "connect 5000,client 50000,server 50000")),
            auth: vars.get("TUTUM_AUTH").cloned(),
        }
    }

    /// Substring identifying per-endpoint discovery variables
    pub fn endpoint_marker(&self) -> String {
        format!("_PORT_{}_TCP", self.port)
    }
}

/// Current process environment, skipping entries that are not valid UTF-8
pub(crate) fn process_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::to_string).collect()
}

fn default_baseline_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/empty_haproxy.cfg.json")
}

fn default_model_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg.json")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg")
}

fn default_proxy_command() -> String {
    "/usr/sbin/haproxy -f /etc/haproxy/haproxy.cfg -db".to_string()
}

fn default_reload_flag() -> String {
    "-sf".to_string()
}

fn default_drain_warn_interval() -> u64 {
    60
}

fn default_polling_period() -> u64 {
    30
}

fn default_backend_name() -> String {
    "cluster".to_string()
}

fn default_cluster_marker() -> String {
    "_TUTUM_API_URL".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.proxy.argv() {
            errors.push(e.to_string());
        }
        if self.proxy.reload_flag.trim().is_empty() {
            errors.push("proxy.reload_flag must not be empty".to_string());
        }
        if self.reconcile.polling_period_secs == 0 {
            errors.push("reconcile.polling_period_secs must be greater than 0".to_string());
        }
        if self.reconcile.backend_name.trim().is_empty() {
            errors.push("reconcile.backend_name must not be empty".to_string());
        }
        if self.reconcile.cluster_marker.is_empty() {
            errors.push("reconcile.cluster_marker must not be empty".to_string());
        }
        if self.paths.model == self.paths.config {
            errors.push("paths.model and paths.config must differ".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
