//! Proxy process lifecycle
//!
//! The supervisor owns the single "current" proxy process. A reload starts a
//! second instance with `<reload flag> <old pid>` appended to the command
//! line; the proxy hands its listening sockets over and the old instance
//! drains and exits. The supervisor then records the new instance as current.

use crate::config::ProxyCommandConfig;
use crate::error::CycleError;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A spawned proxy process and the configuration it was started against
#[derive(Debug)]
pub struct ProxyHandle {
    child: Child,
    pid: u32,
    config: PathBuf,
    started_at: Instant,
}

impl ProxyHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &Path {
        &self.config
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Lifecycle state of the supervised proxy
#[derive(Debug)]
pub enum SupervisorState {
    /// No process launched yet
    NotStarted,
    /// One process serving
    Running(ProxyHandle),
    /// Hand-off in progress: `old` drains while `new` serves
    Reloading { old: ProxyHandle, new: ProxyHandle },
}

impl SupervisorState {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorState::NotStarted => "not_started",
            SupervisorState::Running(_) => "running",
            SupervisorState::Reloading { .. } => "reloading",
        }
    }
}

/// Launches, reloads and stops the proxy process
#[derive(Debug)]
pub struct Supervisor {
    argv: Vec<String>,
    reload_flag: String,
    drain_warn_interval: Duration,
    config: PathBuf,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(proxy: &ProxyCommandConfig, config: PathBuf) -> anyhow::Result<Self> {
        Ok(Self {
            argv: proxy.argv()?,
            reload_flag: proxy.reload_flag.clone(),
            drain_warn_interval: proxy.drain_warn_interval(),
            config,
            state: SupervisorState::NotStarted,
        })
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Pid of the process currently serving, if any
    pub fn current_pid(&self) -> Option<u32> {
        match &self.state {
            SupervisorState::NotStarted => None,
            SupervisorState::Running(handle) => Some(handle.pid),
            SupervisorState::Reloading { new, .. } => Some(new.pid),
        }
    }

    fn spawn(&self, extra_args: &[String]) -> io::Result<ProxyHandle> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.args(extra_args);
        cmd.stdin(Stdio::null());

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "proxy exited before its pid was known"))?;
        info!(
            pid,
            command = %self.argv.join(" "),
            extra_args = ?extra_args,
            config = %self.config.display(),
            "Proxy process spawned"
        );

        Ok(ProxyHandle {
            child,
            pid,
            config: self.config.clone(),
            started_at: Instant::now(),
        })
    }

    /// Launch the proxy unless a process is already serving.
    ///
    /// A process that exited on its own is reported and replaced. Returns
    /// whether a process was launched.
    pub fn ensure_running(&mut self) -> Result<bool, CycleError> {
        if let SupervisorState::Running(handle) = &mut self.state {
            match handle.child.try_wait() {
                Ok(None) => return Ok(false),
                Ok(Some(status)) => {
                    warn!(
                        pid = handle.pid,
                        ?status,
                        uptime_secs = handle.uptime().as_secs(),
                        "Proxy process exited unexpectedly, relaunching"
                    );
                    self.state = SupervisorState::NotStarted;
                }
                Err(e) => {
                    warn!(pid = handle.pid, error = %e, "Failed to poll proxy process status");
                    return Ok(false);
                }
            }
        }

        match self.state {
            SupervisorState::NotStarted => {
                let handle = self.spawn(&[]).map_err(CycleError::Launch)?;
                self.state = SupervisorState::Running(handle);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Hand off from the current process to a fresh one.
    ///
    /// Blocks until the old process has exited; there is no timeout. If the
    /// new process cannot be spawned the old one stays current. Without a
    /// current process this does nothing.
    pub async fn reload(&mut self) -> Result<(), CycleError> {
        self.finish_reload().await;

        let old = match std::mem::replace(&mut self.state, SupervisorState::NotStarted) {
            SupervisorState::Running(old) => old,
            other => {
                debug!(state = other.name(), "No running proxy to reload");
                self.state = other;
                return Ok(());
            }
        };

        let args = [self.reload_flag.clone(), old.pid.to_string()];
        let new = match self.spawn(&args) {
            Ok(new) => new,
            Err(e) => {
                self.state = SupervisorState::Running(old);
                return Err(CycleError::Reload(e));
            }
        };

        info!(
            old_pid = old.pid,
            new_pid = new.pid,
            config = %new.config().display(),
            "Proxy reloading, waiting for old process to drain"
        );
        self.state = SupervisorState::Reloading { old, new };
        self.finish_reload().await;
        Ok(())
    }

    /// Wait for the draining process of an in-progress reload, then promote
    /// the new one
    async fn finish_reload(&mut self) {
        let interval = self.drain_warn_interval;
        let SupervisorState::Reloading { old, .. } = &mut self.state else {
            return;
        };

        let old_pid = old.pid;
        let started = Instant::now();
        loop {
            tokio::select! {
                result = old.child.wait() => {
                    match result {
                        Ok(status) => info!(old_pid, ?status, "Old proxy process exited"),
                        Err(e) => warn!(old_pid, error = %e, "Error waiting for old proxy process"),
                    }
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    warn!(
                        old_pid,
                        waiting_secs = started.elapsed().as_secs(),
                        "Old proxy process is still draining"
                    );
                }
            }
        }

        if let SupervisorState::Reloading { new, .. } =
            std::mem::replace(&mut self.state, SupervisorState::NotStarted)
        {
            info!(pid = new.pid, "Proxy reload complete");
            self.state = SupervisorState::Running(new);
        }
    }

    /// Stop every supervised process, SIGTERM first then SIGKILL after `grace`
    pub async fn shutdown(&mut self, grace: Duration) {
        match std::mem::replace(&mut self.state, SupervisorState::NotStarted) {
            SupervisorState::NotStarted => {}
            SupervisorState::Running(mut handle) => stop_process(&mut handle, grace).await,
            SupervisorState::Reloading { mut old, mut new } => {
                stop_process(&mut new, grace).await;
                stop_process(&mut old, grace).await;
            }
        }
    }
}

async fn stop_process(handle: &mut ProxyHandle, grace: Duration) {
    let pid = handle.pid;
    info!(pid, "Sending SIGTERM to proxy");

    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    #[cfg(not(unix))]
    {
        let _ = handle.child.start_kill();
    }

    match tokio::time::timeout(grace, handle.child.wait()).await {
        Ok(Ok(status)) => info!(pid, ?status, "Proxy exited"),
        Ok(Err(e)) => warn!(pid, error = %e, "Error waiting for proxy to exit"),
        Err(_) => {
            warn!(pid, grace_secs = grace.as_secs(), "Grace period exceeded, sending SIGKILL");
            let _ = handle.child.kill().await;
        }
    }
}
