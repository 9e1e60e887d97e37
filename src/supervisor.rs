//! Lifecycle of the external proxy process.
//!
//! A [`ProxyProcess`] moves through `Starting -> Ready -> Probing ->
//! Terminating -> Terminated`. Readiness is a bounded poll of the SOCKS
//! port; teardown sends a graceful stop, waits out a grace period and then
//! kills. Children are spawned with `kill_on_drop`, so a handle dropped by a
//! panic or an aborted task still takes its process down with it.

use crate::error::{ProbeError, Result};
use crate::models::ProxyConfigArtifact;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

pub const CONFIG_PLACEHOLDER: &str = "{config}";
pub const DEFAULT_PROXY_ARGS: [&str; 3] = ["run", "-c", CONFIG_PLACEHOLDER];

#[derive(Debug, Clone)]
pub struct ProxyCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl ProxyCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: DEFAULT_PROXY_ARGS.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Replaces the argument list. Every `{config}` occurrence is substituted
    /// with the artifact path at launch; without one the path is appended.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn build(&self, artifact: &ProxyConfigArtifact) -> Command {
        let config = artifact.path.to_string_lossy();
        let mut command = Command::new(&self.program);

        if self.args.iter().any(|arg| arg.contains(CONFIG_PLACEHOLDER)) {
            command.args(
                self.args
                    .iter()
                    .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config)),
            );
        } else {
            command.args(&self.args).arg(&artifact.path);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    command: ProxyCommand,
    settings: SupervisorSettings,
}

impl ProcessSupervisor {
    pub fn new(command: ProxyCommand, settings: SupervisorSettings) -> Self {
        Self { command, settings }
    }

    pub fn launch(&self, artifact: &ProxyConfigArtifact) -> Result<ProxyProcess> {
        let child = self
            .command
            .build(artifact)
            .spawn()
            .map_err(|source| ProbeError::ProcessLaunch {
                program: self.command.program.clone(),
                source,
            })?;

        let pid = child.id();
        debug!(
            domain = %artifact.domain,
            pid,
            socks = artifact.ports.socks,
            "proxy spawned"
        );

        Ok(ProxyProcess {
            child,
            pid,
            socks_port: artifact.ports.socks,
            state: ProxyState::Starting,
            settings: self.settings,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Starting,
    Ready,
    Probing,
    Terminating,
    Terminated,
}

/// How a teardown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Graceful,
    Killed,
    AlreadyExited,
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("could not signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("could not kill proxy: {0}")]
    Kill(#[source] std::io::Error),

    #[error("could not reap proxy: {0}")]
    Wait(#[source] std::io::Error),

    #[error("proxy still running {}ms after kill", .waited.as_millis())]
    Unresponsive { waited: Duration },
}

#[derive(Debug)]
pub struct ProxyProcess {
    child: Child,
    pid: Option<u32>,
    socks_port: u16,
    state: ProxyState,
    settings: SupervisorSettings,
}

impl ProxyProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn mark_probing(&mut self) {
        if self.state == ProxyState::Ready {
            self.state = ProxyState::Probing;
        }
    }

    pub async fn wait_ready(&mut self) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.settings.ready_timeout;
        let addr = (Ipv4Addr::LOCALHOST, self.socks_port);

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                debug!(port = self.socks_port, %status, "proxy exited while starting");
                return Err(ProbeError::ProxyExited {
                    port: self.socks_port,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = self
                .settings
                .poll_interval
                .min(remaining)
                .max(Duration::from_millis(1));
            if let Ok(Ok(stream)) = timeout(attempt, TcpStream::connect(addr)).await {
                drop(stream);
                self.state = ProxyState::Ready;
                debug!(
                    port = self.socks_port,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "proxy ready"
                );
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProbeError::ReadinessTimeout {
                    port: self.socks_port,
                    waited: started.elapsed(),
                });
            }

            sleep(self.settings.poll_interval.min(remaining)).await;
        }
    }

    /// Stops the proxy and reaps it. Safe to call more than once.
    pub async fn shutdown(&mut self) -> std::result::Result<Teardown, TeardownError> {
        if self.state == ProxyState::Terminated {
            return Ok(Teardown::AlreadyExited);
        }

        self.state = ProxyState::Terminating;
        let teardown = self.stop().await?;
        self.state = ProxyState::Terminated;
        Ok(teardown)
    }

    async fn stop(&mut self) -> std::result::Result<Teardown, TeardownError> {
        match self.child.try_wait() {
            Ok(Some(_)) => return Ok(Teardown::AlreadyExited),
            Ok(None) => {}
            Err(error) => return Err(TeardownError::Wait(error)),
        }

        let grace = self.settings.grace_period;
        if let Some(pid) = self.child.id() {
            if !request_stop(pid)? {
                return self.reap(grace).await.map(|_| Teardown::AlreadyExited);
            }

            match timeout(grace, self.child.wait()).await {
                Ok(Ok(_)) => return Ok(Teardown::Graceful),
                Ok(Err(error)) => return Err(TeardownError::Wait(error)),
                Err(_) => debug!(pid, "proxy ignored stop request, killing"),
            }
        }

        if let Err(error) = self.child.start_kill() {
            return match self.child.try_wait() {
                Ok(Some(_)) => Ok(Teardown::AlreadyExited),
                _ => Err(TeardownError::Kill(error)),
            };
        }

        self.reap(grace).await.map(|_| Teardown::Killed)
    }

    async fn reap(&mut self, limit: Duration) -> std::result::Result<(), TeardownError> {
        match timeout(limit, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(TeardownError::Wait(error)),
            Err(_) => Err(TeardownError::Unresponsive { waited: limit }),
        }
    }
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        if self.state != ProxyState::Terminated {
            warn!(
                pid = self.pid,
                port = self.socks_port,
                "proxy handle dropped before teardown, killing"
            );
        }
    }
}

/// Sends SIGTERM. `Ok(false)` means the process was already gone.
#[cfg(unix)]
fn request_stop(pid: u32) -> std::result::Result<bool, TeardownError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(error) => Err(TeardownError::Signal {
            pid,
            reason: error.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn request_stop(_pid: u32) -> std::result::Result<bool, TeardownError> {
    Ok(true)
}
