//! Singleton broker control
//!
//! At most one broker serves a control address. [`ensure_running`] connects to the
//! address and only spawns a broker when nothing answers; the spawned broker
//! announces itself with a `READY <addr>` line on stdout once its listener is
//! bound. Losing a start race is not an error: the loser exits, the connection attempt is
//! repeated and the winner is used.

use crate::error::{ShmError, ShmResult};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use shmb::config::BrokerConfig;
use shmb::consts::{BROKER_BIN_ENV, DEFAULT_BROKER_BIN, READY_LINE_PREFIX};
use shmb::protocol::Command as ControlCommand;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Control address from the defaults and the `SHMB_ADDRESS` override
pub fn broker_address() -> ShmResult<SocketAddr> {
    Ok(BrokerConfig::default().with_env_overrides()?.address)
}

/// How to find and start the broker
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Control address to check and to pass to a spawned broker
    pub address: SocketAddr,
    /// Broker executable
    pub broker_bin: PathBuf,
    /// Upper bound on waiting for the readiness line
    pub ready_timeout: Duration,
    /// File the spawned broker appends its logs to; discarded when unset
    pub log_file: Option<PathBuf>,
}

impl ServiceConfig {
    /// Derive from a broker configuration; the executable comes from
    /// `SHMB_BROKER_BIN` or defaults to `shmb` on `PATH`.
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        let broker_bin = std::env::var_os(BROKER_BIN_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BROKER_BIN));

        Self {
            address: config.address,
            broker_bin,
            ready_timeout: config.ready_timeout(),
            log_file: None,
        }
    }

    /// Defaults plus environment overrides
    pub fn resolve() -> ShmResult<Self> {
        let config = BrokerConfig::default().with_env_overrides()?;
        Ok(Self::from_broker_config(&config))
    }

    /// Use a specific broker executable.
    pub fn with_broker_bin(mut self, broker_bin: impl Into<PathBuf>) -> Self {
        self.broker_bin = broker_bin.into();
        self
    }

    /// Send the spawned broker's logs to `path`.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    // The broker outlives the caller, so it must not hold the caller's stderr.
    fn broker_stderr(&self) -> ShmResult<Stdio> {
        match &self.log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(file))
            }
            None => Ok(Stdio::null()),
        }
    }
}

/// Broker started by [`ensure_running`]
#[derive(Debug)]
pub struct BrokerProcess {
    /// OS process id
    pub pid: u32,
    child: Child,
}

impl BrokerProcess {
    /// Ask the broker to shut down via SIGTERM.
    pub fn terminate(&self) -> ShmResult<()> {
        kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM)?;
        Ok(())
    }

    /// Wait for the broker process to exit.
    pub async fn wait(mut self) -> ShmResult<ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

/// True if a broker accepts connections on `address`.
///
/// Refused connections mean "no broker"; any other failure is an error.
pub async fn is_reachable(address: SocketAddr) -> ShmResult<bool> {
    match TcpStream::connect(address).await {
        Ok(_) => Ok(true),
        Err(e) => match ShmError::from_connect(address, e) {
            ShmError::ConnectionRefused { .. } => Ok(false),
            other => Err(other),
        },
    }
}

/// Make sure a broker serves `config.address`.
///
/// Returns `None` when one was already running (or another process won the
/// race to start it) and the spawned process otherwise.
pub async fn ensure_running(config: &ServiceConfig) -> ShmResult<Option<BrokerProcess>> {
    if is_reachable(config.address).await? {
        debug!(address = %config.address, "broker already running");
        return Ok(None);
    }

    info!(
        address = %config.address,
        bin = %config.broker_bin.display(),
        "starting broker"
    );
    let mut child = Command::new(&config.broker_bin)
        .arg("serve")
        .arg("--address")
        .arg(config.address.to_string())
        .arg("--notify-ready")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(config.broker_stderr()?)
        .process_group(0)
        .spawn()
        .map_err(|e| ShmError::SpawnFailed {
            reason: format!("{}: {e}", config.broker_bin.display()),
        })?;

    let pid = child.id().ok_or_else(|| ShmError::SpawnFailed {
        reason: "broker exited immediately".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| ShmError::SpawnFailed {
        reason: "broker stdout not captured".to_string(),
    })?;

    match tokio::time::timeout(config.ready_timeout, wait_ready(stdout)).await {
        Ok(Ok(Some(announced))) => {
            info!(pid, address = %announced, "broker ready");
            Ok(Some(BrokerProcess { pid, child }))
        }
        Ok(Ok(None)) => {
            let status = child.wait().await?;
            if is_reachable(config.address).await? {
                debug!(pid, %status, "lost the start race, using the running broker");
                return Ok(None);
            }
            Err(ShmError::SpawnFailed {
                reason: format!("broker exited before becoming ready ({status})"),
            })
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "reading broker readiness failed, killing it");
            reap(&mut child).await;
            Err(e.into())
        }
        Err(_) => {
            warn!(pid, "broker did not become ready, killing it");
            reap(&mut child).await;
            Err(ShmError::ReadyTimeout {
                timeout_ms: config.ready_timeout.as_millis() as u64,
            })
        }
    }
}

async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

// Address from the first readiness line, or None if stdout closed first.
async fn wait_ready(stdout: ChildStdout) -> std::io::Result<Option<String>> {
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(rest) = line.strip_prefix(READY_LINE_PREFIX) {
            return Ok(Some(rest.trim().to_string()));
        }
        debug!(%line, "ignoring broker output");
    }
    Ok(None)
}

/// Send `SHUTDOWN` to the broker at `address`.
///
/// Returns once the command is written; teardown happens asynchronously.
pub async fn shutdown_server(address: SocketAddr) -> ShmResult<()> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|e| ShmError::from_connect(address, e))?;
    stream.write_all(&[ControlCommand::Shutdown.as_byte()]).await?;
    stream.shutdown().await?;
    debug!(%address, "shutdown requested");
    Ok(())
}
