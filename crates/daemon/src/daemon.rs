//! Process-level wiring.
//!
//! The daemon owns one [`Supervisor`] with two long-lived tasks:
//!
//! - `"relay"`: consumes [`ShutdownRelay`] events and turns them into a
//!   `SIGTERM` for this process;
//! - `"server"`: the WebSocket terminal listener (skipped when
//!   `server.enabled = false`).
//!
//! [`Daemon::run`] blocks until `SIGINT` or `SIGTERM`, then stops every task
//! within `daemon.shutdown_timeout_secs`.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::pidfile::PidFile;
use crate::relay::{RelayEvent, ShutdownRelay};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::terminal::{BridgeConfig, TerminalBridge, TerminalServer};

/// Name of the terminal listener task.
pub const SERVER_TASK: &str = "server";

/// Name of the shutdown relay task.
pub const RELAY_TASK: &str = "relay";

/// The running daemon process.
pub struct Daemon {
    config: Config,
    supervisor: Supervisor,
    relay: ShutdownRelay,
    pid_file: PidFile,
}

impl Daemon {
    /// Creates a daemon whose relay signals this process.
    pub fn new(config: Config) -> Self {
        Self::with_relay(config, ShutdownRelay::new())
    }

    /// Creates a daemon with a custom relay.
    pub fn with_relay(config: Config, relay: ShutdownRelay) -> Self {
        let supervisor = Supervisor::new().with_failure_handler(|failure| {
            error!(task = %failure.task, "panic occurred: {}", failure.message);
        });
        let pid_file = PidFile::new(config.daemon.pid_file());

        Self {
            config,
            supervisor,
            relay,
            pid_file,
        }
    }

    /// The task supervisor.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The PID file this daemon owns.
    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Runs until `SIGINT` or `SIGTERM`.
    ///
    /// # Errors
    ///
    /// Fails if another instance is running, the PID file cannot be
    /// written, or the signal handlers cannot be installed.
    pub async fn run(self) -> Result<()> {
        // Installed before any task starts, so a relayed SIGTERM is caught.
        let mut signals = ShutdownSignals::install()?;
        self.run_until(async move {
            let name = signals.recv().await;
            info!(signal = name, "Received shutdown signal");
        })
        .await
    }

    /// Runs until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Fails if another instance is running or the PID file cannot be
    /// written. A shutdown timeout is logged, not returned.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Some(pid) = self.pid_file.running_pid() {
            anyhow::bail!("termgate is already running (PID {pid})");
        }
        self.pid_file.write().with_context(|| {
            format!(
                "Failed to write PID file: {}",
                self.pid_file.path().display()
            )
        })?;

        let result = self.serve(shutdown).await;

        self.pid_file.remove();
        info!("termgate stopped");
        result
    }

    async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.register_tasks().await?;

        info!(
            pid = std::process::id(),
            version = env!("CARGO_PKG_VERSION"),
            "termgate started"
        );
        self.supervisor.run_all().await;

        shutdown.await;

        let timeout = self.config.daemon.shutdown_timeout();
        match self.supervisor.shutdown_all(Some(timeout)).await {
            Ok(()) => {}
            Err(SupervisorError::Timeout { timeout, .. }) => {
                warn!(timeout = ?timeout, "Services did not stop in time");
            }
            Err(e) => warn!(error = %e, "Shutdown failed"),
        }
        Ok(())
    }

    async fn register_tasks(&self) -> Result<()> {
        let relay = self.relay.clone();
        self.supervisor
            .add_task(RELAY_TASK, move |token: CancellationToken| {
                let relay = relay.clone();
                async move { relay.run(token).await }
            })
            .await?;

        if !self.config.server.enabled {
            info!("Terminal server disabled");
            return Ok(());
        }

        let addr = self.config.server.socket_addr()?;
        let bridge = self.config.terminal.bridge_config();
        let grace = self.config.server.shutdown_grace();
        let relay = self.relay.clone();
        self.supervisor
            .add_task(SERVER_TASK, move |token: CancellationToken| {
                serve_terminals(addr, bridge.clone(), relay.clone(), grace, token)
            })
            .await?;

        Ok(())
    }
}

async fn serve_terminals(
    addr: SocketAddr,
    bridge: BridgeConfig,
    relay: ShutdownRelay,
    grace: Duration,
    token: CancellationToken,
) {
    let server =
        match TerminalServer::bind(addr, TerminalBridge::new(bridge), relay.clone(), grace).await {
            Ok(server) => server,
            Err(e) => {
                error!(addr = %addr, error = %e, "Failed to bind terminal server");
                if let Err(e) = relay.send(RelayEvent::Shutdown) {
                    error!(error = %e, "Failed to request daemon shutdown");
                }
                return;
            }
        };

    match server.local_addr() {
        Ok(local) => info!(addr = %local, "Terminal server listening"),
        Err(_) => info!(addr = %addr, "Terminal server listening"),
    }
    server.run(token).await;
}

/// `SIGINT` and `SIGTERM` streams.
struct ShutdownSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?,
            interrupt: signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}

/// Sends `SIGTERM` to the daemon recorded in `pid_file`.
///
/// Returns the PID that was signalled.
///
/// # Errors
///
/// Fails if no live daemon is recorded or the signal cannot be sent.
pub fn stop_running(pid_file: &PidFile) -> Result<u32> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = pid_file
        .running_pid()
        .context("termgate is not running")?;
    let raw = i32::try_from(pid).context("Invalid PID in PID file")?;

    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .with_context(|| format!("Failed to signal termgate (PID {pid})"))?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().to_path_buf();
        config.daemon.shutdown_timeout_secs = 2;
        config.server.bind_address = "127.0.0.1:0".to_string();
        config.terminal.shell = "/bin/sh".to_string();
        config
    }

    #[tokio::test]
    async fn test_registers_both_tasks() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::with_relay(test_config(&dir), ShutdownRelay::with_action(|_| {}));

        daemon.register_tasks().await.unwrap();

        assert_eq!(
            daemon.supervisor().task_names().await,
            vec![RELAY_TASK.to_string(), SERVER_TASK.to_string()]
        );
    }

    #[tokio::test]
    async fn test_disabled_server_is_not_registered() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.server.enabled = false;
        let daemon = Daemon::with_relay(config, ShutdownRelay::with_action(|_| {}));

        daemon.register_tasks().await.unwrap();

        assert_eq!(daemon.supervisor().task_names().await, vec![RELAY_TASK.to_string()]);
    }

    #[tokio::test]
    async fn test_run_until_writes_and_removes_pid_file() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let pid_path = config.daemon.pid_file();
        let daemon = Daemon::with_relay(config, ShutdownRelay::with_action(|_| {}));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(daemon.run_until(async move {
            let _ = rx.await;
        }));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !pid_path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("PID file should be written");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon should stop")
            .unwrap()
            .unwrap();

        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn test_refuses_second_instance() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        // This test process is alive, so the file names a live daemon.
        PidFile::new(config.daemon.pid_file()).write().unwrap();

        let daemon = Daemon::with_relay(config, ShutdownRelay::with_action(|_| {}));
        let err = daemon.run_until(async {}).await.unwrap_err();

        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn test_bind_failure_requests_shutdown() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let events = Arc::new(AtomicUsize::new(0));
        let events_clone = Arc::clone(&events);
        let relay = ShutdownRelay::with_action(move |_| {
            events_clone.fetch_add(1, Ordering::SeqCst);
        });

        serve_terminals(
            addr,
            BridgeConfig::default(),
            relay.clone(),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await;

        let token = CancellationToken::new();
        token.cancel();
        relay.run(token).await;
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_without_daemon() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("termgate.pid"));
        let err = stop_running(&pid_file).unwrap_err();
        assert!(err.to_string().contains("not running"));
    }
}
