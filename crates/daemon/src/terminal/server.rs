//! TCP listener that upgrades connections to WebSocket terminal sessions.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::bridge::TerminalBridge;
use super::pty::TerminalError;
use crate::relay::{RelayEvent, ShutdownRelay};

/// Accepts connections and runs one [`TerminalBridge`] session per peer.
pub struct TerminalServer {
    listener: TcpListener,
    bridge: TerminalBridge,
    relay: ShutdownRelay,
    grace: Duration,
}

impl TerminalServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        bridge: TerminalBridge,
        relay: ShutdownRelay,
        grace: Duration,
    ) -> Result<Self, TerminalError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            bridge,
            relay,
            grace,
        })
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TerminalError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `token` is cancelled, then waits for every open session
    /// to finish tearing down. Sessions still open after the grace period
    /// are logged and waited for, so no shell is left unreaped.
    ///
    /// If the accept loop dies on its own, a shutdown is requested through
    /// the relay so the whole daemon stops.
    pub async fn run(self, token: CancellationToken) {
        let sessions = TaskTracker::new();

        let failed = loop {
            tokio::select! {
                _ = token.cancelled() => break false,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bridge = self.bridge.clone();
                        let session_token = token.child_token();
                        sessions.spawn(handle_connection(bridge, stream, peer, session_token));
                    }
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "Transient accept error");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Terminal listener failed");
                        break true;
                    }
                },
            }
        };

        sessions.close();
        if failed {
            token.cancel();
            if let Err(e) = self.relay.send(RelayEvent::Shutdown) {
                error!(error = %e, "Failed to request daemon shutdown");
            }
        }

        if tokio::time::timeout(self.grace, sessions.wait()).await.is_err() {
            warn!(
                open_sessions = sessions.len(),
                grace = ?self.grace,
                "Sessions still open after grace period, waiting for teardown"
            );
            // Every session is already stopping and reaps its own shell. The
            // supervisor's shutdown timeout bounds this wait for the daemon.
            sessions.wait().await;
        }
        info!("Terminal server stopped");
    }
}

async fn handle_connection(
    bridge: TerminalBridge,
    stream: TcpStream,
    peer: SocketAddr,
    token: CancellationToken,
) {
    let span = tracing::debug_span!("connection", peer = %peer);
    async move {
        let upgraded = tokio::select! {
            _ = token.cancelled() => return,
            upgraded = tokio_tungstenite::accept_async(stream) => upgraded,
        };
        let ws = match upgraded {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket upgrade failed");
                return;
            }
        };
        debug!("WebSocket connection established");

        if let Err(e) = bridge.serve(ws, &peer.to_string(), token).await {
            warn!(error = %e, "Terminal session failed");
        }
    }
    .instrument(span)
    .await
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    ) || e.raw_os_error() == Some(nix::libc::EMFILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::bridge::BridgeConfig;
    use crate::terminal::pty::{ExitInfo, PtyChild, PtyMaster, PtySpawner, ShellCommand, SpawnedPty};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn bound_server(relay: ShutdownRelay) -> TerminalServer {
        TerminalServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            TerminalBridge::new(BridgeConfig::default()),
            relay,
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel_without_relay_event() {
        let events = Arc::new(AtomicUsize::new(0));
        let events_clone = Arc::clone(&events);
        let relay = ShutdownRelay::with_action(move |_| {
            events_clone.fetch_add(1, Ordering::SeqCst);
        });
        let server = bound_server(relay.clone()).await;
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let token = CancellationToken::new();
        let handle = tokio::spawn(server.run(token.clone()));
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server should stop")
            .unwrap();

        let relay_token = CancellationToken::new();
        relay_token.cancel();
        relay.run(relay_token).await;
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_upgrade_does_not_stop_server() {
        use tokio::io::AsyncWriteExt;

        let server = bound_server(ShutdownRelay::with_action(|_| {})).await;
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.run(token.clone()));

        let mut plain = TcpStream::connect(addr).await.unwrap();
        plain.write_all(b"not a websocket\r\n\r\n").await.unwrap();
        drop(plain);

        // Still accepting.
        TcpStream::connect(addr).await.unwrap();
        assert!(!handle.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server should stop")
            .unwrap();
    }

    /// Spawns fake shells whose reaping takes `reap_delay`.
    struct SlowReapSpawner {
        reap_delay: Duration,
        spawned: Arc<AtomicUsize>,
        reaped: Arc<AtomicUsize>,
    }

    struct IdleMaster;

    impl PtyMaster for IdleMaster {
        fn resize(&self, _: protocol::WindowSize) -> Result<(), TerminalError> {
            Ok(())
        }
    }

    struct SlowChild {
        output: std::os::unix::net::UnixStream,
        reap_delay: Duration,
        reaped: Arc<AtomicUsize>,
    }

    impl PtyChild for SlowChild {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn terminate(&mut self) -> std::io::Result<()> {
            self.output.shutdown(std::net::Shutdown::Both)
        }

        fn wait(&mut self) -> std::io::Result<ExitInfo> {
            std::thread::sleep(self.reap_delay);
            self.reaped.fetch_add(1, Ordering::SeqCst);
            Ok(ExitInfo { code: 0 })
        }
    }

    impl PtySpawner for SlowReapSpawner {
        fn spawn(
            &self,
            _: &ShellCommand,
            _: protocol::WindowSize,
        ) -> Result<SpawnedPty, TerminalError> {
            let (shell_side, bridge_side) = std::os::unix::net::UnixStream::pair()?;
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(SpawnedPty {
                reader: Box::new(bridge_side),
                writer: Box::new(std::io::sink()),
                master: Box::new(IdleMaster),
                child: Box::new(SlowChild {
                    output: shell_side,
                    reap_delay: self.reap_delay,
                    reaped: Arc::clone(&self.reaped),
                }),
            })
        }
    }

    #[tokio::test]
    async fn test_run_waits_for_sessions_past_grace() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let reaped = Arc::new(AtomicUsize::new(0));
        let spawner = SlowReapSpawner {
            reap_delay: Duration::from_millis(800),
            spawned: Arc::clone(&spawned),
            reaped: Arc::clone(&reaped),
        };
        let server = TerminalServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            TerminalBridge::with_spawner(BridgeConfig::default(), Arc::new(spawner)),
            ShutdownRelay::with_action(|_| {}),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.run(token.clone()));

        let (_client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while spawned.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session should start");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should stop")
            .unwrap();

        // The grace period was far shorter than the reap, yet the shell
        // was reaped before `run` returned.
        assert_eq!(reaped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_errors() {
        use std::io::{Error, ErrorKind};
        assert!(is_transient(&Error::from(ErrorKind::ConnectionAborted)));
        assert!(is_transient(&Error::from_raw_os_error(nix::libc::EMFILE)));
        assert!(!is_transient(&Error::from(ErrorKind::PermissionDenied)));
    }
}
