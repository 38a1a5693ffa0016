//! WebSocket ⇄ pty session bridge.
//!
//! One [`TerminalBridge::serve`] call owns one connection, one pty and one
//! shell process for the whole lifetime of the session. Two pumps run
//! concurrently:
//!
//! - **outbound**: pty output → binary frames, each sent under a write
//!   deadline so a stalled peer cannot wedge the session;
//! - **inbound**: binary frames → pty input, text frames → control
//!   messages (resize).
//!
//! Whichever pump finishes first cancels the session's stop token. The
//! coordinator then tears down in a fixed order:
//!
//! ```text
//! close connection → join inbound → close pty → kill child → reap child → join outbound
//! ```
//!
//! Closing the connection first guarantees the inbound pump is no longer
//! writing to the pty when it is closed; reaping before joining the outbound
//! pump guarantees its blocking read sees EOF.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{ControlAction, ControlMessage, WindowSize};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::pty::{
    ExitInfo, NativePtySpawner, PtyChild, PtyMaster, PtySpawner, ShellCommand, SpawnedPty,
    TerminalError,
};

/// Size of each pty read.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default budget for sending one frame to the peer.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Text sent to the peer when the shell cannot be started.
pub const SPAWN_FAILURE_NOTICE: &str = "failed to open pty";

/// Pty output chunks buffered between the reader thread and the outbound pump.
const OUTPUT_QUEUE_DEPTH: usize = 32;

/// How long teardown waits for the blocking pty reader to observe EOF.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A duplex WebSocket-style connection carrying tungstenite messages.
pub trait FrameConnection:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static
{
}

impl<T> FrameConnection for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static
{
}

/// Settings shared by every session of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Shell to start for each session.
    pub command: ShellCommand,
    /// Window size before the first resize.
    pub initial_size: WindowSize,
    /// Budget for sending one frame.
    pub write_deadline: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: ShellCommand::new("/bin/sh").env("TERM", "xterm-256color"),
            initial_size: WindowSize::new(120, 30),
            write_deadline: WRITE_DEADLINE,
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Identifier used in logs.
    pub session_id: String,
    /// Shell process id.
    pub pid: Option<u32>,
    /// Exit status, if the process could be reaped.
    pub exit: Option<ExitInfo>,
    /// Window size at the end of the session.
    pub final_size: WindowSize,
}

/// Runs terminal sessions over already-upgraded connections.
#[derive(Clone)]
pub struct TerminalBridge {
    config: BridgeConfig,
    spawner: Arc<dyn PtySpawner>,
}

impl TerminalBridge {
    /// Creates a bridge that spawns shells on native ptys.
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_spawner(config, Arc::new(NativePtySpawner))
    }

    /// Creates a bridge with a custom pty spawner.
    pub fn with_spawner(config: BridgeConfig, spawner: Arc<dyn PtySpawner>) -> Self {
        Self { config, spawner }
    }

    /// Returns the bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Runs one session to completion.
    ///
    /// Returns once both pumps have stopped and the shell has been reaped.
    /// Cancelling `shutdown` ends the session through the same teardown
    /// path as a peer disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::SpawnFailed`] if the shell could not be
    /// started; the peer receives [`SPAWN_FAILURE_NOTICE`] and the
    /// connection is closed. Errors after the session started are logged
    /// and end the session normally.
    pub async fn serve<C>(
        &self,
        conn: C,
        peer: &str,
        shutdown: CancellationToken,
    ) -> Result<SessionSummary, TerminalError>
    where
        C: FrameConnection,
    {
        let session_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("terminal", session_id = %session_id, peer = %peer);

        self.run_session(conn, session_id, shutdown)
            .instrument(span)
            .await
    }

    async fn run_session<C>(
        &self,
        mut conn: C,
        session_id: String,
        shutdown: CancellationToken,
    ) -> Result<SessionSummary, TerminalError>
    where
        C: FrameConnection,
    {
        let spawned = match self
            .spawner
            .spawn(&self.config.command, self.config.initial_size)
        {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(error = %e, "Failed to start PTY");
                notify_spawn_failure(&mut conn, self.config.write_deadline).await;
                return Err(e);
            }
        };

        let SpawnedPty {
            reader,
            writer,
            master,
            child,
        } = spawned;
        let pid = child.pid();
        info!(pid = ?pid, shell = %self.config.command.program, "Session started");

        let (sink, stream) = conn.split();
        let sink = Arc::new(Mutex::new(sink));
        let master: SharedMaster = Arc::new(Mutex::new(Some(master)));
        let stop = shutdown.child_token();
        let pty_closed = CancellationToken::new();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let reader_thread = tokio::task::spawn_blocking(move || read_pty(reader, output_tx));

        let outbound = tokio::spawn(
            outbound_pump(
                output_rx,
                Arc::clone(&sink),
                self.config.write_deadline,
                stop.clone(),
                pty_closed.clone(),
            )
            .in_current_span(),
        );
        let inbound = tokio::spawn(
            inbound_pump(
                stream,
                writer,
                Arc::clone(&master),
                self.config.initial_size,
                stop.clone(),
            )
            .in_current_span(),
        );

        stop.cancelled().await;
        debug!("Stop signal raised, tearing down session");

        // Close the connection so the inbound pump cannot block on it.
        close_connection(&sink, self.config.write_deadline).await;

        let final_size = match inbound.await {
            Ok(size) => size,
            Err(e) => {
                error!(error = %e, "Inbound pump failed");
                self.config.initial_size
            }
        };

        // Close the pty.
        master.lock().await.take();
        pty_closed.cancel();

        let exit = reap_child(child).await;

        if let Err(e) = outbound.await {
            error!(error = %e, "Outbound pump failed");
        }
        match tokio::time::timeout(READER_JOIN_TIMEOUT, reader_thread).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "PTY reader failed"),
            Err(_) => warn!("PTY reader still blocked after teardown; a descendant may hold the terminal open"),
        }

        info!(exit = ?exit, "Session closed");
        Ok(SessionSummary {
            session_id,
            pid,
            exit,
            final_size,
        })
    }
}

type SharedMaster = Arc<Mutex<Option<Box<dyn PtyMaster>>>>;
type SharedSink<C> = Arc<Mutex<SplitSink<C, Message>>>;

/// Blocking loop moving pty output into the outbound queue.
fn read_pty(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                debug!("PTY EOF");
                break;
            }
            Ok(n) => {
                if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a hung-up pty.
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

async fn outbound_pump<C>(
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    sink: SharedSink<C>,
    write_deadline: Duration,
    stop: CancellationToken,
    pty_closed: CancellationToken,
) where
    C: FrameConnection,
{
    let _stop = stop.drop_guard();

    loop {
        let chunk = tokio::select! {
            chunk = output_rx.recv() => chunk,
            _ = pty_closed.cancelled() => None,
        };
        let Some(chunk) = chunk else {
            break;
        };
        if chunk.is_empty() {
            continue;
        }

        let mut sink = sink.lock().await;
        match tokio::time::timeout(write_deadline, sink.send(Message::Binary(chunk))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Failed to send output frame");
                break;
            }
            Err(_) => {
                warn!(deadline = ?write_deadline, "Peer stalled, output frame timed out");
                break;
            }
        }
    }
    debug!("Outbound pump finished");
}

async fn inbound_pump<C>(
    mut stream: SplitStream<C>,
    writer: Box<dyn Write + Send>,
    master: SharedMaster,
    initial_size: WindowSize,
    stop: CancellationToken,
) -> WindowSize
where
    C: FrameConnection,
{
    let _stop = stop.clone().drop_guard();
    let mut writer = Some(writer);
    let mut size = initial_size;

    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Binary(data))) => {
                if data.is_empty() {
                    continue;
                }
                let Some(w) = writer.take() else {
                    break;
                };
                // A shell that stops reading input must not hold up teardown.
                let written = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    written = write_pty(w, data) => written,
                };
                match written {
                    Ok(w) => writer = Some(w),
                    Err(e) => {
                        error!(error = %e, "Failed to write to PTY");
                        break;
                    }
                }
            }
            Some(Ok(Message::Text(text))) => {
                if let Some(new_size) = apply_control(&text, &master).await {
                    size = new_size;
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!("Peer closed the connection");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "Failed to read frame");
                break;
            }
            None => {
                info!("Connection ended");
                break;
            }
        }
    }

    debug!("Inbound pump finished");
    size
}

/// Writes `data` to the pty on the blocking pool, handing the writer back.
async fn write_pty(
    mut writer: Box<dyn Write + Send>,
    data: Vec<u8>,
) -> Result<Box<dyn Write + Send>, TerminalError> {
    let (writer, result) = tokio::task::spawn_blocking(move || {
        let result = writer.write_all(&data).and_then(|_| writer.flush());
        (writer, result)
    })
    .await
    .map_err(|e| TerminalError::Io(std::io::Error::other(e)))?;

    result?;
    Ok(writer)
}

/// Parses a text frame and applies it. Returns the new size on resize.
async fn apply_control(text: &str, master: &SharedMaster) -> Option<WindowSize> {
    let message = match ControlMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed control message");
            return None;
        }
    };

    match message.action() {
        ControlAction::Resize(size) => {
            let guard = master.lock().await;
            let master = guard.as_ref()?;
            match master.resize(size) {
                Ok(()) => {
                    debug!(cols = size.cols, rows = size.rows, "Resized PTY");
                    Some(size)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to resize PTY");
                    None
                }
            }
        }
        ControlAction::Ignore => {
            debug!(kind = %message.kind, "Ignoring control message");
            None
        }
    }
}

async fn close_connection<C>(sink: &SharedSink<C>, deadline: Duration)
where
    C: FrameConnection,
{
    let close = async {
        let mut sink = sink.lock().await;
        sink.close().await
    };
    match tokio::time::timeout(deadline, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Connection already closed"),
        Err(_) => warn!("Timed out closing connection"),
    }
}

/// Kills and reaps the shell on the blocking pool.
async fn reap_child(mut child: Box<dyn PtyChild>) -> Option<ExitInfo> {
    let reaped = tokio::task::spawn_blocking(move || {
        if let Err(e) = child.terminate() {
            debug!(error = %e, "Failed to signal shell process");
        }
        child.wait()
    })
    .await;

    match reaped {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to reap shell process");
            None
        }
        Err(e) => {
            error!(error = %e, "Reaper task failed");
            None
        }
    }
}

/// Best-effort notice to the peer, then close.
async fn notify_spawn_failure<C>(conn: &mut C, deadline: Duration)
where
    C: FrameConnection,
{
    let notify = async {
        conn.send(Message::Text(SPAWN_FAILURE_NOTICE.to_string()))
            .await?;
        conn.close().await
    };
    if let Err(e) = tokio::time::timeout(deadline, notify)
        .await
        .unwrap_or_else(|_| Err(WsError::Io(std::io::ErrorKind::TimedOut.into())))
    {
        debug!(error = %e, "Failed to deliver spawn failure notice");
    }
}
