//! Internal shutdown requests.
//!
//! Components that discover the daemon can no longer do useful work (the
//! terminal server failing to bind, for instance) cannot tear the process
//! down themselves without racing the normal shutdown path. Instead they
//! enqueue a [`RelayEvent::Shutdown`] on the [`ShutdownRelay`]. A single
//! consumer turns that into a `SIGTERM` for the daemon's own PID, so the
//! shutdown goes through the same signal handling as `termgate stop`.
//!
//! The relay is shared by cloning; every clone refers to the same queue.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the relay queue.
pub const RELAY_CAPACITY: usize = 16;

/// Events carried by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// Terminate the daemon.
    Shutdown,
}

/// Errors returned when enqueueing an event.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// The relay has been disabled; no further events are accepted.
    #[error("relay event channel is closed")]
    Closed,

    /// The queue is full.
    #[error("relay event channel is saturated")]
    Saturated,
}

type EventAction = Arc<dyn Fn(RelayEvent) + Send + Sync>;

struct RelayInner {
    /// `Some` while the relay accepts events.
    sender: RwLock<Option<mpsc::Sender<RelayEvent>>>,
    /// Taken by the one consumer.
    receiver: Mutex<Option<mpsc::Receiver<RelayEvent>>>,
    action: EventAction,
}

/// Bounded single-consumer queue of shutdown requests.
#[derive(Clone)]
pub struct ShutdownRelay {
    inner: Arc<RelayInner>,
}

impl ShutdownRelay {
    /// Creates a relay that sends `SIGTERM` to the current process.
    pub fn new() -> Self {
        Self::targeting(Pid::this())
    }

    /// Creates a relay that sends `SIGTERM` to `pid`.
    pub fn targeting(pid: Pid) -> Self {
        Self::with_action(move |event| match event {
            RelayEvent::Shutdown => {
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    error!(pid = %pid, error = %e, "Failed to send SIGTERM");
                }
            }
        })
    }

    /// Creates a relay that hands every event to `action`.
    pub fn with_action<F>(action: F) -> Self
    where
        F: Fn(RelayEvent) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(RELAY_CAPACITY);
        Self {
            inner: Arc::new(RelayInner {
                sender: RwLock::new(Some(tx)),
                receiver: Mutex::new(Some(rx)),
                action: Arc::new(action),
            }),
        }
    }

    /// Enqueues an event without blocking.
    ///
    /// # Errors
    ///
    /// [`RelayError::Closed`] once the relay is disabled,
    /// [`RelayError::Saturated`] if the queue is full.
    pub fn send(&self, event: RelayEvent) -> Result<(), RelayError> {
        let guard = self
            .inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(RelayError::Closed)?;

        sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::Saturated,
            TrySendError::Closed(_) => RelayError::Closed,
        })
    }

    /// Returns whether the relay still accepts events.
    pub fn is_enabled(&self) -> bool {
        self.inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Runs the consumer until `token` is cancelled.
    ///
    /// On cancellation the relay is disabled and the queue closed; events
    /// already queued are still delivered before this returns. Only the
    /// first call consumes events; later calls return immediately.
    pub async fn run(&self, token: CancellationToken) {
        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = receiver else {
            warn!("Shutdown relay consumer is already running");
            return;
        };

        let action = Arc::clone(&self.inner.action);
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    RelayEvent::Shutdown => info!("Shutdown event received"),
                }
                action(event);
            }
        });

        token.cancelled().await;
        self.disable();

        if let Err(e) = consumer.await {
            error!(error = %e, "Shutdown relay consumer failed");
        }
        debug!("Shutdown relay stopped");
    }

    /// Stops accepting events and closes the queue.
    fn disable(&self) {
        let mut sender = self
            .inner
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Dropping the only sender closes the channel once it is drained.
        sender.take();
    }
}

impl Default for ShutdownRelay {
    fn default() -> Self {
        Self::new()
    }
}
