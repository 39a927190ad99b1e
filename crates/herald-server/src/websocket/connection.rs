//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use herald_core::{ConnectionId, TransportError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake done, not yet registered.
    Connecting = 0,
    /// Registered and receiving frames.
    Connected = 1,
    /// Being torn down.
    Disconnecting = 2,
    /// Gone. Terminal.
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Handle to one connected client.
///
/// Frames are pushed into a bounded channel drained by the session's writer
/// task, so sending never waits on the socket. The writer reports every frame
/// it puts on the socket through [`mark_written`](Self::mark_written); that
/// report, not the enqueue, is what refreshes the heartbeat.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    state: AtomicU8,
    closer: CancellationToken,
    /// Frames accepted into the buffer. Locked around every enqueue so the
    /// count matches channel order.
    queued: Mutex<u64>,
    /// Frames the writer has put on the socket.
    written: watch::Sender<u64>,
    last_heartbeat: Mutex<Instant>,
    /// Frames dropped because the buffer was full or the writer was gone.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// New connection with a generated id.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self::with_id(ConnectionId::new(), tx)
    }

    /// New connection with a caller-chosen id.
    pub fn with_id(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closer: CancellationToken::new(),
            queued: Mutex::new(0),
            written: watch::Sender::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Connecting → Connected`. Returns `false` from any other state.
    pub fn mark_connected(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Disconnecting` unless already past it.
    pub fn begin_disconnect(&self) -> bool {
        self.advance_to(ConnectionState::Disconnecting)
    }

    /// Move to the terminal `Disconnected` state.
    pub fn mark_disconnected(&self) -> bool {
        self.advance_to(ConnectionState::Disconnected)
    }

    fn advance_to(&self, next: ConnectionState) -> bool {
        let next = next as u8;
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur < next).then_some(next)
            })
            .is_ok()
    }

    /// Queue a frame for the writer without waiting.
    pub fn send(&self, frame: Arc<String>) -> Result<(), TransportError> {
        if self.state() >= ConnectionState::Disconnecting {
            return Err(TransportError::Closed);
        }
        let mut queued = self.queued.lock();
        match self.tx.try_send(frame) {
            Ok(()) => {
                *queued += 1;
                Ok(())
            }
            Err(e) => {
                drop(queued);
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(match e {
                    TrySendError::Full(_) => TransportError::Full,
                    TrySendError::Closed(_) => TransportError::Closed,
                })
            }
        }
    }

    /// Queue a frame and wait until the writer has put it on the socket.
    ///
    /// `timeout` covers both waiting for buffer space and waiting for the
    /// write. A writer that stopped draining fails with `Timeout`.
    pub async fn send_heartbeat(
        &self,
        frame: Arc<String>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.state() >= ConnectionState::Disconnecting {
            return Err(TransportError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let permit = match time::timeout_at(deadline, self.tx.reserve()).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Err(_)) => return Err(TransportError::Closed),
            Ok(Ok(permit)) => permit,
        };
        let seq = {
            let mut queued = self.queued.lock();
            permit.send(frame);
            *queued += 1;
            *queued
        };

        let mut written = self.written.subscribe();
        match time::timeout_at(deadline, written.wait_for(|n| *n >= seq)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Called by the writer after a buffered frame reached the socket.
    pub fn mark_written(&self) {
        self.written.send_modify(|n| *n += 1);
        self.touch();
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn last_heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Ask the session to close the socket.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) is called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closer.cancelled()
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
