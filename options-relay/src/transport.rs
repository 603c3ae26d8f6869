use crate::protocol::Outbound;
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use tokio::sync::mpsc;

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Arc<Outbound>),
    Close { code: u16, reason: &'static str },
}

/// Observable state of the underlying connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportState {
    Open,
    /// Close requested but the peer has not finished the handshake.
    Closing,
    Closed,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportState::Open,
            1 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransportState::Open => 0,
            TransportState::Closing => 1,
            TransportState::Closed => 2,
        }
    }
}

/// Reasons a frame could not be queued.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error("transport is not open")]
    NotOpen,
    #[error("outbound queue is full")]
    Full,
}

/// Handle to one connection's outbound queue.
///
/// Sends never block: a slow peer that fills its queue sees frames rejected and is left for the
/// reaper rather than stalling the broadcaster.
#[derive(Debug, Clone)]
pub struct Transport {
    tx: mpsc::Sender<Frame>,
    state: Arc<AtomicU8>,
}

impl Transport {
    /// Construct a transport plus the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            tx,
            state: Arc::new(AtomicU8::new(TransportState::Open.as_u8())),
        };
        (transport, rx)
    }

    pub fn state(&self) -> TransportState {
        if self.tx.is_closed() {
            return TransportState::Closed;
        }
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    pub fn send(&self, message: Outbound) -> Result<(), SendError> {
        self.send_shared(Arc::new(message))
    }

    /// Queue an already shared message, used when one payload goes to many connections.
    pub fn send_shared(&self, message: Arc<Outbound>) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        self.tx
            .try_send(Frame::Message(message))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::NotOpen,
            })
    }

    /// Ask the writer to close the connection. Idempotent.
    pub fn close(&self, code: u16, reason: &'static str) {
        let previous = self
            .state
            .swap(TransportState::Closing.as_u8(), Ordering::AcqRel);
        if previous != TransportState::Open.as_u8() {
            self.state.store(previous, Ordering::Release);
            return;
        }
        let _ = self.tx.try_send(Frame::Close { code, reason });
    }

    /// Record that the peer connection is gone.
    pub fn mark_closed(&self) {
        self.state
            .store(TransportState::Closed.as_u8(), Ordering::Release);
    }
}
