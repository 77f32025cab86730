//! The socket shape the transport depends on.
//!
//! A socket is created by a [`SocketFactory`] and reports its lifecycle
//! through an unbounded event channel: `Opened` once, any number of
//! `Message`/`Error` events, then exactly one `Closed`.

use crate::config::SessionDefaults;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Socket ready-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Close frame data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Close without a close frame (connection lost).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(SessionDefaults::CLOSE_ABNORMAL, reason)
    }

    pub fn is_normal(&self) -> bool {
        self.code == SessionDefaults::CLOSE_NORMAL
    }
}

/// Lifecycle and data events reported by a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Message(String),
    Error(String),
    Closed(CloseEvent),
}

/// A duplex text channel to the engine.
pub trait Socket: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    /// Queue one text frame for delivery.
    fn send(&self, text: String) -> Result<()>;

    /// Start closing; the `Closed` event follows on the event channel.
    fn close(&self, code: u16, reason: &str);
}

/// A freshly created socket plus the receiving end of its events.
pub struct SocketConnection {
    pub socket: Arc<dyn Socket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection")
            .field("ready_state", &self.socket.ready_state())
            .finish_non_exhaustive()
    }
}

/// Creates sockets for a URL.
///
/// Must be called from within a tokio runtime; implementations may spawn the
/// tasks that drive the connection.
pub trait SocketFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<SocketConnection>;
}

impl<F> SocketFactory for F
where
    F: Fn(&str) -> Result<SocketConnection> + Send + Sync,
{
    fn create(&self, url: &str) -> Result<SocketConnection> {
        self(url)
    }
}

/// Atomic ready-state cell shared by socket implementations.
#[derive(Debug)]
pub(crate) struct SocketState(AtomicU8);

impl SocketState {
    pub(crate) fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(Self::encode(state)))
    }

    fn encode(state: ReadyState) -> u8 {
        match state {
            ReadyState::Connecting => 0,
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }

    pub(crate) fn get(&self) -> ReadyState {
        match self.0.load(Ordering::Acquire) {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    pub(crate) fn set(&self, state: ReadyState) {
        self.0.store(Self::encode(state), Ordering::Release);
    }

    /// Move to `Closed`; returns false if already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        self.0.swap(Self::encode(ReadyState::Closed), Ordering::AcqRel)
            != Self::encode(ReadyState::Closed)
    }
}
