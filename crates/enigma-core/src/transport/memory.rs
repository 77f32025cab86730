//! In-process sockets.
//!
//! [`MemoryNetwork`] is a socket factory whose every `create` hands the other
//! end of the new socket, a [`MemoryPeer`], to a [`MemoryAcceptor`]. Sockets
//! open immediately. Used by the integration tests to script an engine and by
//! embedders that host an engine in the same process.

use super::socket::{
    CloseEvent, ReadyState, Socket, SocketConnection, SocketEvent, SocketFactory, SocketState,
};
use crate::config::SessionDefaults;
use crate::error::{EnigmaError, Result};
use crate::lock;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// State shared by both ends of one in-process socket.
struct MemoryLink {
    state: SocketState,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl MemoryLink {
    fn finish(&self, event: CloseEvent) {
        if self.state.mark_closed() {
            let _ = self.events.send(SocketEvent::Closed(event));
        }
    }
}

/// Socket factory for in-process connections.
#[derive(Clone)]
pub struct MemoryNetwork {
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryNetwork {
    /// Create a network and the acceptor that receives its peers.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MemoryNetwork, MemoryAcceptor) {
        let (peers, incoming) = mpsc::unbounded_channel();
        (MemoryNetwork { peers }, MemoryAcceptor { incoming })
    }
}

impl SocketFactory for MemoryNetwork {
    fn create(&self, url: &str) -> Result<SocketConnection> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let link = Arc::new(MemoryLink {
            state: SocketState::new(ReadyState::Open),
            events: events_tx,
        });

        let peer = MemoryPeer {
            url: url.to_string(),
            incoming: from_client,
            link: link.clone(),
        };
        self.peers
            .send(peer)
            .map_err(|_| EnigmaError::not_connected(format!("No acceptor for {}", url)))?;

        let _ = link.events.send(SocketEvent::Opened);
        debug!("Memory socket opened for {}", url);

        Ok(SocketConnection {
            socket: Arc::new(MemorySocket {
                link,
                to_peer: Mutex::new(Some(to_peer)),
            }),
            events: events_rx,
        })
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork").finish_non_exhaustive()
    }
}

/// Receives the server end of every socket the network creates.
pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    /// Wait for the next connection. `None` once the network is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// Take a connection if one is already waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.try_recv().ok()
    }
}

/// Client end of an in-process socket.
pub struct MemorySocket {
    link: Arc<MemoryLink>,
    to_peer: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Socket for MemorySocket {
    fn ready_state(&self) -> ReadyState {
        self.link.state.get()
    }

    fn send(&self, text: String) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(EnigmaError::not_connected("Socket is not open"));
        }
        let sender = lock(&self.to_peer);
        match sender.as_ref() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| EnigmaError::not_connected("Peer went away")),
            None => Err(EnigmaError::not_connected("Socket is not open")),
        }
    }

    fn close(&self, code: u16, reason: &str) {
        lock(&self.to_peer).take();
        self.link.finish(CloseEvent::new(code, reason));
    }
}

/// Server end of an in-process socket.
pub struct MemoryPeer {
    url: String,
    incoming: mpsc::UnboundedReceiver<String>,
    link: Arc<MemoryLink>,
}

impl MemoryPeer {
    /// URL the client connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame from the client, parsed. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Value> {
        while let Some(text) = self.incoming.recv().await {
            match serde_json::from_str(&text) {
                Ok(value) => return Some(value),
                Err(e) => warn!("Memory peer dropped unparseable frame: {}", e),
            }
        }
        None
    }

    /// Deliver a frame to the client. Returns false if the socket is closed.
    pub fn send(&self, message: &Value) -> bool {
        self.send_text(message.to_string())
    }

    /// Deliver a raw text frame to the client.
    pub fn send_text(&self, text: String) -> bool {
        if self.link.state.get() != ReadyState::Open {
            return false;
        }
        self.link.events.send(SocketEvent::Message(text)).is_ok()
    }

    /// Push an id-less notification.
    pub fn notify(&self, method: &str, params: Value) -> bool {
        self.send(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
    }

    /// Close from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        self.link.finish(CloseEvent::new(code, reason));
    }

    /// Report a transport error followed by an abnormal close.
    pub fn fail(&self, reason: &str) {
        if self.link.state.get() == ReadyState::Closed {
            return;
        }
        let _ = self.link.events.send(SocketEvent::Error(reason.to_string()));
        self.link.finish(CloseEvent::abnormal(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.link.state.get() == ReadyState::Closed
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.link
            .finish(CloseEvent::new(SessionDefaults::CLOSE_ABNORMAL, "Peer dropped"));
    }
}
