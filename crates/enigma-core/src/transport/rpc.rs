//! JSON-RPC transport over one socket.
//!
//! `Rpc` creates the socket through the injected factory, spawns a reader task
//! that drains socket events, and routes every inbound frame: responses settle
//! the resolver registered under their id, id-less frames with params become
//! notifications, everything else is a plain message. A socket error or close
//! rejects every outstanding request so no caller waits past a transport
//! failure.
//!
//! # Thread Safety
//!
//! Connection state sits behind a std `Mutex` that is never held across an
//! await; concurrent `send` calls are distinguished only by request id.

use super::envelope::{message_id, RequestEnvelope};
use super::resolver::{ResolverId, ResolverRegistry};
use super::socket::{CloseEvent, ReadyState, Socket, SocketConnection, SocketEvent, SocketFactory};
use crate::config::{SessionDefaults, TransportDefaults};
use crate::error::{EnigmaError, Result};
use crate::lock;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settles with the close frame once the socket has closed.
pub type ClosedSignal = Shared<BoxFuture<'static, CloseEvent>>;

type OpenFuture = Shared<BoxFuture<'static, Result<ClosedSignal>>>;

/// Direction of a traffic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    Sent,
    Received,
}

impl TrafficDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficDirection::Sent => "sent",
            TrafficDirection::Received => "received",
        }
    }
}

/// Events broadcast by the transport for passive listeners.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// Every sent and received frame, tagged with the originating handle.
    Traffic {
        direction: TrafficDirection,
        payload: Value,
        handle: Option<i64>,
    },
    Message(Value),
    Notification { method: String, params: Value },
    Closed(CloseEvent),
    SocketError(String),
}

/// Synchronous hooks for the transport's owner.
///
/// Called from the reader task in frame order. A response's `on_message` and
/// `on_response` run before its caller is resumed.
pub trait RpcObserver: Send + Sync {
    fn on_message(&self, _message: &Value) {}
    /// Rewrite a response before it settles its call. An error rejects the call.
    fn on_response(&self, _id: i64, response: Value) -> Result<Value> {
        Ok(response)
    }
    fn on_notification(&self, _method: &str, _params: &Value) {}
    fn on_closed(&self, _event: &CloseEvent) {}
    fn on_traffic(&self, _direction: TrafficDirection, _payload: &Value, _handle: Option<i64>) {}
}

#[derive(Default)]
struct ConnectionState {
    socket: Option<Arc<dyn Socket>>,
    opening: Option<OpenFuture>,
    closed: Option<ClosedSignal>,
    reader: Option<JoinHandle<()>>,
}

struct RpcShared {
    state: Mutex<ConnectionState>,
    resolvers: ResolverRegistry,
    next_id: AtomicI64,
    events: broadcast::Sender<RpcEvent>,
    observer: Mutex<Option<Weak<dyn RpcObserver>>>,
}

/// The JSON-RPC transport.
pub struct Rpc {
    url: String,
    factory: Arc<dyn SocketFactory>,
    shared: Arc<RpcShared>,
}

impl Rpc {
    pub fn new(url: impl Into<String>, factory: Arc<dyn SocketFactory>) -> Self {
        let (events, _) = broadcast::channel(SessionDefaults::EVENT_CAPACITY);
        Self {
            url: url.into(),
            factory,
            shared: Arc::new(RpcShared {
                state: Mutex::new(ConnectionState::default()),
                resolvers: ResolverRegistry::new(),
                next_id: AtomicI64::new(0),
                events,
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register the owner's hooks. Held weakly.
    pub fn set_observer(&self, observer: Weak<dyn RpcObserver>) {
        *lock(&self.shared.observer) = Some(observer);
    }

    /// Subscribe to transport events.
    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.shared.events.subscribe()
    }

    /// Next request id (1, 2, 3, ...).
    pub fn create_request_id(&self) -> i64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Ids of requests still waiting for a response.
    pub fn pending_requests(&self) -> Vec<i64> {
        self.shared.resolvers.pending_requests()
    }

    /// Number of registered resolvers, including the lifecycle pair.
    pub fn resolver_count(&self) -> usize {
        self.shared.resolvers.len()
    }

    pub fn ready_state(&self) -> ReadyState {
        lock(&self.shared.state)
            .socket
            .as_ref()
            .map(|s| s.ready_state())
            .unwrap_or(ReadyState::Closed)
    }

    /// Open the socket.
    ///
    /// Without `force`, an in-flight or completed open is reused. Settles
    /// once the socket reports opened, with a signal for the eventual close.
    pub async fn open(&self, force: bool) -> Result<ClosedSignal> {
        let opening = {
            let mut state = lock(&self.shared.state);
            let existing = if force { None } else { state.opening.clone() };
            match existing {
                Some(existing) => existing,
                None => {
                    let opening = self.connect(&mut state)?;
                    state.opening = Some(opening.clone());
                    opening
                }
            }
        };
        opening.await
    }

    fn connect(&self, state: &mut ConnectionState) -> Result<OpenFuture> {
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        if let Some(old) = state.socket.take() {
            old.close(SessionDefaults::CLOSE_NORMAL, "Reopened");
            self.shared
                .resolvers
                .reject_all_outstanding(|| EnigmaError::not_connected("Socket reopened"));
        }

        debug!("Opening socket to {}", self.url);
        let SocketConnection { socket, events } = self.factory.create(&self.url)?;

        let opened_rx = self.shared.resolvers.register(ResolverId::Opened, None);
        let closed_rx = self.shared.resolvers.register(ResolverId::Closed, None);

        let closed: ClosedSignal = closed_rx
            .map(|outcome| {
                outcome
                    .ok()
                    .and_then(|settled| settled.ok())
                    .and_then(|value| serde_json::from_value(value).ok())
                    .unwrap_or_else(|| CloseEvent::abnormal("Socket dropped"))
            })
            .boxed()
            .shared();

        let on_open = closed.clone();
        let opening: OpenFuture = async move {
            match opened_rx.await {
                Ok(Ok(_)) => Ok(on_open),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(EnigmaError::not_connected("Socket dropped before opening")),
            }
        }
        .boxed()
        .shared();

        state.reader = Some(tokio::spawn(read_loop(self.shared.clone(), events)));
        state.socket = Some(socket);
        state.closed = Some(closed);
        Ok(opening)
    }

    /// Send a request and wait for its response envelope.
    ///
    /// Fails fast with `NotConnected` if the socket is absent or not open.
    pub async fn send(&self, mut envelope: RequestEnvelope) -> Result<Value> {
        let socket = lock(&self.shared.state)
            .socket
            .clone()
            .filter(|socket| socket.ready_state() == ReadyState::Open)
            .ok_or_else(|| EnigmaError::not_connected("Not connected"))?;

        let id = match envelope.id {
            Some(id) => id,
            None => {
                let id = self.create_request_id();
                envelope.id = Some(id);
                id
            }
        };
        envelope.jsonrpc = TransportDefaults::JSONRPC_VERSION.to_string();

        let payload = serde_json::to_value(&envelope)?;
        let text = payload.to_string();
        let rx = self
            .shared
            .resolvers
            .register(ResolverId::Request(id), Some(envelope.handle));

        debug!("-> #{} {} on handle {}", id, envelope.method, envelope.handle);
        self.shared
            .traffic(TrafficDirection::Sent, payload, Some(envelope.handle));

        if let Err(err) = socket.send(text) {
            self.shared.resolvers.reject(ResolverId::Request(id), err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(EnigmaError::not_connected("Resolver dropped")),
        }
    }

    /// Close the socket and wait for the close to be observed.
    pub async fn close(&self, code: u16, reason: &str) -> CloseEvent {
        let (socket, closed) = {
            let mut state = lock(&self.shared.state);
            state.opening = None;
            (state.socket.take(), state.closed.clone())
        };
        match (socket, closed) {
            (Some(socket), Some(closed)) => {
                info!("Closing socket ({} {})", code, reason);
                socket.close(code, reason);
                closed.await
            }
            _ => CloseEvent::new(code, reason),
        }
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        if let Some(socket) = state.socket.take() {
            socket.close(SessionDefaults::CLOSE_NORMAL, "Transport dropped");
        }
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("url", &self.url)
            .field("resolvers", &self.shared.resolvers)
            .finish_non_exhaustive()
    }
}

impl RpcShared {
    fn emit(&self, event: RpcEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn observer(&self) -> Option<Arc<dyn RpcObserver>> {
        lock(&self.observer).as_ref().and_then(Weak::upgrade)
    }

    fn traffic(&self, direction: TrafficDirection, payload: Value, handle: Option<i64>) {
        if let Some(observer) = self.observer() {
            observer.on_traffic(direction, &payload, handle);
        }
        self.emit(RpcEvent::Traffic {
            direction,
            payload,
            handle,
        });
    }

    fn on_opened(&self) {
        debug!("Socket opened");
        self.resolvers.resolve(ResolverId::Opened, Value::Null);
    }

    fn on_message(&self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable frame: {}", e);
                return;
            }
        };

        let id = message_id(&message);
        let handle = id.and_then(|id| self.resolvers.handle_of(ResolverId::Request(id)));
        self.traffic(TrafficDirection::Received, message.clone(), handle);

        let observer = self.observer();
        match id {
            Some(id) => {
                self.emit(RpcEvent::Message(message.clone()));
                let settled = match &observer {
                    Some(observer) => {
                        observer.on_message(&message);
                        observer.on_response(id, message)
                    }
                    None => Ok(message),
                };
                let delivered = match settled {
                    Ok(message) => self.resolvers.resolve(ResolverId::Request(id), message),
                    Err(err) => self.resolvers.reject(ResolverId::Request(id), err),
                };
                if !delivered {
                    debug!("No resolver for response #{}", id);
                }
            }
            None => match message.get("params") {
                Some(params) => {
                    let method = message
                        .get("method")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    debug!("<- notification {}", method);
                    if let Some(observer) = &observer {
                        observer.on_notification(&method, params);
                    }
                    self.emit(RpcEvent::Notification {
                        method,
                        params: params.clone(),
                    });
                }
                None => {
                    if let Some(observer) = &observer {
                        observer.on_message(&message);
                    }
                    self.emit(RpcEvent::Message(message));
                }
            },
        }
    }

    fn on_error(&self, reason: String) {
        warn!("Socket error: {}", reason);
        self.resolvers
            .reject(ResolverId::Opened, EnigmaError::not_connected(reason.clone()));
        let rejected = self
            .resolvers
            .reject_all_outstanding(|| EnigmaError::not_connected(reason.clone()));
        if rejected > 0 {
            debug!("Rejected {} outstanding requests", rejected);
        }
        self.emit(RpcEvent::SocketError(reason));
    }

    fn on_closed(&self, event: CloseEvent) {
        info!("Socket closed ({} {})", event.code, event.reason);
        self.resolvers.reject(
            ResolverId::Opened,
            EnigmaError::NotConnected {
                reason: "Socket closed before opening".to_string(),
                close: Some(event.clone()),
            },
        );
        let rejected = self.resolvers.reject_all_outstanding(|| EnigmaError::NotConnected {
            reason: "Socket closed".to_string(),
            close: Some(event.clone()),
        });
        if rejected > 0 {
            debug!("Rejected {} outstanding requests", rejected);
        }
        match serde_json::to_value(&event) {
            Ok(value) => {
                self.resolvers.resolve(ResolverId::Closed, value);
            }
            Err(e) => warn!("Failed to encode close event: {}", e),
        }
        self.emit(RpcEvent::Closed(event.clone()));
        if let Some(observer) = self.observer() {
            observer.on_closed(&event);
        }
    }
}

async fn read_loop(shared: Arc<RpcShared>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Opened => shared.on_opened(),
            SocketEvent::Message(text) => shared.on_message(&text),
            SocketEvent::Error(reason) => shared.on_error(reason),
            SocketEvent::Closed(event) => {
                shared.on_closed(event);
                return;
            }
        }
    }
    shared.on_closed(CloseEvent::abnormal("Socket event stream ended"));
}
