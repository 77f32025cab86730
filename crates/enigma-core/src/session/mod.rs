//! Session orchestration.
//!
//! A [`Session`] owns one transport, the schema registry, the interceptor
//! chains and the cache of live API objects. It routes the engine's `change`,
//! `close` and `suspend` lists to the matching objects and turns socket closes
//! into either a terminal close or a suspension.
//!
//! # Lifecycle
//!
//! ```text
//! created ──open──▶ active ──suspend / abnormal close──▶ suspended
//!                     ▲                                      │
//!                     └──────────────resume──────────────────┘
//! active / suspended ──close──▶ closed
//! ```

mod builder;
mod cache;
mod events;
mod suspend;

pub use builder::SessionBuilder;
pub use cache::ApiCache;
pub use events::{RequestFuture, SessionEvent, SuspendInitiator};
pub use suspend::{AttachState, RestoreMethods};

use crate::config::{ObjectNotFoundPolicy, SessionDefaults, SessionOptions};
use crate::error::{EnigmaError, Result};
use crate::intercept::{DeltaResponse, Interceptors, Request};
use crate::lock;
use crate::schema::{Api, ApiEvent, Reply, Schema};
use crate::transport::envelope::handle_list;
use crate::transport::{
    CloseEvent, EngineErrorBody, ReadyState, RequestEnvelope, Rpc, RpcObserver, SocketFactory,
    TrafficDirection,
};
use futures::future;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Handle to a session. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    me: Weak<SessionInner>,
    rpc: Rpc,
    schema: Arc<Schema>,
    options: SessionOptions,
    interceptors: Interceptors,
    restore: RestoreMethods,
    apis: Mutex<ApiCache>,
    global: Mutex<Option<Arc<Api>>>,
    open_lock: tokio::sync::Mutex<()>,
    suspended: AtomicBool,
    closing: AtomicBool,
    open_doc_params: Mutex<Option<Vec<Value>>>,
    /// Request id → (handle, method) of delta calls awaiting their response.
    pending_deltas: Mutex<HashMap<i64, (i64, String)>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Create a new builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub(crate) fn new(
        url: String,
        factory: Arc<dyn SocketFactory>,
        schema: Schema,
        options: SessionOptions,
        interceptors: Interceptors,
        restore: RestoreMethods,
    ) -> Self {
        let (events, _) = broadcast::channel(SessionDefaults::EVENT_CAPACITY);
        let inner = Arc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            rpc: Rpc::new(url, factory),
            schema: Arc::new(schema),
            options,
            interceptors,
            restore,
            apis: Mutex::new(ApiCache::new()),
            global: Mutex::new(None),
            open_lock: tokio::sync::Mutex::new(()),
            suspended: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            open_doc_params: Mutex::new(None),
            pending_deltas: Mutex::new(HashMap::new()),
            events,
        });
        let observer: Weak<dyn RpcObserver> = Arc::<SessionInner>::downgrade(&inner);
        inner.rpc.set_observer(observer);
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Open the socket and return the global API object.
    ///
    /// Calling `open` on an open session returns the existing global object.
    pub async fn open(&self) -> Result<Arc<Api>> {
        let _guard = self.inner.open_lock.lock().await;
        if let Some(global) = lock(&self.inner.global).clone() {
            return Ok(global);
        }

        self.inner.closing.store(false, Ordering::SeqCst);
        let force = self.inner.rpc.ready_state() != ReadyState::Open;
        self.inner.rpc.open(force).await?;

        let global = self.inner.get_object_api(
            SessionDefaults::GLOBAL_HANDLE,
            SessionDefaults::GLOBAL_TYPE,
            SessionDefaults::GLOBAL_TYPE,
            None,
        )?;
        *lock(&self.inner.global) = Some(global.clone());

        info!("Session opened on {}", self.inner.rpc.url());
        self.inner.emit(SessionEvent::Opened);
        Ok(global)
    }

    /// Send a call through the interceptor pipeline.
    ///
    /// The request id is assigned up front and exposed on the returned
    /// future. While suspended the future fails with `SessionSuspended`
    /// without touching the socket.
    pub fn send(&self, mut request: Request) -> RequestFuture<Result<Reply>> {
        let request_id = self.inner.rpc.create_request_id();
        request.id = Some(request_id);

        if self.is_suspended() {
            return RequestFuture::new(
                request_id,
                future::ready(Err(EnigmaError::SessionSuspended)),
            );
        }

        let session = self.clone();
        RequestFuture::new(request_id, async move { session.dispatch(request).await })
    }

    async fn dispatch(&self, request: Request) -> Result<Reply> {
        let inner = &self.inner;
        let request = inner.interceptors.execute_requests(self, request).await?;

        if request.handle == SessionDefaults::GLOBAL_HANDLE
            && request.method == SessionDefaults::OPEN_DOC_METHOD
        {
            *lock(&inner.open_doc_params) = Some(request.params.clone());
        }

        let delta_id = request.id.filter(|_| request.delta);
        if let Some(id) = delta_id {
            lock(&inner.pending_deltas).insert(id, (request.handle, request.method.clone()));
        }
        let response = inner.rpc.send(request.to_envelope()).await;
        if let Some(id) = delta_id {
            lock(&inner.pending_deltas).remove(&id);
        }
        let value = inner
            .interceptors
            .execute_responses(self, &request, response)
            .await?;
        self.materialize(value)
    }

    /// Turn an `{qHandle, qType}` value into its API object.
    fn materialize(&self, value: Value) -> Result<Reply> {
        let handle = value.get("qHandle");
        let type_name = value.get("qType");
        let both_null =
            matches!(handle, Some(Value::Null)) && matches!(type_name, Some(Value::Null));

        if let (Some(handle), Some(type_name)) = (
            handle.and_then(Value::as_i64),
            type_name.and_then(Value::as_str),
        ) {
            let id = value
                .get("qGenericId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let generic_type = value
                .get("qGenericType")
                .and_then(Value::as_str)
                .filter(|g| !g.is_empty());
            let api = self
                .inner
                .get_object_api(handle, id, type_name, generic_type)?;
            return Ok(Reply::Api(api));
        }

        if both_null {
            return match self.inner.options.object_not_found {
                ObjectNotFoundPolicy::Reject => Err(EnigmaError::ObjectNotFound),
                ObjectNotFoundPolicy::ResolveNull => Ok(Reply::Value(Value::Null)),
            };
        }
        Ok(Reply::Value(value))
    }

    /// Send an envelope straight to the transport, skipping every interceptor.
    ///
    /// Resolves with the raw response envelope.
    pub async fn send_raw(&self, envelope: RequestEnvelope) -> Result<Value> {
        self.inner.rpc.send(envelope).await
    }

    /// Close the session with a normal close code.
    pub async fn close(&self) -> CloseEvent {
        self.close_with(SessionDefaults::CLOSE_NORMAL, "").await
    }

    /// Close the socket, emit `closed` on every live API and then on the
    /// session.
    pub async fn close_with(&self, code: u16, reason: &str) -> CloseEvent {
        let inner = &self.inner;
        inner.closing.store(true, Ordering::SeqCst);
        lock(&inner.global).take();

        let event = inner.rpc.close(code, reason).await;
        inner.close_apis();
        inner.suspended.store(false, Ordering::SeqCst);

        info!("Session closed ({} {})", event.code, event.reason);
        inner.emit(SessionEvent::Closed(event.clone()));
        event
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn url(&self) -> &str {
        self.inner.rpc.url()
    }

    /// The global API object, while the session is open.
    pub fn global(&self) -> Option<Arc<Api>> {
        lock(&self.inner.global).clone()
    }

    /// Cached API for `handle`.
    pub fn api(&self, handle: i64) -> Option<Arc<Api>> {
        lock(&self.inner.apis).get(handle)
    }

    /// Every live API object, ordered by handle.
    pub fn apis(&self) -> Vec<Arc<Api>> {
        lock(&self.inner.apis).apis()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.rpc.ready_state()
    }

    /// Ids of calls still waiting for a response.
    pub fn pending_requests(&self) -> Vec<i64> {
        self.inner.rpc.pending_requests()
    }

    pub(crate) fn rebuild_delta(
        &self,
        handle: i64,
        method: &str,
        response: &mut Value,
    ) -> Result<()> {
        DeltaResponse::rebuild(&mut lock(&self.inner.apis), handle, method, response)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.inner.rpc.url())
            .field("suspended", &self.is_suspended())
            .field("apis", &*lock(&self.inner.apis))
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Cached API for `handle`, or a new one from the schema.
    fn get_object_api(
        &self,
        handle: i64,
        id: &str,
        type_name: &str,
        generic_type: Option<&str>,
    ) -> Result<Arc<Api>> {
        if let Some(api) = lock(&self.apis).get(handle) {
            return Ok(api);
        }
        let api = self
            .schema
            .create(self.me.clone(), handle, id, type_name, generic_type)?;

        // Init hooks ran unlocked; another response may have cached the handle.
        let mut apis = lock(&self.apis);
        if let Some(existing) = apis.get(handle) {
            return Ok(existing);
        }
        apis.add(handle, api.clone())?;
        debug!("Cached {} API for handle {}", type_name, handle);
        Ok(api)
    }

    /// Emit `closed` on every cached API, release listeners, empty the cache.
    fn close_apis(&self) {
        let apis = lock(&self.apis).clear();
        for api in apis {
            api.emit(ApiEvent::Closed);
            api.release_listeners();
        }
    }

    /// Raw call; an `error` member becomes a server error, `result` is returned.
    async fn call_raw(&self, handle: i64, method: &str, params: Vec<Value>) -> Result<Value> {
        let response = self
            .rpc
            .send(RequestEnvelope::new(handle, method, params))
            .await?;
        if let Some(error) = response.get("error") {
            let body: EngineErrorBody = serde_json::from_value(error.clone())?;
            return Err(body.into());
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

impl RpcObserver for SessionInner {
    fn on_message(&self, message: &Value) {
        if self.suspended.load(Ordering::SeqCst) {
            return;
        }

        for handle in handle_list(message, "change") {
            let api = lock(&self.apis).get(handle);
            if let Some(api) = api {
                api.emit(ApiEvent::Changed);
            }
        }

        for handle in handle_list(message, "close") {
            let api = lock(&self.apis).remove(handle);
            if let Some(api) = api {
                debug!("Engine closed handle {}", handle);
                api.emit(ApiEvent::Closed);
                api.release_listeners();
            }
        }

        for handle in handle_list(message, "suspend") {
            let Some(inner) = self.me.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let method = inner.options.handle_resume_method.clone();
                if let Err(e) = inner.call_raw(handle, &method, Vec::new()).await {
                    warn!("Failed to resume handle {}: {}", handle, e);
                }
            });
        }
    }

    fn on_response(&self, id: i64, mut response: Value) -> Result<Value> {
        let Some((handle, method)) = lock(&self.pending_deltas).remove(&id) else {
            return Ok(response);
        };
        DeltaResponse::rebuild(&mut lock(&self.apis), handle, &method, &mut response)?;
        Ok(response)
    }

    fn on_notification(&self, method: &str, params: &Value) {
        self.emit(SessionEvent::Notification {
            method: method.to_string(),
            params: params.clone(),
        });
    }

    fn on_traffic(&self, direction: TrafficDirection, payload: &Value, handle: Option<i64>) {
        self.emit(SessionEvent::Traffic {
            direction,
            payload: payload.clone(),
            handle,
        });
    }

    fn on_closed(&self, event: &CloseEvent) {
        if self.suspended.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return;
        }

        if self.options.suspend_on_close && event.code != SessionDefaults::CLOSE_NORMAL {
            self.suspended.store(true, Ordering::SeqCst);
            info!("Session suspended by network ({} {})", event.code, event.reason);
            self.emit(SessionEvent::Suspended {
                initiator: SuspendInitiator::Network,
                code: event.code,
                reason: event.reason.clone(),
            });
            return;
        }

        lock(&self.global).take();
        self.close_apis();
        info!("Session closed by socket ({} {})", event.code, event.reason);
        self.emit(SessionEvent::Closed(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDocument;
    use crate::transport::{MemoryAcceptor, MemoryNetwork, MemoryPeer};
    use serde_json::json;

    fn document() -> SchemaDocument {
        serde_json::from_value(json!({
            "structs": {
                "Global": {
                    "EngineVersion": {"In": [], "Out": [{"Name": "qVersion"}]},
                    "OpenDoc": {"In": [{"Name": "qDocName"}], "Out": []}
                },
                "Doc": {
                    "GetAppLayout": {"In": [], "Out": [{"Name": "qLayout"}]}
                }
            }
        }))
        .unwrap()
    }

    async fn connected(
        configure: impl FnOnce(SessionBuilder) -> SessionBuilder,
    ) -> (Session, Arc<Api>, MemoryPeer, MemoryAcceptor) {
        let (network, mut acceptor) = MemoryNetwork::new();
        let builder = Session::builder()
            .url("memory://engine")
            .schema(document())
            .socket_factory(network);
        let session = configure(builder).build().unwrap();
        let global = session.open().await.unwrap();
        let peer = acceptor.accept().await.unwrap();
        (session, global, peer, acceptor)
    }

    fn reply(peer: &MemoryPeer, request: &Value, result: Value) {
        assert!(peer.send(&json!({"jsonrpc": "2.0", "id": request["id"], "result": result})));
    }

    #[tokio::test]
    async fn test_open_returns_same_global() {
        let (session, global, _peer, _acceptor) = connected(|b| b).await;
        assert_eq!(global.handle(), -1);
        assert_eq!(global.type_name(), "Global");
        assert!(Arc::ptr_eq(&session.open().await.unwrap(), &global));
        assert_eq!(session.apis().len(), 1);
    }

    #[tokio::test]
    async fn test_call_unwraps_out_param() {
        let (_session, global, mut peer, _acceptor) = connected(|b| b).await;

        let call = global.call("EngineVersion", vec![]);
        let engine = async {
            let request = peer.recv().await.unwrap();
            assert_eq!(request["method"], "EngineVersion");
            assert_eq!(request["handle"], -1);
            assert_eq!(request["delta"], true);
            reply(&peer, &request, json!({"qVersion": {"qComponentVersion": "1.0"}}));
        };
        let (reply, _) = tokio::join!(call, engine);
        assert_eq!(
            reply.unwrap().into_value(),
            json!({"qComponentVersion": "1.0"})
        );
    }

    #[tokio::test]
    async fn test_handle_reply_becomes_cached_api() {
        let (session, global, mut peer, _acceptor) = connected(|b| b).await;

        let call = global.call("OpenDoc", vec![json!("sales.qvf")]);
        let engine = async {
            let request = peer.recv().await.unwrap();
            assert!(request.get("delta").is_none());
            reply(
                &peer,
                &request,
                json!({"qReturn": {"qHandle": 1, "qType": "Doc", "qGenericId": "sales.qvf"}}),
            );
        };
        let (doc, _) = tokio::join!(call, engine);
        let doc = doc.unwrap().into_api().unwrap();

        assert_eq!(doc.handle(), 1);
        assert_eq!(doc.id(), "sales.qvf");
        assert!(doc.has_method("GetAppLayout"));
        assert!(Arc::ptr_eq(&session.api(1).unwrap(), &doc));
        assert_eq!(
            *lock(&session.inner.open_doc_params),
            Some(vec![json!("sales.qvf")])
        );
    }

    #[tokio::test]
    async fn test_send_while_suspended_fails_fast() {
        let (session, global, _peer, _acceptor) = connected(|b| b).await;
        session.suspend().await;

        let call = session.send(Request::new(global.handle(), "EngineVersion", vec![]));
        assert!(call.request_id() > 0);
        assert!(matches!(call.await, Err(EnigmaError::SessionSuspended)));
    }

    #[tokio::test]
    async fn test_object_not_found_policy() {
        let (_session, global, mut peer, _acceptor) =
            connected(|b| b.object_not_found(ObjectNotFoundPolicy::ResolveNull)).await;

        let call = global.call("OpenDoc", vec![json!("missing")]);
        let engine = async {
            let request = peer.recv().await.unwrap();
            reply(&peer, &request, json!({"qReturn": {"qHandle": null, "qType": null}}));
        };
        let (result, _) = tokio::join!(call, engine);
        assert_eq!(result.unwrap().into_value(), Value::Null);
    }

    #[tokio::test]
    async fn test_close_emits_closed_on_apis_then_session() {
        let (session, global, _peer, _acceptor) = connected(|b| b).await;
        let mut api_events = global.subscribe();
        let mut events = session.subscribe();

        let event = session.close().await;
        assert_eq!(event.code, 1000);
        assert_eq!(api_events.recv().await.unwrap(), ApiEvent::Closed);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Closed(_)));
        assert!(session.apis().is_empty());
        assert!(session.global().is_none());
    }
}
