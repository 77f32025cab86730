//! API objects: one per live remote handle.

use crate::error::{EnigmaError, Result};
use crate::lock;
use crate::session::{Session, SessionInner};
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

/// Future returned by every API method.
pub type MethodFuture = BoxFuture<'static, Result<Reply>>;

/// A callable method of an API object.
pub type MethodFn = Arc<dyn Fn(Arc<Api>, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Method table shared by every API object of one (type, generic type) pair.
pub type Prototype = Arc<HashMap<String, MethodFn>>;

const API_EVENT_CAPACITY: usize = 64;

/// Outcome of an API call: plain data or another remote object.
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Value),
    Api(Arc<Api>),
}

impl Reply {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Reply::Value(value) => Some(value),
            Reply::Api(_) => None,
        }
    }

    pub fn as_api(&self) -> Option<&Arc<Api>> {
        match self {
            Reply::Api(api) => Some(api),
            Reply::Value(_) => None,
        }
    }

    /// The plain value; an API object yields its identity as JSON.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Value(value) => value,
            Reply::Api(api) => serde_json::json!({
                "qHandle": api.handle(),
                "qType": api.type_name(),
                "qGenericType": api.generic_type(),
                "qGenericId": api.id(),
            }),
        }
    }

    /// The API object, or `ObjectNotFound` for plain data.
    pub fn into_api(self) -> Result<Arc<Api>> {
        match self {
            Reply::Api(api) => Ok(api),
            Reply::Value(_) => Err(EnigmaError::ObjectNotFound),
        }
    }
}

/// Events emitted by an API object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiEvent {
    /// The remote object changed; fetch its layout again.
    Changed,
    /// The remote object is gone. No further events follow.
    Closed,
}

/// A remote object.
///
/// Identity (`id`, `type_name`, `generic_type`) is fixed at creation; the
/// handle is rewritten when the session resumes.
pub struct Api {
    session: Weak<SessionInner>,
    handle: AtomicI64,
    id: String,
    type_name: String,
    generic_type: String,
    prototype: Prototype,
    events: Mutex<Option<broadcast::Sender<ApiEvent>>>,
}

impl Api {
    pub(crate) fn new(
        session: Weak<SessionInner>,
        handle: i64,
        id: impl Into<String>,
        type_name: impl Into<String>,
        generic_type: impl Into<String>,
        prototype: Prototype,
    ) -> Self {
        let (events, _) = broadcast::channel(API_EVENT_CAPACITY);
        Self {
            session,
            handle: AtomicI64::new(handle),
            id: id.into(),
            type_name: type_name.into(),
            generic_type: generic_type.into(),
            prototype,
            events: Mutex::new(Some(events)),
        }
    }

    pub fn handle(&self) -> i64 {
        self.handle.load(Ordering::Acquire)
    }

    pub(crate) fn set_handle(&self, handle: i64) {
        self.handle.store(handle, Ordering::Release);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn generic_type(&self) -> &str {
        &self.generic_type
    }

    /// The owning session, while it is alive.
    pub fn session(&self) -> Option<Session> {
        self.session.upgrade().map(Session::from_inner)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.prototype.contains_key(name)
    }

    /// Method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prototype.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Call a method by name.
    ///
    /// Arguments are positional, or a single object of named parameters.
    pub fn call(self: &Arc<Self>, method: &str, args: Vec<Value>) -> MethodFuture {
        match self.prototype.get(method) {
            Some(f) => f(self.clone(), args),
            None => future::ready(Err(EnigmaError::MethodNotFound {
                type_name: self.type_name.clone(),
                method: method.to_string(),
            }))
            .boxed(),
        }
    }

    /// Listen for `changed`/`closed`.
    ///
    /// After the object has been closed the receiver reports
    /// `RecvError::Closed` straight away.
    pub fn subscribe(&self) -> broadcast::Receiver<ApiEvent> {
        match lock(&self.events).as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub(crate) fn emit(&self, event: ApiEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Drop every listener; queued events are still delivered.
    pub(crate) fn release_listeners(&self) {
        lock(&self.events).take();
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("handle", &self.handle())
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("generic_type", &self.generic_type)
            .finish_non_exhaustive()
    }
}
