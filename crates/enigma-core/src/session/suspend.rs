//! Suspend and resume.
//!
//! Suspending closes the socket but keeps every API object. Resuming reopens
//! the socket, waits briefly for the engine to report whether it kept the old
//! server session, then looks every object up again and rewrites its handle.
//! Objects that cannot be found again are closed. Nothing is committed until
//! every lookup has finished, and any connectivity failure leaves the
//! session suspended with the socket closed.

use super::{Session, SessionEvent, SessionInner, SuspendInitiator};
use crate::config::SessionDefaults;
use crate::error::{EnigmaError, Result};
use crate::lock;
use crate::schema::{Api, ApiEvent};
use crate::transport::CloseEvent;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// What the engine did with the previous server session on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// The previous server session was kept.
    Attached,
    /// A fresh server session was created.
    Created,
}

/// Type name → engine method that fetches an object of that type by id.
///
/// `None` marks a type that can never be restored. Types missing from the
/// table are not restorable either.
#[derive(Debug, Clone)]
pub struct RestoreMethods {
    methods: HashMap<String, Option<String>>,
}

impl Default for RestoreMethods {
    fn default() -> Self {
        Self::empty()
            .with("GenericObject", Some("GetObject"))
            .with("GenericDimension", Some("GetDimension"))
            .with("GenericMeasure", Some("GetMeasure"))
            .with("GenericBookmark", Some("GetBookmark"))
            .with("GenericVariable", Some("GetVariableById"))
            .with("Field", None)
            .with("Variable", None)
    }
}

impl RestoreMethods {
    pub fn empty() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    pub fn with(mut self, type_name: impl Into<String>, method: Option<&str>) -> Self {
        self.methods
            .insert(type_name.into(), method.map(str::to_string));
        self
    }

    pub fn method_for(&self, type_name: &str) -> Option<&str> {
        self.methods.get(type_name).and_then(|m| m.as_deref())
    }
}

impl Session {
    /// Suspend with the manual-suspend close code.
    pub async fn suspend(&self) -> CloseEvent {
        self.suspend_with(
            SessionDefaults::CLOSE_MANUAL_SUSPEND,
            SessionDefaults::MANUAL_SUSPEND_REASON,
        )
        .await
    }

    /// Mark the session suspended and close the socket.
    ///
    /// Outstanding calls fail with a connectivity error; API objects stay
    /// cached for [`Session::resume`].
    pub async fn suspend_with(&self, code: u16, reason: &str) -> CloseEvent {
        let inner = &self.inner;
        inner.suspended.store(true, Ordering::SeqCst);
        let event = inner.rpc.close(code, reason).await;

        info!("Session suspended ({} {})", code, reason);
        inner.emit(SessionEvent::Suspended {
            initiator: SuspendInitiator::Manual,
            code,
            reason: reason.to_string(),
        });
        event
    }

    /// Reconnect and restore every API object.
    ///
    /// With `only_if_attached`, fails with `SessionNotAttached` when the
    /// engine started a fresh server session. On failure the socket is
    /// closed and the session stays suspended.
    pub async fn resume(&self, only_if_attached: bool) -> Result<()> {
        match self.inner.try_resume(only_if_attached).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Resume failed: {}", err);
                self.inner
                    .rpc
                    .close(SessionDefaults::CLOSE_NORMAL, "Resume failed")
                    .await;
                Err(err)
            }
        }
    }
}

/// Wait for the engine's connected notification.
///
/// No notification before the timeout means a fresh server session.
async fn wait_for_attach(
    mut events: broadcast::Receiver<SessionEvent>,
    timeout: Duration,
) -> AttachState {
    let notified = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Notification { method, params })
                    if method == SessionDefaults::CONNECTED_NOTIFICATION =>
                {
                    let state = params.get("qSessionState").and_then(Value::as_str);
                    return if state == Some(SessionDefaults::SESSION_CREATED) {
                        AttachState::Created
                    } else {
                        AttachState::Attached
                    };
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return AttachState::Created,
            }
        }
    };
    tokio::time::timeout(timeout, notified)
        .await
        .unwrap_or(AttachState::Created)
}

/// `qReturn.qHandle` of a raw result.
fn returned_handle(result: &Value) -> Option<i64> {
    result.pointer("/qReturn/qHandle").and_then(Value::as_i64)
}

impl SessionInner {
    async fn try_resume(&self, only_if_attached: bool) -> Result<()> {
        let events = self.events.subscribe();
        self.rpc.open(true).await?;

        let attach = wait_for_attach(events, self.options.attach_timeout).await;
        debug!("Reconnected: {:?}", attach);
        if only_if_attached && attach == AttachState::Created {
            return Err(EnigmaError::SessionNotAttached);
        }

        let apis = lock(&self.apis).apis();
        let mut changed: Vec<(Arc<Api>, i64)> = Vec::new();
        let mut closed: Vec<Arc<Api>> = Vec::new();

        for global in apis
            .iter()
            .filter(|api| api.type_name() == SessionDefaults::GLOBAL_TYPE)
        {
            changed.push((global.clone(), global.handle()));
        }

        // Only one document is restored; any other is closed.
        let mut docs = apis
            .iter()
            .filter(|api| api.type_name() == SessionDefaults::DOC_TYPE);
        let mut doc_handle = None;
        if let Some(doc) = docs.next() {
            match self.restore_doc().await? {
                Some(handle) => {
                    changed.push((doc.clone(), handle));
                    doc_handle = Some(handle);
                }
                None => closed.push(doc.clone()),
            }
        }
        closed.extend(docs.cloned());

        let children: Vec<Arc<Api>> = apis
            .into_iter()
            .filter(|api| {
                api.type_name() != SessionDefaults::GLOBAL_TYPE
                    && api.type_name() != SessionDefaults::DOC_TYPE
            })
            .collect();
        match doc_handle {
            Some(doc_handle) => {
                let lookups = children
                    .iter()
                    .map(|api| self.restore_child(doc_handle, api));
                let outcomes = join_all(lookups).await;
                for (api, outcome) in children.into_iter().zip(outcomes) {
                    match outcome? {
                        Some(handle) => changed.push((api, handle)),
                        None => closed.push(api),
                    }
                }
            }
            None => closed.extend(children),
        }

        self.commit_resume(changed, closed)
    }

    /// Find the document again: the active one, or reopen it.
    ///
    /// Connectivity errors abort the resume; anything else means the document
    /// is gone.
    async fn restore_doc(&self) -> Result<Option<i64>> {
        match self
            .call_raw(
                SessionDefaults::GLOBAL_HANDLE,
                SessionDefaults::ACTIVE_DOC_METHOD,
                Vec::new(),
            )
            .await
        {
            Ok(result) => {
                if let Some(handle) = returned_handle(&result) {
                    return Ok(Some(handle));
                }
            }
            Err(err) if err.is_connectivity() => return Err(err),
            Err(err) => debug!("No active document: {}", err),
        }

        let params = lock(&self.open_doc_params).clone();
        let Some(params) = params else {
            return Ok(None);
        };
        match self
            .call_raw(
                SessionDefaults::GLOBAL_HANDLE,
                SessionDefaults::OPEN_DOC_METHOD,
                params,
            )
            .await
        {
            Ok(result) => Ok(returned_handle(&result)),
            Err(err) if err.is_connectivity() => Err(err),
            Err(err) => {
                debug!("Reopening document failed: {}", err);
                Ok(None)
            }
        }
    }

    async fn restore_child(&self, doc_handle: i64, api: &Arc<Api>) -> Result<Option<i64>> {
        let Some(method) = self.restore.method_for(api.type_name()) else {
            return Ok(None);
        };
        match self
            .call_raw(doc_handle, method, vec![Value::String(api.id().to_string())])
            .await
        {
            Ok(result) => Ok(returned_handle(&result)),
            Err(err) if err.is_connectivity() => Err(err),
            Err(err) => {
                debug!("Could not restore {} {}: {}", api.type_name(), api.id(), err);
                Ok(None)
            }
        }
    }

    fn commit_resume(&self, changed: Vec<(Arc<Api>, i64)>, closed: Vec<Arc<Api>>) -> Result<()> {
        {
            let mut apis = lock(&self.apis);
            apis.replace(
                changed
                    .iter()
                    .map(|(api, handle)| (*handle, api.clone()))
                    .collect(),
            )?;
            for (api, handle) in &changed {
                api.set_handle(*handle);
            }
        }
        let survivors: Vec<Arc<Api>> = changed.into_iter().map(|(api, _)| api).collect();
        self.suspended.store(false, Ordering::SeqCst);

        for api in &closed {
            api.emit(ApiEvent::Closed);
            api.release_listeners();
        }
        for api in survivors
            .iter()
            .filter(|api| api.type_name() != SessionDefaults::GLOBAL_TYPE)
        {
            api.emit(ApiEvent::Changed);
        }

        info!(
            "Session resumed ({} restored, {} closed)",
            survivors.len(),
            closed.len()
        );
        self.emit(SessionEvent::Resumed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use serde_json::json;

    #[test]
    fn test_default_restore_table() {
        let table = RestoreMethods::default();
        assert_eq!(table.method_for("GenericObject"), Some("GetObject"));
        assert_eq!(table.method_for("GenericVariable"), Some("GetVariableById"));
        assert_eq!(table.method_for("Field"), None);
        assert_eq!(table.method_for("Variable"), None);
        assert_eq!(table.method_for("SomethingElse"), None);
    }

    #[test]
    fn test_restore_table_overrides() {
        let table = RestoreMethods::default()
            .with("GenericObject", None)
            .with("CustomThing", Some("GetCustomThing"));
        assert_eq!(table.method_for("GenericObject"), None);
        assert_eq!(table.method_for("CustomThing"), Some("GetCustomThing"));
    }

    #[test]
    fn test_returned_handle() {
        assert_eq!(
            returned_handle(&json!({"qReturn": {"qHandle": 4, "qType": "Doc"}})),
            Some(4)
        );
        assert_eq!(returned_handle(&json!({"qReturn": {"qHandle": null}})), None);
        assert_eq!(returned_handle(&Value::Null), None);
    }

    #[tokio::test]
    async fn test_attach_state_from_notification() {
        let (tx, rx) = broadcast::channel(8);
        tx.send(SessionEvent::Opened).unwrap();
        tx.send(SessionEvent::Notification {
            method: "OnConnected".into(),
            params: json!({"qSessionState": "SESSION_ATTACHED"}),
        })
        .unwrap();
        assert_eq!(
            wait_for_attach(rx, Duration::from_secs(1)).await,
            AttachState::Attached
        );

        let rx = tx.subscribe();
        tx.send(SessionEvent::Notification {
            method: "OnConnected".into(),
            params: json!({"qSessionState": "SESSION_CREATED"}),
        })
        .unwrap();
        assert_eq!(
            wait_for_attach(rx, Duration::from_secs(1)).await,
            AttachState::Created
        );
    }

    #[test]
    fn test_duplicate_restore_handles_leave_objects_untouched() {
        let (network, _acceptor) = MemoryNetwork::new();
        let document = serde_json::from_value(json!({"structs": {"Global": {}, "Doc": {}}}))
            .unwrap();
        let session = Session::builder()
            .url("memory://engine")
            .schema(document)
            .socket_factory(network)
            .build()
            .unwrap();
        let inner = &session.inner;
        let a = inner.get_object_api(5, "a", "Doc", None).unwrap();
        let b = inner.get_object_api(6, "b", "Doc", None).unwrap();
        inner.suspended.store(true, Ordering::SeqCst);
        let mut events = a.subscribe();

        let err = inner
            .commit_resume(vec![(a.clone(), 9), (b.clone(), 9)], Vec::new())
            .unwrap_err();
        assert!(matches!(err, EnigmaError::EntryAlreadyDefined { handle: 9 }));
        assert_eq!((a.handle(), b.handle()), (5, 6));
        assert!(Arc::ptr_eq(&session.api(5).unwrap(), &a));
        assert!(Arc::ptr_eq(&session.api(6).unwrap(), &b));
        assert!(session.is_suspended());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_times_out_as_created() {
        let (_tx, rx) = broadcast::channel::<SessionEvent>(8);
        assert_eq!(
            wait_for_attach(rx, Duration::from_millis(200)).await,
            AttachState::Created
        );
    }
}
