//! Session lifecycle events and the id-tagged request future.

use crate::transport::{CloseEvent, TrafficDirection};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Who suspended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendInitiator {
    Network,
    Manual,
}

/// Events broadcast by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened,
    Closed(CloseEvent),
    Suspended {
        initiator: SuspendInitiator,
        code: u16,
        reason: String,
    },
    Resumed,
    /// Id-less push from the engine.
    Notification { method: String, params: Value },
    Traffic {
        direction: TrafficDirection,
        payload: Value,
        handle: Option<i64>,
    },
}

impl SessionEvent {
    /// Event name, e.g. `opened` or `notification:OnConnected`.
    pub fn name(&self) -> String {
        match self {
            SessionEvent::Opened => "opened".to_string(),
            SessionEvent::Closed(_) => "closed".to_string(),
            SessionEvent::Suspended { .. } => "suspended".to_string(),
            SessionEvent::Resumed => "resumed".to_string(),
            SessionEvent::Notification { method, .. } => format!("notification:{}", method),
            SessionEvent::Traffic { direction, .. } => format!("traffic:{}", direction.as_str()),
        }
    }
}

/// A pending call tagged with the id of the request that started it.
#[must_use = "futures do nothing unless awaited"]
pub struct RequestFuture<T> {
    request_id: i64,
    inner: BoxFuture<'static, T>,
}

impl<T: Send + 'static> RequestFuture<T> {
    pub fn new(request_id: i64, inner: impl Future<Output = T> + Send + 'static) -> Self {
        Self {
            request_id,
            inner: inner.boxed(),
        }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Transform the output, keeping the request id.
    pub fn map<U, F>(self, f: F) -> RequestFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        RequestFuture {
            request_id: self.request_id,
            inner: self.inner.map(f).boxed(),
        }
    }
}

impl<T> Future for RequestFuture<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.inner.poll_unpin(cx)
    }
}

impl<T> std::fmt::Debug for RequestFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFuture")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names() {
        assert_eq!(SessionEvent::Opened.name(), "opened");
        assert_eq!(
            SessionEvent::Notification {
                method: "OnConnected".into(),
                params: json!({}),
            }
            .name(),
            "notification:OnConnected"
        );
        assert_eq!(
            SessionEvent::Traffic {
                direction: TrafficDirection::Received,
                payload: json!({}),
                handle: None,
            }
            .name(),
            "traffic:received"
        );
    }

    #[tokio::test]
    async fn test_map_keeps_request_id() {
        let future = RequestFuture::new(7, async { 20 }).map(|n| n + 1);
        assert_eq!(future.request_id(), 7);
        assert_eq!(future.await, 21);
    }
}
