//! Request and response interceptor pipeline.
//!
//! Every call flows through two ordered chains. The request chain runs the
//! built-in delta flagging step and then caller steps. The response chain runs
//! the built-in error, delta, result and out-parameter steps, then caller steps;
//! the session turns the final value into an API object where applicable.
//!
//! Steps are chained sequentially. An error skips every remaining
//! `on_fulfilled` until a step whose `on_rejected` recovers.

mod request;
mod response;

pub use request::DeltaRequest;
pub use response::{DeltaResponse, ErrorResponse, OutParamResponse, ResultResponse};

use crate::error::{EnigmaError, Result};
use crate::schema::{OutKey, Reply};
use crate::session::{RequestFuture, Session};
use crate::transport::RequestEnvelope;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A call on its way to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Assigned by the session when the call is sent.
    pub id: Option<i64>,
    pub handle: i64,
    pub method: String,
    pub params: Vec<Value>,
    pub out_key: OutKey,
    pub delta: bool,
}

impl Request {
    pub fn new(handle: i64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: None,
            handle,
            method: method.into(),
            params,
            out_key: OutKey::Full,
            delta: false,
        }
    }

    pub fn with_out_key(mut self, out_key: OutKey) -> Self {
        self.out_key = out_key;
        self
    }

    /// Wire form of the request.
    pub fn to_envelope(&self) -> RequestEnvelope {
        let mut envelope =
            RequestEnvelope::new(self.handle, self.method.clone(), self.params.clone());
        envelope.id = self.id;
        envelope.delta = self.delta.then_some(true);
        envelope
    }

    /// Send the same call again under a new request id.
    pub fn retry(&self, session: &Session) -> RequestFuture<Result<Reply>> {
        let mut again = self.clone();
        again.id = None;
        again.delta = false;
        session.send(again)
    }
}

/// Request-phase step.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn on_fulfilled(&self, session: &Session, request: Request) -> Result<Request>;

    async fn on_rejected(&self, _session: &Session, error: EnigmaError) -> Result<Request> {
        Err(error)
    }
}

/// Response-phase step.
///
/// Receives the request that produced the response, so a step can re-submit
/// it with [`Request::retry`].
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn on_fulfilled(
        &self,
        session: &Session,
        request: &Request,
        response: Value,
    ) -> Result<Value>;

    async fn on_rejected(
        &self,
        _session: &Session,
        _request: &Request,
        error: EnigmaError,
    ) -> Result<Value> {
        Err(error)
    }
}

/// The two chains with built-ins at fixed positions.
#[derive(Clone)]
pub struct Interceptors {
    request: Vec<Arc<dyn RequestInterceptor>>,
    response: Vec<Arc<dyn ResponseInterceptor>>,
}

impl Interceptors {
    pub fn new(
        custom_request: Vec<Arc<dyn RequestInterceptor>>,
        custom_response: Vec<Arc<dyn ResponseInterceptor>>,
    ) -> Self {
        let mut request: Vec<Arc<dyn RequestInterceptor>> = vec![Arc::new(DeltaRequest)];
        request.extend(custom_request);

        let mut response: Vec<Arc<dyn ResponseInterceptor>> = vec![
            Arc::new(ErrorResponse),
            Arc::new(DeltaResponse),
            Arc::new(ResultResponse),
            Arc::new(OutParamResponse),
        ];
        response.extend(custom_response);

        Self { request, response }
    }

    pub async fn execute_requests(&self, session: &Session, request: Request) -> Result<Request> {
        let mut outcome = Ok(request);
        for step in &self.request {
            outcome = match outcome {
                Ok(request) => step.on_fulfilled(session, request).await,
                Err(error) => step.on_rejected(session, error).await,
            };
        }
        outcome
    }

    pub async fn execute_responses(
        &self,
        session: &Session,
        request: &Request,
        response: Result<Value>,
    ) -> Result<Value> {
        let mut outcome = response;
        for step in &self.response {
            outcome = match outcome {
                Ok(response) => step.on_fulfilled(session, request, response).await,
                Err(error) => step.on_rejected(session, request, error).await,
            };
        }
        outcome
    }

    pub fn request_len(&self) -> usize {
        self.request.len()
    }

    pub fn response_len(&self) -> usize {
        self.response.len()
    }
}

impl Default for Interceptors {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptors")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_from_request() {
        let mut request =
            Request::new(1, "GetLayout", vec![]).with_out_key(OutKey::Named("qLayout".into()));
        request.id = Some(12);
        request.delta = true;

        let envelope = request.to_envelope();
        assert_eq!(envelope.id, Some(12));
        assert_eq!(envelope.delta, Some(true));
        assert_eq!(envelope.params, json!([]));

        request.delta = false;
        assert_eq!(request.to_envelope().delta, None);
    }

    #[test]
    fn test_builtins_are_fixed_at_the_ends() {
        let interceptors = Interceptors::default();
        assert_eq!(interceptors.request_len(), 1);
        assert_eq!(interceptors.response_len(), 4);
    }
}
