use super::{Request, RequestInterceptor};
use crate::error::Result;
use crate::schema::OutKey;
use crate::session::Session;
use async_trait::async_trait;

/// Flags calls for the delta protocol.
///
/// Only calls returning a single named output other than `qReturn` are
/// flagged, and only when the session has delta enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaRequest;

impl DeltaRequest {
    pub fn wants_delta(enabled: bool, request: &Request) -> bool {
        enabled && matches!(&request.out_key, OutKey::Named(name) if name != "qReturn")
    }
}

#[async_trait]
impl RequestInterceptor for DeltaRequest {
    async fn on_fulfilled(&self, session: &Session, mut request: Request) -> Result<Request> {
        if Self::wants_delta(session.options().protocol.delta, &request) {
            request.delta = true;
        }
        Ok(request)
    }
}
