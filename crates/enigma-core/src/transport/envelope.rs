//! JSON-RPC 2.0 wire types.
//!
//! Requests carry the target `handle` next to the usual `method`/`params`, and
//! may ask for a delta response. Responses are kept as raw [`Value`]s because
//! the response pipeline reshapes them step by step.

use crate::config::TransportDefaults;
use crate::error::EnigmaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    pub handle: i64,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<bool>,
}

impl RequestEnvelope {
    /// Create a request with positional params and no id.
    pub fn new(handle: i64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: TransportDefaults::JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            handle,
            params: Value::Array(params),
            delta: None,
        }
    }
}

/// Error object returned by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineErrorBody {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl From<EngineErrorBody> for EnigmaError {
    fn from(body: EngineErrorBody) -> Self {
        EnigmaError::Server {
            code: body.code,
            message: body.message,
            parameter: body.parameter,
        }
    }
}

/// Numeric `id` of an inbound message, if any.
pub fn message_id(message: &Value) -> Option<i64> {
    message.get("id").and_then(Value::as_i64)
}

/// Handles listed under a routing field (`change`, `close`, `suspend`).
///
/// The engine sends either a single handle or a list of handles.
pub fn handle_list(message: &Value, field: &str) -> Vec<i64> {
    match message.get(field) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
        Some(value) => value.as_i64().into_iter().collect(),
        None => Vec::new(),
    }
}
