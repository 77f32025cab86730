//! Centralized configuration for enigma-core.
//!
//! Protocol constants live as associated consts on unit structs; the plain,
//! serializable part of the session configuration lives in [`SessionOptions`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session-level protocol constants.
pub struct SessionDefaults;

impl SessionDefaults {
    /// How long resume waits for the engine's `OnConnected` notification.
    pub const ATTACH_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const CLOSE_NORMAL: u16 = 1000;
    pub const CLOSE_ABNORMAL: u16 = 1006;
    pub const CLOSE_MANUAL_SUSPEND: u16 = 4000;
    pub const MANUAL_SUSPEND_REASON: &'static str = "manual suspend";
    pub const GLOBAL_HANDLE: i64 = -1;
    pub const GLOBAL_TYPE: &'static str = "Global";
    pub const DOC_TYPE: &'static str = "Doc";
    pub const CONNECTED_NOTIFICATION: &'static str = "OnConnected";
    pub const SESSION_CREATED: &'static str = "SESSION_CREATED";
    pub const OPEN_DOC_METHOD: &'static str = "OpenDoc";
    pub const ACTIVE_DOC_METHOD: &'static str = "GetActiveDoc";
    pub const HANDLE_RESUME_METHOD: &'static str = "Resume";
    pub const EVENT_CAPACITY: usize = 256;
}

/// Transport-level constants.
pub struct TransportDefaults;

impl TransportDefaults {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    pub const TCP_SCHEME: &'static str = "tcp";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
}

/// Wire protocol switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Ask the engine for patch lists instead of full values.
    #[serde(default = "default_true")]
    pub delta: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { delta: true }
    }
}

fn default_true() -> bool {
    true
}

/// What to do when the engine answers with `qHandle: null, qType: null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectNotFoundPolicy {
    /// Reject the call with `ObjectNotFound`.
    #[default]
    Reject,
    /// Resolve the call with `null`.
    ResolveNull,
}

/// Serializable session options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    /// Abnormal socket closes suspend the session instead of closing it.
    #[serde(default)]
    pub suspend_on_close: bool,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub object_not_found: ObjectNotFoundPolicy,
    #[serde(default = "default_attach_timeout", with = "millis")]
    pub attach_timeout: Duration,
    /// Method re-issued for handles listed in a message's `suspend` field.
    #[serde(default = "default_handle_resume_method")]
    pub handle_resume_method: String,
}

fn default_attach_timeout() -> Duration {
    SessionDefaults::ATTACH_TIMEOUT
}

fn default_handle_resume_method() -> String {
    SessionDefaults::HANDLE_RESUME_METHOD.to_string()
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            suspend_on_close: false,
            protocol: ProtocolConfig::default(),
            object_not_found: ObjectNotFoundPolicy::default(),
            attach_timeout: default_attach_timeout(),
            handle_resume_method: default_handle_resume_method(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
