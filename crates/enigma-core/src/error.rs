//! Error types for the engine session client.
//!
//! Errors fall into four groups. Configuration errors are raised while a
//! session is being assembled and are never recoverable. Protocol errors reject
//! the single call that triggered them. Connectivity errors reject every call
//! outstanding when the socket failed. Server errors carry the engine's own
//! `code`/`message`/`parameter` triple.

use crate::transport::CloseEvent;
use std::time::Duration;
use thiserror::Error;

/// Main error type for enigma-core.
///
/// The type is `Clone` so a single transport failure can be delivered to every
/// pending resolver and to every waiter on a shared open/close future.
#[derive(Debug, Clone, Error)]
pub enum EnigmaError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Schema struct type not found: {type_name}")]
    SchemaStructTypeNotFound { type_name: String },

    #[error("Mixin cannot override {type_name}.{method}: no such method")]
    SchemaMixinCantOverrideFunction { type_name: String, method: String },

    #[error("Mixin cannot extend {type_name}.{method}: method already defined")]
    SchemaMixinExtendNotAllowed { type_name: String, method: String },

    #[error("API for handle {handle} is already defined")]
    EntryAlreadyDefined { handle: i64 },

    // Protocol errors
    #[error("Unexpected RPC response, expected array of patches")]
    ExpectedArrayOfPatches,

    #[error("Patch has no parent: {path}")]
    PatchHasNoParent { path: String },

    #[error("Invalid patch at {path}: {message}")]
    InvalidPatch { path: String, message: String },

    #[error("Object not found")]
    ObjectNotFound,

    #[error("Method {method} not found on {type_name}")]
    MethodNotFound { type_name: String, method: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    // Connectivity errors
    #[error("Not connected: {reason}")]
    NotConnected {
        reason: String,
        /// Close frame that triggered the failure, if the socket closed.
        close: Option<CloseEvent>,
    },

    #[error("Session suspended")]
    SessionSuspended,

    #[error("Session not attached")]
    SessionNotAttached,

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    // Server errors
    #[error("Engine error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        parameter: Option<String>,
    },
}

/// Result type alias for enigma-core operations.
pub type Result<T> = std::result::Result<T, EnigmaError>;

/// Error taxonomy group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Protocol,
    Connectivity,
    Server,
}

impl From<serde_json::Error> for EnigmaError {
    fn from(err: serde_json::Error) -> Self {
        EnigmaError::Json {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for EnigmaError {
    fn from(err: std::io::Error) -> Self {
        EnigmaError::Io {
            message: err.to_string(),
        }
    }
}

impl EnigmaError {
    /// Connectivity error without an associated close frame.
    pub fn not_connected(reason: impl Into<String>) -> Self {
        EnigmaError::NotConnected {
            reason: reason.into(),
            close: None,
        }
    }

    /// Which taxonomy group this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EnigmaError::Config { .. }
            | EnigmaError::SchemaStructTypeNotFound { .. }
            | EnigmaError::SchemaMixinCantOverrideFunction { .. }
            | EnigmaError::SchemaMixinExtendNotAllowed { .. }
            | EnigmaError::EntryAlreadyDefined { .. } => ErrorCategory::Configuration,

            EnigmaError::ExpectedArrayOfPatches
            | EnigmaError::PatchHasNoParent { .. }
            | EnigmaError::InvalidPatch { .. }
            | EnigmaError::ObjectNotFound
            | EnigmaError::MethodNotFound { .. }
            | EnigmaError::Json { .. } => ErrorCategory::Protocol,

            EnigmaError::NotConnected { .. }
            | EnigmaError::SessionSuspended
            | EnigmaError::SessionNotAttached
            | EnigmaError::Io { .. }
            | EnigmaError::Timeout(_) => ErrorCategory::Connectivity,

            EnigmaError::Server { .. } => ErrorCategory::Server,
        }
    }

    /// Numeric error code.
    ///
    /// Client-side failures use small negative codes:
    /// - -1: Not connected (also socket IO failures and timeouts)
    /// - -2: Object not found
    /// - -3: Expected array of patches
    /// - -4: Patch has no parent / invalid patch
    /// - -5: Entry already defined
    /// - -6: Configuration error
    /// - -8: Schema struct type not found
    /// - -9: Mixin cannot override function
    /// - -10: Mixin extend not allowed
    /// - -11: Session suspended
    /// - -12: Session not attached
    ///
    /// Server errors keep the engine's code. Malformed JSON maps to the
    /// JSON-RPC parse error (-32700) and unknown methods to -32601.
    pub fn code(&self) -> i64 {
        match self {
            EnigmaError::NotConnected { .. } | EnigmaError::Io { .. } | EnigmaError::Timeout(_) => -1,
            EnigmaError::ObjectNotFound => -2,
            EnigmaError::ExpectedArrayOfPatches => -3,
            EnigmaError::PatchHasNoParent { .. } | EnigmaError::InvalidPatch { .. } => -4,
            EnigmaError::EntryAlreadyDefined { .. } => -5,
            EnigmaError::Config { .. } => -6,
            EnigmaError::SchemaStructTypeNotFound { .. } => -8,
            EnigmaError::SchemaMixinCantOverrideFunction { .. } => -9,
            EnigmaError::SchemaMixinExtendNotAllowed { .. } => -10,
            EnigmaError::SessionSuspended => -11,
            EnigmaError::SessionNotAttached => -12,
            EnigmaError::Json { .. } => -32700,
            EnigmaError::MethodNotFound { .. } => -32601,
            EnigmaError::Server { code, .. } => *code,
        }
    }

    /// Whether the failure came from the transport rather than the call itself.
    ///
    /// Retrying is the caller's (or an interceptor's) decision; the session
    /// never retries on its own.
    pub fn is_connectivity(&self) -> bool {
        self.category() == ErrorCategory::Connectivity
    }
}
