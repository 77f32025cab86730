//! enigma-core: client-side session library for a remote object-oriented
//! compute engine spoken to over JSON-RPC 2.0.
//!
//! The engine exposes remote objects identified by integer handles. A
//! [`Session`] opens one socket, turns the engine's method schema into callable
//! [`Api`] objects, keeps their state current through the delta protocol and
//! can suspend and later resume the whole object graph across reconnects.
//!
//! # Example
//!
//! ```rust,no_run
//! use enigma_core::{MemoryNetwork, SchemaDocument, Session};
//!
//! # async fn example() -> enigma_core::Result<()> {
//! let (network, _acceptor) = MemoryNetwork::new();
//! let schema = SchemaDocument::from_json_str(
//!     r#"{"structs": {"Global": {"EngineVersion": {"In": [], "Out": [{"Name": "qVersion"}]}}}}"#,
//! )?;
//!
//! let session = Session::builder()
//!     .url("memory://engine")
//!     .schema(schema)
//!     .socket_factory(network)
//!     .build()?;
//!
//! let global = session.open().await?;
//! let version = global.call("EngineVersion", vec![]).await?;
//! # let _ = version;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod intercept;
pub mod patch;
pub mod schema;
pub mod session;
pub mod transport;

pub use config::{ObjectNotFoundPolicy, ProtocolConfig, SessionDefaults, SessionOptions};
pub use error::{EnigmaError, ErrorCategory, Result};
pub use intercept::{Request, RequestInterceptor, ResponseInterceptor};
pub use patch::{apply, generate, update_object, IdPointer, Patch, PatchOp, StableIdentity};
pub use schema::{Api, ApiEvent, BoundMethod, Mixin, OutKey, Reply, Schema, SchemaDocument};
pub use session::{
    AttachState, RequestFuture, RestoreMethods, Session, SessionBuilder, SessionEvent,
    SuspendInitiator,
};
pub use transport::{
    CloseEvent, MemoryAcceptor, MemoryNetwork, MemoryPeer, ReadyState, Socket, SocketConnection,
    SocketEvent, SocketFactory, TcpSocketFactory,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
