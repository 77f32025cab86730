//! Socket transport and JSON-RPC plumbing.
//!
//! # Architecture
//!
//! - **Socket**: the abstract duplex text channel ([`Socket`], [`SocketFactory`])
//! - **Rpc**: owns one socket, numbers requests and routes responses by id
//! - **Resolver registry**: pending request id → completion channel
//! - **Implementations**: in-process [`MemoryNetwork`] and framed [`TcpSocketFactory`]

pub mod envelope;
pub mod frame;
pub mod memory;
pub mod resolver;
pub mod rpc;
pub mod socket;
pub mod tcp;

pub use envelope::{EngineErrorBody, RequestEnvelope};
pub use memory::{MemoryAcceptor, MemoryNetwork, MemoryPeer, MemorySocket};
pub use resolver::{ResolverId, ResolverRegistry};
pub use rpc::{ClosedSignal, Rpc, RpcEvent, RpcObserver, TrafficDirection};
pub use socket::{CloseEvent, ReadyState, Socket, SocketConnection, SocketEvent, SocketFactory};
pub use tcp::TcpSocketFactory;
