//! # Toolsmith Server
//!
//! The outer shell of the runtime: the line-delimited JSON-RPC surface
//! over stdio, the policy gate applied to every tool call, and the
//! composition root that wires the event store, integrity chain, worker
//! pool, saga machinery, dead-letter queue, and event bus together.

pub mod bootstrap;
pub mod policy;
pub mod protocol;
pub mod server;

pub use bootstrap::AppContext;
pub use policy::{AllowAllGate, ConfigPolicyGate, PolicyGate, PolicyViolation};
pub use protocol::{RpcRequest, RpcResponse, ToolDescriptor};
pub use server::RpcServer;

/// Error types for the server shell.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("startup failure: {message}")]
    Startup { message: String },

    #[error("io error: {message}")]
    Io { message: String },
}
