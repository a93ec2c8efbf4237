//! # Toolsmith Pool
//!
//! The coordinator / worker pool: priority-queued task scheduling, worker
//! selection by capability and load, health checking, crash requeue, and a
//! bounded result cache — plus both sides of the line-delimited JSON worker
//! protocol and the transports that carry it.

pub mod cache;
pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod worker;

mod queue;

pub use cache::CacheConfig;
pub use pool::{
    ExecuteOptions, PoolConfig, PoolError, PoolMetrics, PoolResult, TaskHandle, TaskResult,
    WorkerPool,
};
pub use protocol::{
    decode_line, encode_line, Priority, ProtocolError, WorkerCapabilities, WorkerErrorBody,
    WorkerReply, WorkerRequest, WorkerResources, DEFAULT_MAX_MESSAGE_CHARS,
};
pub use runtime::{FnToolHandler, ToolHandler, ToolWorker};
pub use transport::{
    ChannelTransport, ChannelWorkerEnd, StdioHandle, StdioTransport, TransportEvent,
    TransportPipes,
};
pub use worker::{WorkerId, WorkerInfo, WorkerStatus};
