//! Sandboxed execution of untrusted programs.
//!
//! A sandbox runs one program at a time on a dedicated thread with no
//! ambient authority: the program receives only a [`SandboxApi`] handle and
//! its (deep-copied) arguments. Limits on steps, heap bytes, and wall-clock
//! time are enforced through the instrumentation hooks every sandboxed
//! program is required to call.

pub mod executor;
pub mod pool;

pub use executor::{ExecutionOutcome, Sandbox, SandboxApi};
pub use pool::{SandboxPool, SandboxPoolConfig};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Resource limits applied to a sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub memory_limit_mb: u64,
    pub timeout_ms: u64,
    pub max_steps: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            timeout_ms: 5_000,
            max_steps: 1_000_000,
        }
    }
}

/// Error raised by sandboxed execution.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum SandboxError {
    #[error("Limit exceeded ({resource}): {message}")]
    LimitExceeded { resource: String, message: String },

    #[error("Runtime error: {message}")]
    Runtime { message: String },

    #[error("Syntax error: {message}")]
    Syntax { message: String },
}

impl SandboxError {
    pub fn limit(resource: &str, message: impl Into<String>) -> Self {
        SandboxError::LimitExceeded {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        SandboxError::Runtime {
            message: message.into(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        SandboxError::Syntax {
            message: message.into(),
        }
    }

    /// Stable error-kind string surfaced at the RPC boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            SandboxError::Runtime { .. } => "RUNTIME_ERROR",
            SandboxError::Syntax { .. } => "SYNTAX_ERROR",
        }
    }
}

/// Execution metrics reported with every outcome, success or not.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub cpu_time_ms: u64,
    pub heap_used_bytes: u64,
    pub steps_executed: u64,
}

/// A compiled program runnable inside a sandbox.
///
/// Programs must call [`SandboxApi::step`] on every iteration of their hot
/// paths and report heap growth through [`SandboxApi::track_alloc`]; those
/// hooks are how the limits of [`SandboxLimits`] are enforced and how a
/// timed-out sandbox preempts the thread.
pub trait SandboxProgram: Send + Sync {
    fn run(&self, api: &SandboxApi, args: serde_json::Value)
        -> Result<serde_json::Value, SandboxError>;
}

/// Compilation seam for tool-provided program sources.
///
/// Concrete tool crates supply the compiler; a source that fails to compile
/// surfaces as [`SandboxError::Syntax`].
pub trait ProgramCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Arc<dyn SandboxProgram>, SandboxError>;
}

/// Shared instrumentation state between a sandbox and its worker thread.
#[derive(Debug, Default)]
pub(crate) struct Meter {
    pub steps: AtomicU64,
    pub heap_used: AtomicU64,
    pub heap_peak: AtomicU64,
    pub cancelled: AtomicBool,
}

impl Meter {
    pub fn reset(&self) {
        self.steps.store(0, Ordering::SeqCst);
        self.heap_used.store(0, Ordering::SeqCst);
        self.heap_peak.store(0, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.steps.load(Ordering::SeqCst),
            self.heap_peak.load(Ordering::SeqCst),
        )
    }
}
