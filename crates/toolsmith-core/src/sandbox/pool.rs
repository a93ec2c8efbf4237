//! Bounded sandbox pool.
//!
//! `acquire` hands out an idle sandbox when one exists, creates a new one
//! while under `max_size`, and otherwise poll-waits until a sandbox is
//! released. Poisoned or surplus sandboxes are disposed on release instead
//! of returning to the idle set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::{Sandbox, SandboxLimits};

#[derive(Debug, Clone)]
pub struct SandboxPoolConfig {
    pub max_size: usize,
    pub limits: SandboxLimits,
    /// Poll interval while waiting for a sandbox to free up
    pub acquire_poll_ms: u64,
}

impl Default for SandboxPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            limits: SandboxLimits::default(),
            acquire_poll_ms: 25,
        }
    }
}

struct PoolState {
    idle: Vec<Sandbox>,
    /// Sandboxes alive anywhere: idle here plus leased to callers
    total: usize,
}

pub struct SandboxPool {
    config: SandboxPoolConfig,
    state: Arc<Mutex<PoolState>>,
}

impl SandboxPool {
    pub fn new(config: SandboxPoolConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
            })),
        }
    }

    /// Acquire a sandbox, waiting if the pool is saturated.
    pub async fn acquire(&self) -> Sandbox {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(sandbox) = state.idle.pop() {
                    return sandbox;
                }
                if state.total < self.config.max_size {
                    state.total += 1;
                    debug!(total = state.total, max = self.config.max_size, "creating sandbox");
                    return Sandbox::create(self.config.limits);
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.acquire_poll_ms)).await;
        }
    }

    /// Return a sandbox to the pool; poisoned or surplus sandboxes are
    /// disposed instead.
    pub async fn release(&self, sandbox: Sandbox) {
        let mut state = self.state.lock().await;
        if sandbox.is_poisoned() || sandbox.is_disposed() || state.idle.len() + 1 > self.config.max_size
        {
            sandbox.dispose();
            state.total = state.total.saturating_sub(1);
            return;
        }
        state.idle.push(sandbox);
    }

    /// Dispose every idle sandbox and forget leased ones.
    pub async fn drain(&self) {
        let mut state = self.state.lock().await;
        for sandbox in state.idle.drain(..) {
            sandbox.dispose();
        }
        state.total = 0;
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{SandboxApi, SandboxError, SandboxProgram};
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Doubler;

    impl SandboxProgram for Doubler {
        fn run(&self, api: &SandboxApi, args: Value) -> Result<Value, SandboxError> {
            api.step()?;
            let n = args["n"].as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_sandbox() {
        let pool = SandboxPool::new(SandboxPoolConfig {
            max_size: 1,
            ..Default::default()
        });

        let sandbox = pool.acquire().await;
        let first_id = sandbox.id();
        pool.release(sandbox).await;

        let sandbox = pool.acquire().await;
        assert_eq!(sandbox.id(), first_id);
        pool.release(sandbox).await;
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(SandboxPool::new(SandboxPoolConfig {
            max_size: 1,
            acquire_poll_ms: 5,
            ..Default::default()
        }));

        let leased = pool.acquire().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let sandbox = pool.acquire().await;
                let outcome = sandbox.execute(Arc::new(Doubler), &json!({"n": 21})).await;
                pool.release(sandbox).await;
                outcome
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(leased).await;

        let outcome = waiter.await.expect("waiter task");
        assert!(outcome.success);
        assert_eq!(outcome.result.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_drain_disposes_idle() {
        let pool = SandboxPool::new(SandboxPoolConfig::default());
        let sandbox = pool.acquire().await;
        pool.release(sandbox).await;
        pool.drain().await;
        assert_eq!(pool.idle_count().await, 0);
    }
}
