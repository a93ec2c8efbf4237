//! Sandbox execution context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Meter, SandboxError, SandboxLimits, SandboxMetrics, SandboxProgram};

/// Instrumentation handle passed to sandboxed programs.
///
/// This is the only capability a program receives: step accounting, heap
/// accounting, and a constrained log hook. There is no clock, no RNG, no
/// filesystem, and no way to reach the host process.
pub struct SandboxApi {
    limits: SandboxLimits,
    meter: Arc<Meter>,
    sandbox_id: Uuid,
}

impl SandboxApi {
    /// Count one execution step; errors once the step limit is exceeded or
    /// the sandbox has been preempted by a timeout.
    pub fn step(&self) -> Result<(), SandboxError> {
        if self.meter.cancelled.load(Ordering::SeqCst) {
            return Err(SandboxError::limit("time", "execution preempted after timeout"));
        }
        let steps = self.meter.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if steps > self.limits.max_steps {
            return Err(SandboxError::limit(
                "steps",
                format!("step limit of {} exceeded", self.limits.max_steps),
            ));
        }
        Ok(())
    }

    /// Account `bytes` of heap growth against the memory limit.
    pub fn track_alloc(&self, bytes: u64) -> Result<(), SandboxError> {
        let used = self.meter.heap_used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.meter.heap_peak.fetch_max(used, Ordering::SeqCst);
        let limit = self.limits.memory_limit_mb * 1024 * 1024;
        if used > limit {
            return Err(SandboxError::limit(
                "memory",
                format!("heap use of {} bytes exceeds {} MB limit", used, self.limits.memory_limit_mb),
            ));
        }
        Ok(())
    }

    /// Release previously tracked heap bytes.
    pub fn track_free(&self, bytes: u64) {
        let mut current = self.meter.heap_used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.meter.heap_used.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Constrained logging hook; messages land in the host's trace stream
    /// tagged with the sandbox id.
    pub fn log(&self, message: &str) {
        debug!(target: "toolsmith::sandbox", sandbox_id = %self.sandbox_id, "{}", message);
    }
}

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<SandboxError>,
    pub metrics: SandboxMetrics,
}

impl ExecutionOutcome {
    fn ok(result: Value, metrics: SandboxMetrics) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            metrics,
        }
    }

    fn err(error: SandboxError, metrics: SandboxMetrics) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            metrics,
        }
    }
}

/// An isolated execution context with enforced limits.
pub struct Sandbox {
    id: Uuid,
    limits: SandboxLimits,
    meter: Arc<Meter>,
    poisoned: AtomicBool,
    disposed: AtomicBool,
}

impl Sandbox {
    /// Establish a fresh, empty execution context.
    pub fn create(limits: SandboxLimits) -> Self {
        Self {
            id: Uuid::now_v7(),
            limits,
            meter: Arc::new(Meter::default()),
            poisoned: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// A sandbox whose program outlived its timeout still has a thread
    /// draining; it must not be reused.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run `program` with `args` copied into the sandbox by value.
    ///
    /// The program executes on a dedicated thread; this future resolves when
    /// it finishes or the wall-clock timeout elapses. On timeout the meter
    /// is cancelled so the thread aborts at its next instrumentation call.
    pub async fn execute(&self, program: Arc<dyn SandboxProgram>, args: &Value) -> ExecutionOutcome {
        if self.is_disposed() {
            return ExecutionOutcome::err(
                SandboxError::runtime("sandbox already disposed"),
                SandboxMetrics::default(),
            );
        }
        if self.is_poisoned() {
            return ExecutionOutcome::err(
                SandboxError::runtime("sandbox poisoned by a previous timeout"),
                SandboxMetrics::default(),
            );
        }

        self.meter.reset();
        let api = SandboxApi {
            limits: self.limits,
            meter: Arc::clone(&self.meter),
            sandbox_id: self.id,
        };
        // Arguments cross the boundary by value only.
        let args = args.clone();

        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let started = Instant::now();
            let result = program.run(&api, args);
            let _ = tx.send((result, started.elapsed()));
        });

        let timeout = Duration::from_millis(self.limits.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok((result, elapsed))) => {
                let (steps, heap_peak) = self.meter.snapshot();
                let metrics = SandboxMetrics {
                    cpu_time_ms: elapsed.as_millis() as u64,
                    heap_used_bytes: heap_peak,
                    steps_executed: steps,
                };
                match result {
                    Ok(value) => ExecutionOutcome::ok(value, metrics),
                    Err(err) => ExecutionOutcome::err(err, metrics),
                }
            }
            Ok(Err(_)) => {
                // Worker thread panicked before sending; treat as a runtime fault.
                let (steps, heap_peak) = self.meter.snapshot();
                ExecutionOutcome::err(
                    SandboxError::runtime("sandboxed program aborted"),
                    SandboxMetrics {
                        cpu_time_ms: 0,
                        heap_used_bytes: heap_peak,
                        steps_executed: steps,
                    },
                )
            }
            Err(_) => {
                self.meter.cancel();
                self.poisoned.store(true, Ordering::SeqCst);
                warn!(sandbox_id = %self.id, timeout_ms = self.limits.timeout_ms, "sandbox execution timed out");
                let (steps, heap_peak) = self.meter.snapshot();
                ExecutionOutcome::err(
                    SandboxError::limit(
                        "time",
                        format!("wall-clock timeout of {} ms exceeded", self.limits.timeout_ms),
                    ),
                    SandboxMetrics {
                        cpu_time_ms: self.limits.timeout_ms,
                        heap_used_bytes: heap_peak,
                        steps_executed: steps,
                    },
                )
            }
        }
    }

    /// Release all resources; safe to call multiple times.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.meter.cancel();
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CountingProgram {
        iterations: u64,
    }

    impl SandboxProgram for CountingProgram {
        fn run(&self, api: &SandboxApi, args: Value) -> Result<Value, SandboxError> {
            let mut acc = 0u64;
            for i in 0..self.iterations {
                api.step()?;
                acc = acc.wrapping_add(i);
            }
            Ok(json!({ "acc": acc, "echo": args }))
        }
    }

    struct AllocatingProgram {
        bytes: u64,
    }

    impl SandboxProgram for AllocatingProgram {
        fn run(&self, api: &SandboxApi, _args: Value) -> Result<Value, SandboxError> {
            api.step()?;
            api.track_alloc(self.bytes)?;
            Ok(Value::Null)
        }
    }

    struct FailingProgram;

    impl SandboxProgram for FailingProgram {
        fn run(&self, api: &SandboxApi, _args: Value) -> Result<Value, SandboxError> {
            api.step()?;
            Err(SandboxError::runtime("division by zero"))
        }
    }

    struct SpinningProgram;

    impl SandboxProgram for SpinningProgram {
        fn run(&self, api: &SandboxApi, _args: Value) -> Result<Value, SandboxError> {
            loop {
                api.step()?;
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[tokio::test]
    async fn test_successful_execution_reports_metrics() {
        let sandbox = Sandbox::create(SandboxLimits::default());
        let outcome = sandbox
            .execute(Arc::new(CountingProgram { iterations: 100 }), &json!({"x": 1}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.metrics.steps_executed, 100);
        assert_eq!(outcome.result.unwrap()["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn test_step_limit_exceeded() {
        let sandbox = Sandbox::create(SandboxLimits {
            max_steps: 10,
            ..Default::default()
        });
        let outcome = sandbox
            .execute(Arc::new(CountingProgram { iterations: 100 }), &Value::Null)
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "LIMIT_EXCEEDED");
        // Partial metrics still reported
        assert!(outcome.metrics.steps_executed >= 10);
    }

    #[tokio::test]
    async fn test_memory_limit_exceeded() {
        let sandbox = Sandbox::create(SandboxLimits {
            memory_limit_mb: 1,
            ..Default::default()
        });
        let outcome = sandbox
            .execute(Arc::new(AllocatingProgram { bytes: 2 * 1024 * 1024 }), &Value::Null)
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "LIMIT_EXCEEDED");
        assert!(outcome.metrics.heap_used_bytes >= 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_runtime_error_surfaces() {
        let sandbox = Sandbox::create(SandboxLimits::default());
        let outcome = sandbox.execute(Arc::new(FailingProgram), &Value::Null).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "RUNTIME_ERROR");
    }

    #[tokio::test]
    async fn test_timeout_poisons_sandbox() {
        let sandbox = Sandbox::create(SandboxLimits {
            timeout_ms: 50,
            ..Default::default()
        });
        let outcome = sandbox.execute(Arc::new(SpinningProgram), &Value::Null).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().kind(), "LIMIT_EXCEEDED");
        assert!(sandbox.is_poisoned());

        // A poisoned sandbox refuses further work.
        let again = sandbox
            .execute(Arc::new(CountingProgram { iterations: 1 }), &Value::Null)
            .await;
        assert!(!again.success);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let sandbox = Sandbox::create(SandboxLimits::default());
        sandbox.dispose();
        sandbox.dispose();
        assert!(sandbox.is_disposed());
        let outcome = sandbox
            .execute(Arc::new(CountingProgram { iterations: 1 }), &Value::Null)
            .await;
        assert!(!outcome.success);
    }
}
