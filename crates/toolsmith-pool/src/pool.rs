// Coordinator / worker pool.
//
// A single supervisor serializes queue and registry mutations behind one
// mutex; dispatch pops the highest-priority task, assigns the least-loaded
// capable worker, and hands off to a per-task waiter that awaits the reply
// or the task's timer. Worker crashes requeue their in-flight tasks at the
// original priority until `max_retries` is exhausted.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, ResultCache};
use crate::protocol::{
    Priority, ProtocolError, WorkerCapabilities, WorkerErrorBody, WorkerReply, WorkerRequest,
    DEFAULT_MAX_MESSAGE_CHARS,
};
use crate::queue::PriorityQueue;
use crate::transport::TransportPipes;
use crate::worker::{WorkerConnection, WorkerEvent, WorkerId, WorkerInfo, WorkerStatus};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bound on queued plus in-flight tasks
    pub max_queue_size: usize,
    pub default_timeout_ms: u64,
    /// Crash-requeue budget per task
    pub max_retries: u32,
    pub health_check_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub max_message_chars: usize,
    /// How long graceful shutdown waits for in-flight tasks
    pub shutdown_grace_ms: u64,
    pub cache: CacheConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            default_timeout_ms: 30_000,
            max_retries: 3,
            health_check_interval_ms: 5_000,
            ping_timeout_ms: 2_000,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            shutdown_grace_ms: 10_000,
            cache: CacheConfig::default(),
        }
    }
}

/// Pool-level failure surfaced to the caller of `execute_task`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("task queue is full")]
    QueueFull,

    #[error("task timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("worker crashed; task failed after {attempts} attempt(s)")]
    WorkerCrashed { attempts: u32 },

    #[error("worker message exceeded the configured line limit")]
    MessageTooLarge,

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("internal pool error: {message}")]
    Internal { message: String },
}

impl PoolError {
    /// Stable error code surfaced at the RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::QueueFull => "QUEUE_FULL",
            PoolError::Timeout { .. } => "TIMEOUT",
            PoolError::WorkerCrashed { .. } => "WORKER_CRASHED",
            PoolError::MessageTooLarge => "WORKER_MESSAGE_TOO_LARGE",
            PoolError::ShuttingDown => "SHUTTING_DOWN",
            PoolError::Internal { .. } => "INTERNAL",
        }
    }
}

impl From<ProtocolError> for PoolError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MessageTooLarge { .. } => PoolError::MessageTooLarge,
            ProtocolError::Serialization { message } => PoolError::Internal { message },
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Resolution of one task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub result: Option<Value>,
    /// Application error reported by the worker, surfaced as-is
    pub error: Option<WorkerErrorBody>,
    pub from_cache: bool,
    pub queue_time_ms: u64,
    pub execution_time_ms: u64,
    pub worker_id: Option<WorkerId>,
}

/// Options for `execute_task` / `submit`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub priority: Priority,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Awaitable handle on a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    rx: oneshot::Receiver<PoolResult<TaskResult>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn wait(self) -> PoolResult<TaskResult> {
        self.rx.await.map_err(|_| PoolError::Internal {
            message: "task waiter dropped".to_string(),
        })?
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub workers: usize,
    pub queue_size: usize,
    pub pending_tasks: usize,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cache_hits: u64,
    pub success_rate: f64,
    pub avg_queue_time_ms: f64,
    pub avg_execution_time_ms: f64,
}

struct Task {
    id: String,
    tool: String,
    params: Value,
    priority: Priority,
    timeout_ms: u64,
    created_at_ms: i64,
    enqueued_at: Instant,
    started_at: Option<Instant>,
    retries: u32,
    max_retries: u32,
    worker_id: Option<WorkerId>,
    fingerprint: String,
    waiter: Option<oneshot::Sender<PoolResult<TaskResult>>>,
}

struct WorkerEntry {
    info: WorkerInfo,
    conn: WorkerConnection,
    draining: bool,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    completed: u64,
    failed: u64,
    cache_hits: u64,
    queue_time_total_ms: u64,
    exec_time_total_ms: u64,
    timing_samples: u64,
}

struct PoolState {
    workers: HashMap<WorkerId, WorkerEntry>,
    queue: PriorityQueue<Task>,
    pending: HashMap<String, Task>,
    cache: ResultCache,
    metrics: MetricsState,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    events_tx: mpsc::Sender<WorkerEvent>,
    shutting_down: AtomicBool,
    self_ref: OnceLock<Weak<PoolInner>>,
}

/// The coordinator: owns the task queue, the worker registry, and the
/// result cache. Callers observe tasks only through the handles returned
/// by [`submit`](WorkerPool::submit).
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (events_tx, mut events_rx) = mpsc::channel::<WorkerEvent>(256);
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                workers: HashMap::new(),
                queue: PriorityQueue::new(),
                pending: HashMap::new(),
                cache: ResultCache::new(config.cache.clone()),
                metrics: MetricsState::default(),
            }),
            config,
            events_tx,
            shutting_down: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));

        // Supervisor: routes worker lifecycle events into registry updates.
        let supervisor = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(inner) = supervisor.upgrade() else { break };
                match event {
                    WorkerEvent::Registered {
                        worker_id,
                        capabilities,
                    } => inner.on_worker_registered(worker_id, capabilities).await,
                    WorkerEvent::Failed { worker_id, reason } => {
                        inner.on_worker_failure(&worker_id, &reason).await
                    }
                    WorkerEvent::Closed { worker_id } => inner.on_worker_closed(&worker_id).await,
                }
            }
        });

        // Health monitor.
        let monitor = Arc::downgrade(&inner);
        let interval = Duration::from_millis(inner.config.health_check_interval_ms.max(100));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = monitor.upgrade() else { break };
                if inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                inner.run_health_checks().await;
            }
        });

        Self { inner }
    }

    /// Add a worker to the registry in `Starting` status. Tasks are only
    /// dispatched to it once its `register` message arrives.
    pub async fn register_worker(
        &self,
        worker_id: impl Into<WorkerId>,
        pipes: TransportPipes,
    ) -> PoolResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let worker_id = worker_id.into();
        let conn = WorkerConnection::start(
            worker_id.clone(),
            pipes,
            self.inner.events_tx.clone(),
            self.inner.config.max_message_chars,
        );
        let mut state = self.inner.state.lock().await;
        if state.workers.contains_key(&worker_id) {
            return Err(PoolError::Internal {
                message: format!("worker {worker_id} already registered"),
            });
        }
        state.workers.insert(
            worker_id.clone(),
            WorkerEntry {
                info: WorkerInfo {
                    id: worker_id.clone(),
                    capabilities: WorkerCapabilities::default(),
                    status: WorkerStatus::Starting,
                    active_tasks: 0,
                    last_ping_ms: now_ms(),
                },
                conn,
                draining: false,
            },
        );
        info!(worker_id = %worker_id, "worker registered, awaiting capabilities");
        Ok(())
    }

    /// Initiate graceful shutdown of one worker; it is removed from the
    /// registry once its transport closes.
    pub async fn unregister_worker(&self, worker_id: &str) -> PoolResult<()> {
        let conn = {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| PoolError::Internal {
                    message: format!("unknown worker {worker_id}"),
                })?;
            entry.draining = true;
            entry.conn.clone()
        };
        conn.notify(&WorkerRequest::Shutdown {
            graceful: true,
            timeout_ms: self.inner.config.shutdown_grace_ms,
        })
        .await
        .ok();
        Ok(())
    }

    /// Submit a task and await its resolution.
    pub async fn execute_task(
        &self,
        tool: &str,
        params: Value,
        options: ExecuteOptions,
    ) -> PoolResult<TaskResult> {
        self.submit(tool, params, options).await?.wait().await
    }

    /// Submit a task, returning an awaitable handle.
    ///
    /// A cache hit resolves the handle immediately with `from_cache: true`
    /// and never enqueues. A full queue fails with `QUEUE_FULL`.
    pub async fn submit(
        &self,
        tool: &str,
        params: Value,
        options: ExecuteOptions,
    ) -> PoolResult<TaskHandle> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let fingerprint = ResultCache::fingerprint(tool, &params);
        let task_id = Uuid::now_v7().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock().await;
            if let Some(value) = state.cache.get(&fingerprint) {
                state.metrics.cache_hits += 1;
                state.metrics.total += 1;
                state.metrics.completed += 1;
                let _ = tx.send(Ok(TaskResult {
                    task_id: task_id.clone(),
                    success: true,
                    result: Some(value),
                    error: None,
                    from_cache: true,
                    queue_time_ms: 0,
                    execution_time_ms: 0,
                    worker_id: None,
                }));
                debug!(tool, "cache hit, task resolved at enqueue time");
                return Ok(TaskHandle { task_id, rx });
            }

            if state.queue.len() + state.pending.len() >= self.inner.config.max_queue_size {
                return Err(PoolError::QueueFull);
            }
            state.metrics.total += 1;
            let task = Task {
                id: task_id.clone(),
                tool: tool.to_string(),
                params,
                priority: options.priority,
                timeout_ms: options
                    .timeout_ms
                    .unwrap_or(self.inner.config.default_timeout_ms),
                created_at_ms: now_ms(),
                enqueued_at: Instant::now(),
                started_at: None,
                retries: 0,
                max_retries: options.max_retries.unwrap_or(self.inner.config.max_retries),
                worker_id: None,
                fingerprint,
                waiter: Some(tx),
            };
            let created_at_ms = task.created_at_ms;
            state.queue.push(options.priority, created_at_ms, task);
        }

        self.inner.try_dispatch().await;
        Ok(TaskHandle { task_id, rx })
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let state = self.inner.state.lock().await;
        let m = &state.metrics;
        let resolved = m.completed + m.failed;
        PoolMetrics {
            workers: state.workers.len(),
            queue_size: state.queue.len(),
            pending_tasks: state.pending.len(),
            total_tasks: m.total,
            completed_tasks: m.completed,
            failed_tasks: m.failed,
            cache_hits: m.cache_hits,
            success_rate: if resolved == 0 {
                0.0
            } else {
                m.completed as f64 / resolved as f64
            },
            avg_queue_time_ms: if m.timing_samples == 0 {
                0.0
            } else {
                m.queue_time_total_ms as f64 / m.timing_samples as f64
            },
            avg_execution_time_ms: if m.timing_samples == 0 {
                0.0
            } else {
                m.exec_time_total_ms as f64 / m.timing_samples as f64
            },
        }
    }

    /// Current registry view.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.inner.state.lock().await;
        state.workers.values().map(|w| w.info.clone()).collect()
    }

    /// Every distinct tool some live worker advertises.
    pub async fn capabilities(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut tools: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.info.status != WorkerStatus::Crashed)
            .flat_map(|w| w.info.capabilities.tools.iter().cloned())
            .collect();
        tools.sort();
        tools.dedup();
        tools
    }

    /// Clear the queue, wait for in-flight tasks up to the grace deadline,
    /// then force-terminate what remains.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        info!("coordinator shutting down");

        {
            let mut state = self.inner.state.lock().await;
            for mut task in state.queue.clear() {
                state.metrics.failed += 1;
                if let Some(waiter) = task.waiter.take() {
                    let _ = waiter.send(Err(PoolError::ShuttingDown));
                }
            }
            for entry in state.workers.values_mut() {
                entry.draining = true;
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.inner.config.shutdown_grace_ms);
        loop {
            {
                let state = self.inner.state.lock().await;
                if state.pending.is_empty() {
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!("shutdown grace period elapsed, rejecting in-flight tasks");
                let mut state = self.inner.state.lock().await;
                let stragglers: Vec<String> = state.pending.keys().cloned().collect();
                for task_id in stragglers {
                    if let Some(mut task) = state.pending.remove(&task_id) {
                        state.metrics.failed += 1;
                        let timeout_ms = task.timeout_ms;
                        if let Some(waiter) = task.waiter.take() {
                            let _ = waiter.send(Err(PoolError::Timeout { timeout_ms }));
                        }
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let conns: Vec<WorkerConnection> = {
            let state = self.inner.state.lock().await;
            state.workers.values().map(|w| w.conn.clone()).collect()
        };
        for conn in conns {
            conn.notify(&WorkerRequest::Shutdown {
                graceful: true,
                timeout_ms: 0,
            })
            .await
            .ok();
        }
    }
}

impl PoolInner {
    fn arc(&self) -> Option<Arc<PoolInner>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    async fn on_worker_registered(&self, worker_id: WorkerId, capabilities: WorkerCapabilities) {
        {
            let mut state = self.state.lock().await;
            let Some(entry) = state.workers.get_mut(&worker_id) else {
                return;
            };
            info!(worker_id = %worker_id, tools = ?capabilities.tools, "worker ready");
            entry.info.capabilities = capabilities;
            entry.info.status = WorkerStatus::Ready;
        }
        self.try_dispatch().await;
    }

    /// Promote a worker to `Crashed`: requeue its in-flight tasks and drop
    /// it from the registry.
    async fn on_worker_failure(&self, worker_id: &str, reason: &str) {
        {
            let mut state = self.state.lock().await;
            let Some(mut entry) = state.workers.remove(worker_id) else {
                return;
            };
            entry.info.status = WorkerStatus::Crashed;
            warn!(worker_id = %worker_id, reason = %reason, "worker crashed");

            let affected: Vec<String> = state
                .pending
                .values()
                .filter(|t| t.worker_id.as_deref() == Some(worker_id))
                .map(|t| t.id.clone())
                .collect();
            for task_id in affected {
                if let Some(task) = state.pending.remove(&task_id) {
                    Self::requeue_or_fail(&mut state, task);
                }
            }
        }
        self.try_dispatch().await;
    }

    async fn on_worker_closed(&self, worker_id: &str) {
        let draining = {
            let state = self.state.lock().await;
            match state.workers.get(worker_id) {
                Some(entry) => entry.draining,
                None => return,
            }
        };
        if draining {
            let mut state = self.state.lock().await;
            state.workers.remove(worker_id);
            info!(worker_id = %worker_id, "worker unregistered");
        } else {
            self.on_worker_failure(worker_id, "transport closed").await;
        }
    }

    /// Requeue at the original priority with `retries += 1`, or resolve
    /// the waiter with `WORKER_CRASHED` once the budget is spent.
    fn requeue_or_fail(state: &mut PoolState, mut task: Task) {
        if let Some(worker_id) = task.worker_id.take() {
            Self::release_worker_slot(state, &worker_id);
        }
        if task.retries < task.max_retries {
            task.retries += 1;
            task.started_at = None;
            debug!(task_id = %task.id, retries = task.retries, "requeueing task after worker crash");
            let (priority, created_at_ms) = (task.priority, task.created_at_ms);
            state.queue.push(priority, created_at_ms, task);
        } else {
            state.metrics.failed += 1;
            let attempts = task.retries + 1;
            if let Some(waiter) = task.waiter.take() {
                let _ = waiter.send(Err(PoolError::WorkerCrashed { attempts }));
            }
        }
    }

    fn release_worker_slot(state: &mut PoolState, worker_id: &str) {
        if let Some(entry) = state.workers.get_mut(worker_id) {
            entry.info.active_tasks = entry.info.active_tasks.saturating_sub(1);
            if entry.info.status == WorkerStatus::Busy && entry.info.current_load() < 1.0 {
                entry.info.status = WorkerStatus::Ready;
            }
        }
    }

    /// Drain the queue while capable workers have spare capacity.
    ///
    /// Returns a boxed future rather than being declared `async fn`: this
    /// method and `fail_dispatch`/`complete_task`/`timeout_task` call each
    /// other recursively, and the compiler cannot resolve the `Send`-ness
    /// of a cycle of opaque `async fn` return types. Boxing breaks the
    /// cycle without changing behavior.
    fn try_dispatch(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        loop {
            let dispatch = {
                let mut state = self.state.lock().await;
                let Some(mut task) = state.queue.pop() else { break };

                let pick = state
                    .workers
                    .values()
                    .filter(|w| {
                        w.info.status != WorkerStatus::Crashed
                            && w.info.status != WorkerStatus::Starting
                            && !w.draining
                            && w.info.capabilities.tools.iter().any(|t| t == &task.tool)
                            && w.info.current_load() < 1.0
                    })
                    .min_by(|a, b| {
                        a.info
                            .current_load()
                            .partial_cmp(&b.info.current_load())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|w| w.info.id.clone());

                match pick {
                    None => {
                        // No capable worker with spare capacity: put the
                        // task back at its original priority and stop.
                        let (priority, created_at_ms) = (task.priority, task.created_at_ms);
                        state.queue.push(priority, created_at_ms, task);
                        None
                    }
                    Some(worker_id) => {
                        // `pick` came from this same locked state, so the
                        // entry is still present.
                        let Some(entry) = state.workers.get_mut(&worker_id) else {
                            let (priority, created_at_ms) = (task.priority, task.created_at_ms);
                            state.queue.push(priority, created_at_ms, task);
                            continue;
                        };
                        entry.info.active_tasks += 1;
                        if entry.info.current_load() >= 1.0 {
                            entry.info.status = WorkerStatus::Busy;
                        }
                        let conn = entry.conn.clone();
                        task.worker_id = Some(worker_id.clone());
                        task.started_at = Some(Instant::now());
                        let request = WorkerRequest::Execute {
                            id: task.id.clone(),
                            tool: task.tool.clone(),
                            params: task.params.clone(),
                            timeout_ms: task.timeout_ms,
                            priority: task.priority,
                        };
                        let timeout_ms = task.timeout_ms;
                        let task_id = task.id.clone();
                        // Waiter callbacks carry the attempt number so a
                        // stale waiter from a crashed dispatch can never
                        // touch a requeued attempt of the same task.
                        let attempt = task.retries;
                        debug!(task_id = %task_id, worker_id = %worker_id, "task dispatched");
                        state.pending.insert(task_id.clone(), task);
                        Some((conn, request, timeout_ms, task_id, attempt))
                    }
                }
            };

            let Some((conn, request, timeout_ms, task_id, attempt)) = dispatch else {
                break;
            };
            let Some(inner) = self.arc() else { break };
            tokio::spawn(async move {
                let rx = match conn.request(&request).await {
                    Ok(rx) => rx,
                    Err(err) => {
                        inner.fail_dispatch(&task_id, attempt, err).await;
                        return;
                    }
                };
                match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
                    Ok(Ok(reply)) => inner.complete_task(&task_id, attempt, reply).await,
                    // Connection died; the crash handler requeues the task.
                    Ok(Err(_)) => {
                        inner
                            .fail_dispatch(
                                &task_id,
                                attempt,
                                PoolError::Internal {
                                    message: "worker connection dropped".to_string(),
                                },
                            )
                            .await
                    }
                    Err(_) => inner.timeout_task(&task_id, attempt).await,
                }
            });
        }
        })
    }

    /// Whether the pending entry for `task_id` still belongs to the
    /// dispatch attempt a waiter callback came from.
    fn is_current_attempt(state: &PoolState, task_id: &str, attempt: u32) -> bool {
        state
            .pending
            .get(task_id)
            .map(|t| t.retries == attempt)
            .unwrap_or(false)
    }

    /// The request never reached the worker (or its connection died while
    /// waiting): treat it like a crash for this task only.
    async fn fail_dispatch(&self, task_id: &str, attempt: u32, err: PoolError) {
        {
            let mut state = self.state.lock().await;
            if !Self::is_current_attempt(&state, task_id, attempt) {
                return;
            }
            let Some(task) = state.pending.remove(task_id) else {
                return;
            };
            debug!(task_id = %task_id, error = %err, "dispatch failed");
            Self::requeue_or_fail(&mut state, task);
        }
        self.try_dispatch().await;
    }

    async fn complete_task(&self, task_id: &str, attempt: u32, reply: WorkerReply) {
        {
            let mut state = self.state.lock().await;
            if !Self::is_current_attempt(&state, task_id, attempt) {
                // Late reply after a timeout, crash resolution, or requeue.
                return;
            }
            let Some(mut task) = state.pending.remove(task_id) else {
                return;
            };
            if let Some(worker_id) = task.worker_id.clone() {
                Self::release_worker_slot(&mut state, &worker_id);
            }
            let queue_time_ms = task
                .started_at
                .map(|s| s.duration_since(task.enqueued_at).as_millis() as u64)
                .unwrap_or(0);
            let execution_time_ms = task
                .started_at
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0);
            state.metrics.queue_time_total_ms += queue_time_ms;
            state.metrics.exec_time_total_ms += execution_time_ms;
            state.metrics.timing_samples += 1;

            let resolution = match reply {
                WorkerReply::Success { result, .. } => {
                    state.metrics.completed += 1;
                    state.cache.put(task.fingerprint.clone(), &result);
                    Ok(TaskResult {
                        task_id: task.id.clone(),
                        success: true,
                        result: Some(result),
                        error: None,
                        from_cache: false,
                        queue_time_ms,
                        execution_time_ms,
                        worker_id: task.worker_id.clone(),
                    })
                }
                WorkerReply::Error { error, .. } => {
                    state.metrics.failed += 1;
                    Ok(TaskResult {
                        task_id: task.id.clone(),
                        success: false,
                        result: None,
                        error: Some(error),
                        from_cache: false,
                        queue_time_ms,
                        execution_time_ms,
                        worker_id: task.worker_id.clone(),
                    })
                }
                other => {
                    state.metrics.failed += 1;
                    Err(PoolError::Internal {
                        message: format!("unexpected reply to execute: {other:?}"),
                    })
                }
            };
            if let Some(waiter) = task.waiter.take() {
                let _ = waiter.send(resolution);
            }
        }
        self.try_dispatch().await;
    }

    /// Per-task timer fired. The worker is not killed at this layer; it may
    /// still recover and its late reply will simply be dropped.
    async fn timeout_task(&self, task_id: &str, attempt: u32) {
        {
            let mut state = self.state.lock().await;
            if !Self::is_current_attempt(&state, task_id, attempt) {
                return;
            }
            let Some(mut task) = state.pending.remove(task_id) else {
                return;
            };
            warn!(task_id = %task_id, timeout_ms = task.timeout_ms, "task timed out");
            if let Some(worker_id) = task.worker_id.clone() {
                Self::release_worker_slot(&mut state, &worker_id);
            }
            let queue_time_ms = task
                .started_at
                .map(|s| s.duration_since(task.enqueued_at).as_millis() as u64)
                .unwrap_or(0);
            state.metrics.queue_time_total_ms += queue_time_ms;
            state.metrics.exec_time_total_ms += task.timeout_ms;
            state.metrics.timing_samples += 1;
            state.metrics.failed += 1;
            let timeout_ms = task.timeout_ms;
            if let Some(waiter) = task.waiter.take() {
                let _ = waiter.send(Err(PoolError::Timeout { timeout_ms }));
            }
        }
        self.try_dispatch().await;
    }

    /// Ping every non-draining worker; treat a missing or late pong as a
    /// crash.
    async fn run_health_checks(&self) {
        let targets: Vec<(WorkerId, WorkerConnection)> = {
            let state = self.state.lock().await;
            state
                .workers
                .values()
                .filter(|w| !w.draining && w.info.status != WorkerStatus::Starting)
                .map(|w| (w.info.id.clone(), w.conn.clone()))
                .collect()
        };

        for (worker_id, conn) in targets {
            let ping = WorkerRequest::Ping {
                id: Uuid::now_v7().to_string(),
                timestamp: now_ms(),
            };
            let healthy = match conn.request(&ping).await {
                Ok(rx) => matches!(
                    tokio::time::timeout(
                        Duration::from_millis(self.config.ping_timeout_ms),
                        rx
                    )
                    .await,
                    Ok(Ok(WorkerReply::Pong { .. }))
                ),
                Err(_) => false,
            };
            if healthy {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.workers.get_mut(&worker_id) {
                    entry.info.last_ping_ms = now_ms();
                }
            } else {
                self.on_worker_failure(&worker_id, "health check failed").await;
            }
        }
    }
}
