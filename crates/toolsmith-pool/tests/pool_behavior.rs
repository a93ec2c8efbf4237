// End-to-end coordinator behavior over in-process channel transports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use toolsmith_pool::{
    encode_line, CacheConfig, ChannelTransport, ExecuteOptions, FnToolHandler, PoolConfig,
    PoolError, Priority, ToolWorker, WorkerErrorBody, WorkerPool, WorkerStatus,
    DEFAULT_MAX_MESSAGE_CHARS,
};

async fn register_echo_worker(pool: &WorkerPool, id: &str, tools: &[&str]) {
    let (pipes, worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
    let mut worker = ToolWorker::new(vec!["javascript".to_string()], 1);
    for tool in tools {
        worker = worker.tool(
            *tool,
            FnToolHandler::new(|params| async move { Ok(json!({ "echo": params })) }),
        );
    }
    tokio::spawn(worker.serve(worker_end.lines_in, worker_end.lines_out));
    pool.register_worker(id, pipes).await.unwrap();
    wait_for_ready(pool, 1).await;
}

async fn wait_for_ready(pool: &WorkerPool, count: usize) {
    for _ in 0..200 {
        let ready = pool
            .workers()
            .await
            .iter()
            .filter(|w| w.status == WorkerStatus::Ready || w.status == WorkerStatus::Busy)
            .count();
        if ready >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("workers never became ready");
}

#[tokio::test]
async fn happy_path_and_cache_idempotence() {
    let pool = WorkerPool::new(PoolConfig::default());
    register_echo_worker(&pool, "w-parse", &["parse"]).await;

    let params = json!({ "language": "javascript", "code": "const x=1" });
    let first = pool
        .execute_task("parse", params.clone(), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(first.success);
    assert!(!first.from_cache);
    assert_eq!(first.result.as_ref().unwrap()["echo"]["code"], "const x=1");
    assert_eq!(first.worker_id.as_deref(), Some("w-parse"));

    let second = pool
        .execute_task("parse", params, ExecuteOptions::default())
        .await
        .unwrap();
    assert!(second.success);
    assert!(second.from_cache);
    assert_eq!(second.queue_time_ms, 0);
    assert_eq!(second.execution_time_ms, 0);
    assert_eq!(second.result, first.result);

    let metrics = pool.metrics().await;
    assert_eq!(metrics.total_tasks, 2);
    assert_eq!(metrics.completed_tasks, 2);
    assert_eq!(metrics.cache_hits, 1);
    assert!(metrics.success_rate > 0.99);
}

#[tokio::test]
async fn strict_priority_preempts_batch_backlog() {
    let pool = WorkerPool::new(PoolConfig::default());

    // Ten batch tasks, then one critical task, all before any worker
    // exists. Distinct params keep the cache out of the picture.
    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(
            pool.submit(
                "slot",
                json!({ "kind": "batch", "i": i }),
                ExecuteOptions {
                    priority: Priority::Batch,
                    ..Default::default()
                },
            )
            .await
            .unwrap(),
        );
    }
    let critical = pool
        .submit(
            "slot",
            json!({ "kind": "critical" }),
            ExecuteOptions {
                priority: Priority::Critical,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // A single-concurrency worker records the order it sees tasks in.
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (pipes, worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
    let seen = order.clone();
    let worker = ToolWorker::new(vec![], 1).tool(
        "slot",
        FnToolHandler::new(move |params: Value| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(params["kind"].as_str().unwrap_or("?").to_string());
                Ok(json!({}))
            }
        }),
    );
    tokio::spawn(worker.serve(worker_end.lines_in, worker_end.lines_out));
    pool.register_worker("w-slot", pipes).await.unwrap();

    critical.wait().await.unwrap();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let order = order.lock().await;
    assert_eq!(order.len(), 11);
    assert_eq!(order[0], "critical", "critical must dispatch before any batch task");
}

#[tokio::test]
async fn queue_bound_rejects_with_queue_full() {
    let pool = WorkerPool::new(PoolConfig {
        max_queue_size: 2,
        ..Default::default()
    });

    let _a = pool
        .submit("t", json!({ "i": 1 }), ExecuteOptions::default())
        .await
        .unwrap();
    let _b = pool
        .submit("t", json!({ "i": 2 }), ExecuteOptions::default())
        .await
        .unwrap();
    let err = pool
        .submit("t", json!({ "i": 3 }), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::QueueFull));
    assert_eq!(err.code(), "QUEUE_FULL");
}

#[tokio::test]
async fn task_timeout_does_not_kill_the_worker() {
    let pool = WorkerPool::new(PoolConfig {
        health_check_interval_ms: 60_000,
        ..Default::default()
    });

    let (pipes, worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
    let worker = ToolWorker::new(vec![], 1).tool(
        "slow",
        FnToolHandler::new(|params: Value| async move {
            if params["sleep_ms"].as_u64().unwrap_or(0) > 0 {
                tokio::time::sleep(Duration::from_millis(params["sleep_ms"].as_u64().unwrap()))
                    .await;
            }
            Ok(json!("done"))
        }),
    );
    tokio::spawn(worker.serve(worker_end.lines_in, worker_end.lines_out));
    pool.register_worker("w-slow", pipes).await.unwrap();
    wait_for_ready(&pool, 1).await;

    let err = pool
        .execute_task(
            "slow",
            json!({ "sleep_ms": 500 }),
            ExecuteOptions {
                timeout_ms: Some(50),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }));
    assert_eq!(err.code(), "TIMEOUT");

    // The worker survives the timeout and serves the next task.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let ok = pool
        .execute_task("slow", json!({ "sleep_ms": 0 }), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(ok.success);
    assert_eq!(pool.workers().await.len(), 1);
}

/// A worker that registers, then drops its transport on the first execute.
async fn register_crashing_worker(pool: &WorkerPool, id: &str, tool: &str) {
    let (pipes, mut worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
    let register = toolsmith_pool::WorkerReply::Register {
        capabilities: toolsmith_pool::WorkerCapabilities {
            tools: vec![tool.to_string()],
            languages: vec![],
            max_concurrent: 1,
        },
        resources: Default::default(),
    };
    let line = encode_line(&register, DEFAULT_MAX_MESSAGE_CHARS).unwrap();
    tokio::spawn(async move {
        worker_end.lines_out.send(line).await.unwrap();
        // First request of any kind: die without replying.
        let _ = worker_end.lines_in.recv().await;
        drop(worker_end.lines_out);
    });
    pool.register_worker(id, pipes).await.unwrap();
}

#[tokio::test]
async fn worker_crash_requeues_until_a_healthy_worker_appears() {
    let pool = WorkerPool::new(PoolConfig {
        max_retries: 2,
        health_check_interval_ms: 60_000,
        ..Default::default()
    });
    register_crashing_worker(&pool, "w-doomed", "work").await;
    wait_for_ready(&pool, 1).await;

    let handle = pool
        .submit("work", json!({ "job": 1 }), ExecuteOptions::default())
        .await
        .unwrap();

    // Give the crash a moment to be observed and the task requeued.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.workers().await.len(), 0);
    assert_eq!(pool.metrics().await.queue_size, 1);

    register_echo_worker(&pool, "w-healthy", &["work"]).await;
    let result = handle.wait().await.unwrap();
    assert!(result.success);
    assert_eq!(result.worker_id.as_deref(), Some("w-healthy"));
}

#[tokio::test]
async fn worker_crash_with_no_retries_fails_the_task() {
    let pool = WorkerPool::new(PoolConfig {
        max_retries: 0,
        health_check_interval_ms: 60_000,
        ..Default::default()
    });
    register_crashing_worker(&pool, "w-doomed", "work").await;
    wait_for_ready(&pool, 1).await;

    let err = pool
        .execute_task("work", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::WorkerCrashed { attempts: 1 }));
    assert_eq!(err.code(), "WORKER_CRASHED");
}

#[tokio::test]
async fn oversize_worker_reply_is_treated_as_a_crash() {
    let pool = WorkerPool::new(PoolConfig {
        max_retries: 0,
        max_message_chars: 512,
        health_check_interval_ms: 60_000,
        ..Default::default()
    });

    // Hand-rolled worker that replies with a line above the pool's limit.
    let (pipes, mut worker_end) = ChannelTransport::pair(512);
    let register = toolsmith_pool::WorkerReply::Register {
        capabilities: toolsmith_pool::WorkerCapabilities {
            tools: vec!["blob".to_string()],
            languages: vec![],
            max_concurrent: 1,
        },
        resources: Default::default(),
    };
    let line = encode_line(&register, 512).unwrap();
    tokio::spawn(async move {
        worker_end.lines_out.send(line).await.unwrap();
        while let Some(_request) = worker_end.lines_in.recv().await {
            if worker_end.lines_out.send("y".repeat(4096)).await.is_err() {
                break;
            }
        }
    });
    pool.register_worker("w-blob", pipes).await.unwrap();
    wait_for_ready(&pool, 1).await;

    let err = pool
        .execute_task("blob", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::WorkerCrashed { .. }));
    assert_eq!(pool.workers().await.len(), 0);
}

#[tokio::test]
async fn health_check_crashes_unresponsive_workers() {
    let pool = WorkerPool::new(PoolConfig {
        health_check_interval_ms: 100,
        ping_timeout_ms: 50,
        ..Default::default()
    });

    // Registers but never answers anything.
    let (pipes, mut worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
    let register = toolsmith_pool::WorkerReply::Register {
        capabilities: toolsmith_pool::WorkerCapabilities {
            tools: vec!["mute".to_string()],
            languages: vec![],
            max_concurrent: 1,
        },
        resources: Default::default(),
    };
    let line = encode_line(&register, DEFAULT_MAX_MESSAGE_CHARS).unwrap();
    tokio::spawn(async move {
        worker_end.lines_out.send(line).await.unwrap();
        // Keep the transport open but stay silent.
        while worker_end.lines_in.recv().await.is_some() {}
    });
    pool.register_worker("w-mute", pipes).await.unwrap();
    wait_for_ready(&pool, 1).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.workers().await.len(), 0, "unresponsive worker must be removed");
}

#[tokio::test]
async fn max_concurrent_admission_control() {
    let pool = WorkerPool::new(PoolConfig {
        health_check_interval_ms: 60_000,
        cache: CacheConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    });

    // Worker with two slots; each execution parks until released.
    let (release_tx, release_rx) = mpsc::channel::<()>(16);
    let release_rx = Arc::new(Mutex::new(release_rx));
    let (pipes, worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
    let worker = ToolWorker::new(vec![], 2).tool(
        "hold",
        FnToolHandler::new(move |_| {
            let release_rx = release_rx.clone();
            async move {
                release_rx.lock().await.recv().await;
                Ok(json!("released"))
            }
        }),
    );
    tokio::spawn(worker.serve(worker_end.lines_in, worker_end.lines_out));
    pool.register_worker("w-two", pipes).await.unwrap();
    wait_for_ready(&pool, 1).await;

    let a = pool.submit("hold", json!({ "i": 1 }), ExecuteOptions::default()).await.unwrap();
    let b = pool.submit("hold", json!({ "i": 2 }), ExecuteOptions::default()).await.unwrap();
    let c = pool.submit("hold", json!({ "i": 3 }), ExecuteOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = pool.metrics().await;
    // Two slots in flight, the third task waits in the queue.
    assert_eq!(metrics.pending_tasks, 2);
    assert_eq!(metrics.queue_size, 1);

    for _ in 0..3 {
        release_tx.send(()).await.unwrap();
    }
    assert!(a.wait().await.unwrap().success);
    assert!(b.wait().await.unwrap().success);
    assert!(c.wait().await.unwrap().success);
}

#[tokio::test]
async fn worker_error_reply_surfaces_as_is_without_retry() {
    let pool = WorkerPool::new(PoolConfig::default());
    let (pipes, worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
    let worker = ToolWorker::new(vec![], 1).tool(
        "fussy",
        FnToolHandler::new(|_| async {
            Err(WorkerErrorBody::new("EXECUTION_ERROR", "bad arguments")
                .with_details(json!({ "field": "code" })))
        }),
    );
    tokio::spawn(worker.serve(worker_end.lines_in, worker_end.lines_out));
    pool.register_worker("w-fussy", pipes).await.unwrap();
    wait_for_ready(&pool, 1).await;

    let result = pool
        .execute_task("fussy", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.code, "EXECUTION_ERROR");
    assert_eq!(error.details.unwrap()["field"], "code");

    let metrics = pool.metrics().await;
    assert_eq!(metrics.total_tasks, 1, "application errors are not retried");
    assert_eq!(metrics.failed_tasks, 1);
}

#[tokio::test]
async fn shutdown_rejects_queued_tasks_and_new_submissions() {
    let pool = WorkerPool::new(PoolConfig {
        shutdown_grace_ms: 100,
        ..Default::default()
    });
    let queued = pool
        .submit("never", json!({}), ExecuteOptions::default())
        .await
        .unwrap();

    pool.shutdown().await;

    let err = queued.wait().await.unwrap_err();
    assert!(matches!(err, PoolError::ShuttingDown));

    let err = pool
        .submit("never", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ShuttingDown));
}

#[tokio::test]
async fn unregister_worker_drains_gracefully() {
    let pool = WorkerPool::new(PoolConfig::default());
    register_echo_worker(&pool, "w-leaving", &["ping"]).await;

    pool.unregister_worker("w-leaving").await.unwrap();
    for _ in 0..200 {
        if pool.workers().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("worker was not removed after graceful shutdown");
}
