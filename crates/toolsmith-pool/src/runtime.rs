// Worker-side runtime: serves the line-delimited protocol over any pair of
// line streams (stdio for out-of-process workers, channels for embedded
// ones). Registers on start, executes tools through `ToolHandler` trait
// objects up to the declared concurrency, answers pings, and honors
// graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::protocol::{
    decode_line, encode_line, WorkerCapabilities, WorkerErrorBody, WorkerReply, WorkerRequest,
    DEFAULT_MAX_MESSAGE_CHARS,
};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One tool implementation served by a worker.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value, WorkerErrorBody>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<Value, WorkerErrorBody>> + Send>>;

/// Closure-backed handler for composition roots and tests.
pub struct FnToolHandler {
    f: Arc<dyn Fn(Value) -> BoxedHandlerFuture + Send + Sync>,
}

impl FnToolHandler {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkerErrorBody>> + Send + 'static,
    {
        Arc::new(Self {
            f: Arc::new(move |params| Box::pin(f(params))),
        })
    }
}

#[async_trait]
impl ToolHandler for FnToolHandler {
    async fn handle(&self, params: Value) -> Result<Value, WorkerErrorBody> {
        (self.f)(params).await
    }
}

/// A long-lived worker serving one tool family.
pub struct ToolWorker {
    capabilities: WorkerCapabilities,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    max_message_chars: usize,
}

impl ToolWorker {
    pub fn new(languages: Vec<String>, max_concurrent: u32) -> Self {
        Self {
            capabilities: WorkerCapabilities {
                tools: Vec::new(),
                languages,
                max_concurrent: max_concurrent.max(1),
            },
            handlers: HashMap::new(),
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }

    pub fn with_max_message_chars(mut self, max_chars: usize) -> Self {
        self.max_message_chars = max_chars;
        self
    }

    /// Register a tool; its name becomes part of the advertised capability
    /// set, matched verbatim by the coordinator.
    pub fn tool(mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        let name = name.into();
        self.capabilities.tools.push(name.clone());
        self.handlers.insert(name, handler);
        self
    }

    /// Serve the protocol until the input stream ends or a shutdown
    /// request arrives.
    pub async fn serve(
        self,
        mut lines_in: mpsc::Receiver<String>,
        lines_out: mpsc::Sender<String>,
    ) {
        let max_chars = self.max_message_chars;
        let register = WorkerReply::Register {
            capabilities: self.capabilities.clone(),
            resources: Default::default(),
        };
        match encode_line(&register, max_chars) {
            Ok(line) => {
                if lines_out.send(line).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "could not encode register message");
                return;
            }
        }
        info!(tools = ?self.capabilities.tools, "worker serving");

        let handlers = Arc::new(self.handlers);
        let max_concurrent = self.capabilities.max_concurrent.max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        while let Some(line) = lines_in.recv().await {
            match decode_line::<WorkerRequest>(&line, max_chars) {
                Ok(WorkerRequest::Execute {
                    id, tool, params, ..
                }) => {
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break;
                    };
                    let handler = handlers.get(&tool).cloned();
                    let out = lines_out.clone();
                    tokio::spawn(async move {
                        let reply = match handler {
                            Some(handler) => match handler.handle(params).await {
                                Ok(result) => WorkerReply::Success { id, result },
                                Err(error) => WorkerReply::Error { id, error },
                            },
                            None => WorkerReply::Error {
                                id,
                                error: WorkerErrorBody::new(
                                    "UNKNOWN_TOOL",
                                    format!("no handler for tool {tool:?}"),
                                ),
                            },
                        };
                        let line = match encode_line(&reply, max_chars) {
                            Ok(line) => line,
                            Err(_) => {
                                // The result itself blew the line limit;
                                // report that instead of crashing the pipe.
                                let fallback = WorkerReply::Error {
                                    id: reply.id().unwrap_or_default().to_string(),
                                    error: WorkerErrorBody::new(
                                        "WORKER_MESSAGE_TOO_LARGE",
                                        "tool result exceeded the message size limit",
                                    ),
                                };
                                match encode_line(&fallback, max_chars) {
                                    Ok(line) => line,
                                    Err(_) => return,
                                }
                            }
                        };
                        let _ = out.send(line).await;
                        drop(permit);
                    });
                }
                Ok(WorkerRequest::Ping { id, .. }) => {
                    let pong = WorkerReply::Pong {
                        id,
                        timestamp: now_ms(),
                    };
                    if let Ok(line) = encode_line(&pong, max_chars) {
                        if lines_out.send(line).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(WorkerRequest::Shutdown { graceful, .. }) => {
                    debug!(graceful, "worker shutting down");
                    if graceful {
                        // Wait for in-flight executions to release their
                        // permits before closing the pipe.
                        let _ = semaphore.acquire_many(max_concurrent as u32).await;
                    }
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "ignoring malformed request line");
                }
            }
        }
    }

    /// Serve over this process's stdin/stdout.
    pub async fn serve_stdio(self) {
        let (in_tx, in_rx) = mpsc::channel::<String>(64);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if in_tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = out_rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        self.serve(in_rx, out_tx).await;
    }
}
