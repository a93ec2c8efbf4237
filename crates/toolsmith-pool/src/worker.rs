// Coordinator-side view of a worker: its advertised info and the
// connection that routes protocol replies back to waiting tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::pool::{PoolError, PoolResult};
use crate::protocol::{decode_line, encode_line, WorkerCapabilities, WorkerReply, WorkerRequest};
use crate::transport::{TransportEvent, TransportPipes};

pub type WorkerId = String;

/// Worker lifecycle: `Starting -> Ready <-> Busy -> Crashed`; `Crashed` is
/// terminal for the worker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Crashed,
}

/// Registry entry describing a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub active_tasks: usize,
    pub last_ping_ms: i64,
}

impl WorkerInfo {
    /// Active tasks over declared concurrency; 1.0 means saturated.
    pub fn current_load(&self) -> f64 {
        self.active_tasks as f64 / self.capabilities.max_concurrent.max(1) as f64
    }
}

/// Lifecycle notifications a connection reports to the pool supervisor.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Registered {
        worker_id: WorkerId,
        capabilities: WorkerCapabilities,
    },
    Failed {
        worker_id: WorkerId,
        reason: String,
    },
    Closed {
        worker_id: WorkerId,
    },
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<WorkerReply>>>>;

/// Request/reply plumbing over one worker's transport.
#[derive(Clone)]
pub(crate) struct WorkerConnection {
    worker_id: WorkerId,
    outgoing: mpsc::Sender<String>,
    pending: PendingMap,
    max_chars: usize,
}

impl WorkerConnection {
    /// Wire a transport into the pool: spawns the router task that resolves
    /// pending requests and reports lifecycle events.
    pub fn start(
        worker_id: WorkerId,
        pipes: TransportPipes,
        events: mpsc::Sender<WorkerEvent>,
        max_chars: usize,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connection = Self {
            worker_id: worker_id.clone(),
            outgoing: pipes.outgoing,
            pending: Arc::clone(&pending),
            max_chars,
        };

        let mut incoming = pipes.incoming;
        tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                match event {
                    TransportEvent::Line(line) => {
                        match decode_line::<WorkerReply>(&line, max_chars) {
                            Ok(WorkerReply::Register { capabilities, .. }) => {
                                let _ = events
                                    .send(WorkerEvent::Registered {
                                        worker_id: worker_id.clone(),
                                        capabilities,
                                    })
                                    .await;
                            }
                            Ok(reply) => {
                                let waiter = reply
                                    .id()
                                    .and_then(|id| pending.lock().ok()?.remove(id));
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(reply);
                                    }
                                    None => {
                                        debug!(worker_id = %worker_id, "reply without a waiter, dropping");
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(worker_id = %worker_id, error = %err, "malformed worker message");
                                let _ = events
                                    .send(WorkerEvent::Failed {
                                        worker_id: worker_id.clone(),
                                        reason: format!("malformed message: {err}"),
                                    })
                                    .await;
                                break;
                            }
                        }
                    }
                    TransportEvent::Oversize { len } => {
                        let _ = events
                            .send(WorkerEvent::Failed {
                                worker_id: worker_id.clone(),
                                reason: format!("message of {len} chars exceeds limit"),
                            })
                            .await;
                        break;
                    }
                    TransportEvent::Closed { reason } => {
                        debug!(worker_id = %worker_id, reason = %reason, "worker transport closed");
                        let _ = events
                            .send(WorkerEvent::Closed {
                                worker_id: worker_id.clone(),
                            })
                            .await;
                        break;
                    }
                }
            }
            // Dropping the pending map wakes every in-flight waiter with a
            // receive error; the pool requeues those tasks.
            if let Ok(mut pending) = pending.lock() {
                pending.clear();
            }
        });

        connection
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Send a request that expects a reply; the returned receiver resolves
    /// when the worker answers or errors when the connection dies first.
    pub async fn request(
        &self,
        request: &WorkerRequest,
    ) -> PoolResult<oneshot::Receiver<WorkerReply>> {
        let id = request
            .id()
            .ok_or_else(|| PoolError::Internal {
                message: "request kind carries no id".to_string(),
            })?
            .to_string();
        let line = encode_line(request, self.max_chars)?;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), tx);
        }
        if self.outgoing.send(line).await.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(PoolError::Internal {
                message: format!("worker {} transport closed", self.worker_id),
            });
        }
        Ok(rx)
    }

    /// Fire-and-forget notification (shutdown).
    pub async fn notify(&self, request: &WorkerRequest) -> PoolResult<()> {
        let line = encode_line(request, self.max_chars)?;
        self.outgoing
            .send(line)
            .await
            .map_err(|_| PoolError::Internal {
                message: format!("worker {} transport closed", self.worker_id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_MESSAGE_CHARS;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_reaches_supervisor() {
        let (pipes, worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let _conn = WorkerConnection::start(
            "w1".to_string(),
            pipes,
            events_tx,
            DEFAULT_MAX_MESSAGE_CHARS,
        );

        let register = WorkerReply::Register {
            capabilities: WorkerCapabilities {
                tools: vec!["parse".to_string()],
                languages: vec!["javascript".to_string()],
                max_concurrent: 1,
            },
            resources: Default::default(),
        };
        worker_end
            .lines_out
            .send(encode_line(&register, DEFAULT_MAX_MESSAGE_CHARS).unwrap())
            .await
            .unwrap();

        match events_rx.recv().await.unwrap() {
            WorkerEvent::Registered { worker_id, capabilities } => {
                assert_eq!(worker_id, "w1");
                assert_eq!(capabilities.tools, vec!["parse"]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_resolves_with_matching_reply() {
        let (pipes, mut worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let conn = WorkerConnection::start(
            "w1".to_string(),
            pipes,
            events_tx,
            DEFAULT_MAX_MESSAGE_CHARS,
        );

        let request = WorkerRequest::Ping {
            id: "p-1".to_string(),
            timestamp: 123,
        };
        let rx = conn.request(&request).await.unwrap();

        // The worker side sees the encoded request and answers it.
        let line = worker_end.lines_in.recv().await.unwrap();
        let seen: WorkerRequest = decode_line(&line, DEFAULT_MAX_MESSAGE_CHARS).unwrap();
        assert!(matches!(seen, WorkerRequest::Ping { .. }));
        let pong = WorkerReply::Pong {
            id: "p-1".to_string(),
            timestamp: 124,
        };
        worker_end
            .lines_out
            .send(encode_line(&pong, DEFAULT_MAX_MESSAGE_CHARS).unwrap())
            .await
            .unwrap();

        match rx.await.unwrap() {
            WorkerReply::Pong { id, timestamp } => {
                assert_eq!(id, "p-1");
                assert_eq!(timestamp, 124);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_transport_fails_pending_waiters() {
        let (pipes, worker_end) = ChannelTransport::pair(DEFAULT_MAX_MESSAGE_CHARS);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let conn = WorkerConnection::start(
            "w1".to_string(),
            pipes,
            events_tx,
            DEFAULT_MAX_MESSAGE_CHARS,
        );

        let rx = conn
            .request(&WorkerRequest::Execute {
                id: "t-1".to_string(),
                tool: "parse".to_string(),
                params: json!({}),
                timeout_ms: 1000,
                priority: Default::default(),
            })
            .await
            .unwrap();

        drop(worker_end.lines_out);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            WorkerEvent::Closed { .. }
        ));
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_current_load() {
        let info = WorkerInfo {
            id: "w".to_string(),
            capabilities: WorkerCapabilities {
                tools: vec![],
                languages: vec![],
                max_concurrent: 4,
            },
            status: WorkerStatus::Ready,
            active_tasks: 3,
            last_ping_ms: 0,
        };
        assert!((info.current_load() - 0.75).abs() < f64::EPSILON);
    }
}
