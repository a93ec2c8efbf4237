// Worker transports.
//
// A transport reduces to a pair of line streams: an outgoing sender the
// coordinator writes requests into, and an incoming receiver of transport
// events (lines, the oversize guard tripping, or the channel closing).
// `StdioTransport` runs a child process over piped stdio; `ChannelTransport`
// pairs a coordinator with an in-process worker, used by tests and by
// embedded workers.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One observation from a worker's transport.
#[derive(Debug)]
pub enum TransportEvent {
    Line(String),
    /// A line exceeded the limit; the coordinator treats this as fatal.
    Oversize { len: usize },
    Closed { reason: String },
}

/// Coordinator-side handle on a worker transport.
pub struct TransportPipes {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Worker-side line streams of a [`ChannelTransport`] pair.
pub struct ChannelWorkerEnd {
    pub lines_in: mpsc::Receiver<String>,
    pub lines_out: mpsc::Sender<String>,
}

/// In-process transport connecting a coordinator to an embedded worker.
pub struct ChannelTransport;

impl ChannelTransport {
    pub fn pair(max_chars: usize) -> (TransportPipes, ChannelWorkerEnd) {
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(64);
        let (worker_in_tx, worker_in_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);
        let (worker_out_tx, mut worker_out_rx) = mpsc::channel::<String>(64);

        // Coordinator -> worker.
        tokio::spawn(async move {
            while let Some(line) = outgoing_rx.recv().await {
                if worker_in_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        // Worker -> coordinator, with the line-size guard.
        tokio::spawn(async move {
            while let Some(line) = worker_out_rx.recv().await {
                if line.len() > max_chars {
                    let _ = event_tx.send(TransportEvent::Oversize { len: line.len() }).await;
                    break;
                }
                if event_tx.send(TransportEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            let _ = event_tx
                .send(TransportEvent::Closed {
                    reason: "worker channel closed".to_string(),
                })
                .await;
        });

        (
            TransportPipes {
                outgoing: outgoing_tx,
                incoming: event_rx,
            },
            ChannelWorkerEnd {
                lines_in: worker_in_rx,
                lines_out: worker_out_tx,
            },
        )
    }
}

/// Handle on a spawned worker process; dropping it kills the child.
pub struct StdioHandle {
    child: Child,
}

impl StdioHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Force-terminate the worker process.
    pub fn kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "worker process already gone");
        }
    }
}

/// Stdio transport over a long-lived child process.
pub struct StdioTransport;

impl StdioTransport {
    /// Spawn `command args...` with piped stdio and wire its stdin/stdout
    /// into a transport pair.
    pub fn spawn(
        command: &str,
        args: &[String],
        max_chars: usize,
    ) -> std::io::Result<(TransportPipes, StdioHandle)> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdout unavailable")
        })?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);

        // Writer: one `\n`-terminated UTF-8 line per message.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = outgoing_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader: lines from the worker, guarded by the size limit.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.len() > max_chars {
                            warn!(len = line.len(), max = max_chars, "oversize worker line");
                            let _ = event_tx
                                .send(TransportEvent::Oversize { len: line.len() })
                                .await;
                            break;
                        }
                        if event_tx.send(TransportEvent::Line(line)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: "worker stdout closed".to_string(),
                            })
                            .await;
                        return;
                    }
                    Err(err) => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: format!("worker stdout error: {err}"),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = event_tx
                .send(TransportEvent::Closed {
                    reason: "worker transport aborted".to_string(),
                })
                .await;
        });

        Ok((
            TransportPipes {
                outgoing: outgoing_tx,
                incoming: event_rx,
            },
            StdioHandle { child },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_passes_lines_both_ways() {
        let (mut pipes, mut worker) = ChannelTransport::pair(1024);

        pipes.outgoing.send("to-worker".to_string()).await.unwrap();
        assert_eq!(worker.lines_in.recv().await.unwrap(), "to-worker");

        worker.lines_out.send("to-pool".to_string()).await.unwrap();
        match pipes.incoming.recv().await.unwrap() {
            TransportEvent::Line(line) => assert_eq!(line, "to-pool"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_pair_flags_oversize_lines() {
        let (mut pipes, worker) = ChannelTransport::pair(8);
        worker.lines_out.send("x".repeat(100)).await.unwrap();
        match pipes.incoming.recv().await.unwrap() {
            TransportEvent::Oversize { len } => assert_eq!(len, 100),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_pair_reports_close() {
        let (mut pipes, worker) = ChannelTransport::pair(1024);
        drop(worker.lines_out);
        match pipes.incoming.recv().await.unwrap() {
            TransportEvent::Closed { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
