// Event bus with per-subscriber backpressure strategies.
//
// Publishing fans out over a broadcast channel; each subscription runs a
// forwarder task that applies its strategy before events reach the
// subscriber's bounded channel. A slow subscriber therefore only affects
// its own delivery, never the producer or its peers.

use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::EventRecord;

/// How a subscription behaves when the subscriber is slower than the
/// producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Queue up to `capacity` events; the forwarder waits for the
    /// subscriber once the queue is full.
    Buffer { capacity: usize },
    /// Queue up to `capacity` events; further events are discarded until
    /// the subscriber catches up.
    Drop { capacity: usize },
    /// Deliver at most one event per interval; intermediate events are
    /// discarded.
    Throttle { min_interval: Duration },
}

/// Receiving end of a subscription.
pub struct EventSubscription {
    rx: mpsc::Receiver<EventRecord>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventRecord> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<EventRecord> {
        let mut drained = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Fan-out bus for tool-to-tool composition.
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(fanout_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(fanout_capacity.max(1));
        Self { tx }
    }

    /// Publish an event to every live subscription. Publishing never
    /// blocks; with no subscribers the event is simply discarded.
    pub fn publish(&self, event: EventRecord) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Open a subscription with the given backpressure strategy.
    pub fn subscribe(&self, strategy: BackpressureStrategy) -> EventSubscription {
        let mut upstream = self.tx.subscribe();
        let capacity = match strategy {
            BackpressureStrategy::Buffer { capacity } | BackpressureStrategy::Drop { capacity } => {
                capacity.max(1)
            }
            BackpressureStrategy::Throttle { .. } => 1,
        };
        let (tx, rx) = mpsc::channel(capacity);

        tokio::spawn(async move {
            let mut last_forward: Option<Instant> = None;
            loop {
                let event = match upstream.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subscriber lagged behind the bus fan-out");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match strategy {
                    BackpressureStrategy::Buffer { .. } => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    BackpressureStrategy::Drop { .. } => {
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(event) {
                            break;
                        }
                    }
                    BackpressureStrategy::Throttle { min_interval } => {
                        let due = last_forward
                            .map(|at| at.elapsed() >= min_interval)
                            .unwrap_or(true);
                        if !due {
                            continue;
                        }
                        match tx.try_send(event) {
                            Ok(()) => last_forward = Some(Instant::now()),
                            Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
            debug!("bus forwarder stopped");
        });

        EventSubscription { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn event(i: i64) -> EventRecord {
        EventRecord {
            id: Uuid::now_v7().to_string(),
            entity_id: "workflow:test".to_string(),
            event_type: "bus.test".to_string(),
            payload: json!({ "i": i }),
            timestamp: i,
            version: i,
        }
    }

    #[tokio::test]
    async fn test_buffer_delivers_everything_in_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(BackpressureStrategy::Buffer { capacity: 4 });
        tokio::time::sleep(Duration::from_millis(10)).await;

        for i in 0..20 {
            bus.publish(event(i));
        }
        let mut received = Vec::new();
        for _ in 0..20 {
            received.push(sub.recv().await.unwrap().payload["i"].as_i64().unwrap());
        }
        assert_eq!(received, (0..20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_drop_discards_overflow() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(BackpressureStrategy::Drop { capacity: 3 });
        tokio::time::sleep(Duration::from_millis(10)).await;

        for i in 0..50 {
            bus.publish(event(i));
        }
        // Give the forwarder time to process the burst without the
        // subscriber consuming anything.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let drained = sub.drain();
        assert!(!drained.is_empty());
        assert!(drained.len() <= 3, "drop strategy must bound the queue");
        // Oldest events win under drop.
        assert_eq!(drained[0].payload["i"], 0);
    }

    #[tokio::test]
    async fn test_throttle_limits_delivery_rate() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(BackpressureStrategy::Throttle {
            min_interval: Duration::from_millis(200),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        for i in 0..10 {
            bus.publish(event(i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let burst = sub.drain();
        assert_eq!(burst.len(), 1, "only the first event of a burst passes");
        assert_eq!(burst[0].payload["i"], 0);

        tokio::time::sleep(Duration::from_millis(220)).await;
        bus.publish(event(99));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = sub.drain();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].payload["i"], 99);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_peers() {
        let bus = EventBus::default();
        let _stuck = bus.subscribe(BackpressureStrategy::Buffer { capacity: 1 });
        let mut healthy = bus.subscribe(BackpressureStrategy::Buffer { capacity: 64 });
        tokio::time::sleep(Duration::from_millis(10)).await;

        for i in 0..30 {
            bus.publish(event(i));
        }
        let mut received = 0;
        for _ in 0..30 {
            if healthy.recv().await.is_some() {
                received += 1;
            }
        }
        assert_eq!(received, 30);
    }
}
