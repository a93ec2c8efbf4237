// Dead-letter queue for operations that exhausted their retries.
//
// Entries live in memory; the durable trace is the pair of `dlq.added` /
// `dlq.removed` events appended to the originating entity's log.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use toolsmith_core::error::{retry_with_policy, RetryPolicy};

use crate::store::EventStore;
use crate::{now_ms, EntityId, EventResult};

/// An operation parked for manual resolution.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub entity_id: String,
    pub operation: String,
    pub error_message: String,
    pub attempts: u32,
    pub payload: Value,
    pub created_at: i64,
}

/// Report returned by [`DeadLetterQueue::run`].
#[derive(Debug)]
pub struct DlqRunReport<T> {
    pub result: Result<T, String>,
    pub attempts: u32,
    /// Set when the terminal failure was parked in the dead-letter table
    pub dead_letter_id: Option<Uuid>,
}

impl<T> DlqRunReport<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// In-memory dead-letter table with an event-log audit trail.
pub struct DeadLetterQueue {
    store: Arc<dyn EventStore>,
    entries: RwLock<HashMap<Uuid, DeadLetterEntry>>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Park a failed operation and append `dlq.added` to the entity's log.
    pub async fn add(
        &self,
        entity_id: &EntityId,
        operation: &str,
        error_message: &str,
        attempts: u32,
        payload: Value,
    ) -> EventResult<DeadLetterEntry> {
        let entry = DeadLetterEntry {
            id: Uuid::now_v7(),
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            error_message: error_message.to_string(),
            attempts,
            payload,
            created_at: now_ms(),
        };
        self.store
            .append(
                entity_id,
                "dlq.added",
                json!({
                    "dead_letter_id": entry.id,
                    "operation": entry.operation,
                    "error": entry.error_message,
                    "attempts": entry.attempts,
                }),
            )
            .await?;
        warn!(
            dead_letter_id = %entry.id,
            operation = %entry.operation,
            attempts = entry.attempts,
            "operation parked in dead-letter queue"
        );
        self.entries.write().await.insert(entry.id, entry.clone());
        Ok(entry)
    }

    /// Remove an entry after manual resolution; appends `dlq.removed`.
    /// Returns `false` when the id is unknown.
    pub async fn resolve(&self, id: Uuid) -> EventResult<bool> {
        let removed = self.entries.write().await.remove(&id);
        match removed {
            Some(entry) => {
                let entity_id: EntityId = entry.entity_id.parse()?;
                self.store
                    .append(
                        &entity_id,
                        "dlq.removed",
                        json!({
                            "dead_letter_id": entry.id,
                            "operation": entry.operation,
                        }),
                    )
                    .await?;
                info!(dead_letter_id = %id, "dead-letter entry resolved");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<DeadLetterEntry> {
        self.entries.read().await.get(&id).cloned()
    }

    /// All entries, oldest first.
    pub async fn list(&self) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<DeadLetterEntry> =
            self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        entries
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Run `operation` under `policy`; a terminal failure deposits a
    /// dead-letter entry carrying `payload`.
    pub async fn run<T, E, F, Fut>(
        &self,
        entity_id: &EntityId,
        operation: &str,
        policy: &RetryPolicy,
        payload: Value,
        f: F,
    ) -> EventResult<DlqRunReport<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let outcome = retry_with_policy(policy, operation, f).await;
        match outcome.result {
            Ok(value) => Ok(DlqRunReport {
                result: Ok(value),
                attempts: outcome.attempts,
                dead_letter_id: None,
            }),
            Err(err) => {
                let message = err.to_string();
                let entry = self
                    .add(entity_id, operation, &message, outcome.attempts, payload)
                    .await?;
                Ok(DlqRunReport {
                    result: Err(message),
                    attempts: outcome.attempts,
                    dead_letter_id: Some(entry.id),
                })
            }
        }
    }
}
