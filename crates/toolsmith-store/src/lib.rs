//! # Toolsmith Store
//!
//! Durable, append-only event log with snapshots and state reconstruction,
//! a tamper-evident Merkle integrity chain over sealed event batches, a
//! saga engine with reverse-order compensation and crash recovery, an
//! in-memory dead-letter queue, and an event bus with per-subscriber
//! backpressure strategies.
//!
//! The store exclusively owns all persisted tables; other components only
//! hold short-lived read views obtained through [`EventStore`] operations.

pub mod bus;
pub mod dlq;
pub mod integrity;
pub mod saga;
pub mod schema;
pub mod store;

pub use bus::{BackpressureStrategy, EventBus, EventSubscription};
pub use dlq::{DeadLetterEntry, DeadLetterQueue, DlqRunReport};
pub use integrity::{IntegrityChain, VerifyReport};
pub use saga::{
    FnSagaStep, SagaCursor, SagaDefinition, SagaEngine, SagaOutcome, SagaRecovery, SagaStep,
    SagaStepError, StepRegistry,
};
pub use store::{reconstruct, EventStore, EventStoreConfig, SqliteEventStore};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result type for event store operations
pub type EventResult<T> = Result<T, EventError>;

/// Error types for event store operations
#[derive(Debug, thiserror::Error, Clone)]
pub enum EventError {
    #[error("Storage error: {message}")]
    DatabaseError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Concurrency conflict: {message}")]
    ConcurrencyError { message: String },

    #[error("Invalid entity id: {message}")]
    InvalidEntityId { message: String },

    #[error("Invalid version: expected at most {expected}, got {actual}")]
    InvalidVersion { expected: i64, actual: i64 },

    #[error("Integrity chain broken at block {block_id}: {message}")]
    IntegrityChainBroken { block_id: String, message: String },

    #[error("Saga error: {message}")]
    SagaError { message: String },
}

impl EventError {
    /// Stable error code surfaced at the RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EventError::DatabaseError { .. } => "STORAGE_ERROR",
            EventError::SerializationError { .. } => "SERIALIZATION_ERROR",
            EventError::ConcurrencyError { .. } => "CONCURRENCY_ERROR",
            EventError::InvalidEntityId { .. } => "INVALID_ENTITY_ID",
            EventError::InvalidVersion { .. } => "INVALID_VERSION",
            EventError::IntegrityChainBroken { .. } => "INTEGRITY_CHAIN_BROKEN",
            EventError::SagaError { .. } => "SAGA_ERROR",
        }
    }
}

impl From<diesel::result::Error> for EventError {
    fn from(error: diesel::result::Error) -> Self {
        EventError::DatabaseError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for EventError {
    fn from(error: serde_json::Error) -> Self {
        EventError::SerializationError {
            message: error.to_string(),
        }
    }
}

/// Kind component of an [`EntityId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Task,
    Agent,
    Workspace,
    Workflow,
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Agent => "agent",
            EntityKind::Workspace => "workspace",
            EntityKind::Workflow => "workflow",
            EntityKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for EntityKind {
    fn from(kind: &str) -> Self {
        match kind {
            "task" => EntityKind::Task,
            "agent" => EntityKind::Agent,
            "workspace" => EntityKind::Workspace,
            "workflow" => EntityKind::Workflow,
            other => EntityKind::Other(other.to_string()),
        }
    }
}

/// Durable identity the event log attributes events to, rendered as
/// `kind:uuid` with a time-ordered (v7) UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityId {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            id: Uuid::now_v7(),
        }
    }

    pub fn workflow() -> Self {
        Self::new(EntityKind::Workflow)
    }

    pub fn task() -> Self {
        Self::new(EntityKind::Task)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for EntityId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or_else(|| EventError::InvalidEntityId {
            message: format!("expected kind:uuid, got {s:?}"),
        })?;
        if kind.is_empty() {
            return Err(EventError::InvalidEntityId {
                message: "empty entity kind".to_string(),
            });
        }
        let id = Uuid::parse_str(id).map_err(|e| EventError::InvalidEntityId {
            message: format!("bad uuid in {s:?}: {e}"),
        })?;
        Ok(Self {
            kind: EntityKind::from(kind),
            id,
        })
    }
}

impl TryFrom<String> for EntityId {
    type Error = EventError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_string()
    }
}

/// One immutable record in the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Time-ordered UUID (v7), lexicographically sortable
    pub id: String,
    pub entity_id: String,
    /// Dotted event type such as `saga.step_completed`
    pub event_type: String,
    /// Opaque payload, preserved verbatim
    pub payload: serde_json::Value,
    /// Millisecond epoch
    pub timestamp: i64,
    /// Monotonic per-entity counter starting at 1
    pub version: i64,
}

/// Materialized view of an entity's state at a specific version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: String,
    pub state: serde_json::Value,
    pub version: i64,
    pub created_at: i64,
}

/// Live status of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    Running,
    Compensating,
    Completed,
    Failed,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> EventResult<Self> {
        match s {
            "running" => Ok(SagaStatus::Running),
            "compensating" => Ok(SagaStatus::Compensating),
            "completed" => Ok(SagaStatus::Completed),
            "failed" => Ok(SagaStatus::Failed),
            other => Err(EventError::SagaError {
                message: format!("unknown saga status {other:?}"),
            }),
        }
    }
}

/// Live saga progress row; the event log remains authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStateRecord {
    pub saga_id: String,
    pub entity_id: String,
    pub status: SagaStatus,
    pub current_step: i64,
    pub total_steps: i64,
    pub input: serde_json::Value,
    /// Names of completed-and-not-yet-compensated steps, in execution order
    pub completed_steps: Vec<String>,
    /// Per-step result or error, in execution order
    pub results: Vec<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A sealed batch of events with a Merkle root, hash-linked to its
/// predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityBlock {
    pub id: String,
    /// `None` for the genesis block
    pub previous_block_hash: Option<String>,
    pub merkle_root: String,
    pub start_event_id: String,
    pub end_event_id: String,
    pub event_count: i64,
    pub created_at: i64,
}

/// Millisecond epoch for "now"; the single wall-clock read point in this
/// crate (workflow logic uses the deterministic context instead).
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_round_trip() {
        let id = EntityId::new(EntityKind::Workflow);
        let rendered = id.to_string();
        assert!(rendered.starts_with("workflow:"));
        let parsed: EntityId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_entity_id_rejects_malformed() {
        assert!("no-colon".parse::<EntityId>().is_err());
        assert!(":deadbeef".parse::<EntityId>().is_err());
        assert!("task:not-a-uuid".parse::<EntityId>().is_err());
    }

    #[test]
    fn test_entity_id_custom_kind() {
        let raw = format!("session:{}", Uuid::now_v7());
        let parsed: EntityId = raw.parse().unwrap();
        assert_eq!(parsed.kind, EntityKind::Other("session".to_string()));
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn test_entity_ids_are_time_ordered() {
        let a = EntityId::new(EntityKind::Task);
        let b = EntityId::new(EntityKind::Task);
        assert!(a.id.to_string() <= b.id.to_string());
    }

    #[test]
    fn test_saga_status_parse() {
        assert_eq!(SagaStatus::parse("running").unwrap(), SagaStatus::Running);
        assert!(SagaStatus::parse("paused").is_err());
    }

    #[test]
    fn test_error_codes() {
        let err = EventError::DatabaseError {
            message: "disk full".to_string(),
        };
        assert_eq!(err.code(), "STORAGE_ERROR");
        let err = EventError::IntegrityChainBroken {
            block_id: "b1".to_string(),
            message: "root mismatch".to_string(),
        };
        assert_eq!(err.code(), "INTEGRITY_CHAIN_BROKEN");
    }
}
