// SQLite-backed event store with a buffered write path.
//
// Writes go through a small in-memory buffer flushed as one atomic
// transaction when it reaches `flush_max_events` entries or after
// `flush_idle_ms` of append inactivity. Read paths flush first so a caller
// always observes its own appends. The store holds a single connection
// behind a mutex: it is the single logical writer for every table it owns.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use toolsmith_core::canonical_json;

use crate::schema::{events, integrity_blocks, saga_state, snapshots};
use crate::{
    now_ms, EntityId, EventError, EventRecord, EventResult, IntegrityBlock, SagaStateRecord,
    SagaStatus, Snapshot,
};

/// Configuration for the event store.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// SQLite database path, or `:memory:`
    pub database_path: String,
    /// Flush the write buffer once it holds this many events
    pub flush_max_events: usize,
    /// Flush the write buffer after this much append inactivity
    pub flush_idle_ms: u64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            flush_max_events: 100,
            flush_idle_ms: 50,
        }
    }
}

impl EventStoreConfig {
    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            database_path: path.into(),
            ..Default::default()
        }
    }
}

/// Event store interface for persisting and retrieving events.
///
/// All persisted tables (events, snapshots, saga state, integrity blocks)
/// are owned by implementations of this trait.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event with an explicit millisecond timestamp.
    async fn append_with_timestamp(
        &self,
        entity_id: &EntityId,
        event_type: &str,
        payload: Value,
        timestamp: i64,
    ) -> EventResult<EventRecord>;

    /// Append an event stamped with the current wall clock.
    async fn append(
        &self,
        entity_id: &EntityId,
        event_type: &str,
        payload: Value,
    ) -> EventResult<EventRecord> {
        let timestamp = now_ms();
        self.append_with_timestamp(entity_id, event_type, payload, timestamp)
            .await
    }

    /// All events for an entity in ascending version order.
    async fn load_events(&self, entity_id: &EntityId) -> EventResult<Vec<EventRecord>>;

    /// Events for an entity with version strictly greater than `version`.
    async fn load_events_after(
        &self,
        entity_id: &EntityId,
        version: i64,
    ) -> EventResult<Vec<EventRecord>>;

    /// Current max version for an entity, buffer included; 0 means no events.
    async fn current_version(&self, entity_id: &EntityId) -> EventResult<i64>;

    /// Upsert the entity's snapshot (latest wins).
    async fn save_snapshot(
        &self,
        entity_id: &EntityId,
        state: Value,
        version: i64,
    ) -> EventResult<()>;

    async fn load_snapshot(&self, entity_id: &EntityId) -> EventResult<Option<Snapshot>>;

    async fn save_saga_state(&self, state: &SagaStateRecord) -> EventResult<()>;

    async fn load_saga_state(&self, saga_id: &str) -> EventResult<Option<SagaStateRecord>>;

    /// Sagas left `running` or `compensating`, ordered by creation time.
    async fn load_incomplete_sagas(&self) -> EventResult<Vec<SagaStateRecord>>;

    async fn delete_saga_state(&self, saga_id: &str) -> EventResult<()>;

    /// Force the write buffer out to storage.
    async fn flush(&self) -> EventResult<()>;

    /// Events with id strictly greater than `after_id` (all events when
    /// `None`), ascending by id, at most `limit`.
    async fn load_events_after_id(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> EventResult<Vec<EventRecord>>;

    /// Events with `start_id <= id <= end_id`, ascending by id.
    async fn load_events_in_id_range(
        &self,
        start_id: &str,
        end_id: &str,
    ) -> EventResult<Vec<EventRecord>>;

    async fn count_events(&self) -> EventResult<i64>;

    async fn insert_integrity_block(&self, block: &IntegrityBlock) -> EventResult<()>;

    /// All sealed blocks in ascending `created_at` order.
    async fn load_integrity_blocks(&self) -> EventResult<Vec<IntegrityBlock>>;

    async fn latest_integrity_block(&self) -> EventResult<Option<IntegrityBlock>>;
}

/// Reconstruct an entity's state by folding a pure reducer over its events,
/// starting from the latest snapshot when one exists.
pub async fn reconstruct<S, F>(
    store: &dyn EventStore,
    entity_id: &EntityId,
    initial: S,
    reducer: F,
) -> EventResult<S>
where
    S: serde::de::DeserializeOwned + Send,
    F: Fn(S, &EventRecord) -> S + Send,
{
    let (mut state, from_version) = match store.load_snapshot(entity_id).await? {
        Some(snapshot) => (serde_json::from_value(snapshot.state)?, snapshot.version),
        None => (initial, 0),
    };
    for event in store.load_events_after(entity_id, from_version).await? {
        state = reducer(state, &event);
    }
    Ok(state)
}

const SCHEMA_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY NOT NULL,
        entity_id TEXT NOT NULL,
        type TEXT NOT NULL,
        payload TEXT NOT NULL,
        timestamp BIGINT NOT NULL,
        version BIGINT NOT NULL,
        UNIQUE(entity_id, version)
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
    "CREATE TABLE IF NOT EXISTS snapshots (
        entity_id TEXT PRIMARY KEY NOT NULL,
        state TEXT NOT NULL,
        version BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS saga_state (
        saga_id TEXT PRIMARY KEY NOT NULL,
        entity_id TEXT NOT NULL,
        status TEXT NOT NULL,
        current_step BIGINT NOT NULL,
        total_steps BIGINT NOT NULL,
        input TEXT NOT NULL,
        completed_steps TEXT NOT NULL,
        results TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_saga_state_entity ON saga_state(entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_saga_state_status ON saga_state(status)",
    "CREATE TABLE IF NOT EXISTS integrity_blocks (
        id TEXT PRIMARY KEY NOT NULL,
        previous_block_hash TEXT,
        merkle_root TEXT NOT NULL,
        start_event_id TEXT NOT NULL,
        end_event_id TEXT NOT NULL,
        event_count BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_integrity_blocks_created ON integrity_blocks(created_at)",
];

#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = events)]
struct EventRow {
    id: String,
    entity_id: String,
    event_type: String,
    payload: String,
    timestamp: i64,
    version: i64,
}

impl EventRow {
    fn from_record(record: &EventRecord) -> Self {
        Self {
            id: record.id.clone(),
            entity_id: record.entity_id.clone(),
            event_type: record.event_type.clone(),
            payload: canonical_json(&record.payload),
            timestamp: record.timestamp,
            version: record.version,
        }
    }

    fn into_record(self) -> EventResult<EventRecord> {
        Ok(EventRecord {
            payload: serde_json::from_str(&self.payload)?,
            id: self.id,
            entity_id: self.entity_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            version: self.version,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = snapshots)]
struct SnapshotRow {
    entity_id: String,
    state: String,
    version: i64,
    created_at: i64,
}

#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = saga_state)]
struct SagaStateRow {
    saga_id: String,
    entity_id: String,
    status: String,
    current_step: i64,
    total_steps: i64,
    input: String,
    completed_steps: String,
    results: String,
    created_at: i64,
    updated_at: i64,
}

impl SagaStateRow {
    fn from_record(record: &SagaStateRecord) -> EventResult<Self> {
        Ok(Self {
            saga_id: record.saga_id.clone(),
            entity_id: record.entity_id.clone(),
            status: record.status.as_str().to_string(),
            current_step: record.current_step,
            total_steps: record.total_steps,
            input: canonical_json(&record.input),
            completed_steps: serde_json::to_string(&record.completed_steps)?,
            results: serde_json::to_string(&record.results)?,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    fn into_record(self) -> EventResult<SagaStateRecord> {
        Ok(SagaStateRecord {
            status: SagaStatus::parse(&self.status)?,
            input: serde_json::from_str(&self.input)?,
            completed_steps: serde_json::from_str(&self.completed_steps)?,
            results: serde_json::from_str(&self.results)?,
            saga_id: self.saga_id,
            entity_id: self.entity_id,
            current_step: self.current_step,
            total_steps: self.total_steps,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = integrity_blocks)]
struct IntegrityBlockRow {
    id: String,
    previous_block_hash: Option<String>,
    merkle_root: String,
    start_event_id: String,
    end_event_id: String,
    event_count: i64,
    created_at: i64,
}

impl IntegrityBlockRow {
    fn from_block(block: &IntegrityBlock) -> Self {
        Self {
            id: block.id.clone(),
            previous_block_hash: block.previous_block_hash.clone(),
            merkle_root: block.merkle_root.clone(),
            start_event_id: block.start_event_id.clone(),
            end_event_id: block.end_event_id.clone(),
            event_count: block.event_count,
            created_at: block.created_at,
        }
    }

    fn into_block(self) -> IntegrityBlock {
        IntegrityBlock {
            id: self.id,
            previous_block_hash: self.previous_block_hash,
            merkle_root: self.merkle_root,
            start_event_id: self.start_event_id,
            end_event_id: self.end_event_id,
            event_count: self.event_count,
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct WriteBuffer {
    events: Vec<EventRecord>,
    /// Highest buffered version per entity, so version assignment accounts
    /// for appends that have not been flushed yet
    pending_versions: HashMap<String, i64>,
    last_append: Option<Instant>,
}

struct StoreInner {
    config: EventStoreConfig,
    conn: Mutex<SqliteConnection>,
    buffer: Mutex<WriteBuffer>,
}

impl StoreInner {
    /// Flush the buffered events inside one transaction. On failure the
    /// events stay buffered; the unique `(entity_id, version)` index rejects
    /// duplicates if a partial write ever retries.
    async fn flush_locked(&self, buffer: &mut WriteBuffer) -> EventResult<()> {
        if buffer.events.is_empty() {
            return Ok(());
        }
        let rows: Vec<EventRow> = buffer.events.iter().map(EventRow::from_record).collect();
        let mut conn = self.conn.lock().await;
        let result = conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(events::table)
                .values(&rows)
                .execute(conn)?;
            Ok(())
        });
        drop(conn);

        match result {
            Ok(()) => {
                debug!(flushed = buffer.events.len(), "flushed event buffer");
                buffer.events.clear();
                buffer.pending_versions.clear();
                buffer.last_append = None;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, buffered = buffer.events.len(), "event buffer flush failed");
                Err(EventError::from(err))
            }
        }
    }

    async fn flush_now(&self) -> EventResult<()> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn db_max_version(&self, entity_key: &str) -> EventResult<i64> {
        let mut conn = self.conn.lock().await;
        let version: Option<i64> = events::table
            .filter(events::entity_id.eq(entity_key))
            .select(diesel::dsl::max(events::version))
            .first(&mut *conn)?;
        Ok(version.unwrap_or(0))
    }
}

/// SQLite implementation of the event store.
#[derive(Clone)]
pub struct SqliteEventStore {
    inner: Arc<StoreInner>,
}

impl SqliteEventStore {
    /// Open (and create if needed) the store at the configured path.
    pub async fn open(config: EventStoreConfig) -> EventResult<Self> {
        let mut conn = SqliteConnection::establish(&config.database_path).map_err(|e| {
            EventError::DatabaseError {
                message: format!("failed to open {}: {}", config.database_path, e),
            }
        })?;

        // WAL only applies to file-backed databases; a failed pragma is not
        // fatal for in-memory stores.
        if config.database_path != ":memory:" {
            if let Err(err) = diesel::sql_query("PRAGMA journal_mode = WAL").execute(&mut conn) {
                warn!(error = %err, "could not enable WAL journal mode");
            }
        }
        diesel::sql_query("PRAGMA busy_timeout = 5000")
            .execute(&mut conn)
            .ok();

        for ddl in SCHEMA_DDL {
            diesel::sql_query(*ddl).execute(&mut conn)?;
        }
        info!(path = %config.database_path, "event store opened");

        let inner = Arc::new(StoreInner {
            config,
            conn: Mutex::new(conn),
            buffer: Mutex::new(WriteBuffer::default()),
        });
        spawn_idle_flusher(&inner);
        Ok(Self { inner })
    }

    /// Flush outstanding writes; call before process exit.
    pub async fn close(&self) -> EventResult<()> {
        self.inner.flush_now().await
    }
}

/// Background task flushing the buffer after append inactivity. Holds only
/// a weak reference so dropping the store stops the task.
fn spawn_idle_flusher(inner: &Arc<StoreInner>) {
    let weak: Weak<StoreInner> = Arc::downgrade(inner);
    let idle = Duration::from_millis(inner.config.flush_idle_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(10));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            let mut buffer = inner.buffer.lock().await;
            let is_idle = buffer
                .last_append
                .map(|at| at.elapsed() >= idle)
                .unwrap_or(false);
            if is_idle && !buffer.events.is_empty() {
                if let Err(err) = inner.flush_locked(&mut buffer).await {
                    error!(error = %err, "idle flush failed; events remain buffered");
                }
            }
        }
    });
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_with_timestamp(
        &self,
        entity_id: &EntityId,
        event_type: &str,
        payload: Value,
        timestamp: i64,
    ) -> EventResult<EventRecord> {
        let entity_key = entity_id.to_string();
        let mut buffer = self.inner.buffer.lock().await;

        let base = match buffer.pending_versions.get(&entity_key) {
            Some(version) => *version,
            None => self.inner.db_max_version(&entity_key).await?,
        };

        let record = EventRecord {
            id: Uuid::now_v7().to_string(),
            entity_id: entity_key.clone(),
            event_type: event_type.to_string(),
            payload,
            timestamp,
            version: base + 1,
        };
        buffer.pending_versions.insert(entity_key, record.version);
        buffer.events.push(record.clone());
        buffer.last_append = Some(Instant::now());

        if buffer.events.len() >= self.inner.config.flush_max_events {
            self.inner.flush_locked(&mut buffer).await?;
        }
        Ok(record)
    }

    async fn load_events(&self, entity_id: &EntityId) -> EventResult<Vec<EventRecord>> {
        self.load_events_after(entity_id, 0).await
    }

    async fn load_events_after(
        &self,
        entity_id: &EntityId,
        version: i64,
    ) -> EventResult<Vec<EventRecord>> {
        self.inner.flush_now().await?;
        let entity_key = entity_id.to_string();
        let mut conn = self.inner.conn.lock().await;
        let rows: Vec<EventRow> = events::table
            .filter(events::entity_id.eq(&entity_key))
            .filter(events::version.gt(version))
            .order(events::version.asc())
            .load(&mut *conn)?;
        rows.into_iter().map(EventRow::into_record).collect()
    }

    async fn current_version(&self, entity_id: &EntityId) -> EventResult<i64> {
        let entity_key = entity_id.to_string();
        let buffer = self.inner.buffer.lock().await;
        if let Some(version) = buffer.pending_versions.get(&entity_key) {
            return Ok(*version);
        }
        drop(buffer);
        self.inner.db_max_version(&entity_key).await
    }

    async fn save_snapshot(
        &self,
        entity_id: &EntityId,
        state: Value,
        version: i64,
    ) -> EventResult<()> {
        let current = self.current_version(entity_id).await?;
        if version > current {
            return Err(EventError::InvalidVersion {
                expected: current,
                actual: version,
            });
        }
        let row = SnapshotRow {
            entity_id: entity_id.to_string(),
            state: canonical_json(&state),
            version,
            created_at: now_ms(),
        };
        let mut conn = self.inner.conn.lock().await;
        diesel::insert_into(snapshots::table)
            .values(&row)
            .on_conflict(snapshots::entity_id)
            .do_update()
            .set((
                snapshots::state.eq(&row.state),
                snapshots::version.eq(row.version),
                snapshots::created_at.eq(row.created_at),
            ))
            .execute(&mut *conn)?;
        Ok(())
    }

    async fn load_snapshot(&self, entity_id: &EntityId) -> EventResult<Option<Snapshot>> {
        let entity_key = entity_id.to_string();
        let mut conn = self.inner.conn.lock().await;
        let row: Option<SnapshotRow> = snapshots::table
            .filter(snapshots::entity_id.eq(&entity_key))
            .first(&mut *conn)
            .optional()?;
        drop(conn);
        match row {
            Some(row) => Ok(Some(Snapshot {
                state: serde_json::from_str(&row.state)?,
                entity_id: row.entity_id,
                version: row.version,
                created_at: row.created_at,
            })),
            None => Ok(None),
        }
    }

    async fn save_saga_state(&self, state: &SagaStateRecord) -> EventResult<()> {
        let row = SagaStateRow::from_record(state)?;
        let mut conn = self.inner.conn.lock().await;
        diesel::insert_into(saga_state::table)
            .values(&row)
            .on_conflict(saga_state::saga_id)
            .do_update()
            .set((
                saga_state::status.eq(&row.status),
                saga_state::current_step.eq(row.current_step),
                saga_state::completed_steps.eq(&row.completed_steps),
                saga_state::results.eq(&row.results),
                saga_state::updated_at.eq(row.updated_at),
            ))
            .execute(&mut *conn)?;
        Ok(())
    }

    async fn load_saga_state(&self, saga_id: &str) -> EventResult<Option<SagaStateRecord>> {
        let mut conn = self.inner.conn.lock().await;
        let row: Option<SagaStateRow> = saga_state::table
            .filter(saga_state::saga_id.eq(saga_id))
            .first(&mut *conn)
            .optional()?;
        drop(conn);
        row.map(SagaStateRow::into_record).transpose()
    }

    async fn load_incomplete_sagas(&self) -> EventResult<Vec<SagaStateRecord>> {
        let mut conn = self.inner.conn.lock().await;
        let rows: Vec<SagaStateRow> = saga_state::table
            .filter(saga_state::status.eq_any(vec!["running", "compensating"]))
            .order(saga_state::created_at.asc())
            .load(&mut *conn)?;
        drop(conn);
        rows.into_iter().map(SagaStateRow::into_record).collect()
    }

    async fn delete_saga_state(&self, saga_id: &str) -> EventResult<()> {
        let mut conn = self.inner.conn.lock().await;
        diesel::delete(saga_state::table.filter(saga_state::saga_id.eq(saga_id)))
            .execute(&mut *conn)?;
        Ok(())
    }

    async fn flush(&self) -> EventResult<()> {
        self.inner.flush_now().await
    }

    async fn load_events_after_id(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> EventResult<Vec<EventRecord>> {
        self.inner.flush_now().await?;
        let mut conn = self.inner.conn.lock().await;
        let mut query = events::table.into_boxed::<diesel::sqlite::Sqlite>();
        if let Some(after) = after_id {
            query = query.filter(events::id.gt(after.to_string()));
        }
        let rows: Vec<EventRow> = query
            .order(events::id.asc())
            .limit(limit as i64)
            .load(&mut *conn)?;
        rows.into_iter().map(EventRow::into_record).collect()
    }

    async fn load_events_in_id_range(
        &self,
        start_id: &str,
        end_id: &str,
    ) -> EventResult<Vec<EventRecord>> {
        self.inner.flush_now().await?;
        let mut conn = self.inner.conn.lock().await;
        let rows: Vec<EventRow> = events::table
            .filter(events::id.ge(start_id.to_string()))
            .filter(events::id.le(end_id.to_string()))
            .order(events::id.asc())
            .load(&mut *conn)?;
        rows.into_iter().map(EventRow::into_record).collect()
    }

    async fn count_events(&self) -> EventResult<i64> {
        self.inner.flush_now().await?;
        let mut conn = self.inner.conn.lock().await;
        Ok(events::table.count().get_result(&mut *conn)?)
    }

    async fn insert_integrity_block(&self, block: &IntegrityBlock) -> EventResult<()> {
        let row = IntegrityBlockRow::from_block(block);
        let mut conn = self.inner.conn.lock().await;
        diesel::insert_into(integrity_blocks::table)
            .values(&row)
            .execute(&mut *conn)?;
        Ok(())
    }

    async fn load_integrity_blocks(&self) -> EventResult<Vec<IntegrityBlock>> {
        let mut conn = self.inner.conn.lock().await;
        let rows: Vec<IntegrityBlockRow> = integrity_blocks::table
            .order(integrity_blocks::created_at.asc())
            .then_order_by(integrity_blocks::id.asc())
            .load(&mut *conn)?;
        Ok(rows.into_iter().map(IntegrityBlockRow::into_block).collect())
    }

    async fn latest_integrity_block(&self) -> EventResult<Option<IntegrityBlock>> {
        let mut conn = self.inner.conn.lock().await;
        let row: Option<IntegrityBlockRow> = integrity_blocks::table
            .order(integrity_blocks::created_at.desc())
            .then_order_by(integrity_blocks::id.desc())
            .first(&mut *conn)
            .optional()?;
        Ok(row.map(IntegrityBlockRow::into_block))
    }
}
