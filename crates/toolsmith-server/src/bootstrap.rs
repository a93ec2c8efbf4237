// Composition root. Every subsystem handle lives in an explicit
// `AppContext` passed down from here; there are no process-wide singletons.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use toolsmith_core::RuntimeConfig;
use toolsmith_pool::{PoolConfig, WorkerPool};
use toolsmith_store::{
    DeadLetterQueue, EventBus, EventStore, EventStoreConfig, IntegrityChain, SagaEngine,
    SagaRecovery, SqliteEventStore, StepRegistry,
};

use crate::protocol::ToolDescriptor;
use crate::ServerError;

/// Application context wiring the store, integrity chain, coordinator,
/// saga machinery, dead-letter queue, and event bus together.
pub struct AppContext {
    pub config: RuntimeConfig,
    pub store: Arc<SqliteEventStore>,
    pub integrity: Arc<IntegrityChain>,
    pub pool: WorkerPool,
    pub saga_engine: Arc<SagaEngine>,
    pub step_registry: Arc<StepRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    pub bus: Arc<EventBus>,
    tools: RwLock<HashMap<String, ToolDescriptor>>,
}

impl AppContext {
    /// Open the store, verify integrity (aborting startup in strict mode),
    /// resume incomplete sagas, and stand up the worker pool.
    pub async fn initialize(
        config: RuntimeConfig,
        step_registry: Arc<StepRegistry>,
    ) -> Result<Arc<Self>, ServerError> {
        let store = Arc::new(
            SqliteEventStore::open(EventStoreConfig::at_path(config.db_path.clone()))
                .await
                .map_err(|e| ServerError::Startup {
                    message: format!("could not open event store: {e}"),
                })?,
        );
        let store_dyn: Arc<dyn EventStore> = store.clone();

        let integrity = Arc::new(IntegrityChain::new(store_dyn.clone()));
        if config.strict_integrity {
            integrity
                .verify_strict()
                .await
                .map_err(|e| ServerError::Startup {
                    message: format!("integrity verification failed at boot: {e}"),
                })?;
            info!("strict integrity check passed");
        }

        let recovery = SagaRecovery::new(store_dyn.clone(), step_registry.clone());
        let resumed = recovery.resume_all().await.map_err(|e| ServerError::Startup {
            message: format!("saga recovery failed: {e}"),
        })?;
        if !resumed.is_empty() {
            for outcome in &resumed {
                if outcome.success {
                    info!(saga_id = %outcome.saga_id, "saga resumed to completion");
                } else {
                    warn!(saga_id = %outcome.saga_id, "saga resumed into failure and compensated");
                }
            }
        }

        let pool = WorkerPool::new(PoolConfig {
            max_queue_size: config.max_queue_size,
            max_message_chars: config.max_message_chars,
            health_check_interval_ms: config.health_check_interval_ms,
            ..Default::default()
        });

        Ok(Arc::new(Self {
            saga_engine: Arc::new(SagaEngine::new(store_dyn.clone())),
            dlq: Arc::new(DeadLetterQueue::new(store_dyn)),
            bus: Arc::new(EventBus::default()),
            tools: RwLock::new(HashMap::new()),
            config,
            store,
            integrity,
            pool,
            step_registry,
        }))
    }

    /// Attach a descriptor for `tools/list`; workers only advertise names.
    pub async fn register_tool(&self, descriptor: ToolDescriptor) {
        self.tools
            .write()
            .await
            .insert(descriptor.name.clone(), descriptor);
    }

    /// Descriptors for every tool a live worker serves, enriched with any
    /// registered metadata.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let described = self.tools.read().await;
        let mut tools: Vec<ToolDescriptor> = self
            .pool
            .capabilities()
            .await
            .into_iter()
            .map(|name| {
                described
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| ToolDescriptor::bare(name))
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Graceful teardown: drain the pool, then flush the store.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.pool.shutdown().await;
        self.store.close().await.map_err(|e| ServerError::Startup {
            message: format!("final store flush failed: {e}"),
        })?;
        info!("runtime shut down cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolsmith_store::{EntityId, EntityKind};

    #[tokio::test]
    async fn test_initialize_in_memory() {
        let ctx = AppContext::initialize(RuntimeConfig::default(), Arc::new(StepRegistry::new()))
            .await
            .unwrap();
        assert!(ctx.list_tools().await.is_empty());
        ctx.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_strict_integrity_rejects_broken_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db").to_string_lossy().to_string();

        // Seed a store with a sealed block, then corrupt the chain by
        // inserting a forged block.
        {
            let store = Arc::new(
                SqliteEventStore::open(EventStoreConfig::at_path(path.clone()))
                    .await
                    .unwrap(),
            );
            let entity = EntityId::new(EntityKind::Workflow);
            for i in 0..4 {
                store.append(&entity, "boot.event", json!({ "i": i })).await.unwrap();
            }
            let chain = IntegrityChain::new(store.clone() as Arc<dyn EventStore>);
            let block = chain.seal_block(4).await.unwrap().unwrap();
            let forged = toolsmith_store::IntegrityBlock {
                id: uuid::Uuid::now_v7().to_string(),
                previous_block_hash: Some("00".repeat(32)),
                merkle_root: block.merkle_root.clone(),
                start_event_id: block.start_event_id.clone(),
                end_event_id: block.end_event_id.clone(),
                event_count: block.event_count,
                created_at: block.created_at + 1,
            };
            store.insert_integrity_block(&forged).await.unwrap();
            store.close().await.unwrap();
        }

        let config = RuntimeConfig {
            db_path: path,
            strict_integrity: true,
            ..Default::default()
        };
        let result = AppContext::initialize(config, Arc::new(StepRegistry::new())).await;
        assert!(matches!(result, Err(ServerError::Startup { .. })));
    }
}
