// Saga engine: ordered step lists with reverse-order compensation,
// persisted progress, and crash-recovery resumption.
//
// Every transition appends an event before the live saga-state row is
// updated, so the audit trail stays complete even when the process dies
// mid-compensation. The live row is deleted once a terminal event is
// appended; the event log remains authoritative.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::EventStore;
use crate::{now_ms, EntityId, EventError, EventRecord, EventResult, SagaStateRecord, SagaStatus};

/// Failure raised by a saga step's `execute` or `compensate`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SagaStepError {
    pub message: String,
}

impl SagaStepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One named step of a saga.
///
/// Both `execute` and `compensate` must be idempotent against repeated
/// invocation across a crash-resume boundary; the engine only guarantees at
/// most one completion record per `(saga_id, step)` in the event log.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, input: &Value) -> Result<Value, SagaStepError>;

    /// Reverse action for a previously successful `execute`. The default is
    /// a no-op for steps without side effects.
    async fn compensate(&self, _input: &Value, _error: &SagaStepError) -> Result<Value, SagaStepError> {
        Ok(Value::Null)
    }
}

type BoxedStepFuture = Pin<Box<dyn Future<Output = Result<Value, SagaStepError>> + Send>>;
type StepFn = Arc<dyn Fn(Value) -> BoxedStepFuture + Send + Sync>;
type CompensateFn = Arc<dyn Fn(Value, SagaStepError) -> BoxedStepFuture + Send + Sync>;

/// Closure-backed step, convenient for composition roots and tests.
pub struct FnSagaStep {
    name: String,
    execute_fn: StepFn,
    compensate_fn: Option<CompensateFn>,
}

impl FnSagaStep {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SagaStepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute_fn: Arc::new(move |input| Box::pin(execute(input))),
            compensate_fn: None,
        }
    }

    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(Value, SagaStepError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SagaStepError>> + Send + 'static,
    {
        self.compensate_fn = Some(Arc::new(move |input, err| Box::pin(compensate(input, err))));
        self
    }
}

#[async_trait]
impl SagaStep for FnSagaStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &Value) -> Result<Value, SagaStepError> {
        (self.execute_fn)(input.clone()).await
    }

    async fn compensate(&self, input: &Value, error: &SagaStepError) -> Result<Value, SagaStepError> {
        match &self.compensate_fn {
            Some(f) => f(input.clone(), error.clone()).await,
            None => Ok(Value::Null),
        }
    }
}

/// An ordered, named list of saga steps.
pub struct SagaDefinition {
    pub name: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }
}

/// Terminal result of a saga execution.
#[derive(Debug, Clone)]
pub struct SagaOutcome {
    pub saga_id: String,
    pub success: bool,
    /// Whether previously completed steps were compensated
    pub compensated: bool,
    /// Results of completed steps, in execution order
    pub results: Vec<Value>,
    pub error: Option<String>,
}

/// Executes sagas against the event store.
pub struct SagaEngine {
    store: Arc<dyn EventStore>,
}

impl SagaEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Execute `definition` from the first step.
    pub async fn run(
        &self,
        definition: &SagaDefinition,
        entity_id: &EntityId,
        input: Value,
    ) -> EventResult<SagaOutcome> {
        let saga_id = Uuid::now_v7().to_string();
        let started_at = now_ms();

        self.store
            .append(
                entity_id,
                "saga.started",
                json!({
                    "saga_id": saga_id,
                    "saga": definition.name,
                    "steps": definition.step_names(),
                    "input": input,
                }),
            )
            .await?;

        let state = SagaStateRecord {
            saga_id: saga_id.clone(),
            entity_id: entity_id.to_string(),
            status: SagaStatus::Running,
            current_step: 0,
            total_steps: definition.steps.len() as i64,
            input,
            completed_steps: Vec::new(),
            results: Vec::new(),
            created_at: started_at,
            updated_at: started_at,
        };
        self.store.save_saga_state(&state).await?;
        info!(saga_id = %saga_id, saga = %definition.name, steps = definition.steps.len(), "saga started");

        self.run_steps(definition.steps(), entity_id, state, 0).await
    }

    /// Drive steps from `start` to the end, compensating on failure.
    async fn run_steps(
        &self,
        steps: &[Arc<dyn SagaStep>],
        entity_id: &EntityId,
        mut state: SagaStateRecord,
        start: usize,
    ) -> EventResult<SagaOutcome> {
        for (index, step) in steps.iter().enumerate().skip(start) {
            state.current_step = index as i64;
            state.updated_at = now_ms();
            self.store.save_saga_state(&state).await?;

            match step.execute(&state.input).await {
                Ok(result) => {
                    self.store
                        .append(
                            entity_id,
                            "saga.step_completed",
                            json!({
                                "saga_id": state.saga_id,
                                "step": step.name(),
                                "result": result,
                            }),
                        )
                        .await?;
                    state.completed_steps.push(step.name().to_string());
                    state.results.push(result);
                    state.updated_at = now_ms();
                    self.store.save_saga_state(&state).await?;
                }
                Err(err) => {
                    warn!(saga_id = %state.saga_id, step = step.name(), error = %err, "saga step failed");
                    self.store
                        .append(
                            entity_id,
                            "saga.step_failed",
                            json!({
                                "saga_id": state.saga_id,
                                "step": step.name(),
                                "error": err.message,
                            }),
                        )
                        .await?;
                    state.status = SagaStatus::Compensating;
                    state.updated_at = now_ms();
                    self.store.save_saga_state(&state).await?;

                    return self.finish_compensating(steps, entity_id, state, &err).await;
                }
            }
        }

        state.status = SagaStatus::Completed;
        state.updated_at = now_ms();
        self.store.save_saga_state(&state).await?;
        self.store.delete_saga_state(&state.saga_id).await?;
        self.store
            .append(
                entity_id,
                "saga.completed",
                json!({ "saga_id": state.saga_id }),
            )
            .await?;
        info!(saga_id = %state.saga_id, "saga completed");

        Ok(SagaOutcome {
            saga_id: state.saga_id,
            success: true,
            compensated: false,
            results: state.results,
            error: None,
        })
    }

    /// Compensate every remaining completed step in reverse order, then
    /// finalize the saga as failed.
    async fn finish_compensating(
        &self,
        steps: &[Arc<dyn SagaStep>],
        entity_id: &EntityId,
        mut state: SagaStateRecord,
        error: &SagaStepError,
    ) -> EventResult<SagaOutcome> {
        self.compensate_completed(steps, entity_id, &mut state, error)
            .await?;

        state.status = SagaStatus::Failed;
        state.updated_at = now_ms();
        self.store.save_saga_state(&state).await?;
        self.store.delete_saga_state(&state.saga_id).await?;
        self.store
            .append(
                entity_id,
                "saga.failed",
                json!({
                    "saga_id": state.saga_id,
                    "error": error.message,
                }),
            )
            .await?;
        info!(saga_id = %state.saga_id, "saga failed after compensation");

        Ok(SagaOutcome {
            saga_id: state.saga_id,
            success: false,
            compensated: true,
            results: state.results,
            error: Some(error.message.clone()),
        })
    }

    /// Compensate the steps still listed in `completed_steps`, strictly in
    /// reverse execution order. Each attempted step is removed from the
    /// list and the state persisted, so a crash mid-compensation never
    /// compensates a step twice.
    async fn compensate_completed(
        &self,
        steps: &[Arc<dyn SagaStep>],
        entity_id: &EntityId,
        state: &mut SagaStateRecord,
        error: &SagaStepError,
    ) -> EventResult<()> {
        let to_compensate: Vec<String> = state.completed_steps.iter().rev().cloned().collect();
        for name in to_compensate {
            match steps.iter().find(|s| s.name() == name) {
                Some(step) => match step.compensate(&state.input, error).await {
                    Ok(_) => {
                        self.store
                            .append(
                                entity_id,
                                "saga.compensated",
                                json!({ "saga_id": state.saga_id, "step": name }),
                            )
                            .await?;
                    }
                    Err(cerr) => {
                        error!(saga_id = %state.saga_id, step = %name, error = %cerr, "compensation failed");
                        self.store
                            .append(
                                entity_id,
                                "saga.compensation_failed",
                                json!({
                                    "saga_id": state.saga_id,
                                    "step": name,
                                    "error": cerr.message,
                                }),
                            )
                            .await?;
                    }
                },
                None => {
                    error!(saga_id = %state.saga_id, step = %name, "no step implementation to compensate");
                    self.store
                        .append(
                            entity_id,
                            "saga.compensation_failed",
                            json!({
                                "saga_id": state.saga_id,
                                "step": name,
                                "error": "step implementation not available",
                            }),
                        )
                        .await?;
                }
            }
            state.completed_steps.retain(|n| n != &name);
            state.updated_at = now_ms();
            self.store.save_saga_state(state).await?;
        }
        Ok(())
    }
}

/// Resolves step names recorded in the event log back to implementations
/// when resuming after a restart.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn SagaStep>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: Arc<dyn SagaStep>) {
        self.steps.insert(step.name().to_string(), step);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SagaStep>> {
        self.steps.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Scans for sagas left `running` or `compensating` and converges each to
/// a terminal state.
pub struct SagaRecovery {
    store: Arc<dyn EventStore>,
    registry: Arc<StepRegistry>,
}

impl SagaRecovery {
    pub fn new(store: Arc<dyn EventStore>, registry: Arc<StepRegistry>) -> Self {
        Self { store, registry }
    }

    /// Resume or finish compensation of every incomplete saga, in creation
    /// order. Sagas whose step implementations are no longer registered are
    /// left untouched for manual resolution.
    pub async fn resume_all(&self) -> EventResult<Vec<SagaOutcome>> {
        let incomplete = self.store.load_incomplete_sagas().await?;
        if incomplete.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = incomplete.len(), "resuming incomplete sagas");

        let engine = SagaEngine::new(Arc::clone(&self.store));
        let mut outcomes = Vec::new();

        for state in incomplete {
            match self.resume_one(&engine, state).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => error!(error = %err, "saga resume failed"),
            }
        }
        Ok(outcomes)
    }

    async fn resume_one(
        &self,
        engine: &SagaEngine,
        state: SagaStateRecord,
    ) -> EventResult<SagaOutcome> {
        let entity_id: EntityId = state.entity_id.parse()?;
        let events = self.store.load_events(&entity_id).await?;
        let step_names = started_step_names(&events, &state.saga_id).ok_or_else(|| {
            EventError::SagaError {
                message: format!("no saga.started event for saga {}", state.saga_id),
            }
        })?;

        let mut steps: Vec<Arc<dyn SagaStep>> = Vec::with_capacity(step_names.len());
        for name in &step_names {
            match self.registry.get(name) {
                Some(step) => steps.push(step),
                None => {
                    warn!(saga_id = %state.saga_id, step = %name, "unregistered step, leaving saga for manual resolution");
                    return Err(EventError::SagaError {
                        message: format!("step {name:?} not registered"),
                    });
                }
            }
        }

        match state.status {
            SagaStatus::Running => {
                // The next step to run is exactly the number of completed
                // steps; current_step agrees whenever the row is consistent.
                let start = state.completed_steps.len();
                info!(saga_id = %state.saga_id, start, "resuming running saga");
                engine.run_steps(&steps, &entity_id, state, start).await
            }
            SagaStatus::Compensating => {
                info!(saga_id = %state.saga_id, "resuming compensation");
                let error = last_step_failure(&events, &state.saga_id)
                    .unwrap_or_else(|| SagaStepError::new("resumed compensation after restart"));
                engine
                    .finish_compensating(&steps, &entity_id, state, &error)
                    .await
            }
            status => Err(EventError::SagaError {
                message: format!("saga {} is not incomplete: {:?}", state.saga_id, status),
            }),
        }
    }
}

fn started_step_names(events: &[EventRecord], saga_id: &str) -> Option<Vec<String>> {
    events
        .iter()
        .find(|e| e.event_type == "saga.started" && e.payload["saga_id"] == saga_id)
        .and_then(|e| {
            e.payload["steps"].as_array().map(|steps| {
                steps
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
        })
}

fn last_step_failure(events: &[EventRecord], saga_id: &str) -> Option<SagaStepError> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == "saga.step_failed" && e.payload["saga_id"] == saga_id)
        .and_then(|e| e.payload["error"].as_str())
        .map(SagaStepError::new)
}

/// Cursor-based audit view over a single saga's events.
pub struct SagaCursor {
    events: Vec<EventRecord>,
    position: usize,
}

impl SagaCursor {
    /// Load the entity's log filtered down to events carrying `saga_id`.
    pub async fn load(
        store: &dyn EventStore,
        entity_id: &EntityId,
        saga_id: &str,
    ) -> EventResult<Self> {
        let events = store
            .load_events(entity_id)
            .await?
            .into_iter()
            .filter(|e| e.payload["saga_id"] == saga_id)
            .collect();
        Ok(Self {
            events,
            position: 0,
        })
    }

    pub fn next(&mut self) -> Option<&EventRecord> {
        let event = self.events.get(self.position)?;
        self.position += 1;
        Some(event)
    }

    pub fn remaining(&self) -> usize {
        self.events.len() - self.position
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }
}
