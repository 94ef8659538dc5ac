//! Workflow execution engine
//!
//! Schedules validated workflow DAGs against an [`AgentInvoker`]:
//! - Admission control (concurrent workflow limit + bounded queue)
//! - Level-by-level execution with bounded step parallelism
//! - Per-step retry with exponential backoff
//! - Pause / resume / cancel
//! - State persisted after every transition, recoverable after a restart

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;

use crate::config::{EngineConfig, OrchestratorConfig};
use crate::context::{ContextStore, MemoryContextStore};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventReceiver, WorkflowEvent};
use crate::graph;
use crate::invoker::{call_with_timeout, AgentInvoker, InvokeOptions};
use crate::metrics::WorkflowMetrics;
use crate::retry::retry_with_policy;
use crate::store::{ExecutionStore, MemoryExecutionStore};
use crate::template::{PlaceholderResolver, TemplateResolver};
use crate::workflow::{
    ExecutionFilter, StepStatus, WorkflowDefinition, WorkflowExecutionState, WorkflowStatus,
    WorkflowStep,
};

// ============================================================================
// Internal state
// ============================================================================

/// Mutable part of one execution, guarded by an async mutex so it can be
/// held while the state is persisted.
struct ExecutionCell {
    state: WorkflowExecutionState,
    /// A driver task is currently running this execution's levels
    driver_active: bool,
    /// Cancellation requested while steps were in flight
    cancel_requested: bool,
    /// A state save failed; no further launches, the run ends as failed
    storage_error: Option<String>,
}

struct Execution {
    id: String,
    cell: tokio::sync::Mutex<ExecutionCell>,
    status_tx: watch::Sender<WorkflowStatus>,
    /// Flipped to true by `cancel`; steps waiting to retry watch it
    cancel_tx: watch::Sender<bool>,
}

impl Execution {
    fn new(state: WorkflowExecutionState) -> Self {
        let (status_tx, _) = watch::channel(state.status);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            id: state.id.clone(),
            cell: tokio::sync::Mutex::new(ExecutionCell {
                state,
                driver_active: false,
                cancel_requested: false,
                storage_error: None,
            }),
            status_tx,
            cancel_tx,
        }
    }
}

/// Non-terminal executions managed by this engine
#[derive(Default)]
struct Registry {
    executions: HashMap<String, Arc<Execution>>,
    /// Executions holding a concurrency slot (running or paused)
    admitted: HashSet<String>,
    queue: VecDeque<String>,
}

enum Admission {
    Started,
    Queued(usize),
}

struct StepOutcome {
    step_id: String,
    result: Result<String>,
    attempts: u32,
    duration_ms: u64,
}

struct EngineInner {
    config: EngineConfig,
    invoker: Arc<dyn AgentInvoker>,
    context: Arc<dyn ContextStore>,
    templates: Arc<dyn TemplateResolver>,
    store: Arc<dyn ExecutionStore>,
    events: EventBus<WorkflowEvent>,
    metrics: Mutex<WorkflowMetrics>,
    registry: Mutex<Registry>,
    wake: Arc<Notify>,
    dequeue_started: AtomicBool,
}

// ============================================================================
// Public API
// ============================================================================

/// Workflow execution engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine with in-memory context, template and execution stores
    pub fn new(config: EngineConfig, invoker: Arc<dyn AgentInvoker>) -> Self {
        Self::with_ports(
            config,
            invoker,
            Arc::new(MemoryContextStore::new()),
            Arc::new(PlaceholderResolver::new()),
            Arc::new(MemoryExecutionStore::new()),
        )
    }

    /// Create an engine from explicit port implementations
    pub fn with_ports(
        config: EngineConfig,
        invoker: Arc<dyn AgentInvoker>,
        context: Arc<dyn ContextStore>,
        templates: Arc<dyn TemplateResolver>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                invoker,
                context,
                templates,
                store,
                events: EventBus::new(),
                metrics: Mutex::new(WorkflowMetrics::default()),
                registry: Mutex::new(Registry::default()),
                wake: Arc::new(Notify::new()),
                dequeue_started: AtomicBool::new(false),
            }),
        }
    }

    /// Create an engine from a loaded configuration file. Uses the SQLite
    /// execution store when the `persistence` feature is enabled.
    pub fn from_config(
        config: &OrchestratorConfig,
        invoker: Arc<dyn AgentInvoker>,
        templates: Arc<dyn TemplateResolver>,
    ) -> Result<Self> {
        let mut context = MemoryContextStore::new();
        if let Some(ttl) = config.context.ttl_secs {
            context = context.with_ttl(Duration::from_secs(ttl));
        }

        #[cfg(feature = "persistence")]
        let store: Arc<dyn ExecutionStore> = Arc::new(crate::db::SqliteExecutionStore::open_at(
            config.persistence.resolve_db_path()?,
        )?);
        #[cfg(not(feature = "persistence"))]
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());

        Ok(Self::with_ports(
            config.engine.clone(),
            invoker,
            Arc::new(context),
            templates,
            store,
        ))
    }

    /// Validate and schedule a workflow. Returns the execution id.
    ///
    /// Validation, template and capacity errors are returned before anything
    /// is persisted. A failed initial save is returned as a storage error and
    /// the workflow never runs.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        user_id: &str,
        input: Value,
    ) -> Result<String> {
        let inner = &self.inner;
        graph::validate(&definition, inner.config.max_steps).into_result()?;

        for step in &definition.steps {
            if let Some(template_id) = &step.prompt_template_id {
                if inner.templates.template(template_id).await?.is_none() {
                    return Err(OrchestratorError::Validation(format!(
                        "step '{}' references unknown prompt template '{}'",
                        step.id, template_id
                    )));
                }
            }
        }

        if !(input.is_object() || input.is_null()) {
            return Err(OrchestratorError::Validation(
                "workflow input must be a JSON object".to_string(),
            ));
        }

        inner.ensure_dequeue_loop();

        let state = WorkflowExecutionState::new(definition, user_id, input.clone());
        let execution_id = state.id.clone();
        let exec = Arc::new(Execution::new(state));
        // Held until the initial state is persisted; a driver started from
        // the queue waits on it.
        let mut cell = exec.cell.lock().await;

        let initial = if input.is_null() { None } else { Some(input) };
        inner.context.create(&execution_id, initial).await?;

        let admission = match inner.admit(&exec, false) {
            Ok(admission) => admission,
            Err(e) => {
                inner.metrics.lock().unwrap().record_rejected();
                if let Err(cleanup) = inner.context.delete(&execution_id).await {
                    tracing::warn!(execution_id = %execution_id, "Failed to drop context: {}", cleanup);
                }
                return Err(e);
            }
        };

        if let Admission::Queued(_) = admission {
            cell.state.transition(WorkflowStatus::Queued)?;
        }
        if let Err(e) = inner.persist(&cell.state).await {
            // A driver the dequeue loop already spawned finds the execution
            // released and exits
            inner.release(&execution_id);
            if let Err(cleanup) = inner.context.delete(&execution_id).await {
                tracing::warn!(execution_id = %execution_id, "Failed to drop context: {}", cleanup);
            }
            return Err(e);
        }

        inner.metrics.lock().unwrap().record_submitted();
        match admission {
            Admission::Started => {
                inner.start(&exec);
                tracing::info!(
                    execution_id = %execution_id,
                    workflow_id = %cell.state.workflow_id,
                    "Workflow admitted"
                );
            }
            Admission::Queued(position) => {
                exec.status_tx.send_replace(WorkflowStatus::Queued);
                inner.metrics.lock().unwrap().record_queued();
                inner.events.publish(WorkflowEvent::WorkflowQueued {
                    execution_id: execution_id.clone(),
                    position,
                });
                tracing::info!(execution_id = %execution_id, position, "Workflow queued");
            }
        }

        Ok(execution_id)
    }

    /// Stop launching new steps; in-flight steps finish and are recorded
    pub async fn pause(&self, execution_id: &str) -> Result<()> {
        let exec = self.require_execution(execution_id).await?;
        let mut cell = exec.cell.lock().await;
        if cell.state.status != WorkflowStatus::Running || cell.cancel_requested {
            return Err(OrchestratorError::State(format!(
                "cannot pause execution {} while {}",
                execution_id, cell.state.status
            )));
        }

        cell.state.transition(WorkflowStatus::Paused)?;
        self.inner.checkpoint(&mut cell).await?;
        exec.status_tx.send_replace(WorkflowStatus::Paused);
        self.inner.events.publish(WorkflowEvent::WorkflowPaused {
            execution_id: execution_id.to_string(),
        });
        tracing::info!(execution_id = %execution_id, "Workflow paused");
        Ok(())
    }

    /// Continue a paused execution from its first incomplete level
    pub async fn resume(&self, execution_id: &str) -> Result<()> {
        let exec = self.require_execution(execution_id).await?;
        let mut cell = exec.cell.lock().await;
        if cell.state.status != WorkflowStatus::Paused || cell.cancel_requested {
            return Err(OrchestratorError::State(format!(
                "cannot resume execution {} while {}",
                execution_id, cell.state.status
            )));
        }

        cell.state.transition(WorkflowStatus::Running)?;
        let saved = self.inner.checkpoint(&mut cell).await;
        exec.status_tx.send_replace(WorkflowStatus::Running);
        if saved.is_ok() {
            self.inner.events.publish(WorkflowEvent::WorkflowResumed {
                execution_id: execution_id.to_string(),
            });
            tracing::info!(execution_id = %execution_id, "Workflow resumed");
        }

        // A driver still draining a paused level picks the new status up.
        // After a failed save the driver fails the execution.
        if !cell.driver_active {
            cell.driver_active = true;
            tokio::spawn(drive(self.inner.clone(), exec.clone()));
        }
        saved
    }

    /// Cancel an execution. Queued and idle paused executions finish
    /// immediately; running ones finish once in-flight steps are recorded.
    pub async fn cancel(&self, execution_id: &str) -> Result<()> {
        let exec = self.require_execution(execution_id).await?;
        let mut cell = exec.cell.lock().await;
        let status = cell.state.status;
        if status.is_terminal() {
            return Err(OrchestratorError::State(format!(
                "execution {} is already {}",
                execution_id, status
            )));
        }

        let dequeued = matches!(status, WorkflowStatus::Pending | WorkflowStatus::Queued)
            && self.inner.remove_from_queue(execution_id);
        let idle_paused = status == WorkflowStatus::Paused && !cell.driver_active;

        if dequeued || idle_paused {
            self.inner
                .finalize(&exec, &mut cell, WorkflowStatus::Cancelled)
                .await;
        } else {
            cell.cancel_requested = true;
            exec.cancel_tx.send_replace(true);
        }
        tracing::info!(execution_id = %execution_id, "Workflow cancellation requested");
        Ok(())
    }

    /// Current state of an execution. Stable once the execution is terminal.
    pub async fn get_status(&self, execution_id: &str) -> Result<WorkflowExecutionState> {
        if let Some(exec) = self.inner.execution(execution_id) {
            return Ok(exec.cell.lock().await.state.clone());
        }
        self.inner
            .store
            .get(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {}", execution_id)))
    }

    /// Executions known to the execution store
    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecutionState>> {
        self.inner.store.list(filter).await
    }

    /// Wait until an execution reaches a terminal status
    pub async fn wait(&self, execution_id: &str) -> Result<WorkflowExecutionState> {
        if let Some(exec) = self.inner.execution(execution_id) {
            let mut rx = exec.status_tx.subscribe();
            let _ = rx.wait_for(|status| status.is_terminal()).await;
            return Ok(exec.cell.lock().await.state.clone());
        }
        match self.inner.store.get(execution_id).await? {
            Some(state) if state.status.is_terminal() => Ok(state),
            Some(state) => Err(OrchestratorError::State(format!(
                "execution {} is {} but not loaded in this engine",
                execution_id, state.status
            ))),
            None => Err(OrchestratorError::NotFound(format!("execution {}", execution_id))),
        }
    }

    /// Context data of an execution (input plus step outputs).
    ///
    /// Kept after the execution finishes for `context_retention_ms` when
    /// that is configured, and until the caller deletes it otherwise.
    pub async fn outputs(&self, execution_id: &str) -> Result<Value> {
        self.inner.context.get(execution_id).await
    }

    /// Events of one execution, from now on
    pub fn subscribe(&self, execution_id: &str) -> EventReceiver<WorkflowEvent> {
        self.inner.events.subscribe(execution_id)
    }

    /// Events of every execution, from now on
    pub fn subscribe_all(&self) -> EventReceiver<WorkflowEvent> {
        self.inner.events.subscribe_all()
    }

    /// Snapshot of the engine counters
    pub fn metrics(&self) -> WorkflowMetrics {
        self.inner.metrics.lock().unwrap().clone()
    }

    /// Reload non-terminal executions from the store after a restart.
    ///
    /// Steps that were in flight go back to pending. Running, queued and
    /// pending executions are re-admitted; paused ones stay paused.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let inner = &self.inner;
        inner.ensure_dequeue_loop();

        let mut states = inner.store.list(&ExecutionFilter::default()).await?;
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut recovered = Vec::new();
        for mut state in states.into_iter().filter(|s| !s.status.is_terminal()) {
            if inner.execution(&state.id).is_some() {
                continue;
            }
            let was_paused = state.status == WorkflowStatus::Paused;
            state.reset_for_recovery();
            inner.restore_context(&state).await?;

            let exec = Arc::new(Execution::new(state));
            let mut cell = exec.cell.lock().await;
            let admission = if was_paused {
                inner.register_paused(&exec);
                None
            } else {
                Some(inner.admit(&exec, true)?)
            };
            if let Some(Admission::Queued(_)) = admission {
                cell.state.transition(WorkflowStatus::Queued)?;
            }
            if let Err(e) = inner.persist(&cell.state).await {
                inner.release(&exec.id);
                return Err(e);
            }
            match admission {
                Some(Admission::Started) => inner.start(&exec),
                Some(Admission::Queued(position)) => {
                    exec.status_tx.send_replace(WorkflowStatus::Queued);
                    inner.events.publish(WorkflowEvent::WorkflowQueued {
                        execution_id: exec.id.clone(),
                        position,
                    });
                }
                None => {}
            }
            tracing::info!(
                execution_id = %exec.id,
                status = %cell.state.status,
                "Recovered execution"
            );
            recovered.push(exec.id.clone());
        }
        Ok(recovered)
    }

    async fn require_execution(&self, execution_id: &str) -> Result<Arc<Execution>> {
        if let Some(exec) = self.inner.execution(execution_id) {
            return Ok(exec);
        }
        match self.inner.store.get(execution_id).await? {
            Some(state) if state.status.is_terminal() => Err(OrchestratorError::State(format!(
                "execution {} is already {}",
                execution_id, state.status
            ))),
            Some(_) => Err(OrchestratorError::State(format!(
                "execution {} is not loaded; call recover() first",
                execution_id
            ))),
            None => Err(OrchestratorError::NotFound(format!("execution {}", execution_id))),
        }
    }
}

// ============================================================================
// Admission and bookkeeping
// ============================================================================

impl EngineInner {
    fn execution(&self, execution_id: &str) -> Option<Arc<Execution>> {
        self.registry
            .lock()
            .unwrap()
            .executions
            .get(execution_id)
            .cloned()
    }

    /// Take a slot if one is free, otherwise queue. `force_queue` ignores
    /// the queue bound (used by recovery so nothing persisted is dropped).
    /// The caller starts a `Started` execution once its state is saved.
    fn admit(&self, exec: &Arc<Execution>, force_queue: bool) -> Result<Admission> {
        let mut registry = self.registry.lock().unwrap();
        if registry.admitted.len() < self.config.max_concurrent_workflows {
            registry.executions.insert(exec.id.clone(), exec.clone());
            registry.admitted.insert(exec.id.clone());
            return Ok(Admission::Started);
        }
        if force_queue || registry.queue.len() < self.config.max_queue_size {
            registry.executions.insert(exec.id.clone(), exec.clone());
            registry.queue.push_back(exec.id.clone());
            return Ok(Admission::Queued(registry.queue.len()));
        }
        Err(OrchestratorError::Capacity(format!(
            "{} workflows running and {} queued",
            registry.admitted.len(),
            registry.queue.len()
        )))
    }

    fn start(self: &Arc<Self>, exec: &Arc<Execution>) {
        tokio::spawn(drive(self.clone(), exec.clone()));
    }

    fn register_paused(&self, exec: &Arc<Execution>) {
        let mut registry = self.registry.lock().unwrap();
        registry.executions.insert(exec.id.clone(), exec.clone());
        registry.admitted.insert(exec.id.clone());
    }

    fn remove_from_queue(&self, execution_id: &str) -> bool {
        let mut registry = self.registry.lock().unwrap();
        let before = registry.queue.len();
        registry.queue.retain(|id| id != execution_id);
        registry.queue.len() != before
    }

    /// Drop a finished execution and free its slot
    fn release(&self, execution_id: &str) {
        {
            let mut registry = self.registry.lock().unwrap();
            registry.executions.remove(execution_id);
            registry.admitted.remove(execution_id);
            registry.queue.retain(|id| id != execution_id);
        }
        self.wake.notify_one();
    }

    /// Move queued executions into free slots
    fn promote_queued(self: &Arc<Self>) {
        let mut to_start = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            while registry.admitted.len() < self.config.max_concurrent_workflows {
                let Some(id) = registry.queue.pop_front() else {
                    break;
                };
                if let Some(exec) = registry.executions.get(&id).cloned() {
                    registry.admitted.insert(id);
                    to_start.push(exec);
                }
            }
        }
        for exec in to_start {
            tracing::debug!(execution_id = %exec.id, "Dequeued workflow");
            tokio::spawn(drive(self.clone(), exec));
        }
    }

    fn ensure_dequeue_loop(self: &Arc<Self>) {
        if self.dequeue_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval = Duration::from_millis(self.config.dequeue_interval_ms.max(1));
        tokio::spawn(dequeue_loop(Arc::downgrade(self), self.wake.clone(), interval));
    }

    async fn persist(&self, state: &WorkflowExecutionState) -> Result<()> {
        self.store.save(state).await.map_err(|e| {
            tracing::error!(execution_id = %state.id, "Failed to persist execution state: {}", e);
            e
        })
    }

    /// Persist the cell's state. A failure is kept on the cell, which stops
    /// further launches and makes the driver fail the execution.
    async fn checkpoint(&self, cell: &mut ExecutionCell) -> Result<()> {
        self.persist(&cell.state).await.map_err(|e| {
            cell.storage_error.get_or_insert_with(|| e.to_string());
            e
        })
    }

    /// Recreate a lost context from the input and completed step outputs
    async fn restore_context(&self, state: &WorkflowExecutionState) -> Result<()> {
        match self.context.get(&state.id).await {
            Ok(_) => return Ok(()),
            Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let initial = if state.input.is_null() {
            None
        } else {
            Some(state.input.clone())
        };
        self.context.create(&state.id, initial).await?;
        for (step_id, step) in &state.steps {
            if let (StepStatus::Completed, Some(output)) = (step.status, &step.output) {
                self.context
                    .merge_path(&state.id, json!({ step_id.as_str(): output }))
                    .await?;
            }
        }
        Ok(())
    }

    /// Put an execution into a terminal status, persist, notify and free
    /// its slot. Caller holds the execution cell.
    async fn finalize(&self, exec: &Execution, cell: &mut ExecutionCell, status: WorkflowStatus) {
        let storage_error = cell.storage_error.clone();
        let state = &mut cell.state;
        match (status, storage_error) {
            (WorkflowStatus::Cancelled, _) => {
                state.cancel_unfinished_steps();
            }
            (WorkflowStatus::Failed, Some(error)) => {
                state.cancel_unfinished_steps();
                state.error = Some(format!("execution state not saved: {}", error));
            }
            (WorkflowStatus::Failed, None) => {
                state.error = state.first_failed_step().map(|(id, step)| {
                    format!(
                        "step '{}' failed: {}",
                        id,
                        step.error.as_deref().unwrap_or("unknown error")
                    )
                });
            }
            _ => {}
        }
        if let Err(e) = state.transition(status) {
            tracing::error!(execution_id = %exec.id, "{}", e);
            return;
        }
        // Terminal either way; `wait` reads the in-memory state
        let _ = self.persist(state).await;
        exec.status_tx.send_replace(status);

        let duration_ms = state.duration_ms();
        let execution_id = exec.id.clone();
        {
            let mut metrics = self.metrics.lock().unwrap();
            match status {
                WorkflowStatus::Completed => metrics.record_completed(duration_ms),
                WorkflowStatus::Failed => metrics.record_failed(duration_ms),
                _ => metrics.record_cancelled(),
            }
        }
        let event = match status {
            WorkflowStatus::Completed => {
                tracing::info!(execution_id = %execution_id, duration_ms, "Workflow completed");
                WorkflowEvent::WorkflowCompleted {
                    execution_id,
                    duration_ms,
                }
            }
            WorkflowStatus::Failed => {
                let error = state.error.clone().unwrap_or_default();
                tracing::warn!(execution_id = %execution_id, "Workflow failed: {}", error);
                WorkflowEvent::WorkflowFailed {
                    execution_id,
                    error,
                }
            }
            _ => {
                tracing::info!(execution_id = %execution_id, "Workflow cancelled");
                WorkflowEvent::WorkflowCancelled { execution_id }
            }
        };
        self.events.publish(event);

        if let Some(retention_ms) = self.config.context_retention_ms {
            let context = self.context.clone();
            let execution_id = exec.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(retention_ms)).await;
                match context.delete(&execution_id).await {
                    Ok(()) => tracing::debug!(execution_id = %execution_id, "Context dropped"),
                    Err(e) => tracing::warn!(execution_id = %execution_id, "Failed to drop context: {}", e),
                }
            });
        }

        cell.driver_active = false;
        self.release(&exec.id);
    }
}

async fn dequeue_loop(engine: Weak<EngineInner>, wake: Arc<Notify>, interval: Duration) {
    loop {
        match engine.upgrade() {
            Some(inner) => inner.promote_queued(),
            None => break,
        }
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Run an execution level by level until it finishes, pauses or is cancelled
async fn drive(inner: Arc<EngineInner>, exec: Arc<Execution>) {
    let levels = {
        let mut cell = exec.cell.lock().await;
        if inner.execution(&exec.id).is_none() {
            tracing::debug!(execution_id = %exec.id, "Execution released before start");
            return;
        }
        cell.driver_active = true;
        if cell.cancel_requested {
            inner.finalize(&exec, &mut cell, WorkflowStatus::Cancelled).await;
            return;
        }
        if matches!(cell.state.status, WorkflowStatus::Pending | WorkflowStatus::Queued) {
            if let Err(e) = cell.state.transition(WorkflowStatus::Running) {
                tracing::error!(execution_id = %exec.id, "{}", e);
                cell.driver_active = false;
                return;
            }
            if inner.checkpoint(&mut cell).await.is_err() {
                inner.finalize(&exec, &mut cell, WorkflowStatus::Failed).await;
                return;
            }
            exec.status_tx.send_replace(WorkflowStatus::Running);
            inner.events.publish(WorkflowEvent::WorkflowStarted {
                execution_id: exec.id.clone(),
                workflow_id: cell.state.workflow_id.clone(),
            });
            tracing::info!(execution_id = %exec.id, "Workflow started");
        }
        graph::execution_levels(&cell.state.definition.steps)
    };

    loop {
        let batch = {
            let mut cell = exec.cell.lock().await;
            if cell.cancel_requested {
                inner.finalize(&exec, &mut cell, WorkflowStatus::Cancelled).await;
                return;
            }
            if cell.storage_error.is_some() {
                inner.finalize(&exec, &mut cell, WorkflowStatus::Failed).await;
                return;
            }
            if cell.state.status != WorkflowStatus::Running {
                cell.driver_active = false;
                tracing::debug!(execution_id = %exec.id, "Driver parked");
                return;
            }

            let state = &cell.state;
            let next = levels.iter().find_map(|level| {
                let pending: Vec<WorkflowStep> = level
                    .iter()
                    .filter(|id| state.step_status(id) == Some(StepStatus::Pending))
                    .filter_map(|id| state.definition.step(id).cloned())
                    .collect();
                (!pending.is_empty()).then_some(pending)
            });

            match next {
                Some(batch) => batch,
                None => {
                    let status = if cell.state.all_steps_completed() {
                        WorkflowStatus::Completed
                    } else {
                        WorkflowStatus::Failed
                    };
                    inner.finalize(&exec, &mut cell, status).await;
                    return;
                }
            }
        };

        run_level(&inner, &exec, batch).await;
    }
}

/// Launch the pending steps of one level (bounded) and record every outcome
async fn run_level(inner: &Arc<EngineInner>, exec: &Arc<Execution>, steps: Vec<WorkflowStep>) {
    let limit = inner.config.max_parallel_steps.max(1);
    let mut join_set = JoinSet::new();
    let mut launched: HashSet<String> = HashSet::new();

    for step in steps {
        while join_set.len() >= limit {
            match join_set.join_next().await {
                Some(joined) => record_joined(inner, exec, joined, &mut launched).await,
                None => break,
            }
        }
        if !try_start_step(inner, exec, &step.id).await {
            break;
        }
        launched.insert(step.id.clone());
        join_set.spawn(run_step(
            inner.clone(),
            exec.id.clone(),
            step,
            exec.cancel_tx.subscribe(),
        ));
    }

    while let Some(joined) = join_set.join_next().await {
        record_joined(inner, exec, joined, &mut launched).await;
    }

    // Steps whose task died without reporting
    for step_id in launched {
        let outcome = StepOutcome {
            step_id,
            result: Err(OrchestratorError::AgentInvocation("step task aborted".to_string())),
            attempts: 0,
            duration_ms: 0,
        };
        record_outcome(inner, exec, outcome).await;
    }
}

/// Mark a step running unless the execution stopped accepting launches
async fn try_start_step(inner: &EngineInner, exec: &Execution, step_id: &str) -> bool {
    let mut cell = exec.cell.lock().await;
    if cell.cancel_requested
        || cell.storage_error.is_some()
        || cell.state.status != WorkflowStatus::Running
    {
        return false;
    }
    cell.state.start_step(step_id);
    if inner.checkpoint(&mut cell).await.is_err() {
        return false;
    }
    inner.events.publish(WorkflowEvent::StepStarted {
        execution_id: exec.id.clone(),
        step_id: step_id.to_string(),
        attempt: 1,
    });
    tracing::debug!(execution_id = %exec.id, step_id = %step_id, "Step started");
    true
}

async fn record_joined(
    inner: &EngineInner,
    exec: &Execution,
    joined: std::result::Result<StepOutcome, tokio::task::JoinError>,
    launched: &mut HashSet<String>,
) {
    match joined {
        Ok(outcome) => {
            launched.remove(&outcome.step_id);
            record_outcome(inner, exec, outcome).await;
        }
        Err(e) => tracing::error!(execution_id = %exec.id, "Step task failed to join: {}", e),
    }
}

async fn record_outcome(inner: &EngineInner, exec: &Execution, outcome: StepOutcome) {
    let StepOutcome {
        step_id,
        result,
        attempts,
        duration_ms,
    } = outcome;

    // Outputs become visible to later levels under the step id
    let result = match result {
        Ok(output) => inner
            .context
            .merge_path(&exec.id, json!({ step_id.as_str(): output.as_str() }))
            .await
            .map(|_| output),
        Err(e) => Err(e),
    };

    let mut cell = exec.cell.lock().await;
    match result {
        Ok(output) => {
            cell.state.complete_step(&step_id, output, attempts, duration_ms);
            inner.metrics.lock().unwrap().record_step_completed(duration_ms);
            inner.events.publish(WorkflowEvent::StepCompleted {
                execution_id: exec.id.clone(),
                step_id: step_id.clone(),
                attempts,
                duration_ms,
            });
            tracing::debug!(execution_id = %exec.id, step_id = %step_id, attempts, "Step completed");
        }
        Err(e) => {
            let error = e.to_string();
            cell.state.fail_step(&step_id, error.clone(), attempts, duration_ms);
            inner.metrics.lock().unwrap().record_step_failed(duration_ms);
            inner.events.publish(WorkflowEvent::StepFailed {
                execution_id: exec.id.clone(),
                step_id: step_id.clone(),
                attempts,
                error: error.clone(),
            });
            tracing::warn!(
                execution_id = %exec.id,
                step_id = %step_id,
                attempts,
                "Step failed: {}",
                error
            );

            let dependents = graph::dependents_closure(&cell.state.definition.steps, &step_id);
            for dependent in dependents {
                if cell.state.skip_step(&dependent, &step_id) {
                    inner.metrics.lock().unwrap().record_step_skipped();
                    inner.events.publish(WorkflowEvent::StepSkipped {
                        execution_id: exec.id.clone(),
                        step_id: dependent,
                        failed_dependency: step_id.clone(),
                    });
                }
            }
        }
    }
    // A failure stays on the cell and ends the run before the next launch
    let _ = inner.checkpoint(&mut cell).await;
}

// ============================================================================
// Step execution
// ============================================================================

/// Build the prompt and call the agent with the step's retry policy.
/// Once `cancel` turns true no further attempt is made.
async fn run_step(
    inner: Arc<EngineInner>,
    execution_id: String,
    step: WorkflowStep,
    mut cancel: watch::Receiver<bool>,
) -> StepOutcome {
    let started = Instant::now();

    let (result, attempts) = match build_prompt(&inner, &execution_id, &step).await {
        Ok(prompt) => {
            let timeout_ms = step.timeout_ms.unwrap_or(inner.config.step_timeout_ms);
            let mut options = InvokeOptions::new()
                .with_timeout_ms(Some(timeout_ms))
                .with_metadata("execution_id", execution_id.as_str())
                .with_metadata("step_id", step.id.as_str());
            if let Some(system_prompt) = &step.system_prompt {
                options = options.with_system_prompt(system_prompt.as_str());
            }

            let outcome = retry_with_policy(
                &step.retry_policy,
                |attempt| {
                    let inner = inner.clone();
                    let execution_id = execution_id.clone();
                    let step_id = step.id.clone();
                    let agent = step.agent.clone();
                    let prompt = prompt.clone();
                    let options = options.clone();
                    async move {
                        if attempt > 1 {
                            inner.events.publish(WorkflowEvent::StepStarted {
                                execution_id,
                                step_id,
                                attempt,
                            });
                        }
                        call_agent(inner.invoker.as_ref(), &agent, &prompt, &options, timeout_ms).await
                    }
                },
                OrchestratorError::is_retryable,
                |retry, err, delay| {
                    inner.metrics.lock().unwrap().record_retry();
                    tracing::warn!(
                        execution_id = %execution_id,
                        step_id = %step.id,
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying step: {}",
                        err
                    );
                    inner.events.publish(WorkflowEvent::StepRetrying {
                        execution_id: execution_id.clone(),
                        step_id: step.id.clone(),
                        attempt: retry + 1,
                        delay_ms: delay.as_millis() as u64,
                        error: err.to_string(),
                    });
                },
                async move {
                    let closed = cancel.wait_for(|cancelled| *cancelled).await.is_err();
                    if closed {
                        std::future::pending::<()>().await;
                    }
                },
            )
            .await;
            if outcome.cancelled {
                tracing::info!(
                    execution_id = %execution_id,
                    step_id = %step.id,
                    attempts = outcome.attempts,
                    "Step retries stopped by cancellation"
                );
            }
            (outcome.result, outcome.attempts)
        }
        // Unresolvable prompts are not retried
        Err(e) => (Err(e), 0),
    };

    StepOutcome {
        step_id: step.id,
        result,
        attempts,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Resolve the step prompt against a fresh snapshot of the context
async fn build_prompt(inner: &EngineInner, execution_id: &str, step: &WorkflowStep) -> Result<String> {
    let template = match (&step.prompt, &step.prompt_template_id) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(template_id)) => inner.templates.template(template_id).await?.ok_or_else(|| {
            OrchestratorError::Template(format!("prompt template '{}' not found", template_id))
        })?,
        (None, None) => {
            return Err(OrchestratorError::Validation(format!(
                "step '{}' has no prompt",
                step.id
            )))
        }
    };

    let variables = inner.context.get(execution_id).await?;
    inner.templates.resolve(&template, &variables).await.into_result()
}

async fn call_agent(
    invoker: &dyn AgentInvoker,
    agent: &str,
    prompt: &str,
    options: &InvokeOptions,
    timeout_ms: u64,
) -> Result<String> {
    let response = call_with_timeout(invoker, agent, prompt, options, Some(timeout_ms)).await?;
    if response.success {
        Ok(response.result.unwrap_or_default())
    } else {
        Err(OrchestratorError::AgentInvocation(response.error_message()))
    }
}
