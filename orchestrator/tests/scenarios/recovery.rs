//! Restart recovery and execution-store scenarios

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use orchestrator::config::EngineConfig;
use orchestrator::context::MemoryContextStore;
use orchestrator::engine::WorkflowEngine;
use orchestrator::error::{OrchestratorError, Result};
use orchestrator::store::{ExecutionStore, MemoryExecutionStore};
use orchestrator::template::PlaceholderResolver;
use orchestrator::workflow::{
    ExecutionFilter, StepStatus, WorkflowDefinition, WorkflowExecutionState, WorkflowStatus,
    WorkflowStep,
};

use super::common::{eventually, Reply, ScriptedInvoker};

fn draft_and_review() -> WorkflowDefinition {
    WorkflowDefinition::new("draft-review", "Draft and review")
        .with_step(WorkflowStep::new("draft", "writer").with_prompt("write about {{topic}}"))
        .with_step(
            WorkflowStep::new("review", "reviewer")
                .with_prompt("review {{draft}} on {{topic}}")
                .depends_on("draft"),
        )
}

fn engine_on(invoker: &Arc<ScriptedInvoker>, store: Arc<dyn ExecutionStore>) -> WorkflowEngine {
    WorkflowEngine::with_ports(
        EngineConfig::default(),
        invoker.clone(),
        Arc::new(MemoryContextStore::new()),
        Arc::new(PlaceholderResolver::new()),
        store,
    )
}

/// Memory store whose saves fail once `failing` is set
#[derive(Default)]
struct FlakyStore {
    inner: MemoryExecutionStore,
    failing: AtomicBool,
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn save(&self, state: &WorkflowExecutionState) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Storage("disk full".to_string()));
        }
        self.inner.save(state).await
    }

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecutionState>> {
        self.inner.get(execution_id).await
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecutionState>> {
        self.inner.list(filter).await
    }

    async fn delete(&self, execution_id: &str) -> Result<bool> {
        self.inner.delete(execution_id).await
    }
}

/// State as a crashed process would have left it: draft done, review in flight
fn interrupted_state() -> WorkflowExecutionState {
    let mut state = WorkflowExecutionState::new(draft_and_review(), "alice", json!({"topic": "async"}));
    state.transition(WorkflowStatus::Running).unwrap();
    state.start_step("draft");
    state.complete_step("draft", "first draft".to_string(), 1, 12);
    state.start_step("review");
    state
}

#[tokio::test]
async fn test_recover_resets_in_flight_steps() {
    let store = Arc::new(MemoryExecutionStore::new());
    let state = interrupted_state();
    store.save(&state).await.unwrap();

    let invoker = ScriptedInvoker::new();
    let engine = engine_on(&invoker, store.clone());

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered, vec![state.id.clone()]);

    let done = engine.wait(&state.id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.step("draft").and_then(|s| s.output.as_deref()), Some("first draft"));

    // Only the interrupted step ran again, against the rebuilt context
    assert_eq!(invoker.agents_called(), vec!["reviewer".to_string()]);
    assert_eq!(invoker.calls()[0].input, "review first draft on async");

    // Nothing left to recover
    assert!(engine.recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recover_keeps_paused_executions_paused() {
    let store = Arc::new(MemoryExecutionStore::new());
    let mut state = interrupted_state();
    state.reset_for_recovery();
    state.transition(WorkflowStatus::Running).unwrap();
    state.transition(WorkflowStatus::Paused).unwrap();
    store.save(&state).await.unwrap();

    let invoker = ScriptedInvoker::new();
    let engine = engine_on(&invoker, store.clone());
    engine.recover().await.unwrap();

    let paused = engine.get_status(&state.id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.step_status("review"), Some(StepStatus::Pending));
    assert!(invoker.calls().is_empty());

    engine.resume(&state.id).await.unwrap();
    let done = engine.wait(&state.id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(invoker.call_count("reviewer"), 1);
}

#[tokio::test]
async fn test_failed_initial_save_rejects_submission() {
    let store = Arc::new(FlakyStore::default());
    store.failing.store(true, Ordering::SeqCst);
    let invoker = ScriptedInvoker::new();
    let engine = engine_on(&invoker, store.clone());

    let err = engine
        .submit(draft_and_review(), "alice", json!({"topic": "io"}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Storage(_)));

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(invoker.calls().is_empty());
    assert_eq!(engine.metrics().submitted, 0);
    assert!(engine.list(&ExecutionFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_save_stops_further_launches() {
    let store = Arc::new(FlakyStore::default());
    let invoker = ScriptedInvoker::new();
    let gate = Arc::new(Semaphore::new(0));
    invoker.script("writer", vec![Reply::gated(&gate, Reply::ok("the draft"))]);
    let engine = engine_on(&invoker, store.clone());

    let id = engine
        .submit(draft_and_review(), "alice", json!({"topic": "io"}))
        .await
        .unwrap();
    eventually("draft to start", || invoker.call_count("writer") == 1).await;

    // The draft result cannot be saved
    store.failing.store(true, Ordering::SeqCst);
    gate.add_permits(1);
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    let error = state.error.clone().unwrap();
    assert!(error.contains("not saved"), "{}", error);
    assert!(error.contains("disk full"), "{}", error);
    assert_eq!(state.step_status("review"), Some(StepStatus::Cancelled));
    assert_eq!(invoker.call_count("reviewer"), 0);
    assert_eq!(engine.metrics().failed, 1);
}

#[tokio::test]
async fn test_unloaded_execution_requires_recovery() {
    let store = Arc::new(MemoryExecutionStore::new());
    let state = interrupted_state();
    store.save(&state).await.unwrap();

    let engine = engine_on(&ScriptedInvoker::new(), store.clone());
    assert!(engine.pause(&state.id).await.is_err());
    // Status queries are served from the store
    assert_eq!(
        engine.get_status(&state.id).await.unwrap().status,
        WorkflowStatus::Running
    );
}

#[tokio::test]
async fn test_list_filters_by_user_and_status() {
    let store = Arc::new(MemoryExecutionStore::new());
    let invoker = ScriptedInvoker::new();
    invoker.set_default("reviewer", super::common::Reply::fail("no reviewers today"));
    let engine = engine_on(&invoker, store.clone());

    let ok = engine
        .submit(
            WorkflowDefinition::new("solo", "Solo")
                .with_step(WorkflowStep::new("only", "writer").with_prompt("hi")),
            "alice",
            json!({}),
        )
        .await
        .unwrap();
    let failed = engine
        .submit(draft_and_review(), "bob", json!({"topic": "io"}))
        .await
        .unwrap();
    engine.wait(&ok).await.unwrap();
    engine.wait(&failed).await.unwrap();

    let alice = engine
        .list(&ExecutionFilter {
            user_id: Some("alice".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].id, ok);

    let failures = engine
        .list(&ExecutionFilter {
            status: Some(WorkflowStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, failed);
}

#[cfg(feature = "persistence")]
#[tokio::test]
async fn test_sqlite_store_survives_restart() {
    use orchestrator::db::SqliteExecutionStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("executions.db");

    let execution_id = {
        let store = Arc::new(SqliteExecutionStore::open_at(&path).unwrap());
        let engine = engine_on(&ScriptedInvoker::new(), store);
        let id = engine
            .submit(draft_and_review(), "alice", json!({"topic": "sqlite"}))
            .await
            .unwrap();
        assert_eq!(engine.wait(&id).await.unwrap().status, WorkflowStatus::Completed);
        id
    };

    let reopened = Arc::new(SqliteExecutionStore::open_at(&path).unwrap());
    let state = reopened.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.user_id, "alice");
    assert_eq!(
        state.step("review").and_then(|s| s.output.as_deref()),
        Some("review write about sqlite on sqlite")
    );

    let engine = engine_on(&ScriptedInvoker::new(), reopened);
    assert!(engine.recover().await.unwrap().is_empty());
    assert_eq!(
        engine.get_status(&execution_id).await.unwrap().status,
        WorkflowStatus::Completed
    );
}

#[cfg(feature = "persistence")]
#[tokio::test]
async fn test_sqlite_recovery_after_crash() {
    use orchestrator::db::SqliteExecutionStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("executions.db");
    let state = interrupted_state();
    SqliteExecutionStore::open_at(&path)
        .unwrap()
        .save(&state)
        .await
        .unwrap();

    let invoker = ScriptedInvoker::new();
    let engine = engine_on(&invoker, Arc::new(SqliteExecutionStore::open_at(&path).unwrap()));
    assert_eq!(engine.recover().await.unwrap(), vec![state.id.clone()]);
    assert_eq!(
        engine.wait(&state.id).await.unwrap().status,
        WorkflowStatus::Completed
    );
    assert_eq!(invoker.call_count("reviewer"), 1);
    assert_eq!(invoker.call_count("writer"), 0);
}
