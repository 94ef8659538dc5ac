//! Workflow engine scenarios: ordering, retries, failure propagation,
//! pause/resume/cancel and admission control

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;

use orchestrator::config::EngineConfig;
use orchestrator::engine::WorkflowEngine;
use orchestrator::error::OrchestratorError;
use orchestrator::events::WorkflowEvent;
use orchestrator::retry::RetryPolicy;
use orchestrator::workflow::{StepStatus, WorkflowDefinition, WorkflowStatus, WorkflowStep};

use super::common::{eventually, Reply, ScriptedInvoker};

fn engine_with(invoker: &Arc<ScriptedInvoker>, config: EngineConfig) -> WorkflowEngine {
    WorkflowEngine::new(config, invoker.clone())
}

/// draft (writer) -> review (reviewer)
fn draft_and_review() -> WorkflowDefinition {
    WorkflowDefinition::new("draft-review", "Draft and review")
        .with_step(WorkflowStep::new("draft", "writer").with_prompt("write about {{topic}}"))
        .with_step(
            WorkflowStep::new("review", "reviewer")
                .with_prompt("review {{draft}}")
                .depends_on("draft"),
        )
}

fn single_step(agent: &str) -> WorkflowDefinition {
    WorkflowDefinition::new("single", "Single step")
        .with_step(WorkflowStep::new("only", agent).with_prompt("go"))
}

async fn step_status(engine: &WorkflowEngine, id: &str, step: &str) -> Option<StepStatus> {
    engine
        .get_status(id)
        .await
        .ok()
        .and_then(|state| state.step_status(step))
}

async fn wait_for_step(engine: &WorkflowEngine, id: &str, step: &str, status: StepStatus) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while step_status(engine, id, step).await != Some(status) {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for step {} to become {:?}",
            step,
            status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Ordering and data flow
// ============================================================================

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let invoker = ScriptedInvoker::new();
    let engine = engine_with(&invoker, EngineConfig::default());
    let mut events = engine.subscribe_all();

    let definition = WorkflowDefinition::new("diamond", "Diamond")
        .with_step(WorkflowStep::new("a", "agent-a").with_prompt("{{seed}}"))
        .with_step(WorkflowStep::new("b", "agent-b").with_prompt("b of {{a}}").depends_on("a"))
        .with_step(WorkflowStep::new("c", "agent-c").with_prompt("c of {{a}}").depends_on("a"))
        .with_step(
            WorkflowStep::new("d", "agent-d")
                .with_prompt("join {{b}} + {{c}}")
                .depends_on("b")
                .depends_on("c"),
        );

    let id = engine
        .submit(definition, "alice", json!({"seed": "start"}))
        .await
        .unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.progress, 100);
    assert!(state.error.is_none());

    let order = invoker.agents_called();
    let pos = |agent: &str| order.iter().position(|a| a == agent).unwrap();
    assert_eq!(order.len(), 4);
    assert!(pos("agent-a") < pos("agent-b"));
    assert!(pos("agent-a") < pos("agent-c"));
    assert!(pos("agent-b") < pos("agent-d"));
    assert!(pos("agent-c") < pos("agent-d"));

    assert_eq!(
        invoker.calls_to("agent-d")[0].input,
        "join b of start + c of start"
    );

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.first(), Some(WorkflowEvent::WorkflowStarted { .. })));
    assert!(matches!(received.last(), Some(WorkflowEvent::WorkflowCompleted { .. })));
    let completed_steps = received
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StepCompleted { .. }))
        .count();
    assert_eq!(completed_steps, 4);
}

#[tokio::test]
async fn test_cycle_rejected_naming_every_member() {
    let invoker = ScriptedInvoker::new();
    let engine = engine_with(&invoker, EngineConfig::default());

    let definition = WorkflowDefinition::new("loop", "Loop")
        .with_step(WorkflowStep::new("alpha", "x").with_prompt("1").depends_on("gamma"))
        .with_step(WorkflowStep::new("beta", "x").with_prompt("2").depends_on("alpha"))
        .with_step(WorkflowStep::new("gamma", "x").with_prompt("3").depends_on("beta"))
        .with_step(WorkflowStep::new("delta", "x").with_prompt("4"));

    let err = engine.submit(definition, "alice", json!({})).await.unwrap_err();
    let OrchestratorError::Dependency(message) = err else {
        panic!("expected dependency error, got {:?}", err);
    };
    for member in ["alpha", "beta", "gamma"] {
        assert!(message.contains(member), "{} missing from: {}", member, message);
    }
    assert!(!message.contains("delta"));
    assert!(invoker.calls().is_empty());
    assert_eq!(engine.metrics().submitted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_level_parallelism_is_bounded() {
    let invoker = ScriptedInvoker::new();
    for agent in ["a", "b", "c"] {
        invoker.set_default(agent, Reply::Delayed(Duration::from_millis(50), Box::new(Reply::ok(agent))));
    }
    let definition = WorkflowDefinition::new("fan", "Fan")
        .with_step(WorkflowStep::new("a", "a").with_prompt("a"))
        .with_step(WorkflowStep::new("b", "b").with_prompt("b"))
        .with_step(WorkflowStep::new("c", "c").with_prompt("c"));

    let serial = engine_with(&invoker, EngineConfig::default().with_max_parallel_steps(1));
    let start = tokio::time::Instant::now();
    let id = serial.submit(definition.clone(), "alice", json!({})).await.unwrap();
    assert_eq!(serial.wait(&id).await.unwrap().status, WorkflowStatus::Completed);
    assert!(start.elapsed() >= Duration::from_millis(150));

    let wide = engine_with(&invoker, EngineConfig::default().with_max_parallel_steps(3));
    let start = tokio::time::Instant::now();
    let id = wide.submit(definition, "alice", json!({})).await.unwrap();
    assert_eq!(wide.wait(&id).await.unwrap().status, WorkflowStatus::Completed);
    assert!(start.elapsed() < Duration::from_millis(100));
}

// ============================================================================
// Retries and failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_backoff_then_single_failure() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("flaky", Reply::fail("upstream unavailable"));
    let engine = engine_with(&invoker, EngineConfig::default());
    let mut events = engine.subscribe_all();

    let definition = WorkflowDefinition::new("retry", "Retry").with_step(
        WorkflowStep::new("call", "flaky")
            .with_prompt("ping")
            .with_retry(RetryPolicy::new(3, 100, 10.0, 250)),
    );

    let id = engine.submit(definition, "alice", json!({})).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.step("call").map(|s| s.attempts), Some(4));
    assert!(state.error.as_deref().unwrap().contains("upstream unavailable"));

    let calls = invoker.calls_to("flaky");
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    // 100ms, then 1000ms capped to 250ms twice
    assert!(gaps[0] >= Duration::from_millis(100));
    assert!(gaps[1] >= Duration::from_millis(250));
    assert!(gaps[2] >= Duration::from_millis(250));
    assert!(gaps[1] < Duration::from_millis(1000));

    let mut failed = 0;
    let mut retrying = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkflowEvent::StepFailed { attempts, .. } => {
                failed += 1;
                assert_eq!(attempts, 4);
            }
            WorkflowEvent::StepRetrying { .. } => retrying += 1,
            _ => {}
        }
    }
    assert_eq!(failed, 1);
    assert_eq!(retrying, 3);
    assert_eq!(engine.metrics().step_retries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failure() {
    let invoker = ScriptedInvoker::new();
    invoker.script("flaky", vec![Reply::fail("blip"), Reply::ok("pong")]);
    let engine = engine_with(&invoker, EngineConfig::default());

    let definition = WorkflowDefinition::new("retry", "Retry").with_step(
        WorkflowStep::new("call", "flaky")
            .with_prompt("ping")
            .with_retry(RetryPolicy::new(2, 50, 2.0, 1000)),
    );

    let id = engine.submit(definition, "alice", json!({})).await.unwrap();
    let state = engine.wait(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    let step = state.step("call").unwrap();
    assert_eq!(step.attempts, 2);
    assert_eq!(step.output.as_deref(), Some("pong"));
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_counts_as_failure() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("slow", Reply::Delayed(Duration::from_secs(10), Box::new(Reply::ok("late"))));
    let engine = engine_with(&invoker, EngineConfig::default());

    let definition = WorkflowDefinition::new("timeout", "Timeout")
        .with_step(WorkflowStep::new("wait", "slow").with_prompt("x").with_timeout_ms(200));

    let id = engine.submit(definition, "alice", json!({})).await.unwrap();
    let state = engine.wait(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(state.step("wait").unwrap().error.as_deref().unwrap().contains("200ms"));
}

#[tokio::test]
async fn test_failure_skips_dependents_and_spares_independent_branches() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("broken", Reply::fail("boom"));
    let engine = engine_with(&invoker, EngineConfig::default());

    let definition = WorkflowDefinition::new("branches", "Branches")
        .with_step(WorkflowStep::new("a", "broken").with_prompt("a"))
        .with_step(WorkflowStep::new("b", "ok-agent").with_prompt("{{a}}").depends_on("a"))
        .with_step(WorkflowStep::new("b2", "ok-agent").with_prompt("{{b}}").depends_on("b"))
        .with_step(WorkflowStep::new("c", "ok-agent").with_prompt("independent"));

    let id = engine.submit(definition, "alice", json!({})).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.step_status("a"), Some(StepStatus::Failed));
    assert_eq!(state.step_status("b"), Some(StepStatus::Skipped));
    assert_eq!(state.step_status("b2"), Some(StepStatus::Skipped));
    assert_eq!(state.step_status("c"), Some(StepStatus::Completed));
    assert_eq!(state.progress, 100);

    let error = state.error.unwrap();
    assert!(error.contains("step 'a' failed"), "{}", error);
    assert!(error.contains("boom"), "{}", error);

    // Only the independent branch reached the healthy agent
    assert_eq!(invoker.call_count("ok-agent"), 1);
    assert_eq!(engine.metrics().steps_skipped, 2);
}

#[tokio::test]
async fn test_terminal_status_is_stable() {
    let invoker = ScriptedInvoker::new();
    let engine = engine_with(&invoker, EngineConfig::default());

    let id = engine
        .submit(draft_and_review(), "alice", json!({"topic": "ownership"}))
        .await
        .unwrap();
    let waited = engine.wait(&id).await.unwrap();
    let first = engine.get_status(&id).await.unwrap();
    let second = engine.get_status(&id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.status, waited.status);
    assert_eq!(
        engine.outputs(&id).await.unwrap()["review"],
        json!("review write about ownership")
    );
}

// ============================================================================
// Pause / resume / cancel
// ============================================================================

#[tokio::test]
async fn test_pause_lets_in_flight_step_finish_then_resume() {
    let invoker = ScriptedInvoker::new();
    let gate = Arc::new(Semaphore::new(0));
    invoker.script("writer", vec![Reply::gated(&gate, Reply::ok("the draft"))]);
    let engine = engine_with(&invoker, EngineConfig::default());

    let id = engine
        .submit(draft_and_review(), "alice", json!({"topic": "traits"}))
        .await
        .unwrap();
    eventually("draft to start", || invoker.call_count("writer") == 1).await;

    engine.pause(&id).await.unwrap();
    assert_eq!(engine.get_status(&id).await.unwrap().status, WorkflowStatus::Paused);
    assert!(matches!(engine.pause(&id).await, Err(OrchestratorError::State(_))));

    gate.add_permits(1);
    wait_for_step(&engine, &id, "draft", StepStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let paused = engine.get_status(&id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.step_status("review"), Some(StepStatus::Pending));
    assert_eq!(invoker.call_count("reviewer"), 0);

    engine.resume(&id).await.unwrap();
    assert!(matches!(engine.resume(&id).await, Err(OrchestratorError::State(_))));

    let state = engine.wait(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(invoker.calls_to("reviewer")[0].input, "review the draft");
}

#[tokio::test]
async fn test_cancel_preserves_in_flight_result() {
    let invoker = ScriptedInvoker::new();
    let gate = Arc::new(Semaphore::new(0));
    invoker.script("writer", vec![Reply::gated(&gate, Reply::ok("the draft"))]);
    let engine = engine_with(&invoker, EngineConfig::default());

    let id = engine
        .submit(draft_and_review(), "alice", json!({"topic": "lifetimes"}))
        .await
        .unwrap();
    eventually("draft to start", || invoker.call_count("writer") == 1).await;

    engine.cancel(&id).await.unwrap();
    // Cancellation is pending; no further transitions are accepted
    assert!(matches!(engine.pause(&id).await, Err(OrchestratorError::State(_))));

    gate.add_permits(1);
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Cancelled);
    let draft = state.step("draft").unwrap();
    assert_eq!(draft.status, StepStatus::Completed);
    assert_eq!(draft.output.as_deref(), Some("the draft"));
    assert_eq!(state.step_status("review"), Some(StepStatus::Cancelled));
    assert_eq!(invoker.call_count("reviewer"), 0);

    assert!(matches!(engine.cancel(&id).await, Err(OrchestratorError::State(_))));
    assert!(matches!(engine.resume(&id).await, Err(OrchestratorError::State(_))));
    assert_eq!(engine.metrics().cancelled, 1);
}

#[tokio::test]
async fn test_cancel_paused_execution() {
    let invoker = ScriptedInvoker::new();
    let gate = Arc::new(Semaphore::new(0));
    invoker.script("writer", vec![Reply::gated(&gate, Reply::ok("the draft"))]);
    let engine = engine_with(&invoker, EngineConfig::default());

    let id = engine
        .submit(draft_and_review(), "alice", json!({"topic": "macros"}))
        .await
        .unwrap();
    eventually("draft to start", || invoker.call_count("writer") == 1).await;
    engine.pause(&id).await.unwrap();
    gate.add_permits(1);
    wait_for_step(&engine, &id, "draft", StepStatus::Completed).await;

    engine.cancel(&id).await.unwrap();
    let state = engine.wait(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(state.step_status("review"), Some(StepStatus::Cancelled));
}

#[tokio::test]
async fn test_cancel_stops_retries_waiting_on_backoff() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("flaky", Reply::fail("upstream unavailable"));
    let engine = engine_with(&invoker, EngineConfig::default());

    let definition = WorkflowDefinition::new("retry", "Retry").with_step(
        WorkflowStep::new("call", "flaky")
            .with_prompt("ping")
            .with_retry(RetryPolicy::new(3, 1_000, 2.0, 10_000)),
    );
    let id = engine.submit(definition, "alice", json!({})).await.unwrap();
    eventually("first attempt", || invoker.call_count("flaky") == 1).await;

    let cancelled_at = std::time::Instant::now();
    engine.cancel(&id).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    // Finished without sitting out the 1s backoff, and no retry was launched
    assert!(cancelled_at.elapsed() < Duration::from_millis(1_000));
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(invoker.call_count("flaky"), 1);

    let step = state.step("call").unwrap();
    assert_eq!(step.attempts, 1);
    assert!(step.error.as_deref().unwrap().contains("upstream unavailable"));
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test]
async fn test_queue_admission_and_capacity() {
    let invoker = ScriptedInvoker::new();
    let gate = Arc::new(Semaphore::new(0));
    invoker.set_default("writer", Reply::gated(&gate, Reply::ok("done")));
    let engine = engine_with(
        &invoker,
        EngineConfig::default()
            .with_max_concurrent_workflows(1)
            .with_max_queue_size(1),
    );

    let first = engine.submit(single_step("writer"), "alice", json!({})).await.unwrap();
    eventually("first workflow to start", || invoker.call_count("writer") == 1).await;

    let second = engine.submit(single_step("writer"), "bob", json!({})).await.unwrap();
    assert_eq!(engine.get_status(&second).await.unwrap().status, WorkflowStatus::Queued);

    let rejected = engine.submit(single_step("writer"), "carol", json!({})).await;
    assert!(matches!(rejected, Err(OrchestratorError::Capacity(_))));

    // Cancelling a queued execution frees its queue slot immediately
    engine.cancel(&second).await.unwrap();
    let cancelled = engine.wait(&second).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert_eq!(cancelled.step_status("only"), Some(StepStatus::Cancelled));

    let third = engine.submit(single_step("writer"), "dave", json!({})).await.unwrap();
    assert_eq!(engine.get_status(&third).await.unwrap().status, WorkflowStatus::Queued);

    gate.add_permits(2);
    assert_eq!(engine.wait(&first).await.unwrap().status, WorkflowStatus::Completed);
    assert_eq!(engine.wait(&third).await.unwrap().status, WorkflowStatus::Completed);
    assert_eq!(invoker.call_count("writer"), 2);

    let metrics = engine.metrics();
    assert_eq!(metrics.submitted, 3);
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.queued, 2);
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.cancelled, 1);
}
