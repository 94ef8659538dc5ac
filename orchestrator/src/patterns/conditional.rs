//! Conditional pattern: run the first task whose condition holds, falling
//! back to the first task without a condition

use super::condition::Condition;
use super::{describe_failure, OrchestrationRequest, Orchestrator, PatternOutcome};
use crate::error::Result;

pub(crate) async fn run(orch: &Orchestrator, request: &OrchestrationRequest) -> Result<PatternOutcome> {
    // Parse every guard up front so a typo fails before any agent call
    let guards = request
        .tasks
        .iter()
        .map(|task| task.condition.as_deref().map(Condition::parse).transpose())
        .collect::<Result<Vec<Option<Condition>>>>()?;

    let matched = request
        .tasks
        .iter()
        .zip(&guards)
        .find(|(_, guard)| guard.as_ref().is_some_and(|g| g.evaluate(&request.context)))
        .or_else(|| {
            request
                .tasks
                .iter()
                .zip(&guards)
                .find(|(_, guard)| guard.is_none())
        })
        .map(|(task, _)| task);

    let Some(task) = matched else {
        tracing::debug!("No conditional task matched");
        return Ok(PatternOutcome::completed(Vec::new()));
    };
    tracing::debug!(task_id = %task.id, "Conditional task selected");

    let result = orch
        .run_task(task, &task.id, &request.context, request.options.timeout_ms)
        .await;
    if result.success {
        Ok(PatternOutcome::completed(vec![result]))
    } else {
        let error = describe_failure(&result);
        Ok(PatternOutcome::failed(vec![result], error))
    }
}
