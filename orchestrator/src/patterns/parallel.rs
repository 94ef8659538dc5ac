//! Parallel pattern: run every task concurrently, fail if any failed

use futures_util::stream::{self, StreamExt};

use super::{describe_failure, OrchestrationRequest, Orchestrator, PatternOutcome, TaskResult};
use crate::error::Result;

pub(crate) async fn run(orch: &Orchestrator, request: &OrchestrationRequest) -> Result<PatternOutcome> {
    let limit = request
        .options
        .max_parallel
        .unwrap_or(request.tasks.len())
        .max(1);

    // `buffered` keeps results in task order regardless of completion order
    let task_results: Vec<TaskResult> = stream::iter(request.tasks.iter())
        .map(|task| orch.run_task(task, &task.id, &request.context, request.options.timeout_ms))
        .buffered(limit)
        .collect()
        .await;

    let failures: Vec<String> = task_results
        .iter()
        .filter(|r| !r.success)
        .map(describe_failure)
        .collect();

    if failures.is_empty() {
        Ok(PatternOutcome::completed(task_results))
    } else {
        let error = format!(
            "{} of {} tasks failed: {}",
            failures.len(),
            task_results.len(),
            failures.join("; ")
        );
        Ok(PatternOutcome::failed(task_results, error))
    }
}
