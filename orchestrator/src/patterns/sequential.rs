//! Sequential pattern: run tasks in order, stop at the first failure

use serde_json::{Map, Value};

use super::{bind, describe_failure, OrchestrationRequest, Orchestrator, PatternOutcome};
use crate::error::Result;

pub(crate) async fn run(orch: &Orchestrator, request: &OrchestrationRequest) -> Result<PatternOutcome> {
    let mut task_results = Vec::with_capacity(request.tasks.len());
    let mut results = Map::new();
    let mut previous = Value::Null;

    for task in &request.tasks {
        let variables = bind(
            &bind(&request.context, "previous_result", previous.clone()),
            "results",
            Value::Object(results.clone()),
        );

        let result = orch
            .run_task(task, &task.id, &variables, request.options.timeout_ms)
            .await;

        if !result.success {
            let error = describe_failure(&result);
            task_results.push(result);
            return Ok(PatternOutcome::failed(task_results, error));
        }

        previous = Value::String(result.output().to_string());
        results.insert(task.id.clone(), previous.clone());
        task_results.push(result);
    }

    Ok(PatternOutcome::completed(task_results))
}
