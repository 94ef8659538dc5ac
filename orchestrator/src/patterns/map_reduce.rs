//! Map-reduce pattern
//!
//! Task `map` runs once per item with `_item` (and `_index`) bound; when every
//! map call succeeds, task `reduce` runs once with `_mapResults` bound to the
//! map outputs in item order. Without a `reduce` task the map results are
//! the whole result.

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};

use super::{bind, describe_failure, OrchestrationRequest, Orchestrator, PatternOutcome, TaskResult};
use crate::error::{OrchestratorError, Result};

pub(crate) async fn run(orch: &Orchestrator, request: &OrchestrationRequest) -> Result<PatternOutcome> {
    let map_task = request.task("map").ok_or_else(|| {
        OrchestratorError::Validation("map-reduce requires a task with id 'map'".to_string())
    })?;
    let items = &request.options.items;
    if items.is_empty() {
        return Err(OrchestratorError::Validation(
            "map-reduce requires at least one item".to_string(),
        ));
    }

    let limit = request.options.max_parallel.unwrap_or(items.len()).max(1);
    let timeout_ms = request.options.timeout_ms;

    let map_results: Vec<TaskResult> = stream::iter(items.iter().enumerate())
        .map(|(index, item)| {
            let variables = bind(&bind(&request.context, "_item", item.clone()), "_index", json!(index));
            async move {
                orch.run_task(map_task, &format!("map[{}]", index), &variables, timeout_ms)
                    .await
            }
        })
        .buffered(limit)
        .collect()
        .await;

    let failures: Vec<String> = map_results
        .iter()
        .filter(|r| !r.success)
        .map(describe_failure)
        .collect();
    if !failures.is_empty() {
        let error = format!(
            "map phase failed: {} of {} items failed ({})",
            failures.len(),
            map_results.len(),
            failures.join("; ")
        );
        return Ok(PatternOutcome::failed(map_results, error));
    }

    let Some(reduce_task) = request.task("reduce") else {
        tracing::debug!("No reduce task, returning map results");
        return Ok(PatternOutcome::completed(map_results));
    };

    let outputs: Vec<Value> = map_results
        .iter()
        .map(|r| Value::String(r.output().to_string()))
        .collect();
    let variables = bind(&request.context, "_mapResults", Value::Array(outputs));
    let reduce_result = orch
        .run_task(reduce_task, &reduce_task.id, &variables, timeout_ms)
        .await;

    let mut task_results = map_results;
    if reduce_result.success {
        task_results.push(reduce_result);
        Ok(PatternOutcome::completed(task_results))
    } else {
        let error = format!("reduce phase failed: {}", describe_failure(&reduce_result));
        task_results.push(reduce_result);
        Ok(PatternOutcome::failed(task_results, error))
    }
}
