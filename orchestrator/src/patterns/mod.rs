//! Orchestration patterns over flat task lists
//!
//! Unlike the [`crate::engine::WorkflowEngine`], patterns keep no state
//! between calls: a request goes in, an [`OrchestrationResult`] comes out.
//!
//! - `sequential`: tasks in order, each sees the previous result
//! - `parallel`: every task at once (optionally bounded)
//! - `conditional`: first task whose condition holds
//! - `map-reduce`: task `map` per item, then task `reduce` over the outputs

pub mod condition;
mod conditional;
mod map_reduce;
mod parallel;
mod sequential;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};
use crate::invoker::{invoke_with_timeout, AgentInvoker, InvokeOptions};
use crate::metrics::PatternMetrics;
use crate::template::{PlaceholderResolver, TemplateResolver};

pub use condition::Condition;

// ============================================================================
// Request / result types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pattern {
    Sequential,
    Parallel,
    Conditional,
    MapReduce,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Sequential => "sequential",
            Pattern::Parallel => "parallel",
            Pattern::Conditional => "conditional",
            Pattern::MapReduce => "map-reduce",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in a pattern request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent: String,
    /// Prompt template, interpolated against the request context
    pub prompt: String,
    /// Guard expression (conditional pattern only)
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            prompt: prompt.into(),
            condition: None,
            system_prompt: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationOptions {
    /// Concurrency bound for parallel and map phases (unbounded when unset)
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Map-reduce input items
    #[serde(default)]
    pub items: Vec<Value>,
    /// Per-call timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub user_id: String,
    pub pattern: Pattern,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub options: OrchestrationOptions,
    /// Initial variables (a JSON object)
    #[serde(default)]
    pub context: Value,
}

impl OrchestrationRequest {
    pub fn new(user_id: impl Into<String>, pattern: Pattern, tasks: Vec<Task>) -> Self {
        Self {
            user_id: user_id.into(),
            pattern,
            tasks,
            options: OrchestrationOptions::default(),
            context: Value::Object(Map::new()),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_items(mut self, items: Vec<Value>) -> Self {
        self.options.items = items;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.options.max_parallel = Some(max);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    Completed,
    Failed,
}

/// Outcome of one agent call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskResult {
    fn failed(task_id: &str, agent: &str, error: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            success: false,
            result: None,
            error: Some(error),
            duration_ms: 0,
        }
    }

    pub fn output(&self) -> &str {
        self.result.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub id: String,
    pub pattern: Pattern,
    pub status: OrchestrationStatus,
    /// Every attempted call, in task (or item) order
    pub task_results: Vec<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// What a pattern run produced; `error` set means failed
pub(crate) struct PatternOutcome {
    pub task_results: Vec<TaskResult>,
    pub error: Option<String>,
}

impl PatternOutcome {
    fn completed(task_results: Vec<TaskResult>) -> Self {
        Self {
            task_results,
            error: None,
        }
    }

    fn failed(task_results: Vec<TaskResult>, error: String) -> Self {
        Self {
            task_results,
            error: Some(error),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs orchestration requests against an agent invoker
pub struct Orchestrator {
    invoker: Arc<dyn AgentInvoker>,
    templates: Arc<dyn TemplateResolver>,
    metrics: Mutex<PatternMetrics>,
}

impl Orchestrator {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            invoker,
            templates: Arc::new(PlaceholderResolver::new()),
            metrics: Mutex::new(PatternMetrics::default()),
        }
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateResolver>) -> Self {
        self.templates = templates;
        self
    }

    pub fn metrics(&self) -> PatternMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Run a request. Malformed requests fail with a validation error before
    /// any agent call; agent failures are reported in the result.
    pub async fn execute(&self, request: OrchestrationRequest) -> Result<OrchestrationResult> {
        validate_request(&request)?;

        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!(
            pattern = %request.pattern,
            tasks = request.tasks.len(),
            user_id = %request.user_id,
            "Starting orchestration"
        );

        let outcome = match request.pattern {
            Pattern::Sequential => sequential::run(self, &request).await?,
            Pattern::Parallel => parallel::run(self, &request).await?,
            Pattern::Conditional => conditional::run(self, &request).await?,
            Pattern::MapReduce => map_reduce::run(self, &request).await?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let status = if outcome.error.is_some() {
            OrchestrationStatus::Failed
        } else {
            OrchestrationStatus::Completed
        };
        self.metrics.lock().unwrap().record_run(
            request.pattern.as_str(),
            status == OrchestrationStatus::Completed,
            outcome.task_results.len() as u64,
            duration_ms,
        );
        match &outcome.error {
            Some(error) => tracing::warn!(pattern = %request.pattern, "Orchestration failed: {}", error),
            None => tracing::info!(pattern = %request.pattern, duration_ms, "Orchestration completed"),
        }

        Ok(OrchestrationResult {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: request.pattern,
            status,
            task_results: outcome.task_results,
            error: outcome.error,
            duration_ms,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Interpolate the task prompt and call its agent. Never fails: template
    /// and agent errors come back as a failed [`TaskResult`].
    pub(crate) async fn run_task(
        &self,
        task: &Task,
        result_id: &str,
        variables: &Value,
        timeout_ms: Option<u64>,
    ) -> TaskResult {
        let prompt = match self.templates.resolve(&task.prompt, variables).await.into_result() {
            Ok(prompt) => prompt,
            Err(e) => return TaskResult::failed(result_id, &task.agent, e.to_string()),
        };

        let mut options = InvokeOptions::new()
            .with_timeout_ms(timeout_ms)
            .with_metadata("task_id", result_id);
        if let Some(system_prompt) = &task.system_prompt {
            options = options.with_system_prompt(system_prompt.as_str());
        }

        tracing::debug!(task_id = %result_id, agent = %task.agent, "Running task");
        let response =
            invoke_with_timeout(self.invoker.as_ref(), &task.agent, &prompt, &options, timeout_ms).await;

        TaskResult {
            task_id: result_id.to_string(),
            agent: task.agent.clone(),
            success: response.success,
            error: (!response.success).then(|| response.error_message()),
            result: response.result.filter(|_| response.success),
            duration_ms: response.duration_ms,
        }
    }
}

fn validate_request(request: &OrchestrationRequest) -> Result<()> {
    if request.tasks.is_empty() {
        return Err(OrchestratorError::Validation(
            "orchestration request has no tasks".to_string(),
        ));
    }
    for task in &request.tasks {
        if task.prompt.trim().is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "task '{}' has an empty prompt",
                task.id
            )));
        }
    }
    if !(request.context.is_object() || request.context.is_null()) {
        return Err(OrchestratorError::Validation(
            "orchestration context must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

/// Copy of `base` (an object, or null) with `key` set to `value`
pub(crate) fn bind(base: &Value, key: &str, value: Value) -> Value {
    let mut vars = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    vars.insert(key.to_string(), value);
    Value::Object(vars)
}

/// "task 'x' failed: <error>"
pub(crate) fn describe_failure(result: &TaskResult) -> String {
    format!(
        "task '{}' failed: {}",
        result.task_id,
        result.error.as_deref().unwrap_or("unknown error")
    )
}
