//! Workflow definitions and execution state
//!
//! A [`WorkflowDefinition`] is a DAG of [`WorkflowStep`]s. Each scheduled run
//! gets a [`WorkflowExecutionState`], which is owned by the engine and only
//! changes through the transition methods below.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;

// ============================================================================
// Definition
// ============================================================================

/// A single step in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the definition; outputs are stored under this key
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Agent reference handed to the invoker
    pub agent: String,

    /// Inline prompt template (exclusive with `prompt_template_id`)
    #[serde(default)]
    pub prompt: Option<String>,

    /// Stored prompt template id (exclusive with `prompt`)
    #[serde(default)]
    pub prompt_template_id: Option<String>,

    /// Sibling step ids that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Per-attempt timeout, engine default when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent: agent.into(),
            prompt: None,
            prompt_template_id: None,
            dependencies: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
            system_prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.prompt_template_id = Some(template_id.into());
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Steps in definition order (ties inside a level keep this order)
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Load a definition from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Validation(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load a definition from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| OrchestratorError::Validation(e.to_string()))
    }
}

// ============================================================================
// Status enums
// ============================================================================

/// Error type for parsing statuses from strings
#[derive(Debug, Clone)]
pub struct ParseStatusError(String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid status: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self -> to`
    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(WorkflowStatus::Pending),
            "queued" => Ok(WorkflowStatus::Queued),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Status of one step within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }
}

// ============================================================================
// Execution state
// ============================================================================

/// Per-step progress inside an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// Persisted state of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionState {
    /// Execution id (distinct from the definition id)
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: WorkflowStatus,
    pub steps: BTreeMap<String, StepState>,
    #[serde(default)]
    pub in_flight: BTreeSet<String>,
    /// 0-100, share of steps in a terminal state
    #[serde(default)]
    pub progress: u8,
    /// Human-readable failure naming the failing step
    #[serde(default)]
    pub error: Option<String>,
    /// Definition snapshot, so the state alone is enough to resume
    pub definition: WorkflowDefinition,
    /// Initial context data supplied at submission
    #[serde(default)]
    pub input: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecutionState {
    /// Fresh pending state for a definition
    pub fn new(definition: WorkflowDefinition, user_id: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::default()))
            .collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            user_id: user_id.into(),
            status: WorkflowStatus::Pending,
            steps,
            in_flight: BTreeSet::new(),
            progress: 0,
            error: None,
            definition,
            input,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.get(step_id)
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|s| s.status)
    }

    /// Move the workflow to `to`, enforcing the state machine
    pub fn transition(&mut self, to: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::State(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        let now = Utc::now();
        if to == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn start_step(&mut self, step_id: &str) {
        let now = Utc::now();
        if let Some(step) = self.steps.get_mut(step_id) {
            step.status = StepStatus::Running;
            step.started_at = Some(now);
            step.error = None;
        }
        self.in_flight.insert(step_id.to_string());
        self.updated_at = now;
    }

    pub fn complete_step(&mut self, step_id: &str, output: String, attempts: u32, duration_ms: u64) {
        self.finish_step(step_id, StepStatus::Completed, attempts, duration_ms);
        if let Some(step) = self.steps.get_mut(step_id) {
            step.output = Some(output);
        }
    }

    pub fn fail_step(&mut self, step_id: &str, error: String, attempts: u32, duration_ms: u64) {
        self.finish_step(step_id, StepStatus::Failed, attempts, duration_ms);
        if let Some(step) = self.steps.get_mut(step_id) {
            step.error = Some(error);
        }
    }

    fn finish_step(&mut self, step_id: &str, status: StepStatus, attempts: u32, duration_ms: u64) {
        let now = Utc::now();
        if let Some(step) = self.steps.get_mut(step_id) {
            step.status = status;
            step.attempts = attempts;
            step.completed_at = Some(now);
            step.duration_ms = Some(duration_ms);
        }
        self.in_flight.remove(step_id);
        self.updated_at = now;
        self.recompute_progress();
    }

    /// Mark a not-yet-started step skipped because `cause` failed
    pub fn skip_step(&mut self, step_id: &str, cause: &str) -> bool {
        match self.steps.get_mut(step_id) {
            Some(step) if step.status == StepStatus::Pending => {
                step.status = StepStatus::Skipped;
                step.error = Some(format!("dependency '{}' failed", cause));
                step.completed_at = Some(Utc::now());
                self.recompute_progress();
                true
            }
            _ => false,
        }
    }

    /// Mark every pending or running step cancelled, returning their ids
    pub fn cancel_unfinished_steps(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for (id, step) in self.steps.iter_mut() {
            if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                step.status = StepStatus::Cancelled;
                step.completed_at = Some(now);
                cancelled.push(id.clone());
            }
        }
        self.in_flight.clear();
        self.recompute_progress();
        cancelled
    }

    /// Prepare a state read back after a restart: steps that were in flight
    /// lost their results and go back to pending.
    pub fn reset_for_recovery(&mut self) {
        for step_id in std::mem::take(&mut self.in_flight) {
            if let Some(step) = self.steps.get_mut(&step_id) {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Pending;
                    step.started_at = None;
                }
            }
        }
        if matches!(self.status, WorkflowStatus::Running | WorkflowStatus::Queued) {
            self.status = WorkflowStatus::Pending;
        }
        self.updated_at = Utc::now();
    }

    fn recompute_progress(&mut self) {
        let total = self.steps.len();
        if total == 0 {
            self.progress = 100;
            return;
        }
        let done = self.steps.values().filter(|s| s.status.is_terminal()).count();
        self.progress = ((done * 100) / total) as u8;
    }

    pub fn all_steps_completed(&self) -> bool {
        self.steps.values().all(|s| s.status == StepStatus::Completed)
    }

    /// First permanently failed step in definition order
    pub fn first_failed_step(&self) -> Option<(&str, &StepState)> {
        self.definition.steps.iter().find_map(|def| {
            self.steps
                .get(&def.id)
                .filter(|s| s.status == StepStatus::Failed)
                .map(|s| (def.id.as_str(), s))
        })
    }

    /// Wall-clock duration from start to completion (or now)
    pub fn duration_ms(&self) -> u64 {
        match self.started_at {
            Some(start) => {
                let end = self.completed_at.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as u64
            }
            None => 0,
        }
    }
}

/// Filter for listing executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub user_id: Option<String>,
    pub workflow_id: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, state: &WorkflowExecutionState) -> bool {
        self.user_id.as_ref().map_or(true, |u| &state.user_id == u)
            && self.workflow_id.as_ref().map_or(true, |w| &state.workflow_id == w)
            && self.status.map_or(true, |s| state.status == s)
    }
}
