//! Self-critique protocol
//!
//! generate -> evaluate -> improve, until the output scores above the stop
//! threshold or `max_iterations` runs out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{extract_json_object, CollaborationStatus};
use crate::config::CritiqueDefaults;
use crate::error::{OrchestratorError, Result};
use crate::events::{CritiqueEvent, EventBus, EventReceiver};
use crate::invoker::{invoke_with_timeout, AgentInvoker, InvokeOptions};
use crate::metrics::CollaborationMetrics;
use crate::patterns::TaskResult;
use crate::prompts::critique::evaluation_prompt;
use crate::prompts::{EVALUATOR_SYSTEM_PROMPT, IMPROVEMENT_TEMPLATE};
use crate::template::{PlaceholderResolver, TemplateResolver};

/// Score used when the evaluator fails or replies with something unusable
pub const NEUTRAL_SCORE: f64 = 0.5;

const MAX_ITERATIONS_CAP: u32 = 10;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCriterion {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub evaluation_prompt: String,
    pub weight: f64,
    pub threshold: f64,
}

impl QualityCriterion {
    pub fn new(name: impl Into<String>, weight: f64, threshold: f64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            evaluation_prompt: String::new(),
            weight,
            threshold,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_evaluation_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.evaluation_prompt = prompt.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfCritiqueConfig {
    pub max_iterations: u32,
    pub quality_criteria: Vec<QualityCriterion>,
    /// Stop once the overall score reaches this; when unset, stop once every
    /// criterion meets its own threshold
    #[serde(default)]
    pub stop_on_quality_threshold: Option<f64>,
    /// Agent that scores the output (defaults to the generating agent)
    #[serde(default)]
    pub evaluator_agent: Option<String>,
    /// Replaces the default improvement prompt
    #[serde(default)]
    pub improvement_template: Option<String>,
    /// Per-call timeout for generation and evaluation
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SelfCritiqueConfig {
    pub fn new(quality_criteria: Vec<QualityCriterion>) -> Self {
        Self::from_defaults(&CritiqueDefaults::default(), quality_criteria)
    }

    pub fn from_defaults(defaults: &CritiqueDefaults, quality_criteria: Vec<QualityCriterion>) -> Self {
        Self {
            max_iterations: defaults.max_iterations,
            quality_criteria,
            stop_on_quality_threshold: None,
            evaluator_agent: None,
            improvement_template: None,
            timeout_ms: defaults.iteration_timeout_ms,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_stop_threshold(mut self, threshold: f64) -> Self {
        self.stop_on_quality_threshold = Some(threshold);
        self
    }

    pub fn with_evaluator(mut self, agent: impl Into<String>) -> Self {
        self.evaluator_agent = Some(agent.into());
        self
    }

    pub fn with_improvement_template(mut self, template: impl Into<String>) -> Self {
        self.improvement_template = Some(template.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ITERATIONS_CAP).contains(&self.max_iterations) {
            return Err(OrchestratorError::Validation(format!(
                "max_iterations must be within 1..={}, got {}",
                MAX_ITERATIONS_CAP, self.max_iterations
            )));
        }
        if self.quality_criteria.is_empty() {
            return Err(OrchestratorError::Validation(
                "self-critique needs at least one quality criterion".to_string(),
            ));
        }
        for criterion in &self.quality_criteria {
            if !(criterion.weight > 0.0 && criterion.weight.is_finite()) {
                return Err(OrchestratorError::Validation(format!(
                    "criterion '{}' weight must be > 0",
                    criterion.name
                )));
            }
            if !(0.0..=1.0).contains(&criterion.threshold) {
                return Err(OrchestratorError::Validation(format!(
                    "criterion '{}' threshold must be within [0, 1]",
                    criterion.name
                )));
            }
        }
        if let Some(threshold) = self.stop_on_quality_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(OrchestratorError::Validation(format!(
                    "stop_on_quality_threshold must be within [0, 1], got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub overall_score: f64,
    pub criteria_scores: BTreeMap<String, f64>,
    pub feedback: String,
    pub suggestions: Vec<String>,
    /// Every criterion reached its own threshold
    pub meets_threshold: bool,
}

impl Critique {
    fn neutral(feedback: impl Into<String>) -> Self {
        Self {
            overall_score: NEUTRAL_SCORE,
            criteria_scores: BTreeMap::new(),
            feedback: feedback.into(),
            suggestions: Vec::new(),
            meets_threshold: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueIteration {
    pub iteration: u32,
    pub output: String,
    pub critique: Critique,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfCritiqueResult {
    pub id: String,
    pub status: CollaborationStatus,
    pub iterations: Vec<CritiqueIteration>,
    #[serde(default)]
    pub final_output: Option<String>,
    pub final_score: f64,
    pub converged: bool,
    pub task_results: Vec<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Weighted mean of criterion scores. A criterion without a score counts as
/// 0 but keeps its weight in the denominator.
pub fn calculate_overall_score(criteria: &[QualityCriterion], scores: &BTreeMap<String, f64>) -> f64 {
    let total_weight: f64 = criteria.iter().map(|c| c.weight).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = criteria
        .iter()
        .map(|c| scores.get(&c.name).copied().unwrap_or(0.0) * c.weight)
        .sum();
    weighted / total_weight
}

fn meets_every_threshold(criteria: &[QualityCriterion], scores: &BTreeMap<String, f64>) -> bool {
    criteria
        .iter()
        .all(|c| scores.get(&c.name).is_some_and(|s| *s >= c.threshold))
}

/// Parse an evaluator reply. `None` when it carries no usable scores.
fn parse_critique(content: &str, criteria: &[QualityCriterion]) -> Option<Critique> {
    let value = extract_json_object(content)?;
    let raw_scores = value
        .get("criteriaScores")
        .or_else(|| value.get("criteria_scores"))?
        .as_object()?;

    let criteria_scores: BTreeMap<String, f64> = raw_scores
        .iter()
        .filter_map(|(name, score)| {
            let score = score.as_f64().filter(|s| s.is_finite())?;
            Some((name.clone(), score.clamp(0.0, 1.0)))
        })
        .collect();
    if criteria_scores.is_empty() {
        return None;
    }

    let feedback = value
        .get("feedback")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let suggestions = value
        .get("suggestions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Some(Critique {
        overall_score: calculate_overall_score(criteria, &criteria_scores),
        meets_threshold: meets_every_threshold(criteria, &criteria_scores),
        criteria_scores,
        feedback,
        suggestions,
    })
}

// ============================================================================
// Protocol
// ============================================================================

/// Runs self-critique loops against an agent invoker
pub struct SelfCritique {
    invoker: Arc<dyn AgentInvoker>,
    templates: Arc<dyn TemplateResolver>,
    events: EventBus<CritiqueEvent>,
    metrics: Mutex<CollaborationMetrics>,
}

impl SelfCritique {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self::with_templates(invoker, Arc::new(PlaceholderResolver::new()))
    }

    pub fn with_templates(invoker: Arc<dyn AgentInvoker>, templates: Arc<dyn TemplateResolver>) -> Self {
        Self {
            invoker,
            templates,
            events: EventBus::new(),
            metrics: Mutex::new(CollaborationMetrics::default()),
        }
    }

    pub fn subscribe(&self, critique_id: &str) -> EventReceiver<CritiqueEvent> {
        self.events.subscribe(critique_id)
    }

    pub fn subscribe_all(&self) -> EventReceiver<CritiqueEvent> {
        self.events.subscribe_all()
    }

    pub fn metrics(&self) -> CollaborationMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub async fn run(&self, agent: &str, task: &str, config: &SelfCritiqueConfig) -> Result<SelfCritiqueResult> {
        let id = uuid::Uuid::new_v4().to_string();
        self.run_with_id(&id, agent, task, config).await
    }

    pub async fn run_with_id(
        &self,
        critique_id: &str,
        agent: &str,
        task: &str,
        config: &SelfCritiqueConfig,
    ) -> Result<SelfCritiqueResult> {
        config.validate()?;
        if task.trim().is_empty() {
            return Err(OrchestratorError::Validation("self-critique task is empty".to_string()));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let mut iterations: Vec<CritiqueIteration> = Vec::new();
        let mut task_results: Vec<TaskResult> = Vec::new();
        let mut converged = false;
        let mut error = None;

        tracing::info!(
            critique_id = %critique_id,
            agent = agent,
            max_iterations = config.max_iterations,
            "Starting self-critique"
        );

        for iteration in 1..=config.max_iterations {
            let iteration_start = Instant::now();

            let prompt = match iterations.last() {
                None => task.to_string(),
                Some(previous) => match self.improvement_prompt(task, iteration, previous, config).await {
                    Ok(prompt) => prompt,
                    Err(e) => {
                        error = Some(format!("iteration {}: {}", iteration, e));
                        break;
                    }
                },
            };

            let options = InvokeOptions::new()
                .with_timeout_ms(config.timeout_ms)
                .with_metadata("critique_id", critique_id)
                .with_metadata("iteration", iteration.to_string());
            let response =
                invoke_with_timeout(self.invoker.as_ref(), agent, &prompt, &options, config.timeout_ms).await;
            task_results.push(TaskResult {
                task_id: format!("iteration-{}:generate", iteration),
                agent: agent.to_string(),
                success: response.success,
                result: response.result.clone().filter(|_| response.success),
                error: (!response.success).then(|| response.error_message()),
                duration_ms: response.duration_ms,
            });
            if !response.success {
                error = Some(format!(
                    "generation failed in iteration {}: {}",
                    iteration,
                    response.error_message()
                ));
                break;
            }
            let output = response.output().to_string();

            let critique = self
                .evaluate_output(critique_id, iteration, agent, task, &output, config, &mut task_results)
                .await;

            self.events.publish(CritiqueEvent::Iteration {
                critique_id: critique_id.to_string(),
                iteration,
                overall_score: critique.overall_score,
                meets_threshold: critique.meets_threshold,
            });
            tracing::info!(
                critique_id = %critique_id,
                iteration,
                overall_score = critique.overall_score,
                meets_threshold = critique.meets_threshold,
                "Iteration evaluated"
            );

            let done = match config.stop_on_quality_threshold {
                Some(threshold) => critique.overall_score >= threshold,
                None => critique.meets_threshold,
            };
            let score = critique.overall_score;
            iterations.push(CritiqueIteration {
                iteration,
                output,
                critique,
                duration_ms: iteration_start.elapsed().as_millis() as u64,
            });

            if done {
                converged = true;
                self.events.publish(CritiqueEvent::Converged {
                    critique_id: critique_id.to_string(),
                    iteration,
                    score,
                });
                break;
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let final_score = iterations.last().map_or(0.0, |i| i.critique.overall_score);
        let status = match &error {
            Some(message) => {
                tracing::warn!(critique_id = %critique_id, "Self-critique failed: {}", message);
                self.events.publish(CritiqueEvent::Error {
                    critique_id: critique_id.to_string(),
                    message: message.clone(),
                });
                CollaborationStatus::Failed
            }
            None => {
                tracing::info!(
                    critique_id = %critique_id,
                    converged,
                    iterations = iterations.len(),
                    final_score,
                    "Self-critique completed"
                );
                self.events.publish(CritiqueEvent::Completed {
                    critique_id: critique_id.to_string(),
                    converged,
                    iterations: iterations.len() as u32,
                    final_score,
                });
                CollaborationStatus::Completed
            }
        };

        self.metrics.lock().unwrap().record_run(
            converged,
            error.is_some(),
            iterations.len() as u64,
            final_score,
            duration_ms,
        );

        Ok(SelfCritiqueResult {
            id: critique_id.to_string(),
            status,
            final_output: iterations.last().map(|i| i.output.clone()),
            final_score,
            converged,
            iterations,
            task_results,
            error,
            duration_ms,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Score `output`. Never fails: an evaluator failure or unusable reply
    /// yields the neutral score.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_output(
        &self,
        critique_id: &str,
        iteration: u32,
        agent: &str,
        task: &str,
        output: &str,
        config: &SelfCritiqueConfig,
        task_results: &mut Vec<TaskResult>,
    ) -> Critique {
        let evaluator = config.evaluator_agent.as_deref().unwrap_or(agent);
        let prompt = evaluation_prompt(task, output, &config.quality_criteria);
        let options = InvokeOptions::new()
            .with_system_prompt(EVALUATOR_SYSTEM_PROMPT)
            .with_timeout_ms(config.timeout_ms)
            .with_metadata("critique_id", critique_id)
            .with_metadata("iteration", iteration.to_string());
        let response =
            invoke_with_timeout(self.invoker.as_ref(), evaluator, &prompt, &options, config.timeout_ms).await;
        task_results.push(TaskResult {
            task_id: format!("iteration-{}:evaluate", iteration),
            agent: evaluator.to_string(),
            success: response.success,
            result: response.result.clone().filter(|_| response.success),
            error: (!response.success).then(|| response.error_message()),
            duration_ms: response.duration_ms,
        });

        if !response.success {
            tracing::warn!(
                critique_id = %critique_id,
                iteration,
                "Evaluator failed, using neutral score: {}",
                response.error_message()
            );
            return Critique::neutral(format!("evaluation failed: {}", response.error_message()));
        }
        parse_critique(response.output(), &config.quality_criteria).unwrap_or_else(|| {
            tracing::warn!(
                critique_id = %critique_id,
                iteration,
                "Unparseable evaluator reply, using neutral score"
            );
            Critique::neutral("evaluator reply could not be parsed")
        })
    }

    async fn improvement_prompt(
        &self,
        task: &str,
        iteration: u32,
        previous: &CritiqueIteration,
        config: &SelfCritiqueConfig,
    ) -> Result<String> {
        let template = config
            .improvement_template
            .as_deref()
            .unwrap_or(IMPROVEMENT_TEMPLATE);
        let criteria_scores = config
            .quality_criteria
            .iter()
            .map(|c| {
                let score = previous
                    .critique
                    .criteria_scores
                    .get(&c.name)
                    .map_or_else(|| "not scored".to_string(), |s| format!("{:.2}", s));
                format!("- {}: {} (threshold {})", c.name, score, c.threshold)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let suggestions = previous
            .critique
            .suggestions
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n");
        let variables = json!({
            "task": task,
            "previous_output": previous.output,
            "feedback": previous.critique.feedback,
            "criteria_scores": criteria_scores,
            "suggestions": suggestions,
            "overall_score": previous.critique.overall_score,
            "iteration": iteration,
        });
        self.templates.resolve(template, &variables).await.into_result()
    }
}
