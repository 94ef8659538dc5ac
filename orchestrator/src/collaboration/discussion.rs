//! Discussion protocol
//!
//! Participants are invoked concurrently once per round. Their replies are
//! folded back in participant order, reduced to a consensus score (or scored
//! by a facilitator agent), and the loop stops as soon as the score history
//! converges or `max_rounds` is reached.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::consensus::{check_convergence, evaluate_consensus, ConsensusStrategy};
use super::{extract_json_object, CollaborationStatus};
use crate::config::DiscussionDefaults;
use crate::error::{OrchestratorError, Result};
use crate::events::{DiscussionEvent, EventBus, EventReceiver};
use crate::invoker::{invoke_with_timeout, AgentInvoker, InvokeOptions};
use crate::metrics::CollaborationMetrics;
use crate::patterns::TaskResult;
use crate::prompts::discussion::{facilitator_prompt, participant_prompt, PriorRound};
use crate::prompts::{FACILITATOR_SYSTEM_PROMPT, PARTICIPANT_SYSTEM_PROMPT};

static AGREEMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*_#>-]*agreement(?:[ _]?score)?[\s*_]*[:=]\s*([0-9]*\.?[0-9]+)")
        .expect("Invalid agreement regex")
});

// ============================================================================
// Configuration
// ============================================================================

/// One discussion participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub agent_id: String,
    /// Distinct id when the same agent takes part twice (defaults to the agent id)
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub perspective: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl Participant {
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            id: None,
            role: role.into(),
            weight: default_weight(),
            perspective: None,
            system_prompt: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_perspective(mut self, perspective: impl Into<String>) -> Self {
        self.perspective = Some(perspective.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn participant_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.agent_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionConfig {
    pub max_rounds: u32,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub consensus_strategy: ConsensusStrategy,
    pub convergence_threshold: f64,
    #[serde(default)]
    pub facilitator_agent_id: Option<String>,
    /// Per-call timeout for every invocation in a round
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl DiscussionConfig {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self::from_defaults(&DiscussionDefaults::default(), participants)
    }

    /// Start from configured defaults
    pub fn from_defaults(defaults: &DiscussionDefaults, participants: Vec<Participant>) -> Self {
        Self {
            max_rounds: defaults.max_rounds,
            participants,
            consensus_strategy: ConsensusStrategy::default(),
            convergence_threshold: defaults.convergence_threshold,
            facilitator_agent_id: None,
            timeout_ms: defaults.round_timeout_ms,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_strategy(mut self, strategy: ConsensusStrategy) -> Self {
        self.consensus_strategy = strategy;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    pub fn with_facilitator(mut self, agent_id: impl Into<String>) -> Self {
        self.facilitator_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(OrchestratorError::Validation(
                "discussion needs at least one participant".to_string(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(OrchestratorError::Validation(
                "max_rounds must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.convergence_threshold) {
            return Err(OrchestratorError::Validation(format!(
                "convergence_threshold must be within [0, 1], got {}",
                self.convergence_threshold
            )));
        }
        let mut seen = HashSet::new();
        for participant in &self.participants {
            if !(participant.weight > 0.0) || !participant.weight.is_finite() {
                return Err(OrchestratorError::Validation(format!(
                    "participant '{}' weight must be > 0",
                    participant.participant_id()
                )));
            }
            if !seen.insert(participant.participant_id()) {
                return Err(OrchestratorError::Validation(format!(
                    "duplicate participant '{}'",
                    participant.participant_id()
                )));
            }
        }
        if self.consensus_strategy == ConsensusStrategy::Facilitator
            && self.facilitator_agent_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(OrchestratorError::Validation(
                "facilitator strategy requires facilitator_agent_id".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub participant_id: String,
    pub role: String,
    pub content: String,
    /// Self-reported agreement; `None` excludes the contribution from scoring
    #[serde(default)]
    pub agreement_score: Option<f64>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionRound {
    pub round: u32,
    pub contributions: Vec<Contribution>,
    #[serde(default)]
    pub synthesis: Option<String>,
    #[serde(default)]
    pub agreements: Vec<String>,
    #[serde(default)]
    pub disagreements: Vec<String>,
    pub consensus_score: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub role: String,
    pub contributions: u32,
    pub failures: u32,
    pub average_agreement: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionResult {
    pub id: String,
    pub topic: String,
    pub status: CollaborationStatus,
    pub rounds: Vec<DiscussionRound>,
    pub converged: bool,
    /// Latest synthesis, or the latest contributions when there is none
    #[serde(default)]
    pub final_consensus: Option<String>,
    pub consensus_score: f64,
    pub participant_summaries: Vec<ParticipantSummary>,
    /// Every agent call, in round then participant order
    pub task_results: Vec<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Facilitator reply after one round
#[derive(Debug, Clone, Deserialize)]
struct FacilitatorReport {
    #[serde(default)]
    synthesis: String,
    #[serde(alias = "consensusScore")]
    consensus_score: f64,
    #[serde(default)]
    agreements: Vec<String>,
    #[serde(default)]
    disagreements: Vec<String>,
}

/// Self-reported agreement: a JSON `agreementScore` / `agreement_score`
/// field, or an `Agreement: 0.x` line. Clamped to [0, 1].
pub fn parse_agreement_score(content: &str) -> Option<f64> {
    let from_json = extract_json_object(content).and_then(|value| {
        value
            .get("agreementScore")
            .or_else(|| value.get("agreement_score"))
            .and_then(|v| v.as_f64())
    });
    let score = from_json.or_else(|| {
        AGREEMENT_REGEX
            .captures_iter(content)
            .last()
            .and_then(|caps| caps[1].parse::<f64>().ok())
    })?;
    score.is_finite().then(|| score.clamp(0.0, 1.0))
}

/// Facilitator reply, or `None` when it is not JSON or its score lies
/// outside [0, 1]
fn parse_facilitator_report(content: &str) -> Option<FacilitatorReport> {
    let value = extract_json_object(content)?;
    let report: FacilitatorReport = serde_json::from_value(value).ok()?;
    (0.0..=1.0).contains(&report.consensus_score).then_some(report)
}

// ============================================================================
// Protocol
// ============================================================================

/// Runs discussions against an agent invoker
pub struct Discussion {
    invoker: Arc<dyn AgentInvoker>,
    events: EventBus<DiscussionEvent>,
    metrics: Mutex<CollaborationMetrics>,
}

impl Discussion {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            invoker,
            events: EventBus::new(),
            metrics: Mutex::new(CollaborationMetrics::default()),
        }
    }

    pub fn subscribe(&self, discussion_id: &str) -> EventReceiver<DiscussionEvent> {
        self.events.subscribe(discussion_id)
    }

    pub fn subscribe_all(&self) -> EventReceiver<DiscussionEvent> {
        self.events.subscribe_all()
    }

    pub fn metrics(&self) -> CollaborationMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Run a discussion under a fresh id
    pub async fn run(&self, topic: &str, config: &DiscussionConfig) -> Result<DiscussionResult> {
        let id = uuid::Uuid::new_v4().to_string();
        self.run_with_id(&id, topic, config).await
    }

    /// Run a discussion under a caller-chosen id, so events can be
    /// subscribed to before the first round starts
    pub async fn run_with_id(
        &self,
        discussion_id: &str,
        topic: &str,
        config: &DiscussionConfig,
    ) -> Result<DiscussionResult> {
        config.validate()?;
        if topic.trim().is_empty() {
            return Err(OrchestratorError::Validation("discussion topic is empty".to_string()));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let mut rounds: Vec<DiscussionRound> = Vec::new();
        let mut scores: Vec<f64> = Vec::new();
        let mut task_results: Vec<TaskResult> = Vec::new();
        // Failed calls per participant, by index
        let mut failures = vec![0u32; config.participants.len()];
        let mut converged = false;
        let mut error = None;

        tracing::info!(
            discussion_id = %discussion_id,
            participants = config.participants.len(),
            strategy = ?config.consensus_strategy,
            "Starting discussion"
        );

        for round in 1..=config.max_rounds {
            self.events.publish(DiscussionEvent::RoundStarted {
                discussion_id: discussion_id.to_string(),
                round,
            });

            match self
                .run_round(
                    discussion_id,
                    topic,
                    round,
                    config,
                    rounds.last(),
                    &mut task_results,
                    &mut failures,
                )
                .await
            {
                Ok(record) => {
                    scores.push(record.consensus_score);
                    self.events.publish(DiscussionEvent::RoundCompleted {
                        discussion_id: discussion_id.to_string(),
                        round,
                        consensus_score: record.consensus_score,
                    });
                    tracing::info!(
                        discussion_id = %discussion_id,
                        round,
                        consensus_score = record.consensus_score,
                        "Round completed"
                    );
                    let score = record.consensus_score;
                    rounds.push(record);

                    if check_convergence(&scores, config.convergence_threshold) {
                        converged = true;
                        self.events.publish(DiscussionEvent::Converged {
                            discussion_id: discussion_id.to_string(),
                            round,
                            consensus_score: score,
                        });
                        break;
                    }
                }
                Err(message) => {
                    error = Some(message);
                    break;
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let consensus_score = scores.last().copied().unwrap_or(0.0);
        let status = if error.is_some() {
            CollaborationStatus::Failed
        } else {
            CollaborationStatus::Completed
        };

        match &error {
            Some(message) => {
                tracing::warn!(discussion_id = %discussion_id, "Discussion failed: {}", message);
                self.events.publish(DiscussionEvent::Error {
                    discussion_id: discussion_id.to_string(),
                    message: message.clone(),
                });
            }
            None => {
                tracing::info!(
                    discussion_id = %discussion_id,
                    converged,
                    rounds = rounds.len(),
                    "Discussion completed"
                );
                self.events.publish(DiscussionEvent::Completed {
                    discussion_id: discussion_id.to_string(),
                    converged,
                    rounds: rounds.len() as u32,
                });
            }
        }

        self.metrics.lock().unwrap().record_run(
            converged,
            error.is_some(),
            rounds.len() as u64,
            consensus_score,
            duration_ms,
        );

        Ok(DiscussionResult {
            id: discussion_id.to_string(),
            topic: topic.to_string(),
            status,
            final_consensus: final_consensus(rounds.last()),
            participant_summaries: summarize(&config.participants, &rounds, &failures),
            rounds,
            converged,
            consensus_score,
            task_results,
            error,
            duration_ms,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// One round: every participant, then the consensus score. An `Err`
    /// carries the failure message for the result.
    #[allow(clippy::too_many_arguments)]
    async fn run_round(
        &self,
        discussion_id: &str,
        topic: &str,
        round: u32,
        config: &DiscussionConfig,
        previous: Option<&DiscussionRound>,
        task_results: &mut Vec<TaskResult>,
        failures: &mut [u32],
    ) -> std::result::Result<DiscussionRound, String> {
        let round_start = Instant::now();
        let prior = match previous {
            None => PriorRound::None,
            Some(DiscussionRound {
                synthesis: Some(synthesis),
                ..
            }) => PriorRound::Synthesis(synthesis),
            Some(record) => PriorRound::Contributions(&record.contributions),
        };

        let calls = config.participants.iter().map(|participant| {
            let prompt = participant_prompt(topic, round, config.max_rounds, participant, prior);
            let options = InvokeOptions::new()
                .with_system_prompt(
                    participant
                        .system_prompt
                        .as_deref()
                        .unwrap_or(PARTICIPANT_SYSTEM_PROMPT),
                )
                .with_timeout_ms(config.timeout_ms)
                .with_metadata("discussion_id", discussion_id)
                .with_metadata("round", round.to_string());
            async move {
                invoke_with_timeout(
                    self.invoker.as_ref(),
                    &participant.agent_id,
                    &prompt,
                    &options,
                    config.timeout_ms,
                )
                .await
            }
        });
        let responses = join_all(calls).await;

        let mut contributions = Vec::new();
        for ((participant, response), failed) in config
            .participants
            .iter()
            .zip(responses)
            .zip(failures.iter_mut())
        {
            let participant_id = participant.participant_id();
            task_results.push(TaskResult {
                task_id: format!("round-{}:{}", round, participant_id),
                agent: participant.agent_id.clone(),
                success: response.success,
                result: response.result.clone().filter(|_| response.success),
                error: (!response.success).then(|| response.error_message()),
                duration_ms: response.duration_ms,
            });

            if !response.success {
                *failed += 1;
                tracing::warn!(
                    discussion_id = %discussion_id,
                    round,
                    participant = %participant_id,
                    "Participant failed: {}",
                    response.error_message()
                );
                continue;
            }

            let content = response.output().to_string();
            let agreement_score = parse_agreement_score(&content);
            self.events.publish(DiscussionEvent::Contribution {
                discussion_id: discussion_id.to_string(),
                round,
                participant_id: participant_id.to_string(),
                role: participant.role.clone(),
                agreement_score,
            });
            contributions.push(Contribution {
                participant_id: participant_id.to_string(),
                role: participant.role.clone(),
                content,
                agreement_score,
                duration_ms: response.duration_ms,
            });
        }

        if contributions.is_empty() {
            return Err(format!(
                "round {} produced no contributions: every participant failed",
                round
            ));
        }

        let mut record = DiscussionRound {
            round,
            consensus_score: 0.0,
            contributions,
            synthesis: None,
            agreements: Vec::new(),
            disagreements: Vec::new(),
            duration_ms: 0,
        };

        let facilitated = match (&config.consensus_strategy, &config.facilitator_agent_id) {
            (ConsensusStrategy::Facilitator, Some(facilitator)) => {
                self.facilitate(discussion_id, topic, round, facilitator, config, &record.contributions, task_results)
                    .await
            }
            _ => None,
        };

        match facilitated {
            Some(report) => {
                record.consensus_score = report.consensus_score;
                record.synthesis = (!report.synthesis.trim().is_empty()).then_some(report.synthesis);
                record.agreements = report.agreements;
                record.disagreements = report.disagreements;
            }
            None => {
                record.consensus_score = evaluate_consensus(
                    config.consensus_strategy,
                    &record.contributions,
                    &config.participants,
                );
            }
        }
        record.duration_ms = round_start.elapsed().as_millis() as u64;
        Ok(record)
    }

    /// Ask the facilitator to score the round. `None` when the call fails or
    /// the reply is unusable; the caller falls back to the mean.
    #[allow(clippy::too_many_arguments)]
    async fn facilitate(
        &self,
        discussion_id: &str,
        topic: &str,
        round: u32,
        facilitator: &str,
        config: &DiscussionConfig,
        contributions: &[Contribution],
        task_results: &mut Vec<TaskResult>,
    ) -> Option<FacilitatorReport> {
        let prompt = facilitator_prompt(topic, round, contributions);
        let options = InvokeOptions::new()
            .with_system_prompt(FACILITATOR_SYSTEM_PROMPT)
            .with_timeout_ms(config.timeout_ms)
            .with_metadata("discussion_id", discussion_id)
            .with_metadata("round", round.to_string());
        let response =
            invoke_with_timeout(self.invoker.as_ref(), facilitator, &prompt, &options, config.timeout_ms).await;

        task_results.push(TaskResult {
            task_id: format!("round-{}:facilitator", round),
            agent: facilitator.to_string(),
            success: response.success,
            result: response.result.clone().filter(|_| response.success),
            error: (!response.success).then(|| response.error_message()),
            duration_ms: response.duration_ms,
        });

        if !response.success {
            tracing::warn!(
                discussion_id = %discussion_id,
                round,
                "Facilitator failed, using mean agreement: {}",
                response.error_message()
            );
            return None;
        }
        let report = parse_facilitator_report(response.output());
        if report.is_none() {
            tracing::warn!(
                discussion_id = %discussion_id,
                round,
                "Unparseable facilitator reply, using mean agreement"
            );
        }
        report
    }
}

fn final_consensus(last: Option<&DiscussionRound>) -> Option<String> {
    let last = last?;
    if let Some(synthesis) = &last.synthesis {
        return Some(synthesis.clone());
    }
    Some(
        last.contributions
            .iter()
            .map(|c| format!("{} ({}): {}", c.participant_id, c.role, c.content))
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}

fn summarize(
    participants: &[Participant],
    rounds: &[DiscussionRound],
    failures: &[u32],
) -> Vec<ParticipantSummary> {
    participants
        .iter()
        .zip(failures)
        .map(|(participant, &failures)| {
            let id = participant.participant_id();
            let contributions: Vec<&Contribution> = rounds
                .iter()
                .flat_map(|r| r.contributions.iter())
                .filter(|c| c.participant_id == id)
                .collect();
            let scores: Vec<f64> = contributions.iter().filter_map(|c| c.agreement_score).collect();
            ParticipantSummary {
                participant_id: id.to_string(),
                role: participant.role.clone(),
                contributions: contributions.len() as u32,
                failures,
                average_agreement: (!scores.is_empty())
                    .then(|| scores.iter().sum::<f64>() / scores.len() as f64),
            }
        })
        .collect()
}
