//! Metrics accumulators
//!
//! In-memory counters and durations for workflows, patterns and the
//! collaboration protocols. Reporting/aggregation is left to the caller;
//! these types only accumulate and expose serialisable snapshots.

use std::collections::HashMap;

use serde::Serialize;

// ============================================================================
// Workflow Metrics
// ============================================================================

/// Counters for the workflow engine
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowMetrics {
    pub submitted: u64,
    pub rejected: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub step_retries: u64,
    pub total_workflow_duration_ms: u64,
    pub total_step_duration_ms: u64,
}

impl WorkflowMetrics {
    pub fn record_submitted(&mut self) {
        self.submitted += 1;
    }

    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn record_queued(&mut self) {
        self.queued += 1;
    }

    pub fn record_step_completed(&mut self, duration_ms: u64) {
        self.steps_completed += 1;
        self.total_step_duration_ms += duration_ms;
    }

    pub fn record_step_failed(&mut self, duration_ms: u64) {
        self.steps_failed += 1;
        self.total_step_duration_ms += duration_ms;
    }

    pub fn record_step_skipped(&mut self) {
        self.steps_skipped += 1;
    }

    pub fn record_retry(&mut self) {
        self.step_retries += 1;
    }

    pub fn record_completed(&mut self, duration_ms: u64) {
        self.completed += 1;
        self.total_workflow_duration_ms += duration_ms;
    }

    pub fn record_failed(&mut self, duration_ms: u64) {
        self.failed += 1;
        self.total_workflow_duration_ms += duration_ms;
    }

    pub fn record_cancelled(&mut self) {
        self.cancelled += 1;
    }

    /// Average duration of finished (completed or failed) workflows
    pub fn avg_workflow_duration_ms(&self) -> u64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 0;
        }
        self.total_workflow_duration_ms / finished
    }

    /// Success rate as a percentage (0.0 - 100.0) over finished workflows
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 100.0;
        }
        (self.completed as f64 / finished as f64) * 100.0
    }
}

// ============================================================================
// Pattern Metrics
// ============================================================================

/// Counters for one orchestration pattern
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternStats {
    pub runs: u64,
    pub failures: u64,
    pub agent_calls: u64,
    pub total_duration_ms: u64,
}

/// Counters keyed by pattern name
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternMetrics {
    patterns: HashMap<String, PatternStats>,
}

impl PatternMetrics {
    pub fn record_run(&mut self, pattern: &str, success: bool, agent_calls: u64, duration_ms: u64) {
        let stats = self.patterns.entry(pattern.to_string()).or_default();
        stats.runs += 1;
        stats.agent_calls += agent_calls;
        stats.total_duration_ms += duration_ms;
        if !success {
            stats.failures += 1;
        }
    }

    pub fn get(&self, pattern: &str) -> Option<&PatternStats> {
        self.patterns.get(pattern)
    }

    pub fn total_runs(&self) -> u64 {
        self.patterns.values().map(|s| s.runs).sum()
    }
}

// ============================================================================
// Collaboration Metrics
// ============================================================================

/// Counters for discussion or self-critique runs
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollaborationMetrics {
    pub runs: u64,
    pub converged: u64,
    pub failed: u64,
    /// Rounds (discussion) or iterations (self-critique)
    pub total_cycles: u64,
    pub total_duration_ms: u64,
    /// Sum of final scores, used for the average
    pub total_final_score: f64,
}

impl CollaborationMetrics {
    pub fn record_run(&mut self, converged: bool, failed: bool, cycles: u64, final_score: f64, duration_ms: u64) {
        self.runs += 1;
        self.total_cycles += cycles;
        self.total_duration_ms += duration_ms;
        self.total_final_score += final_score;
        if converged {
            self.converged += 1;
        }
        if failed {
            self.failed += 1;
        }
    }

    /// Fraction of runs that converged (0.0 - 1.0)
    pub fn convergence_rate(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.converged as f64 / self.runs as f64
    }

    pub fn avg_cycles(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.total_cycles as f64 / self.runs as f64
    }

    pub fn avg_final_score(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.total_final_score / self.runs as f64
    }
}
