//! Lifecycle events for real-time visibility
//!
//! Each protocol emits its own typed event enum. Events are routed through an
//! [`EventBus`] keyed by execution id; subscribers registered before an event
//! fires receive it, late joiners get no replay and should poll status.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events that belong to one execution / discussion / critique run
pub trait ExecutionEvent: Clone + Send + 'static {
    fn execution_id(&self) -> &str;

    /// Whether this event ends the run (subscriptions are closed after it)
    fn is_terminal(&self) -> bool;
}

// ============================================================================
// Workflow Events
// ============================================================================

/// Events emitted by the workflow engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowQueued {
        execution_id: String,
        position: usize,
    },
    WorkflowStarted {
        execution_id: String,
        workflow_id: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
        attempt: u32,
    },
    StepRetrying {
        execution_id: String,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        execution_id: String,
        step_id: String,
        attempts: u32,
        error: String,
    },
    StepSkipped {
        execution_id: String,
        step_id: String,
        /// The permanently failed step that caused the skip
        failed_dependency: String,
    },
    WorkflowPaused {
        execution_id: String,
    },
    WorkflowResumed {
        execution_id: String,
    },
    WorkflowCompleted {
        execution_id: String,
        duration_ms: u64,
    },
    WorkflowFailed {
        execution_id: String,
        error: String,
    },
    WorkflowCancelled {
        execution_id: String,
    },
}

impl ExecutionEvent for WorkflowEvent {
    fn execution_id(&self) -> &str {
        match self {
            Self::WorkflowQueued { execution_id, .. }
            | Self::WorkflowStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepRetrying { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::WorkflowPaused { execution_id }
            | Self::WorkflowResumed { execution_id }
            | Self::WorkflowCompleted { execution_id, .. }
            | Self::WorkflowFailed { execution_id, .. }
            | Self::WorkflowCancelled { execution_id } => execution_id,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. } | Self::WorkflowCancelled { .. }
        )
    }
}

// ============================================================================
// Discussion Events
// ============================================================================

/// Events emitted by the discussion protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscussionEvent {
    RoundStarted {
        discussion_id: String,
        round: u32,
    },
    Contribution {
        discussion_id: String,
        round: u32,
        participant_id: String,
        role: String,
        agreement_score: Option<f64>,
    },
    RoundCompleted {
        discussion_id: String,
        round: u32,
        consensus_score: f64,
    },
    Converged {
        discussion_id: String,
        round: u32,
        consensus_score: f64,
    },
    Completed {
        discussion_id: String,
        converged: bool,
        rounds: u32,
    },
    Error {
        discussion_id: String,
        message: String,
    },
}

impl ExecutionEvent for DiscussionEvent {
    fn execution_id(&self) -> &str {
        match self {
            Self::RoundStarted { discussion_id, .. }
            | Self::Contribution { discussion_id, .. }
            | Self::RoundCompleted { discussion_id, .. }
            | Self::Converged { discussion_id, .. }
            | Self::Completed { discussion_id, .. }
            | Self::Error { discussion_id, .. } => discussion_id,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

// ============================================================================
// Self-Critique Events
// ============================================================================

/// Events emitted by the self-critique protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CritiqueEvent {
    Iteration {
        critique_id: String,
        iteration: u32,
        overall_score: f64,
        meets_threshold: bool,
    },
    Converged {
        critique_id: String,
        iteration: u32,
        score: f64,
    },
    Completed {
        critique_id: String,
        converged: bool,
        iterations: u32,
        final_score: f64,
    },
    Error {
        critique_id: String,
        message: String,
    },
}

impl ExecutionEvent for CritiqueEvent {
    fn execution_id(&self) -> &str {
        match self {
            Self::Iteration { critique_id, .. }
            | Self::Converged { critique_id, .. }
            | Self::Completed { critique_id, .. }
            | Self::Error { critique_id, .. } => critique_id,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Receiver for a subscription
pub type EventReceiver<E> = mpsc::UnboundedReceiver<E>;

struct Subscribers<E> {
    by_execution: HashMap<String, Vec<mpsc::UnboundedSender<E>>>,
    global: Vec<mpsc::UnboundedSender<E>>,
}

/// Publish/subscribe channel keyed by execution id.
///
/// Channels are unbounded so a slow subscriber never loses events.
pub struct EventBus<E> {
    subscribers: Mutex<Subscribers<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers {
                by_execution: HashMap::new(),
                global: Vec::new(),
            }),
        }
    }
}

impl<E: ExecutionEvent> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of one execution
    pub fn subscribe(&self, execution_id: &str) -> EventReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .by_execution
            .entry(execution_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribe to events of every execution
    pub fn subscribe_all(&self) -> EventReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().global.push(tx);
        rx
    }

    /// Deliver an event to current subscribers. Per-execution subscriptions
    /// are closed after a terminal event.
    pub fn publish(&self, event: E) {
        let mut subs = self.subscribers.lock().unwrap();
        let id = event.execution_id().to_string();

        if let Some(senders) = subs.by_execution.get_mut(&id) {
            // Drop subscribers whose receiver is gone
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
        subs.global.retain(|tx| tx.send(event.clone()).is_ok());

        if event.is_terminal() {
            subs.by_execution.remove(&id);
        }
    }

    /// Number of live per-execution subscribers (for diagnostics)
    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .by_execution
            .get(execution_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
