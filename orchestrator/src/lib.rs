//! Agent orchestration engine
//!
//! This crate provides:
//! - A DAG workflow engine with bounded concurrency, retry/backoff,
//!   pause/resume/cancel, persisted execution state and crash recovery
//! - Orchestration patterns over flat task lists (sequential, parallel,
//!   conditional, map-reduce)
//! - Collaboration protocols: multi-round discussion with consensus scoring,
//!   and self-critique with weighted quality criteria
//!
//! Agents are reached through the [`AgentInvoker`] port; context, template
//! and execution-state storage are ports as well, with in-process defaults.
//!
//! # Example
//!
//! ```rust,ignore
//! use orchestrator::{EngineConfig, WorkflowDefinition, WorkflowEngine, WorkflowStep};
//!
//! let engine = WorkflowEngine::new(EngineConfig::default(), invoker);
//!
//! let definition = WorkflowDefinition::new("review", "Review")
//!     .with_step(WorkflowStep::new("draft", "writer").with_prompt("Write about {{topic}}"))
//!     .with_step(
//!         WorkflowStep::new("review", "reviewer")
//!             .with_prompt("Review: {{draft}}")
//!             .depends_on("draft"),
//!     );
//!
//! let id = engine.submit(definition, "user-1", json!({"topic": "Rust"})).await?;
//! let state = engine.wait(&id).await?;
//! ```

pub mod collaboration;
pub mod config;
pub mod context;
#[cfg(feature = "persistence")]
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod invoker;
pub mod metrics;
pub mod patterns;
pub mod prompts;
pub mod retry;
pub mod store;
pub mod template;
pub mod workflow;

pub use collaboration::{
    CollaborationStatus, ConsensusStrategy, Discussion, DiscussionConfig, DiscussionResult,
    Participant, QualityCriterion, SelfCritique, SelfCritiqueConfig, SelfCritiqueResult,
};
pub use config::{EngineConfig, OrchestratorConfig};
pub use context::{ContextStore, MemoryContextStore};
#[cfg(feature = "persistence")]
pub use db::SqliteExecutionStore;
pub use engine::WorkflowEngine;
pub use error::{OrchestratorError, Result};
pub use events::{CritiqueEvent, DiscussionEvent, EventReceiver, WorkflowEvent};
pub use graph::{execution_levels, validate, ValidationReport};
pub use invoker::{AgentInvoker, AgentResponse, InvokeOptions};
pub use patterns::{
    OrchestrationRequest, OrchestrationResult, OrchestrationStatus, Orchestrator, Pattern, Task,
    TaskResult,
};
pub use retry::RetryPolicy;
pub use store::{ExecutionStore, MemoryExecutionStore};
pub use template::{PlaceholderResolver, TemplateResolver};
pub use workflow::{
    ExecutionFilter, StepStatus, WorkflowDefinition, WorkflowExecutionState, WorkflowStatus,
    WorkflowStep,
};
