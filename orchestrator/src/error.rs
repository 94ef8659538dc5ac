//! Error taxonomy for the orchestrator
//!
//! Validation, dependency, capacity, not-found and state errors surface
//! synchronously from API calls and are never retried. Agent invocation and
//! timeout errors are retried by the owning step's policy.

/// Errors produced by the engine, patterns and collaboration protocols
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Agent invocation failed: {0}")]
    AgentInvocation(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Whether a step retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AgentInvocation(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;
