//! Agent invocation port
//!
//! Agents are opaque: the orchestrator only knows an agent reference and the
//! uniform `execute` contract. Agent failures come back as values; only a
//! missed deadline in [`call_with_timeout`] is an `Err`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Per-call options passed through to the invoker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeOptions {
    /// System prompt / persona for this call
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Deadline the invoker may honour itself
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Free-form metadata (execution id, step id, round...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a single agent call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AgentResponse {
    pub fn ok(result: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    /// Output text, empty for failures
    pub fn output(&self) -> &str {
        self.result.as_deref().unwrap_or("")
    }

    /// Error text, with a generic message when the invoker gave none
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "agent reported failure without an error message".to_string())
    }
}

/// Uniform contract every agent provider implements
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Execute an agent with the given input. Must not panic; failures are
    /// reported through `AgentResponse::success == false`.
    async fn execute(&self, agent: &str, input: &str, options: &InvokeOptions) -> AgentResponse;
}

/// Invoke an agent under a deadline. An overdue call is a
/// [`OrchestratorError::Timeout`]; `timeout_ms == None` waits indefinitely.
pub async fn call_with_timeout(
    invoker: &dyn AgentInvoker,
    agent: &str,
    input: &str,
    options: &InvokeOptions,
    timeout_ms: Option<u64>,
) -> Result<AgentResponse> {
    let Some(ms) = timeout_ms else {
        return Ok(invoker.execute(agent, input, options).await);
    };
    tokio::time::timeout(Duration::from_millis(ms), invoker.execute(agent, input, options))
        .await
        .map_err(|_| {
            tracing::warn!(agent = agent, timeout_ms = ms, "Agent call timed out");
            OrchestratorError::Timeout(ms)
        })
}

/// Invoke an agent, converting an overdue call into a failed response
pub async fn invoke_with_timeout(
    invoker: &dyn AgentInvoker,
    agent: &str,
    input: &str,
    options: &InvokeOptions,
    timeout_ms: Option<u64>,
) -> AgentResponse {
    let start = Instant::now();
    match call_with_timeout(invoker, agent, input, options, timeout_ms).await {
        Ok(response) => response,
        Err(e) => AgentResponse::failed(e.to_string(), start.elapsed().as_millis() as u64),
    }
}
