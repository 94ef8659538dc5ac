//! Configuration loading (.orchestrator.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Config file name searched for on disk
pub const CONFIG_FILE_NAME: &str = ".orchestrator.toml";

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/orchestrator/
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("orchestrator").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub discussion: DiscussionDefaults,
    #[serde(default)]
    pub critique: CritiqueDefaults,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl OrchestratorConfig {
    /// Load config from .orchestrator.toml
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for .orchestrator.toml
    /// 2. Check ~/.config/orchestrator/.orchestrator.toml (global fallback)
    /// 3. Fall back to defaults
    pub fn load() -> Result<Self> {
        if let Some(config_path) = find_config_file(CONFIG_FILE_NAME) {
            tracing::debug!("Loading config from: {}", config_path.display());
            return Self::load_from_path(&config_path);
        }

        tracing::debug!("No {} found, using defaults", CONFIG_FILE_NAME);
        Ok(Self::default())
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OrchestratorError::Config(e.to_string()))
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Scheduler limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workflows allowed to run (or sit paused) at once
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Waiting workflows before submissions are rejected
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Simultaneous step launches within one dependency level
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Step count cap for a workflow definition
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Per-attempt timeout when a step does not set its own
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Fallback polling interval of the dequeue loop
    #[serde(default = "default_dequeue_interval_ms")]
    pub dequeue_interval_ms: u64,

    /// Drop an execution's context this long after it finishes. Unset keeps
    /// contexts until they are deleted through the context store.
    #[serde(default)]
    pub context_retention_ms: Option<u64>,
}

fn default_max_concurrent_workflows() -> usize {
    5
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_max_steps() -> usize {
    100
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_dequeue_interval_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            max_queue_size: default_max_queue_size(),
            max_parallel_steps: default_max_parallel_steps(),
            max_steps: default_max_steps(),
            step_timeout_ms: default_step_timeout_ms(),
            dequeue_interval_ms: default_dequeue_interval_ms(),
            context_retention_ms: None,
        }
    }
}

impl EngineConfig {
    /// Builder method to set the workflow concurrency limit
    pub fn with_max_concurrent_workflows(mut self, max: usize) -> Self {
        self.max_concurrent_workflows = max;
        self
    }

    /// Builder method to set the queue bound
    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    /// Builder method to set the per-level step parallelism
    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max;
        self
    }

    /// Builder method to set the step count cap
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max;
        self
    }

    /// Builder method to set the default step timeout
    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = timeout_ms;
        self
    }

    /// Builder method to drop finished contexts after `retention_ms`
    pub fn with_context_retention_ms(mut self, retention_ms: u64) -> Self {
        self.context_retention_ms = Some(retention_ms);
        self
    }
}

// ============================================================================
// Context store / protocols / persistence
// ============================================================================

/// In-memory context store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Expire contexts this many seconds after their last write
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Defaults applied by callers building a discussion config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionDefaults {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    #[serde(default)]
    pub round_timeout_ms: Option<u64>,
}

fn default_max_rounds() -> u32 {
    3
}

fn default_convergence_threshold() -> f64 {
    0.8
}

impl Default for DiscussionDefaults {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            convergence_threshold: default_convergence_threshold(),
            round_timeout_ms: None,
        }
    }
}

/// Defaults applied by callers building a self-critique config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueDefaults {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub iteration_timeout_ms: Option<u64>,
}

fn default_max_iterations() -> u32 {
    3
}

impl Default for CritiqueDefaults {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_timeout_ms: None,
        }
    }
}

/// Execution store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (defaults to ~/.orchestrator/executions.db)
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl PersistenceConfig {
    /// Resolve the database path, falling back to the home directory
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| OrchestratorError::Config("Could not determine home directory".into()))?;
        Ok(home.join(".orchestrator").join("executions.db"))
    }
}
