//! Execution-state store port
//!
//! The engine persists a full [`WorkflowExecutionState`] after every
//! transition. Stores only need keyed save/get/list/delete.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::workflow::{ExecutionFilter, WorkflowExecutionState};

/// Durable store for execution state
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace the state stored under `state.id`
    async fn save(&self, state: &WorkflowExecutionState) -> Result<()>;

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecutionState>>;

    /// Executions matching `filter`, most recently created first
    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecutionState>>;

    /// Returns whether anything was removed
    async fn delete(&self, execution_id: &str) -> Result<bool>;
}

/// In-process store, used by default and in tests
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    states: RwLock<HashMap<String, WorkflowExecutionState>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save(&self, state: &WorkflowExecutionState) -> Result<()> {
        self.states
            .write()
            .unwrap()
            .insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecutionState>> {
        Ok(self.states.read().unwrap().get(execution_id).cloned())
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecutionState>> {
        let mut states: Vec<_> = self
            .states
            .read()
            .unwrap()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        states.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            states.truncate(limit);
        }
        Ok(states)
    }

    async fn delete(&self, execution_id: &str) -> Result<bool> {
        Ok(self.states.write().unwrap().remove(execution_id).is_some())
    }
}
