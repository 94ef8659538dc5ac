//! Per-execution context store
//!
//! Each execution id owns one nested JSON tree. Steps, rounds and iterations
//! read it as a variable bag and write their outputs back into it. Paths use
//! dot notation with array-index segments: `steps.fetch.items[2].name` or
//! `steps.fetch.items.2.name`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::error::{OrchestratorError, Result};

// ============================================================================
// Port
// ============================================================================

/// Context store contract consumed by the engine and the protocols
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Create (or reset) the context of an execution
    async fn create(&self, execution_id: &str, initial: Option<Value>) -> Result<()>;

    /// Whole context tree
    async fn get(&self, execution_id: &str) -> Result<Value>;

    /// Value at a path, `None` when the path does not resolve
    async fn get_path(&self, execution_id: &str, path: &str) -> Result<Option<Value>>;

    /// Set the value at a path, creating intermediate objects/arrays
    async fn set_path(&self, execution_id: &str, path: &str, value: Value) -> Result<()>;

    /// Deep-merge a partial object into the root of the context
    async fn merge_path(&self, execution_id: &str, partial: Value) -> Result<()>;

    /// Capture the current tree, returning a snapshot id
    async fn snapshot(&self, execution_id: &str, label: Option<&str>) -> Result<String>;

    /// Replace the current tree with a previously captured snapshot
    async fn restore(&self, execution_id: &str, snapshot_id: &str) -> Result<()>;

    /// Drop the context and its snapshots
    async fn delete(&self, execution_id: &str) -> Result<()>;
}

// ============================================================================
// Path handling
// ============================================================================

/// One segment of a context path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse `a.b[0].c` into segments
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let path = path.trim();
    if path.is_empty() {
        return Err(OrchestratorError::Validation("empty context path".into()));
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "empty segment in context path '{}'",
                path
            )));
        }

        let (name, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !name.is_empty() {
            segments.push(PathSegment::Key(name.to_string()));
        }

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| {
                OrchestratorError::Validation(format!("unclosed index in context path '{}'", path))
            })?;
            let index = rest[1..close].trim().parse::<usize>().map_err(|_| {
                OrchestratorError::Validation(format!("invalid index in context path '{}'", path))
            })?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(OrchestratorError::Validation(format!(
                    "unexpected characters after index in context path '{}'",
                    path
                )));
            }
        }
    }

    Ok(segments)
}

/// Resolve a parsed path inside a JSON tree
pub fn lookup<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a dot path string inside a JSON tree
pub fn lookup_str<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path).ok()?;
    lookup(root, &segments)
}

/// Largest array index a write may create. Writes into existing slots are
/// not limited.
pub const MAX_PATH_INDEX: usize = 10_000;

/// Make `items[index]` addressable, padding with nulls
fn ensure_slot(items: &mut Vec<Value>, index: usize) -> Result<()> {
    if index < items.len() {
        return Ok(());
    }
    if index > MAX_PATH_INDEX {
        return Err(OrchestratorError::Validation(format!(
            "array index {} exceeds the maximum of {}",
            index, MAX_PATH_INDEX
        )));
    }
    items.resize(index + 1, Value::Null);
    Ok(())
}

/// Write `value` at `segments`, creating containers along the way
pub fn assign(target: &mut Value, segments: &[PathSegment], value: Value) -> Result<()> {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };

    match head {
        PathSegment::Key(key) => {
            if let Value::Array(items) = target {
                if let Ok(index) = key.parse::<usize>() {
                    ensure_slot(items, index)?;
                    return assign(&mut items[index], rest, value);
                }
            }
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            match target {
                Value::Object(map) => {
                    let child = map.entry(key.clone()).or_insert(Value::Null);
                    assign(child, rest, value)
                }
                _ => Ok(()),
            }
        }
        PathSegment::Index(index) => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            match target {
                Value::Array(items) => {
                    ensure_slot(items, *index)?;
                    assign(&mut items[*index], rest, value)
                }
                _ => Ok(()),
            }
        }
    }
}

/// Deep merge: objects merge key by key, everything else is replaced
pub fn deep_merge(target: &mut Value, partial: Value) {
    match (target, partial) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone)]
struct Snapshot {
    label: Option<String>,
    data: Value,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ContextEntry {
    data: Value,
    snapshots: HashMap<String, Snapshot>,
    expires_at: Option<Instant>,
}

/// Context store backed by a process-local map, with optional TTL
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    entries: Mutex<HashMap<String, ContextEntry>>,
    ttl: Option<Duration>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire contexts `ttl` after their last write
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn expiry(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }

    /// Run `f` against a live (non-expired) entry
    fn with_entry<T>(&self, execution_id: &str, f: impl FnOnce(&mut ContextEntry) -> Result<T>) -> Result<T> {
        let mut entries = self.entries.lock().unwrap();
        let expired = entries
            .get(execution_id)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            tracing::debug!(execution_id = %execution_id, "Context expired");
            entries.remove(execution_id);
        }
        let entry = entries
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("context for execution {}", execution_id)))?;
        f(entry)
    }

    /// Snapshot labels for an execution, oldest first
    pub fn snapshot_labels(&self, execution_id: &str) -> Result<Vec<(String, Option<String>)>> {
        self.with_entry(execution_id, |entry| {
            let mut snapshots: Vec<_> = entry.snapshots.iter().collect();
            snapshots.sort_by_key(|(_, snap)| snap.created_at);
            Ok(snapshots
                .into_iter()
                .map(|(id, snap)| (id.clone(), snap.label.clone()))
                .collect())
        })
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn create(&self, execution_id: &str, initial: Option<Value>) -> Result<()> {
        let data = match initial {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => {
                return Err(OrchestratorError::Validation(format!(
                    "initial context must be an object, got {}",
                    other
                )))
            }
        };
        let entry = ContextEntry {
            data,
            snapshots: HashMap::new(),
            expires_at: self.expiry(),
        };
        self.entries.lock().unwrap().insert(execution_id.to_string(), entry);
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Value> {
        self.with_entry(execution_id, |entry| Ok(entry.data.clone()))
    }

    async fn get_path(&self, execution_id: &str, path: &str) -> Result<Option<Value>> {
        let segments = parse_path(path)?;
        self.with_entry(execution_id, |entry| Ok(lookup(&entry.data, &segments).cloned()))
    }

    async fn set_path(&self, execution_id: &str, path: &str, value: Value) -> Result<()> {
        let segments = parse_path(path)?;
        let expires_at = self.expiry();
        self.with_entry(execution_id, |entry| {
            // A rejected path leaves the tree untouched
            let mut data = entry.data.clone();
            assign(&mut data, &segments, value)?;
            entry.data = data;
            entry.expires_at = expires_at;
            Ok(())
        })
    }

    async fn merge_path(&self, execution_id: &str, partial: Value) -> Result<()> {
        if !partial.is_object() {
            return Err(OrchestratorError::Validation(
                "merge requires an object".to_string(),
            ));
        }
        let expires_at = self.expiry();
        self.with_entry(execution_id, |entry| {
            deep_merge(&mut entry.data, partial);
            entry.expires_at = expires_at;
            Ok(())
        })
    }

    async fn snapshot(&self, execution_id: &str, label: Option<&str>) -> Result<String> {
        self.with_entry(execution_id, |entry| {
            let id = uuid::Uuid::new_v4().to_string();
            entry.snapshots.insert(
                id.clone(),
                Snapshot {
                    label: label.map(str::to_string),
                    data: entry.data.clone(),
                    created_at: Utc::now(),
                },
            );
            Ok(id)
        })
    }

    async fn restore(&self, execution_id: &str, snapshot_id: &str) -> Result<()> {
        self.with_entry(execution_id, |entry| {
            let snapshot = entry
                .snapshots
                .get(snapshot_id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("snapshot {}", snapshot_id)))?;
            entry.data = snapshot.data.clone();
            Ok(())
        })
    }

    async fn delete(&self, execution_id: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(execution_id);
        Ok(())
    }
}
