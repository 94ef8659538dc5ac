//! Dependency graph checks and level planning
//!
//! Validation collects every violation instead of stopping at the first one,
//! so a caller can fix a definition in one pass.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::OrchestratorError;
use crate::workflow::{WorkflowDefinition, WorkflowStep};

/// Kind of a single validation problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    TooManySteps,
    EmptyDefinition,
    DuplicateStep,
    SelfDependency,
    MissingDependency,
    Cycle,
    PromptSource,
    RetryPolicy,
}

/// One problem found in a definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Offending step, when the issue is tied to one
    pub step_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(kind: IssueKind, step_id: Option<&str>, message: String) -> Self {
        Self {
            kind,
            step_id: step_id.map(str::to_string),
            message,
        }
    }
}

/// Result of validating a definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Convert into an error. Graph-shape problems (missing references,
    /// cycles) map to `Dependency`, everything else to `Validation`.
    pub fn into_result(self) -> Result<(), OrchestratorError> {
        if self.valid {
            return Ok(());
        }
        let joined = self
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let graph_only = self
            .errors
            .iter()
            .all(|e| matches!(e.kind, IssueKind::MissingDependency | IssueKind::Cycle));
        if graph_only {
            Err(OrchestratorError::Dependency(joined))
        } else {
            Err(OrchestratorError::Validation(joined))
        }
    }
}

/// Check a definition against every structural rule
pub fn validate(definition: &WorkflowDefinition, max_steps: usize) -> ValidationReport {
    let mut errors = Vec::new();
    let steps = &definition.steps;

    if steps.is_empty() {
        errors.push(ValidationIssue::new(
            IssueKind::EmptyDefinition,
            None,
            format!("workflow '{}' has no steps", definition.id),
        ));
    }
    if steps.len() > max_steps {
        errors.push(ValidationIssue::new(
            IssueKind::TooManySteps,
            None,
            format!("workflow has {} steps, maximum is {}", steps.len(), max_steps),
        ));
    }

    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(ValidationIssue::new(
                IssueKind::DuplicateStep,
                Some(&step.id),
                format!("duplicate step id '{}'", step.id),
            ));
        }
    }

    for step in steps {
        for dep in &step.dependencies {
            if dep == &step.id {
                errors.push(ValidationIssue::new(
                    IssueKind::SelfDependency,
                    Some(&step.id),
                    format!("step '{}' depends on itself", step.id),
                ));
            } else if !seen.contains(dep.as_str()) {
                errors.push(ValidationIssue::new(
                    IssueKind::MissingDependency,
                    Some(&step.id),
                    format!("step '{}' depends on unknown step '{}'", step.id, dep),
                ));
            }
        }

        let inline = step.prompt.as_deref().map(|p| !p.trim().is_empty());
        let stored = step
            .prompt_template_id
            .as_deref()
            .map(|t| !t.trim().is_empty());
        match (inline, stored) {
            (Some(true), None) | (None, Some(true)) => {}
            (Some(_), Some(_)) => errors.push(ValidationIssue::new(
                IssueKind::PromptSource,
                Some(&step.id),
                format!("step '{}' sets both prompt and prompt_template_id", step.id),
            )),
            (None, None) => errors.push(ValidationIssue::new(
                IssueKind::PromptSource,
                Some(&step.id),
                format!("step '{}' has no prompt or prompt_template_id", step.id),
            )),
            _ => errors.push(ValidationIssue::new(
                IssueKind::PromptSource,
                Some(&step.id),
                format!("step '{}' has an empty prompt source", step.id),
            )),
        }

        if let Err(reason) = step.retry_policy.validate() {
            errors.push(ValidationIssue::new(
                IssueKind::RetryPolicy,
                Some(&step.id),
                format!("step '{}' retry policy: {}", step.id, reason),
            ));
        }
    }

    for cycle in find_cycles(steps) {
        errors.push(ValidationIssue::new(
            IssueKind::Cycle,
            cycle.first().map(String::as_str),
            format!("dependency cycle: {}", cycle.join(" -> ")),
        ));
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Every distinct cycle reachable through dependency edges, members in
/// traversal order. Self-loops are reported separately by `validate`.
fn find_cycles(steps: &[WorkflowStep]) -> Vec<Vec<String>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut colour = vec![Colour::White; steps.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut cycles = Vec::new();
    let mut reported: HashSet<Vec<String>> = HashSet::new();

    fn visit(
        node: usize,
        steps: &[WorkflowStep],
        index: &HashMap<&str, usize>,
        colour: &mut [Colour],
        stack: &mut Vec<usize>,
        cycles: &mut Vec<Vec<String>>,
        reported: &mut HashSet<Vec<String>>,
    ) {
        colour[node] = Colour::Grey;
        stack.push(node);
        for dep in &steps[node].dependencies {
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            if next == node {
                continue;
            }
            match colour[next] {
                Colour::White => visit(next, steps, index, colour, stack, cycles, reported),
                Colour::Grey => {
                    if let Some(pos) = stack.iter().position(|&n| n == next) {
                        let members: Vec<String> =
                            stack[pos..].iter().map(|&n| steps[n].id.clone()).collect();
                        let mut key = members.clone();
                        key.sort();
                        if reported.insert(key) {
                            cycles.push(members);
                        }
                    }
                }
                Colour::Black => {}
            }
        }
        stack.pop();
        colour[node] = Colour::Black;
    }

    for start in 0..steps.len() {
        if colour[start] == Colour::White {
            visit(start, steps, &index, &mut colour, &mut stack, &mut cycles, &mut reported);
        }
    }
    cycles
}

/// Group steps into dependency levels (Kahn's algorithm). Steps inside a
/// level keep definition order. Assumes a validated, acyclic definition;
/// steps left on a cycle are dropped.
pub fn execution_levels(steps: &[WorkflowStep]) -> Vec<Vec<String>> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = steps
        .iter()
        .map(|s| {
            let deps = s
                .dependencies
                .iter()
                .filter(|d| ids.contains(d.as_str()))
                .collect::<HashSet<_>>()
                .len();
            (s.id.as_str(), deps)
        })
        .collect();

    let mut levels = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    loop {
        let ready: Vec<&str> = steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !placed.contains(id) && in_degree.get(id) == Some(&0))
            .collect();
        if ready.is_empty() {
            break;
        }
        placed.extend(ready.iter().copied());
        for step in steps {
            let hits = step
                .dependencies
                .iter()
                .filter(|d| ready.contains(&d.as_str()))
                .collect::<HashSet<_>>()
                .len();
            if hits > 0 {
                if let Some(deg) = in_degree.get_mut(step.id.as_str()) {
                    *deg = deg.saturating_sub(hits);
                }
            }
        }
        levels.push(ready.into_iter().map(str::to_string).collect());
    }
    levels
}

/// Every step that transitively depends on `step_id`, in definition order
pub fn dependents_closure(steps: &[WorkflowStep], step_id: &str) -> Vec<String> {
    let mut affected: HashSet<&str> = HashSet::new();
    affected.insert(step_id);
    let mut changed = true;
    while changed {
        changed = false;
        for step in steps {
            if !affected.contains(step.id.as_str())
                && step.dependencies.iter().any(|d| affected.contains(d.as_str()))
            {
                affected.insert(step.id.as_str());
                changed = true;
            }
        }
    }
    steps
        .iter()
        .filter(|s| s.id != step_id && affected.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}
