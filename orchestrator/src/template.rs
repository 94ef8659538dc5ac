//! Prompt template storage and placeholder resolution
//!
//! Placeholder syntax:
//! - `{{path}}` required; a missing value is reported as an error
//! - `{{path?}}` optional; resolves to an empty string with a warning
//! - `{{path|fallback}}` resolves to `fallback` when the value is missing
//!
//! Paths are dot paths into the JSON variable bag (see [`crate::context`]).

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::context::lookup_str;
use crate::error::{OrchestratorError, Result};

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-\.\[\]]+)\s*(\?|\|([^}]*))?\s*\}\}")
        .expect("Invalid placeholder regex")
});

/// Outcome of resolving one template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Rendered text; unresolved required placeholders are left verbatim
    pub content: String,
    /// Required variables with no value
    pub missing_required: Vec<String>,
    /// Optional variables that resolved empty
    pub warnings: Vec<String>,
}

impl Resolution {
    pub fn is_success(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// Convert into the rendered text, or a template error naming every
    /// missing required variable
    pub fn into_result(self) -> Result<String> {
        if self.missing_required.is_empty() {
            Ok(self.content)
        } else {
            Err(OrchestratorError::Template(format!(
                "missing required variable(s): {}",
                self.missing_required.join(", ")
            )))
        }
    }
}

/// Template resolver contract (template storage + interpolation)
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    /// Look up a stored prompt template by id
    async fn template(&self, template_id: &str) -> Result<Option<String>>;

    /// Interpolate `template` against `variables`
    async fn resolve(&self, template: &str, variables: &Value) -> Resolution;
}

/// Render a JSON value into prompt text
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interpolate placeholders synchronously
pub fn interpolate(template: &str, variables: &Value) -> Resolution {
    let mut missing_required = Vec::new();
    let mut warnings = Vec::new();

    let content = PLACEHOLDER_REGEX
        .replace_all(template, |caps: &Captures| {
            let path = &caps[1];
            let found = lookup_str(variables, path).filter(|v| !v.is_null());
            match (found, caps.get(2).map(|m| m.as_str())) {
                (Some(value), _) => render_value(value),
                (None, Some("?")) => {
                    warnings.push(format!("optional variable '{}' is empty", path));
                    String::new()
                }
                (None, Some(_)) => caps
                    .get(3)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
                (None, None) => {
                    if !missing_required.iter().any(|m| m == path) {
                        missing_required.push(path.to_string());
                    }
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    Resolution {
        content,
        missing_required,
        warnings,
    }
}

/// Default resolver: in-process template map + `{{...}}` interpolation
#[derive(Debug, Default)]
pub struct PlaceholderResolver {
    templates: RwLock<HashMap<String, String>>,
}

impl PlaceholderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to register a template
    pub fn with_template(self, id: impl Into<String>, template: impl Into<String>) -> Self {
        self.register(id, template);
        self
    }

    /// Register or replace a template
    pub fn register(&self, id: impl Into<String>, template: impl Into<String>) {
        self.templates
            .write()
            .unwrap()
            .insert(id.into(), template.into());
    }
}

#[async_trait]
impl TemplateResolver for PlaceholderResolver {
    async fn template(&self, template_id: &str) -> Result<Option<String>> {
        Ok(self.templates.read().unwrap().get(template_id).cloned())
    }

    async fn resolve(&self, template: &str, variables: &Value) -> Resolution {
        let resolution = interpolate(template, variables);
        for warning in &resolution.warnings {
            tracing::debug!("Template warning: {}", warning);
        }
        resolution
    }
}
