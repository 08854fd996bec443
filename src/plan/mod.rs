//! Job payload and task definitions consumed by the execution pipeline.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("plan has no tasks")]
    NoTasks,

    #[error("duplicate task id '{0}'")]
    DuplicateTaskId(String),

    #[error("task '{task_id}' ({kind}) requires '{field}'")]
    MissingField {
        task_id: String,
        kind: TaskKind,
        field: &'static str,
    },
}

/// Enqueue contract: one run of one approved plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub run_id: String,
    pub plan_id: String,
    pub project_id: String,
    pub tenant_id: String,
    pub tasks: Vec<Task>,
}

impl JobPayload {
    /// Reject payloads the executor could never run.
    pub fn validate(&self) -> Result<(), PlanError> {
        for (name, value) in [
            ("runId", &self.run_id),
            ("planId", &self.plan_id),
            ("projectId", &self.project_id),
            ("tenantId", &self.tenant_id),
        ] {
            if value.trim().is_empty() {
                return Err(PlanError::EmptyField(name));
            }
        }

        if self.tasks.is_empty() {
            return Err(PlanError::NoTasks);
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(PlanError::EmptyField("tasks[].id"));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTaskId(task.id.clone()));
            }
            task.validate()?;
        }

        Ok(())
    }
}

/// Kind of automation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Navigate,
    Click,
    Fill,
    Screenshot,
    Extract,
    Wait,
    Custom,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Navigate => "navigate",
            TaskKind::Click => "click",
            TaskKind::Fill => "fill",
            TaskKind::Screenshot => "screenshot",
            TaskKind::Extract => "extract",
            TaskKind::Wait => "wait",
            TaskKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// One step of a plan. Immutable once the plan is approved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Script for `extract` (read-only) and `custom` tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Attribute name for `extract`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Screenshot scope when no selector is given (default: full page).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_page: Option<bool>,
    /// Per-task timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_critical() -> bool {
    true
}

/// Interactions retry by default; everything else runs once unless the plan says otherwise.
const INTERACTION_RETRY: RetryPolicy = RetryPolicy {
    max_retries: 3,
    backoff_ms: 1000,
};

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            url: None,
            selector: None,
            value: None,
            script: None,
            attribute: None,
            full_page: None,
            timeout: None,
            retry_policy: None,
            critical: true,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_retries,
            backoff_ms,
        });
        self
    }

    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Display label used in progress events.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match (self.retry_policy, self.kind) {
            (Some(policy), _) => policy,
            (None, TaskKind::Click | TaskKind::Fill) => INTERACTION_RETRY,
            (None, _) => RetryPolicy::none(),
        }
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_millis).unwrap_or(default)
    }

    fn validate(&self) -> Result<(), PlanError> {
        let missing = |field| PlanError::MissingField {
            task_id: self.id.clone(),
            kind: self.kind,
            field,
        };

        match self.kind {
            TaskKind::Navigate if is_blank(&self.url) => Err(missing("url")),
            TaskKind::Click if is_blank(&self.selector) => Err(missing("selector")),
            TaskKind::Fill if is_blank(&self.selector) => Err(missing("selector")),
            TaskKind::Fill if self.value.is_none() => Err(missing("value")),
            TaskKind::Wait
                if is_blank(&self.selector) && is_blank(&self.url) && is_blank(&self.value) =>
            {
                Err(missing("value"))
            }
            TaskKind::Custom if is_blank(&self.script) && is_blank(&self.value) => {
                Err(missing("script"))
            }
            _ => Ok(()),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
