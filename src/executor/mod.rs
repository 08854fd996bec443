//! Task executor -- drives one page through a plan's tasks in order.
//!
//! Each task runs under its own timeout with an explicit attempt counter
//! and a fixed backoff between attempts. Non-critical failures are recorded
//! and skipped; a critical failure aborts the rest of the run. Cancellation
//! is observed between tasks only.

pub mod artifacts;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::artifacts::{Artifact, ArtifactKind, ArtifactStore};
use crate::config::{EngineConfig, ExecutorConfig};
use crate::engine::{EngineError, Page, ReadyState};
use crate::events::{EventBus, LogLevel, RunEvent};
use crate::plan::{JobPayload, Task, TaskKind};
use crate::queue::JobStore;
use crate::storage::RunStore;

const READY_POLL: Duration = Duration::from_millis(100);
const NETWORK_QUIET: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("engine error: {0}")]
    Engine(EngineError),

    #[error("artifact write failed: {0:#}")]
    Artifact(anyhow::Error),
}

impl From<EngineError> for TaskError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ElementNotFound(sel) => TaskError::ElementNotFound(sel),
            EngineError::Timeout(msg) => TaskError::Timeout(msg),
            EngineError::Script(msg) => TaskError::Script(msg),
            other => TaskError::Engine(other),
        }
    }
}

impl TaskError {
    /// Failures of the machinery rather than the page. These are retried at
    /// the job level instead of being charged to the plan.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            TaskError::Artifact(_)
                | TaskError::Engine(
                    EngineError::Disconnected | EngineError::Launch(_) | EngineError::Transport(_)
                )
        )
    }

    fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::InvalidTask(_))
    }
}

/// Output of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFailure {
    pub task_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A critical task exhausted its attempts.
    Failed { task_id: String, error: String },
    /// Cancellation observed at a task boundary.
    Cancelled,
    /// Engine or artifact storage failed; worth another job attempt.
    Infrastructure { error: String },
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub results: Vec<TaskResult>,
    pub partial_failures: Vec<PartialFailure>,
    pub artifacts: Vec<Artifact>,
    pub duration: Duration,
}

impl RunReport {
    /// Opaque result payload stored on the run record.
    pub fn result_json(&self) -> Value {
        json!({
            "results": self.results,
            "partialFailures": self.partial_failures,
        })
    }

    pub fn screenshot_count(&self) -> u64 {
        self.artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Screenshot)
            .count() as u64
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    artifacts: ArtifactStore,
    events: EventBus,
    runs: RunStore,
    jobs: JobStore,
    readiness: ReadyState,
    default_timeout: Duration,
    navigation_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        config: &ExecutorConfig,
        engine: &EngineConfig,
        artifacts: ArtifactStore,
        events: EventBus,
        runs: RunStore,
        jobs: JobStore,
    ) -> Self {
        Self {
            artifacts,
            events,
            runs,
            jobs,
            readiness: engine.readiness,
            default_timeout: Duration::from_millis(config.default_task_timeout_ms),
            navigation_timeout: engine.navigation_timeout(),
        }
    }

    /// Execute every task of `payload` on `page`, strictly in order.
    pub async fn execute(
        &self,
        page: &dyn Page,
        payload: &JobPayload,
        cancel: &CancellationToken,
    ) -> RunReport {
        let run_id = payload.run_id.as_str();
        let total = payload.tasks.len();
        let started = Instant::now();
        let mut results = Vec::with_capacity(total);
        let mut partial_failures = Vec::new();
        let mut artifacts = Vec::new();
        let mut outcome = RunOutcome::Completed;

        for (index, task) in payload.tasks.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, next_task = %task.id, "cancellation observed");
                outcome = RunOutcome::Cancelled;
                break;
            }

            let (result, error) = self.run_task(page, payload, task).await;
            artifacts.extend(result.artifacts.iter().cloned());

            let progress = ((index + 1) * 100 / total) as u8;
            let (level, message) = match &result.error {
                None => (
                    LogLevel::Info,
                    format!("task '{}' ({}) completed in {}ms", task.label(), task.kind, result.duration_ms),
                ),
                Some(e) if task.critical => (
                    LogLevel::Error,
                    format!("task '{}' ({}) failed: {e}", task.label(), task.kind),
                ),
                Some(e) => (
                    LogLevel::Warn,
                    format!("non-critical task '{}' ({}) failed: {e}", task.label(), task.kind),
                ),
            };
            self.report_task(run_id, task, progress, result.clone(), level, message);
            results.push(result);

            let Some(error) = error else { continue };
            let message = error.to_string();
            if error.is_infrastructure() {
                outcome = RunOutcome::Infrastructure { error: message };
                break;
            }
            if task.critical {
                outcome = RunOutcome::Failed {
                    task_id: task.id.clone(),
                    error: message,
                };
                break;
            }
            partial_failures.push(PartialFailure {
                task_id: task.id.clone(),
                error: message,
            });
        }

        RunReport {
            outcome,
            results,
            partial_failures,
            artifacts,
            duration: started.elapsed(),
        }
    }

    fn report_task(
        &self,
        run_id: &str,
        task: &Task,
        progress: u8,
        result: TaskResult,
        level: LogLevel,
        message: String,
    ) {
        for artifact in &result.artifacts {
            if let Err(e) = self.runs.append_artifact(run_id, artifact) {
                warn!(run_id = %run_id, error = %e, "failed to record artifact");
            }
        }

        self.events.publish(RunEvent::Progress {
            run_id: run_id.to_string(),
            progress,
            current_task: task.label().to_string(),
        });
        self.events.publish(RunEvent::TaskCompleted {
            run_id: run_id.to_string(),
            task_id: task.id.clone(),
            result,
        });

        if let Err(e) = self.jobs.update_progress(run_id, progress) {
            warn!(run_id = %run_id, error = %e, "failed to record job progress");
        }
        if let Err(e) = self.runs.append_log(run_id, level.as_str(), &message) {
            warn!(run_id = %run_id, error = %e, "failed to append run log");
        }
        self.events.publish(RunEvent::Log {
            run_id: run_id.to_string(),
            level,
            message,
        });
    }

    /// One task with its retry policy. Attempts are bounded by
    /// `max_retries + 1`; the backoff between attempts is fixed.
    async fn run_task(
        &self,
        page: &dyn Page,
        payload: &JobPayload,
        task: &Task,
    ) -> (TaskResult, Option<TaskError>) {
        let policy = task.retry_policy();
        let default = if task.kind == TaskKind::Navigate {
            self.navigation_timeout
        } else {
            self.default_timeout
        };
        let timeout = task.timeout_or(default);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            // A fixed delay is its own bound.
            let outcome = if fixed_delay(task).is_some() {
                self.perform(page, payload, task).await
            } else {
                match tokio::time::timeout(timeout, self.perform(page, payload, task)).await {
                    Ok(r) => r,
                    Err(_) => Err(TaskError::Timeout(format!(
                        "task '{}' exceeded {}ms",
                        task.id,
                        timeout.as_millis()
                    ))),
                }
            };

            match outcome {
                Ok(output) => {
                    debug!(run_id = %payload.run_id, task = %task.id, attempt, "task succeeded");
                    let result = TaskResult {
                        task_id: task.id.clone(),
                        success: true,
                        duration_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                        data: output.data,
                        artifacts: output.artifacts,
                        error: None,
                    };
                    return (result, None);
                }
                Err(e) if e.is_retryable() && attempt < policy.max_attempts() => {
                    warn!(
                        run_id = %payload.run_id,
                        task = %task.id,
                        attempt,
                        max_attempts = policy.max_attempts(),
                        error = %e,
                        "task attempt failed, retrying"
                    );
                    tokio::time::sleep(policy.backoff()).await;
                }
                Err(e) => {
                    warn!(run_id = %payload.run_id, task = %task.id, attempt, error = %e, "task failed");
                    let result = TaskResult {
                        task_id: task.id.clone(),
                        success: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                        data: None,
                        artifacts: Vec::new(),
                        error: Some(e.to_string()),
                    };
                    return (result, Some(e));
                }
            }
        }
    }

    async fn perform(
        &self,
        page: &dyn Page,
        payload: &JobPayload,
        task: &Task,
    ) -> Result<TaskOutput, TaskError> {
        match task.kind {
            TaskKind::Navigate => {
                let url = required(task, task.url.as_deref(), "url")?;
                page.goto(url).await?;
                wait_ready(page, self.readiness).await?;
                let landed = page.current_url().await?;
                Ok(TaskOutput::data(json!({ "url": landed })))
            }
            TaskKind::Click => {
                let selector = required(task, task.selector.as_deref(), "selector")?;
                page.click(selector).await?;
                Ok(TaskOutput::default())
            }
            TaskKind::Fill => {
                let selector = required(task, task.selector.as_deref(), "selector")?;
                // An empty value clears the field.
                let value = task.value.as_deref().ok_or_else(|| missing(task, "value"))?;
                page.fill(selector, value).await?;
                Ok(TaskOutput::default())
            }
            TaskKind::Screenshot => {
                let full_page = task.full_page.unwrap_or(true);
                let bytes = page.screenshot(task.selector.as_deref(), full_page).await?;
                let artifact = self
                    .artifacts
                    .write(
                        &payload.project_id,
                        &payload.run_id,
                        &task.id,
                        ArtifactKind::Screenshot,
                        &bytes,
                    )
                    .await
                    .map_err(TaskError::Artifact)?;
                Ok(TaskOutput {
                    data: Some(json!({ "sizeBytes": artifact.size_bytes, "url": artifact.url })),
                    artifacts: vec![artifact],
                })
            }
            TaskKind::Extract => extract(page, task).await.map(TaskOutput::data),
            TaskKind::Wait => wait(page, task).await.map(|_| TaskOutput::default()),
            TaskKind::Custom => {
                let script = task
                    .script
                    .as_deref()
                    .or(task.value.as_deref())
                    .ok_or_else(|| missing(task, "script"))?;
                let value = page.evaluate(script).await?;
                Ok(TaskOutput::data(value))
            }
        }
    }
}

#[derive(Default)]
struct TaskOutput {
    data: Option<Value>,
    artifacts: Vec<Artifact>,
}

impl TaskOutput {
    fn data(value: Value) -> Self {
        Self {
            data: Some(value),
            artifacts: Vec::new(),
        }
    }
}

fn missing(task: &Task, field: &str) -> TaskError {
    TaskError::InvalidTask(format!("{} task '{}' has no {field}", task.kind, task.id))
}

fn required<'a>(task: &Task, value: Option<&'a str>, field: &str) -> Result<&'a str, TaskError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| missing(task, field))
}

/// Script, then selector (attribute, markup or text), then whole-page text.
async fn extract(page: &dyn Page, task: &Task) -> Result<Value, TaskError> {
    if let Some(script) = task.script.as_deref() {
        return Ok(page.evaluate(script).await?);
    }

    let Some(selector) = task.selector.as_deref() else {
        return Ok(json!({ "text": page.body_text().await? }));
    };

    if let Some(name) = task.attribute.as_deref() {
        let value = page.attribute(selector, name).await?;
        return Ok(json!({ "selector": selector, "attribute": name, "value": value }));
    }
    if task.value.as_deref() == Some("html") {
        let html = page.inner_html(selector).await?;
        return Ok(json!({ "selector": selector, "html": html }));
    }
    let text = page.text(selector).await?;
    Ok(json!({ "selector": selector, "text": text }))
}

fn fixed_delay(task: &Task) -> Option<Duration> {
    if task.kind != TaskKind::Wait {
        return None;
    }
    let ms = task.value.as_deref()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_millis(ms))
}

/// Fixed delay (numeric `value`), network idle, a selector, or a URL.
async fn wait(page: &dyn Page, task: &Task) -> Result<(), TaskError> {
    if let Some(delay) = fixed_delay(task) {
        tokio::time::sleep(delay).await;
        return Ok(());
    }
    if let Some(value) = task.value.as_deref().map(str::trim) {
        if value.eq_ignore_ascii_case("networkidle") {
            return wait_ready(page, ReadyState::NetworkIdle).await;
        }
    }

    if let Some(selector) = task.selector.as_deref() {
        while !page.exists(selector).await? {
            tokio::time::sleep(READY_POLL).await;
        }
        return Ok(());
    }

    if let Some(url) = task.url.as_deref() {
        while !page.current_url().await?.contains(url) {
            tokio::time::sleep(READY_POLL).await;
        }
        return Ok(());
    }

    Err(missing(task, "duration, selector or url"))
}

/// Poll until the page reaches `state`. Bounded by the caller's timeout.
async fn wait_ready(page: &dyn Page, state: ReadyState) -> Result<(), TaskError> {
    loop {
        let ready = page.ready_state().await?;
        let reached = match state {
            ReadyState::DomContentLoaded => ready == "interactive" || ready == "complete",
            ReadyState::Load | ReadyState::NetworkIdle => ready == "complete",
        };
        if reached {
            break;
        }
        tokio::time::sleep(READY_POLL).await;
    }

    if state != ReadyState::NetworkIdle {
        return Ok(());
    }

    let mut count = page.resource_count().await?;
    let mut quiet_since = Instant::now();
    while quiet_since.elapsed() < NETWORK_QUIET {
        tokio::time::sleep(READY_POLL).await;
        let now = page.resource_count().await?;
        if now != count {
            count = now;
            quiet_since = Instant::now();
        }
    }
    Ok(())
}
