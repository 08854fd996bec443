//! Real-time run event channel.
//!
//! Events are fanned out over a broadcast channel; slow subscribers lag and
//! drop events rather than block publishers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::executor::artifacts::Artifact;
use crate::executor::TaskResult;
use crate::usage::Metric;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run:started", rename_all = "camelCase")]
    Started { run_id: String, plan_id: String },

    #[serde(rename = "run:progress", rename_all = "camelCase")]
    Progress {
        run_id: String,
        progress: u8,
        current_task: String,
    },

    #[serde(rename = "run:task_completed", rename_all = "camelCase")]
    TaskCompleted {
        run_id: String,
        task_id: String,
        result: TaskResult,
    },

    #[serde(rename = "run:log", rename_all = "camelCase")]
    Log {
        run_id: String,
        level: LogLevel,
        message: String,
    },

    #[serde(rename = "run:completed", rename_all = "camelCase")]
    Completed {
        run_id: String,
        /// Milliseconds.
        duration: u64,
        artifacts: Vec<Artifact>,
    },

    #[serde(rename = "run:failed", rename_all = "camelCase")]
    Failed { run_id: String, error: String },

    #[serde(rename = "run:cancelled", rename_all = "camelCase")]
    Cancelled { run_id: String },

    #[serde(rename = "quota:warning")]
    QuotaWarning(QuotaThreshold),

    #[serde(rename = "quota:critical")]
    QuotaCritical(QuotaThreshold),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaThreshold {
    pub tenant_id: String,
    pub metric: Metric,
    pub current: u64,
    pub limit: i64,
    pub percentage: f64,
}

impl RunEvent {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::Progress { run_id, .. }
            | RunEvent::TaskCompleted { run_id, .. }
            | RunEvent::Log { run_id, .. }
            | RunEvent::Completed { run_id, .. }
            | RunEvent::Failed { run_id, .. }
            | RunEvent::Cancelled { run_id } => Some(run_id),
            RunEvent::QuotaWarning(_) | RunEvent::QuotaCritical(_) => None,
        }
    }

    /// Wire name, e.g. `run:progress`.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "run:started",
            RunEvent::Progress { .. } => "run:progress",
            RunEvent::TaskCompleted { .. } => "run:task_completed",
            RunEvent::Log { .. } => "run:log",
            RunEvent::Completed { .. } => "run:completed",
            RunEvent::Failed { .. } => "run:failed",
            RunEvent::Cancelled { .. } => "run:cancelled",
            RunEvent::QuotaWarning(_) => "quota:warning",
            RunEvent::QuotaCritical(_) => "quota:critical",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}
