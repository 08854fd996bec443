//! Periodic maintenance scheduler.
//!
//! Each registered job runs on its own loop with an injected [`Cadence`].
//! `start` and `stop` are driven by the process lifecycle; a job's
//! `on_stop` hook runs once after its loop exits.

pub mod jobs;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    /// Six-field cron expression (seconds first).
    Cron(Box<CronSchedule>),
}

impl Cadence {
    pub fn parse_cron(expr: &str) -> Result<Self> {
        let schedule = CronSchedule::from_str(expr)
            .map_err(|e| anyhow!("invalid cron expression '{expr}': {e}"))?;
        Ok(Cadence::Cron(Box::new(schedule)))
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every(d) => chrono::Duration::from_std(*d).ok().map(|d| now + d),
            Cadence::Cron(schedule) => schedule.after(&now).next(),
        }
    }

    /// How long to sleep from `now` until the next fire time.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Cadence::Every(d) => Some(*d),
            Cadence::Cron(_) => self
                .next_after(now)
                .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

#[async_trait::async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, now: DateTime<Utc>) -> Result<()>;

    /// Called once when the scheduler stops.
    async fn on_stop(&self) {}
}

struct Registered {
    cadence: Cadence,
    job: Arc<dyn PeriodicJob>,
}

pub struct Scheduler {
    jobs: Vec<Registered>,
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            stop: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn register(&mut self, cadence: Cadence, job: Arc<dyn PeriodicJob>) {
        info!(job = %job.name(), ?cadence, "periodic job registered");
        self.jobs.push(Registered { cadence, job });
    }

    pub fn start(&mut self) {
        for reg in &self.jobs {
            let cadence = reg.cadence.clone();
            let job = Arc::clone(&reg.job);
            let stop = self.stop.clone();
            self.handles.push(tokio::spawn(run_loop(cadence, job, stop)));
        }
        info!(jobs = self.handles.len(), "scheduler started");
    }

    /// Signal every loop and wait for the `on_stop` hooks to finish.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "periodic job task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Dry-run: fire times in the next `hours`, sorted.
    pub fn preview(&self, hours: u64) -> Vec<(DateTime<Utc>, String)> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for reg in &self.jobs {
            let mut at = now;
            while let Some(next) = reg.cadence.next_after(at) {
                if next > end {
                    break;
                }
                preview.push((next, reg.job.name().to_string()));
                at = next;
            }
        }

        preview.sort_by(|a, b| a.0.cmp(&b.0));
        preview
    }
}

async fn run_loop(cadence: Cadence, job: Arc<dyn PeriodicJob>, stop: CancellationToken) {
    loop {
        let Some(delay) = cadence.delay_from(Utc::now()) else {
            info!(job = %job.name(), "cadence has no further fire times");
            break;
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match job.run(Utc::now()).await {
            Ok(()) => debug!(job = %job.name(), "periodic job finished"),
            Err(e) => error!(job = %job.name(), error = %e, "periodic job failed"),
        }
    }
    job.on_stop().await;
}
