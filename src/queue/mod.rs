//! Durable job queue keyed by run id.
//!
//! Jobs live in the `jobs` table. Dequeue order is priority (lower number
//! first) then insertion order. Infrastructure failures are retried with
//! exponential backoff up to `max_attempts`; terminal jobs are kept for the
//! retention window and then purged.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::plan::JobPayload;
use crate::storage::{now_ms, Pool, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    /// Waiting for a retry backoff to elapse.
    Delayed,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Queue state implied by a run record whose job row is gone.
    pub fn from_run_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Queued => JobState::Waiting,
            RunStatus::Running => JobState::Active,
            RunStatus::Completed => JobState::Completed,
            RunStatus::Failed => JobState::Failed,
            RunStatus::Cancelled => JobState::Cancelled,
        }
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "waiting" => JobState::Waiting,
            "delayed" => JobState::Delayed,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            other => anyhow::bail!("unknown job state '{other}'"),
        })
    }
}

/// Returned by `enqueue`; `created` is false when the run id was already known.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub run_id: String,
    pub state: JobState,
    pub priority: i64,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub failed_reason: Option<String>,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Job had not started and was deleted.
    Removed,
    /// Job is executing; the executor will stop at the next task boundary.
    Signalled,
    AlreadyFinished,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    Failed,
}

/// A job claimed by a worker.
#[derive(Debug)]
pub struct ActiveJob {
    pub payload: JobPayload,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl ActiveJob {
    pub fn run_id(&self) -> &str {
        &self.payload.run_id
    }
}

#[derive(Clone)]
pub struct JobStore {
    pool: Pool,
    config: QueueConfig,
    poll_interval: Duration,
    notify: Arc<Notify>,
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl JobStore {
    pub fn new(pool: Pool, config: QueueConfig, poll_interval: Duration) -> Self {
        Self {
            pool,
            config,
            poll_interval,
            notify: Arc::new(Notify::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enqueue a run. Idempotent on `run_id`: an existing job is returned as-is.
    pub fn enqueue(&self, run_id: &str, payload: &JobPayload, priority: i64) -> Result<JobHandle> {
        let payload_json = serde_json::to_string(payload)?;
        let now = now_ms();
        let conn = self.pool.get()?;
        let inserted = conn
            .execute(
                "INSERT INTO jobs (run_id, payload_json, priority, state, max_attempts, available_at, created_at)
                 VALUES (?1, ?2, ?3, 'waiting', ?4, ?5, ?5)
                 ON CONFLICT(run_id) DO NOTHING",
                params![run_id, payload_json, priority, self.config.max_attempts, now],
            )
            .context("Failed to insert job")?;

        let (state, priority): (String, i64) = conn.query_row(
            "SELECT state, priority FROM jobs WHERE run_id = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if inserted == 1 {
            info!(run_id = %run_id, priority, "job enqueued");
            self.notify.notify_one();
        } else {
            debug!(run_id = %run_id, "job already present, returning existing handle");
        }

        Ok(JobHandle {
            run_id: run_id.to_string(),
            state: state.parse()?,
            priority,
            created: inserted == 1,
        })
    }

    /// Block until a job is claimed or `stop` fires.
    pub async fn dequeue(&self, stop: &CancellationToken) -> Result<Option<ActiveJob>> {
        loop {
            if stop.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.try_dequeue()? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(None),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Claim the next runnable job without waiting.
    pub fn try_dequeue(&self) -> Result<Option<ActiveJob>> {
        loop {
            let now = now_ms();
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let next = tx
                .query_row(
                    "SELECT seq, run_id, payload_json, attempts FROM jobs
                     WHERE state IN ('waiting', 'delayed') AND available_at <= ?1
                     ORDER BY priority ASC, seq ASC LIMIT 1",
                    params![now],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, u32>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((seq, run_id, payload_json, attempts)) = next else {
                return Ok(None);
            };

            let payload = match serde_json::from_str::<JobPayload>(&payload_json) {
                Ok(p) => p,
                Err(e) => {
                    // Unreadable payloads can never succeed; fail them and move on.
                    error!(run_id = %run_id, error = %e, "corrupt job payload");
                    tx.execute(
                        "UPDATE jobs SET state = 'failed', failed_reason = ?2, finished_on = ?3
                         WHERE seq = ?1",
                        params![seq, format!("corrupt payload: {e}"), now],
                    )?;
                    tx.commit()?;
                    continue;
                }
            };

            tx.execute(
                "UPDATE jobs SET state = 'active', attempts = attempts + 1, processed_on = ?2,
                     cancel_requested = 0
                 WHERE seq = ?1",
                params![seq, now],
            )?;
            tx.commit()?;

            let cancel = CancellationToken::new();
            self.tokens().insert(run_id.clone(), cancel.clone());

            debug!(run_id = %run_id, attempt = attempts + 1, "job claimed");
            return Ok(Some(ActiveJob {
                payload,
                attempt: attempts + 1,
                cancel,
            }));
        }
    }

    pub fn update_progress(&self, run_id: &str, progress: u8) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE jobs SET progress = ?2 WHERE run_id = ?1 AND state = 'active'",
            params![run_id, progress.min(100)],
        )?;
        Ok(())
    }

    pub fn complete(&self, run_id: &str) -> Result<()> {
        self.finish(run_id, JobState::Completed, None)
    }

    /// Record the end of an in-flight job that observed its cancellation.
    pub fn finish_cancelled(&self, run_id: &str) -> Result<()> {
        self.finish(run_id, JobState::Cancelled, Some("cancelled"))
    }

    /// Hand a claimed job back untouched, e.g. when the worker is stopping
    /// before it could start the run.
    pub fn release_claim(&self, run_id: &str) -> Result<()> {
        self.release_token(run_id);
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE jobs SET state = 'waiting', attempts = MAX(attempts - 1, 0), processed_on = NULL
             WHERE run_id = ?1 AND state = 'active'",
            params![run_id],
        )?;
        self.notify.notify_one();
        debug!(run_id = %run_id, "job claim released");
        Ok(())
    }

    /// Record a failed attempt. Retryable failures go back to the queue with
    /// exponential backoff until `max_attempts` is reached.
    pub fn fail(&self, run_id: &str, reason: &str, retryable: bool) -> Result<FailOutcome> {
        self.release_token(run_id);
        let now = now_ms();
        let conn = self.pool.get()?;
        let (attempts, max_attempts, cancel_requested): (u32, u32, bool) = conn.query_row(
            "SELECT attempts, max_attempts, cancel_requested FROM jobs WHERE run_id = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if retryable && !cancel_requested && attempts < max_attempts {
            let delay = self.backoff_for(attempts);
            conn.execute(
                "UPDATE jobs SET state = 'delayed', failed_reason = ?2, available_at = ?3
                 WHERE run_id = ?1",
                params![run_id, reason, now + delay.as_millis() as i64],
            )?;
            warn!(
                run_id = %run_id,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "job failed, retry scheduled"
            );
            return Ok(FailOutcome::Retrying {
                attempt: attempts,
                delay,
            });
        }

        conn.execute(
            "UPDATE jobs SET state = 'failed', failed_reason = ?2, finished_on = ?3
             WHERE run_id = ?1",
            params![run_id, reason, now],
        )?;
        warn!(run_id = %run_id, attempts, reason = %reason, "job failed permanently");
        Ok(FailOutcome::Failed)
    }

    /// `base * 2^(attempt-1)`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.backoff_ms.saturating_mul(1u64 << exp))
    }

    pub fn status(&self, run_id: &str) -> Result<Option<JobStatus>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT state, progress, attempts, failed_reason, processed_on, finished_on
                 FROM jobs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u8>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(state, progress, attempts, failed_reason, processed_on, finished_on)| {
            Ok::<_, anyhow::Error>(JobStatus {
                id: run_id.to_string(),
                state: state.parse()?,
                progress,
                attempts,
                failed_reason,
                processed_on,
                finished_on,
            })
        })
        .transpose()
    }

    /// Remove a job that has not started, or signal one that is executing.
    pub fn cancel(&self, run_id: &str) -> Result<CancelOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM jobs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match state.as_deref().map(JobState::from_str).transpose()? {
            None => CancelOutcome::NotFound,
            Some(JobState::Waiting | JobState::Delayed) => {
                tx.execute("DELETE FROM jobs WHERE run_id = ?1", params![run_id])?;
                CancelOutcome::Removed
            }
            Some(JobState::Active) => {
                tx.execute(
                    "UPDATE jobs SET cancel_requested = 1 WHERE run_id = ?1",
                    params![run_id],
                )?;
                CancelOutcome::Signalled
            }
            Some(_) => CancelOutcome::AlreadyFinished,
        };
        tx.commit()?;

        if outcome == CancelOutcome::Signalled {
            if let Some(token) = self.tokens().get(run_id) {
                token.cancel();
            }
        }

        info!(run_id = %run_id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    /// Delete terminal jobs whose retention window has elapsed.
    pub fn purge_expired(&self) -> Result<usize> {
        let retention_ms = (self.config.retention_hours as i64).saturating_mul(3_600_000);
        let cutoff = now_ms() - retention_ms;
        let conn = self.pool.get()?;
        let purged = conn.execute(
            "DELETE FROM jobs WHERE state IN ('completed', 'failed', 'cancelled')
             AND finished_on IS NOT NULL AND finished_on <= ?1",
            params![cutoff],
        )?;
        if purged > 0 {
            info!(purged, "purged expired jobs");
        }
        Ok(purged)
    }

    /// Return jobs left `active` by a previous process to the queue.
    pub fn recover_stalled(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let recovered = conn.execute(
            "UPDATE jobs SET state = 'waiting', available_at = ?1
             WHERE state = 'active' AND cancel_requested = 0",
            params![now_ms()],
        )?;
        let cancelled = conn.execute(
            "UPDATE jobs SET state = 'cancelled', finished_on = ?1
             WHERE state = 'active' AND cancel_requested = 1",
            params![now_ms()],
        )?;
        if recovered + cancelled > 0 {
            warn!(recovered, cancelled, "recovered stalled jobs");
        }
        Ok(recovered)
    }

    pub fn counts(&self) -> Result<HashMap<String, u64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = HashMap::new();
        for r in rows {
            let (state, n) = r?;
            counts.insert(state, n.max(0) as u64);
        }
        Ok(counts)
    }

    fn finish(&self, run_id: &str, state: JobState, reason: Option<&str>) -> Result<()> {
        self.release_token(run_id);
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE jobs SET state = ?2, finished_on = ?3,
                 progress = CASE WHEN ?2 = 'completed' THEN 100 ELSE progress END,
                 failed_reason = COALESCE(?4, failed_reason)
             WHERE run_id = ?1",
            params![run_id, state.as_str(), now_ms(), reason],
        )?;
        Ok(())
    }

    fn release_token(&self, run_id: &str) {
        self.tokens().remove(run_id);
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        // A poisoned map only ever holds tokens; keep using it.
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Task, TaskKind};
    use crate::storage::test_pool;

    fn store(pool: Pool) -> JobStore {
        JobStore::new(
            pool,
            QueueConfig {
                max_attempts: 3,
                backoff_ms: 100,
                retention_hours: 0,
            },
            Duration::from_millis(20),
        )
    }

    fn payload(run_id: &str) -> JobPayload {
        JobPayload {
            run_id: run_id.into(),
            plan_id: "plan".into(),
            project_id: "proj".into(),
            tenant_id: "acme".into(),
            tasks: vec![Task::new("t", TaskKind::Screenshot)],
        }
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        let first = jobs.enqueue("r1", &payload("r1"), 0).unwrap();
        let second = jobs.enqueue("r1", &payload("r1"), 5).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.priority, 0);
        assert_eq!(jobs.counts().unwrap()["waiting"], 1);
    }

    #[test]
    fn test_dequeue_priority_then_fifo() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        jobs.enqueue("low-1", &payload("low-1"), 10).unwrap();
        jobs.enqueue("high", &payload("high"), 1).unwrap();
        jobs.enqueue("low-2", &payload("low-2"), 10).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| jobs.try_dequeue().unwrap())
            .map(|j| j.payload.run_id)
            .collect();
        assert_eq!(order, vec!["high", "low-1", "low-2"]);
    }

    #[test]
    fn test_status_tracks_attempts_and_progress() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        jobs.enqueue("r1", &payload("r1"), 0).unwrap();
        let job = jobs.try_dequeue().unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        jobs.update_progress("r1", 50).unwrap();

        let status = jobs.status("r1").unwrap().unwrap();
        assert_eq!(status.state, JobState::Active);
        assert_eq!(status.progress, 50);
        assert_eq!(status.attempts, 1);
        assert!(status.processed_on.is_some());

        jobs.complete("r1").unwrap();
        let status = jobs.status("r1").unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, 100);
        assert!(status.finished_on.is_some());
    }

    #[test]
    fn test_retry_with_exponential_backoff_then_fail() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        assert_eq!(jobs.backoff_for(1), Duration::from_millis(100));
        assert_eq!(jobs.backoff_for(2), Duration::from_millis(200));
        assert_eq!(jobs.backoff_for(3), Duration::from_millis(400));

        jobs.enqueue("r1", &payload("r1"), 0).unwrap();
        jobs.try_dequeue().unwrap().unwrap();
        let outcome = jobs.fail("r1", "engine down", true).unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(jobs.status("r1").unwrap().unwrap().state, JobState::Delayed);
        // Not runnable until the backoff elapses.
        assert!(jobs.try_dequeue().unwrap().is_none());

        std::thread::sleep(Duration::from_millis(120));
        jobs.try_dequeue().unwrap().unwrap();
        assert!(matches!(
            jobs.fail("r1", "engine down", true).unwrap(),
            FailOutcome::Retrying { attempt: 2, .. }
        ));

        std::thread::sleep(Duration::from_millis(220));
        jobs.try_dequeue().unwrap().unwrap();
        assert_eq!(jobs.fail("r1", "engine down", true).unwrap(), FailOutcome::Failed);

        let status = jobs.status("r1").unwrap().unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempts, 3);
        assert_eq!(status.failed_reason.as_deref(), Some("engine down"));
    }

    #[test]
    fn test_non_retryable_failure_is_terminal() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        jobs.enqueue("r1", &payload("r1"), 0).unwrap();
        jobs.try_dequeue().unwrap().unwrap();
        assert_eq!(jobs.fail("r1", "critical task", false).unwrap(), FailOutcome::Failed);
    }

    #[test]
    fn test_cancel_waiting_removes_job() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        jobs.enqueue("r1", &payload("r1"), 0).unwrap();
        assert_eq!(jobs.cancel("r1").unwrap(), CancelOutcome::Removed);
        assert!(jobs.status("r1").unwrap().is_none());
        assert!(jobs.try_dequeue().unwrap().is_none());
        assert_eq!(jobs.cancel("r1").unwrap(), CancelOutcome::NotFound);
    }

    #[test]
    fn test_cancel_active_signals_token() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        jobs.enqueue("r1", &payload("r1"), 0).unwrap();
        let job = jobs.try_dequeue().unwrap().unwrap();
        assert!(!job.cancel.is_cancelled());

        assert_eq!(jobs.cancel("r1").unwrap(), CancelOutcome::Signalled);
        assert!(job.cancel.is_cancelled());
        // Cancellation also suppresses infrastructure retries.
        assert_eq!(jobs.fail("r1", "boom", true).unwrap(), FailOutcome::Failed);
        assert_eq!(jobs.cancel("r1").unwrap(), CancelOutcome::AlreadyFinished);
    }

    #[test]
    fn test_purge_and_recover() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        jobs.enqueue("done", &payload("done"), 0).unwrap();
        jobs.enqueue("stuck", &payload("stuck"), 1).unwrap();
        jobs.try_dequeue().unwrap().unwrap();
        jobs.complete("done").unwrap();
        jobs.try_dequeue().unwrap().unwrap();

        // retention_hours = 0 in this store.
        assert_eq!(jobs.purge_expired().unwrap(), 1);
        assert!(jobs.status("done").unwrap().is_none());

        assert_eq!(jobs.recover_stalled().unwrap(), 1);
        assert_eq!(jobs.status("stuck").unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue_and_stops() {
        let (_dir, pool) = test_pool();
        let jobs = store(pool);
        let stop = CancellationToken::new();

        let waiter = {
            let jobs = jobs.clone();
            let stop = stop.clone();
            tokio::spawn(async move { jobs.dequeue(&stop).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        jobs.enqueue("r1", &payload("r1"), 0).unwrap();
        let job = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(job.run_id(), "r1");

        stop.cancel();
        assert!(jobs.dequeue(&stop).await.unwrap().is_none());
    }
}
