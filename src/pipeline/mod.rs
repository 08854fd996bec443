//! Submission facade: validation, admission, run record, enqueue.
//!
//! This is the surface collaborators call. Workers never go through it.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{EventBus, RunEvent};
use crate::plan::{JobPayload, PlanError};
use crate::queue::{CancelOutcome, JobHandle, JobState, JobStatus, JobStore};
use crate::quota::{QuotaEnforcer, QuotaError, QuotaExceeded, ResourceKind};
use crate::storage::{Run, RunStore};
use crate::usage::Metric;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),

    #[error("invalid payload: {0}")]
    Invalid(#[from] PlanError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<QuotaError> for SubmitError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::Exceeded(q) => SubmitError::Quota(q),
            QuotaError::Lookup(e) => SubmitError::Storage(e),
        }
    }
}

/// Job status joined with the run record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub job: Option<JobStatus>,
    pub run: Option<Run>,
}

impl RunView {
    pub fn is_empty(&self) -> bool {
        self.job.is_none() && self.run.is_none()
    }
}

#[derive(Clone)]
pub struct Pipeline {
    jobs: JobStore,
    runs: RunStore,
    quota: QuotaEnforcer,
    events: EventBus,
}

impl Pipeline {
    pub fn new(jobs: JobStore, runs: RunStore, quota: QuotaEnforcer, events: EventBus) -> Self {
        Self {
            jobs,
            runs,
            quota,
            events,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    pub fn quota(&self) -> &QuotaEnforcer {
        &self.quota
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Admit and enqueue a run. A run id seen before returns its existing
    /// handle without another quota check.
    pub async fn submit(&self, payload: JobPayload, priority: i64) -> Result<JobHandle, SubmitError> {
        payload.validate()?;
        let run_id = payload.run_id.as_str();

        if let Some(existing) = self.existing_handle(run_id, priority)? {
            debug!(run_id = %run_id, "duplicate submit, returning existing job");
            return Ok(existing);
        }

        let tenant = payload.tenant_id.as_str();
        self.quota
            .require_admission(tenant, ResourceKind::ConcurrentRuns)?;
        self.quota
            .check_metered_quota(tenant, Metric::RunMinutes, 1)
            .await?;

        self.runs.create(&payload)?;
        let handle = self.jobs.enqueue(run_id, &payload, priority)?;
        info!(
            run_id = %run_id,
            tenant = %tenant,
            tasks = payload.tasks.len(),
            priority,
            created = handle.created,
            "run submitted"
        );
        Ok(handle)
    }

    fn existing_handle(&self, run_id: &str, priority: i64) -> anyhow::Result<Option<JobHandle>> {
        if let Some(status) = self.jobs.status(run_id)? {
            return Ok(Some(JobHandle {
                run_id: run_id.to_string(),
                state: status.state,
                priority,
                created: false,
            }));
        }
        // Job already purged or cancelled; the run record still owns the id.
        Ok(self.runs.get(run_id)?.map(|run| JobHandle {
            run_id: run.id,
            state: JobState::from_run_status(run.status),
            priority,
            created: false,
        }))
    }

    /// Remove a queued run or signal a running one.
    pub fn cancel(&self, run_id: &str) -> anyhow::Result<CancelOutcome> {
        let outcome = self.jobs.cancel(run_id)?;
        match outcome {
            CancelOutcome::Removed => {
                if self.runs.mark_cancelled(run_id)? {
                    self.events.publish(RunEvent::Cancelled {
                        run_id: run_id.to_string(),
                    });
                }
            }
            CancelOutcome::Signalled => {
                // Worker publishes the terminal event at the next task boundary.
                self.runs.mark_cancelled(run_id)?;
            }
            CancelOutcome::AlreadyFinished | CancelOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    pub fn status(&self, run_id: &str) -> anyhow::Result<RunView> {
        Ok(RunView {
            job: self.jobs.status(run_id)?,
            run: self.runs.get(run_id)?,
        })
    }

    pub fn run(&self, run_id: &str) -> anyhow::Result<Option<Run>> {
        self.runs.get(run_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{QueueConfig, UsageConfig};
    use crate::quota::directory::SqliteTenantDirectory;
    use crate::quota::tiers::{PlanResolver, TierCatalog};
    use crate::storage::{test_pool, RunStatus};
    use crate::plan::{Task, TaskKind};
    use crate::usage::{MemoryUsageStore, SqliteUsageStore, UsageMeter};

    struct Fixture {
        _dir: tempfile::TempDir,
        pipeline: Pipeline,
        tenants: SqliteTenantDirectory,
        meter: Arc<UsageMeter>,
    }

    fn fixture() -> Fixture {
        let (dir, pool) = test_pool();
        let tenants = SqliteTenantDirectory::new(pool.clone());
        let plans = PlanResolver::new(TierCatalog::default(), Arc::new(tenants.clone()));
        let events = EventBus::default();
        let meter = Arc::new(UsageMeter::new(
            Arc::new(MemoryUsageStore::new()),
            SqliteUsageStore::new(pool.clone()),
            plans.clone(),
            events.clone(),
            &UsageConfig::default(),
        ));
        let pipeline = Pipeline::new(
            JobStore::new(pool.clone(), QueueConfig::default(), Duration::from_millis(50)),
            RunStore::new(pool),
            QuotaEnforcer::new(plans, meter.clone()),
            events,
        );
        Fixture {
            _dir: dir,
            pipeline,
            tenants,
            meter,
        }
    }

    fn payload(run_id: &str, tenant: &str) -> JobPayload {
        JobPayload {
            run_id: run_id.into(),
            plan_id: "plan-1".into(),
            project_id: "proj-1".into(),
            tenant_id: tenant.into(),
            tasks: vec![Task::new("open", TaskKind::Navigate).with_url("https://example.com")],
        }
    }

    #[tokio::test]
    async fn test_submit_is_idempotent_and_skips_quota_on_repeat() {
        let f = fixture();
        f.tenants.upsert_tenant("acme", "free").unwrap();

        let first = f.pipeline.submit(payload("run-1", "acme"), 0).await.unwrap();
        assert!(first.created);
        assert_eq!(first.state, JobState::Waiting);

        // Free tier allows one concurrent run; the repeat must still succeed.
        let second = f.pipeline.submit(payload("run-1", "acme"), 0).await.unwrap();
        assert!(!second.created);
        assert_eq!(f.pipeline.jobs().counts().unwrap().get("waiting"), Some(&1));
    }

    #[tokio::test]
    async fn test_concurrent_run_limit_is_distinguishable() {
        let f = fixture();
        f.tenants.upsert_tenant("acme", "free").unwrap();
        f.pipeline.submit(payload("run-1", "acme"), 0).await.unwrap();

        let err = f.pipeline.submit(payload("run-2", "acme"), 0).await.unwrap_err();
        match err {
            SubmitError::Quota(q) => {
                assert_eq!(q.subject, "concurrent_runs");
                assert_eq!(q.current, 1);
                assert_eq!(q.limit, 1);
            }
            other => panic!("expected quota error, got {other:?}"),
        }
        assert!(f.pipeline.run("run-2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_run_minutes_block_submission() {
        let f = fixture();
        f.tenants.upsert_tenant("acme", "free").unwrap();
        f.meter.increment("acme", Metric::RunMinutes, 60, None).await.unwrap();

        let err = f.pipeline.submit(payload("run-1", "acme"), 0).await.unwrap_err();
        assert!(matches!(err, SubmitError::Quota(ref q) if q.subject == "run_minutes"));
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() {
        let f = fixture();
        let mut p = payload("run-1", "acme");
        p.tasks.clear();
        let err = f.pipeline.submit(p, 0).await.unwrap_err();
        assert!(matches!(err, SubmitError::Invalid(PlanError::NoTasks)));
    }

    #[tokio::test]
    async fn test_cancel_queued_run_removes_job() {
        let f = fixture();
        let mut events = f.pipeline.events().subscribe();
        f.pipeline.submit(payload("run-1", "acme"), 0).await.unwrap();

        assert_eq!(f.pipeline.cancel("run-1").unwrap(), CancelOutcome::Removed);
        let view = f.pipeline.status("run-1").unwrap();
        assert!(view.job.is_none());
        assert_eq!(view.run.unwrap().status, RunStatus::Cancelled);

        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "run:cancelled");
        assert_eq!(f.pipeline.cancel("missing").unwrap(), CancelOutcome::NotFound);
    }
}
