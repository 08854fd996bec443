//! Admission and metered-quota gate.
//!
//! Read-only: nothing here changes counters. Rejections surface as
//! [`QuotaExceeded`] so callers can tell them apart from failures.

pub mod directory;
pub mod tiers;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use self::tiers::{admits, percentage, PlanResolver, UNLIMITED};
use crate::usage::{Metric, UsageMeter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Projects,
    Members,
    ConcurrentRuns,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Projects => "projects",
            ResourceKind::Members => "members",
            ResourceKind::ConcurrentRuns => "concurrent_runs",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "projects" => ResourceKind::Projects,
            "members" => ResourceKind::Members,
            "concurrent_runs" => ResourceKind::ConcurrentRuns,
            other => anyhow::bail!("unknown resource kind '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub allowed: bool,
    pub current: u64,
    pub limit: i64,
    pub percentage: f64,
}

/// A request rejected by plan limits.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("quota exceeded for {subject}: {current} of {limit} ({percentage:.0}%)")]
pub struct QuotaExceeded {
    pub tenant_id: String,
    pub subject: String,
    pub current: u64,
    pub limit: i64,
    pub percentage: f64,
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Exceeded(#[from] QuotaExceeded),

    #[error("quota lookup failed: {0:#}")]
    Lookup(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    plans: PlanResolver,
    meter: Arc<UsageMeter>,
}

impl QuotaEnforcer {
    pub fn new(plans: PlanResolver, meter: Arc<UsageMeter>) -> Self {
        Self { plans, meter }
    }

    /// Compare the tenant's current count of `kind` against its tier limit.
    pub fn check_admission(&self, tenant_id: &str, kind: ResourceKind) -> anyhow::Result<Admission> {
        let limits = self.plans.limits_for(tenant_id)?;
        let directory = self.plans.directory();
        let (current, limit) = match kind {
            ResourceKind::Projects => (directory.project_count(tenant_id)?, limits.projects),
            ResourceKind::Members => (directory.member_count(tenant_id)?, limits.members),
            ResourceKind::ConcurrentRuns => {
                (directory.active_runs(tenant_id)?, limits.concurrent_runs)
            }
        };
        let admission = Admission {
            allowed: admits(limit, current),
            current,
            limit,
            percentage: percentage(current, limit),
        };
        debug!(tenant = %tenant_id, %kind, current, limit, allowed = admission.allowed, "admission check");
        Ok(admission)
    }

    /// [`check_admission`](Self::check_admission) as a hard gate.
    pub fn require_admission(&self, tenant_id: &str, kind: ResourceKind) -> Result<Admission, QuotaError> {
        let admission = self.check_admission(tenant_id, kind)?;
        if admission.allowed {
            return Ok(admission);
        }
        info!(tenant = %tenant_id, %kind, current = admission.current, limit = admission.limit, "admission denied");
        Err(QuotaExceeded {
            tenant_id: tenant_id.to_string(),
            subject: kind.to_string(),
            current: admission.current,
            limit: admission.limit,
            percentage: admission.percentage,
        }
        .into())
    }

    /// Reject work whose estimated consumption would push `metric` past the limit.
    pub async fn check_metered_quota(
        &self,
        tenant_id: &str,
        metric: Metric,
        estimated: u64,
    ) -> Result<(), QuotaError> {
        let stats = self.meter.stats(tenant_id, metric).await?;
        if stats.limit == UNLIMITED || stats.current.saturating_add(estimated) <= stats.limit as u64 {
            return Ok(());
        }
        info!(tenant = %tenant_id, %metric, current = stats.current, limit = stats.limit, estimated, "metered quota denied");
        Err(QuotaExceeded {
            tenant_id: tenant_id.to_string(),
            subject: metric.to_string(),
            current: stats.current,
            limit: stats.limit,
            percentage: stats.percentage,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsageConfig;
    use crate::events::EventBus;
    use crate::quota::directory::SqliteTenantDirectory;
    use crate::quota::tiers::TierCatalog;
    use crate::storage::{test_pool, RunStore};
    use crate::usage::{MemoryUsageStore, SqliteUsageStore};
    use crate::plan::{JobPayload, Task, TaskKind};

    fn enforcer() -> (tempfile::TempDir, QuotaEnforcer, SqliteTenantDirectory, RunStore, Arc<UsageMeter>) {
        let (dir, pool) = test_pool();
        let tenants = SqliteTenantDirectory::new(pool.clone());
        let plans = PlanResolver::new(TierCatalog::default(), Arc::new(tenants.clone()));
        let meter = Arc::new(UsageMeter::new(
            Arc::new(MemoryUsageStore::new()),
            SqliteUsageStore::new(pool.clone()),
            plans.clone(),
            EventBus::default(),
            &UsageConfig::default(),
        ));
        let quota = QuotaEnforcer::new(plans, meter.clone());
        (dir, quota, tenants, RunStore::new(pool), meter)
    }

    fn payload(run_id: &str) -> JobPayload {
        JobPayload {
            run_id: run_id.into(),
            plan_id: "plan".into(),
            project_id: "proj".into(),
            tenant_id: "t1".into(),
            tasks: vec![Task::new("a", TaskKind::Navigate).with_url("https://x.test")],
        }
    }

    #[test]
    fn test_admission_false_iff_count_reaches_limit() {
        let (_dir, quota, tenants, _, _) = enforcer();
        tenants.upsert_tenant("t1", "free").unwrap();

        for i in 0..3 {
            assert!(quota.check_admission("t1", ResourceKind::Projects).unwrap().allowed);
            tenants.add_project("t1", &format!("p{i}"), "p").unwrap();
        }
        let admission = quota.check_admission("t1", ResourceKind::Projects).unwrap();
        assert!(!admission.allowed);
        assert_eq!(admission.current, 3);
        assert_eq!(admission.limit, 3);
        assert_eq!(admission.percentage, 100.0);
    }

    #[test]
    fn test_unlimited_always_admits() {
        let (_dir, quota, tenants, _, _) = enforcer();
        tenants.upsert_tenant("t1", "enterprise").unwrap();
        for i in 0..20 {
            tenants.add_member("t1", &format!("u{i}")).unwrap();
        }
        let admission = quota.check_admission("t1", ResourceKind::Members).unwrap();
        assert!(admission.allowed);
        assert_eq!(admission.limit, -1);
    }

    #[test]
    fn test_concurrent_runs_counts_queued_and_running() {
        let (_dir, quota, _, runs, _) = enforcer();
        assert!(quota.require_admission("t1", ResourceKind::ConcurrentRuns).is_ok());
        runs.create(&payload("r1")).unwrap();

        match quota.require_admission("t1", ResourceKind::ConcurrentRuns) {
            Err(QuotaError::Exceeded(e)) => {
                assert_eq!(e.subject, "concurrent_runs");
                assert_eq!((e.current, e.limit), (1, 1));
            }
            other => panic!("expected quota rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_metered_quota() {
        let (_dir, quota, _, _, meter) = enforcer();
        meter.increment("t1", Metric::RunMinutes, 59, None).await.unwrap();

        assert!(quota.check_metered_quota("t1", Metric::RunMinutes, 1).await.is_ok());
        let err = quota
            .check_metered_quota("t1", Metric::RunMinutes, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Exceeded(ref e) if e.current == 59 && e.limit == 60));
    }
}
