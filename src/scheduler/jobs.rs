//! Maintenance jobs driven by the scheduler.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::PeriodicJob;
use crate::engine::BrowserPool;
use crate::queue::JobStore;
use crate::usage::{BillingPeriod, UsageMeter};

/// Copies fast usage counters into the durable table and closes billing
/// periods at month rollover.
pub struct UsageFlushJob {
    meter: Arc<UsageMeter>,
}

impl UsageFlushJob {
    pub fn new(meter: Arc<UsageMeter>) -> Self {
        Self { meter }
    }
}

#[async_trait::async_trait]
impl PeriodicJob for UsageFlushJob {
    fn name(&self) -> &str {
        "usage-flush"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        self.meter.flush_tick(now).await.map(|_| ())
    }

    async fn on_stop(&self) {
        let period = BillingPeriod::current();
        match self.meter.flush(period).await {
            Ok(n) => info!(%period, counters = n, "final usage flush"),
            Err(e) => warn!(%period, error = %e, "final usage flush failed"),
        }
    }
}

/// Drops terminal jobs past the retention window.
pub struct PurgeJob {
    jobs: JobStore,
}

impl PurgeJob {
    pub fn new(jobs: JobStore) -> Self {
        Self { jobs }
    }
}

#[async_trait::async_trait]
impl PeriodicJob for PurgeJob {
    fn name(&self) -> &str {
        "job-purge"
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<()> {
        self.jobs.purge_expired().map(|_| ())
    }
}

/// Evicts engine instances that stopped answering.
pub struct PoolSweepJob {
    pool: Arc<BrowserPool>,
}

impl PoolSweepJob {
    pub fn new(pool: Arc<BrowserPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PeriodicJob for PoolSweepJob {
    fn name(&self) -> &str {
        "pool-sweep"
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<()> {
        let evicted = self.pool.sweep().await;
        if evicted > 0 {
            info!(evicted, "engine pool sweep");
        }
        Ok(())
    }
}
