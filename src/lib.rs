//! planrunner -- durable execution pipeline for browser automation plans.
//!
//! This crate provides the job queue, engine pool, task executor, worker
//! pool, usage metering and quota enforcement behind the `planrunner`
//! daemon and CLI.

pub mod api;
pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod plan;
pub mod queue;
pub mod quota;
pub mod scheduler;
pub mod storage;
pub mod usage;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::PipelineConfig;
use crate::engine::webdriver::WebDriverLauncher;
use crate::engine::{BrowserLauncher, BrowserPool};
use crate::events::EventBus;
use crate::executor::artifacts::ArtifactStore;
use crate::executor::TaskExecutor;
use crate::pipeline::Pipeline;
use crate::queue::JobStore;
use crate::quota::directory::SqliteTenantDirectory;
use crate::quota::tiers::{PlanResolver, TierCatalog};
use crate::quota::QuotaEnforcer;
use crate::scheduler::jobs::{PoolSweepJob, PurgeJob, UsageFlushJob};
use crate::scheduler::{Cadence, Scheduler};
use crate::storage::{Pool, RunStore};
use crate::usage::{BillingPeriod, MemoryUsageStore, SqliteUsageStore, UsageMeter};
use crate::worker::{RateLimiter, WorkerContext, WorkerPool};

const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Every long-lived component, wired together from one configuration.
#[derive(Clone)]
pub struct Services {
    pub pool: Pool,
    pub jobs: JobStore,
    pub runs: RunStore,
    pub tenants: SqliteTenantDirectory,
    pub events: EventBus,
    pub fast_usage: Arc<MemoryUsageStore>,
    pub meter: Arc<UsageMeter>,
    pub engines: Arc<BrowserPool>,
    pub executor: TaskExecutor,
    pub pipeline: Pipeline,
}

impl Services {
    pub fn build(config: &PipelineConfig, launcher: Arc<dyn BrowserLauncher>) -> Result<Self> {
        let pool = storage::open_pool(&config.database.path).with_context(|| {
            format!("failed to open database {}", config.database.path.display())
        })?;
        let events = EventBus::default();
        let jobs = JobStore::new(pool.clone(), config.queue.clone(), config.workers.dequeue_poll());
        let runs = RunStore::new(pool.clone());
        let tenants = SqliteTenantDirectory::new(pool.clone());

        let plans = PlanResolver::new(
            TierCatalog::with_overrides(&config.tiers),
            Arc::new(tenants.clone()),
        );
        let fast_usage = Arc::new(MemoryUsageStore::new());
        let meter = Arc::new(UsageMeter::new(
            fast_usage.clone(),
            SqliteUsageStore::new(pool.clone()),
            plans.clone(),
            events.clone(),
            &config.usage,
        ));
        let quota = QuotaEnforcer::new(plans, meter.clone());

        let engines = Arc::new(BrowserPool::new(launcher, config.engine.max_instances));
        let artifacts = ArtifactStore::new(
            config.executor.artifacts_root.clone(),
            config.api.public_base_url.clone(),
        );
        let executor = TaskExecutor::new(
            &config.executor,
            &config.engine,
            artifacts,
            events.clone(),
            runs.clone(),
            jobs.clone(),
        );
        let pipeline = Pipeline::new(jobs.clone(), runs.clone(), quota, events.clone());

        Ok(Self {
            pool,
            jobs,
            runs,
            tenants,
            events,
            fast_usage,
            meter,
            engines,
            executor,
            pipeline,
        })
    }

    /// Startup bookkeeping: requeue work a previous process left claimed and
    /// seed the fast usage counters from the durable table.
    pub fn recover(&self) -> Result<()> {
        let jobs = self.jobs.recover_stalled()?;
        let runs = self.runs.requeue_interrupted()?;
        let counters = self
            .meter
            .hydrate(&self.fast_usage, BillingPeriod::current())?;
        info!(jobs, runs, counters, "startup recovery complete");
        Ok(())
    }

    pub fn worker_context(&self, config: &PipelineConfig) -> WorkerContext {
        WorkerContext {
            jobs: self.jobs.clone(),
            runs: self.runs.clone(),
            executor: self.executor.clone(),
            engines: self.engines.clone(),
            meter: self.meter.clone(),
            events: self.events.clone(),
            limiter: Arc::new(RateLimiter::new(
                config.workers.rate_limit_jobs,
                config.workers.rate_limit_window(),
            )),
            error_backoff: DEQUEUE_ERROR_BACKOFF,
        }
    }

    pub fn app_state(&self, config: &PipelineConfig) -> api::state::AppState {
        api::state::AppState {
            pipeline: self.pipeline.clone(),
            meter: self.meter.clone(),
            engines: self.engines.clone(),
            artifacts_root: config.executor.artifacts_root.clone(),
        }
    }

    /// Maintenance jobs: usage flush, job purge, engine sweep.
    pub fn scheduler(&self, config: &PipelineConfig) -> Result<Scheduler> {
        let mut scheduler = Scheduler::new();
        scheduler.register(
            Cadence::parse_cron(&config.usage.flush_schedule)?,
            Arc::new(UsageFlushJob::new(self.meter.clone())),
        );
        scheduler.register(
            Cadence::Every(PURGE_INTERVAL),
            Arc::new(PurgeJob::new(self.jobs.clone())),
        );
        scheduler.register(
            Cadence::Every(Duration::from_secs(config.engine.sweep_interval_secs.max(1))),
            Arc::new(PoolSweepJob::new(self.engines.clone())),
        );
        Ok(scheduler)
    }
}

/// Start the planrunner daemon: API server, worker pool, and scheduler.
pub async fn serve(config: PipelineConfig) -> Result<()> {
    // 1. Engine launcher and components
    let launcher = Arc::new(WebDriverLauncher::new(config.engine.clone())?);
    let services = Services::build(&config, launcher)?;
    services.recover()?;

    // 2. Workers
    let mut workers = WorkerPool::start(config.workers.concurrency, services.worker_context(&config));

    // 3. Scheduler
    let mut scheduler = services.scheduler(&config)?;
    scheduler.start();

    // 4. API server
    let app = api::router(services.app_state(&config));
    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.api.bind))?;
    info!(addr = %config.api.bind, "planrunner listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // 5. Drain: in-flight runs settle before the final usage flush.
    info!("shutting down");
    workers.stop().await;
    scheduler.stop().await;
    services.engines.shutdown().await;

    served.context("API server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
