//! Worker pool -- N dequeue loops feeding the task executor.
//!
//! Every loop takes one run at a time: claim, rate-limit, mark running,
//! lease an engine, execute, settle. A panic or error while processing a
//! run fails that run and the loop keeps consuming. The page is closed and
//! the engine lease returned even when the executor panics.

pub mod rate_limit;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use self::rate_limit::RateLimiter;
use crate::engine::BrowserPool;
use crate::events::{EventBus, LogLevel, RunEvent};
use crate::executor::{RunOutcome, RunReport, TaskExecutor};
use crate::plan::JobPayload;
use crate::queue::{ActiveJob, FailOutcome, JobStore};
use crate::storage::{RunCompletion, RunStatus, RunStore};
use crate::usage::{run_minutes, Metric, UsageMeter};

/// Everything a worker loop needs. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: JobStore,
    pub runs: RunStore,
    pub executor: TaskExecutor,
    pub engines: Arc<BrowserPool>,
    pub meter: Arc<UsageMeter>,
    pub events: EventBus,
    pub limiter: Arc<RateLimiter>,
    /// Pause after a dequeue error before polling again.
    pub error_backoff: Duration,
}

pub struct WorkerPool {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(concurrency: usize, ctx: WorkerContext) -> Self {
        let stop = CancellationToken::new();
        let handles = (0..concurrency.max(1))
            .map(|id| tokio::spawn(worker_loop(id, ctx.clone(), stop.clone())))
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "worker pool started");
        Self { stop, handles }
    }

    /// Stop claiming new runs and wait for in-flight runs to settle.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(id: usize, ctx: WorkerContext, stop: CancellationToken) {
    debug!(worker = id, "worker loop started");
    loop {
        let job = match ctx.jobs.dequeue(&stop).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                error!(worker = id, error = %e, "dequeue failed");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(ctx.error_backoff) => continue,
                }
            }
        };

        if !ctx.limiter.acquire(&stop).await {
            if let Err(e) = ctx.jobs.release_claim(job.run_id()) {
                warn!(worker = id, run_id = %job.run_id(), error = %e, "failed to release claim");
            }
            break;
        }

        let run_id = job.run_id().to_string();
        let payload = job.payload.clone();
        let outcome = AssertUnwindSafe(process(&ctx, job)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("worker error: {e:#}")),
            Err(panic) => Some(format!("worker panicked: {}", panic_message(panic.as_ref()))),
        };
        if let Some(reason) = failure {
            error!(worker = id, run_id = %run_id, reason = %reason, "run aborted at worker boundary");
            settle_aborted(&ctx, &payload, &reason);
        }
    }
    debug!(worker = id, "worker loop stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Last-resort bookkeeping for a run whose processing blew up.
fn settle_aborted(ctx: &WorkerContext, payload: &JobPayload, reason: &str) {
    let run_id = payload.run_id.as_str();
    if let Err(e) = ctx.jobs.fail(run_id, reason, false) {
        error!(run_id = %run_id, error = %e, "failed to mark job failed");
    }
    let completion = RunCompletion {
        status: RunStatus::Failed,
        duration_ms: 0,
        result: None,
        error_message: Some(reason.to_string()),
    };
    if let Err(e) = ctx.runs.finish(run_id, &completion) {
        error!(run_id = %run_id, error = %e, "failed to mark run failed");
    }
    ctx.events.publish(RunEvent::Failed {
        run_id: run_id.to_string(),
        error: reason.to_string(),
    });
}

async fn process(ctx: &WorkerContext, job: ActiveJob) -> Result<()> {
    let payload = &job.payload;
    let run_id = payload.run_id.as_str();

    if !ctx.runs.mark_running(run_id, Utc::now())? {
        // Cancelled between enqueue and claim.
        info!(run_id = %run_id, "run no longer queued, skipping");
        ctx.jobs.finish_cancelled(run_id)?;
        return Ok(());
    }

    info!(run_id = %run_id, attempt = job.attempt, tasks = payload.tasks.len(), "run started");
    ctx.events.publish(RunEvent::Started {
        run_id: run_id.to_string(),
        plan_id: payload.plan_id.clone(),
    });

    let engine = match ctx.engines.acquire().await {
        Ok(engine) => engine,
        Err(e) => return settle_infrastructure(ctx, run_id, &format!("engine unavailable: {e}")),
    };
    let page = match engine.new_page().await {
        Ok(page) => page,
        Err(e) => {
            ctx.engines.release(engine).await;
            return settle_infrastructure(ctx, run_id, &format!("failed to open page: {e}"));
        }
    };

    let executed = AssertUnwindSafe(ctx.executor.execute(page.as_ref(), payload, &job.cancel))
        .catch_unwind()
        .await;
    page.close().await;
    ctx.engines.release(engine).await;

    match executed {
        Ok(report) => settle(ctx, payload, report, &job.cancel).await,
        Err(panic) => {
            let reason = format!("worker panicked: {}", panic_message(panic.as_ref()));
            error!(run_id = %run_id, reason = %reason, "executor panicked");
            settle_aborted(ctx, payload, &reason);
            Ok(())
        }
    }
}

async fn settle(
    ctx: &WorkerContext,
    payload: &JobPayload,
    report: RunReport,
    cancel: &CancellationToken,
) -> Result<()> {
    let run_id = payload.run_id.as_str();
    let duration_ms = report.duration.as_millis() as u64;

    // A cancel that lands during the last task is never seen at a boundary.
    if report.outcome != RunOutcome::Cancelled && cancel.is_cancelled() {
        info!(run_id = %run_id, "cancellation arrived after the last task boundary");
        return settle_cancelled(ctx, payload, &report, duration_ms).await;
    }

    match &report.outcome {
        RunOutcome::Completed => {
            let finished = ctx.runs.finish(
                run_id,
                &RunCompletion {
                    status: RunStatus::Completed,
                    duration_ms: duration_ms as i64,
                    result: Some(report.result_json()),
                    error_message: None,
                },
            )?;
            if !finished && run_cancelled(ctx, run_id)? {
                return settle_cancelled(ctx, payload, &report, duration_ms).await;
            }
            ctx.jobs.complete(run_id)?;
            record_usage(ctx, payload, &report).await;
            info!(
                run_id = %run_id,
                duration_ms,
                partial_failures = report.partial_failures.len(),
                "run completed"
            );
            ctx.events.publish(RunEvent::Completed {
                run_id: run_id.to_string(),
                duration: duration_ms,
                artifacts: report.artifacts.clone(),
            });
        }
        RunOutcome::Failed { task_id, error } => {
            let message = format!("task '{task_id}' failed: {error}");
            let finished = ctx.runs.finish(
                run_id,
                &RunCompletion {
                    status: RunStatus::Failed,
                    duration_ms: duration_ms as i64,
                    result: Some(report.result_json()),
                    error_message: Some(message.clone()),
                },
            )?;
            if !finished && run_cancelled(ctx, run_id)? {
                return settle_cancelled(ctx, payload, &report, duration_ms).await;
            }
            ctx.jobs.fail(run_id, &message, false)?;
            record_usage(ctx, payload, &report).await;
            warn!(run_id = %run_id, duration_ms, error = %message, "run failed");
            ctx.events.publish(RunEvent::Failed {
                run_id: run_id.to_string(),
                error: message,
            });
        }
        RunOutcome::Cancelled => {
            settle_cancelled(ctx, payload, &report, duration_ms).await?;
        }
        RunOutcome::Infrastructure { error } => {
            settle_infrastructure(ctx, run_id, error)?;
        }
    }
    Ok(())
}

fn run_cancelled(ctx: &WorkerContext, run_id: &str) -> Result<bool> {
    Ok(ctx
        .runs
        .get(run_id)?
        .is_some_and(|run| run.status == RunStatus::Cancelled))
}

/// Run record, job row and terminal event all agree on `cancelled`.
async fn settle_cancelled(
    ctx: &WorkerContext,
    payload: &JobPayload,
    report: &RunReport,
    duration_ms: u64,
) -> Result<()> {
    let run_id = payload.run_id.as_str();
    ctx.runs.mark_cancelled(run_id)?;
    ctx.jobs.finish_cancelled(run_id)?;
    record_usage(ctx, payload, report).await;
    info!(run_id = %run_id, duration_ms, "run cancelled");
    ctx.events.publish(RunEvent::Cancelled {
        run_id: run_id.to_string(),
    });
    Ok(())
}

/// Engine or storage trouble: let the job store retry with backoff, or give
/// up once attempts are exhausted.
fn settle_infrastructure(ctx: &WorkerContext, run_id: &str, error: &str) -> Result<()> {
    match ctx.jobs.fail(run_id, error, true)? {
        FailOutcome::Retrying { attempt, delay } => {
            ctx.runs.requeue(run_id)?;
            let message = format!(
                "attempt {attempt} hit an infrastructure failure, retrying in {}ms: {error}",
                delay.as_millis()
            );
            ctx.runs.append_log(run_id, LogLevel::Warn.as_str(), &message)?;
            ctx.events.publish(RunEvent::Log {
                run_id: run_id.to_string(),
                level: LogLevel::Warn,
                message,
            });
        }
        FailOutcome::Failed => {
            ctx.runs.finish(
                run_id,
                &RunCompletion {
                    status: RunStatus::Failed,
                    duration_ms: 0,
                    result: None,
                    error_message: Some(error.to_string()),
                },
            )?;
            warn!(run_id = %run_id, error = %error, "run failed after exhausting attempts");
            ctx.events.publish(RunEvent::Failed {
                run_id: run_id.to_string(),
                error: error.to_string(),
            });
        }
    }
    Ok(())
}

/// Metering failures never fail the run.
async fn record_usage(ctx: &WorkerContext, payload: &JobPayload, report: &RunReport) {
    let metadata = json!({ "runId": payload.run_id, "planId": payload.plan_id });
    let charges = [
        (Metric::RunMinutes, run_minutes(report.duration)),
        (Metric::Screenshots, report.screenshot_count()),
    ];
    for (metric, amount) in charges {
        if amount == 0 {
            continue;
        }
        if let Err(e) = ctx
            .meter
            .increment(&payload.tenant_id, metric, amount as i64, Some(&metadata))
            .await
        {
            warn!(run_id = %payload.run_id, %metric, amount, error = %e, "usage recording failed");
        }
    }
}
