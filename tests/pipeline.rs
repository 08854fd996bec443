//! End-to-end pipeline tests against the in-process fake browser.

use std::sync::Arc;
use std::time::Duration;

use planrunner::config::PipelineConfig;
use planrunner::engine::testing::{FakeLauncher, FakeSite};
use planrunner::engine::{Browser, BrowserLauncher, EngineError};
use planrunner::events::{LogLevel, RunEvent};
use planrunner::executor::artifacts::ArtifactKind;
use planrunner::plan::{JobPayload, Task, TaskKind};
use planrunner::queue::{CancelOutcome, JobState};
use planrunner::storage::RunStatus;
use planrunner::usage::Metric;
use planrunner::worker::WorkerPool;
use planrunner::Services;
use tempfile::TempDir;
use tokio::sync::broadcast::Receiver;

struct Harness {
    _dir: TempDir,
    config: PipelineConfig,
    services: Services,
}

impl Harness {
    fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self::with_backoff(launcher, 10)
    }

    fn with_backoff(launcher: Arc<dyn BrowserLauncher>, backoff_ms: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.database.path = dir.path().join("planrunner.db");
        config.executor.artifacts_root = dir.path().join("artifacts");
        config.workers.concurrency = 2;
        config.workers.dequeue_poll_ms = 20;
        config.queue.backoff_ms = backoff_ms;
        let services = Services::build(&config, launcher).unwrap();
        services.tenants.upsert_tenant("acme", "pro").unwrap();
        Self {
            _dir: dir,
            config,
            services,
        }
    }

    fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(
            self.config.workers.concurrency,
            self.services.worker_context(&self.config),
        )
    }
}

fn payload(run_id: &str, tasks: Vec<Task>) -> JobPayload {
    JobPayload {
        run_id: run_id.into(),
        plan_id: "plan-1".into(),
        project_id: "proj-1".into(),
        tenant_id: "acme".into(),
        tasks,
    }
}

fn is_terminal(event: &RunEvent) -> bool {
    matches!(
        event,
        RunEvent::Completed { .. } | RunEvent::Failed { .. } | RunEvent::Cancelled { .. }
    )
}

/// Collect the events of `run_id` up to and including its terminal event.
async fn run_events(rx: &mut Receiver<RunEvent>, run_id: &str) -> Vec<RunEvent> {
    let collect = async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            if event.run_id() != Some(run_id) {
                continue;
            }
            let done = is_terminal(&event);
            events.push(event);
            if done {
                return events;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("run did not reach a terminal state")
}

fn lifecycle(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Started { .. } => Some("started".to_string()),
            RunEvent::Progress { progress, .. } => Some(format!("progress:{progress}")),
            RunEvent::Completed { .. } => Some("completed".to_string()),
            RunEvent::Failed { .. } => Some("failed".to_string()),
            RunEvent::Cancelled { .. } => Some("cancelled".to_string()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_navigate_and_screenshot_end_to_end() {
    let site = FakeSite::new();
    let h = Harness::new(FakeLauncher::new(site.clone()));
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let tasks = vec![
        Task::new("open", TaskKind::Navigate).with_url("https://example.com"),
        Task::new("shot", TaskKind::Screenshot),
    ];
    let handle = h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();
    assert!(handle.created);

    let events = run_events(&mut rx, "run-1").await;
    assert_eq!(
        lifecycle(&events),
        ["started", "progress:50", "progress:100", "completed"]
    );

    let Some(RunEvent::Completed { artifacts, .. }) = events.last() else {
        panic!("last event is not run:completed");
    };
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, ArtifactKind::Screenshot);
    assert_eq!(artifacts[0].task_id, "shot");
    assert!(artifacts[0].path.exists());

    let run = h.services.pipeline.run("run-1").unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.duration_ms.is_some());
    assert_eq!(run.artifacts.len(), 1);

    let meter = &h.services.meter;
    assert_eq!(meter.current_usage("acme", Metric::RunMinutes).await.unwrap(), 1);
    assert_eq!(meter.current_usage("acme", Metric::Screenshots).await.unwrap(), 1);

    let logs = h.services.runs.logs("run-1").unwrap();
    assert_eq!(logs.len(), 2);
    assert!(site.calls().contains(&"goto:https://example.com".to_string()));

    workers.stop().await;
}

#[tokio::test]
async fn test_non_critical_failure_is_annotated_and_run_continues() {
    let site = FakeSite::new();
    let h = Harness::new(FakeLauncher::new(site.clone()));
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let tasks = vec![
        Task::new("a", TaskKind::Navigate).with_url("https://example.com"),
        Task::new("b", TaskKind::Click)
            .with_selector("#missing")
            .with_retry(0, 0)
            .non_critical(),
        Task::new("c", TaskKind::Extract),
    ];
    h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();

    let events = run_events(&mut rx, "run-1").await;
    assert_eq!(lifecycle(&events).last().map(String::as_str), Some("completed"));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Log { level: LogLevel::Warn, message, .. } if message.contains("#missing")
    )));

    let run = h.services.pipeline.run("run-1").unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let result = run.result.unwrap();
    let partial = result["partialFailures"].as_array().unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0]["taskId"], "b");
    assert_eq!(result["results"][2]["data"]["text"], "fake body");

    workers.stop().await;
}

#[tokio::test]
async fn test_critical_failure_skips_remaining_tasks() {
    let site = FakeSite::new();
    let h = Harness::new(FakeLauncher::new(site.clone()));
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let tasks = vec![
        Task::new("a", TaskKind::Navigate).with_url("https://example.com"),
        Task::new("b", TaskKind::Click).with_selector("#missing").with_retry(0, 0),
        Task::new("c", TaskKind::Screenshot),
    ];
    h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();

    let events = run_events(&mut rx, "run-1").await;
    let Some(RunEvent::Failed { error, .. }) = events.last() else {
        panic!("last event is not run:failed");
    };
    assert!(error.contains("task 'b' failed"));
    assert_eq!(site.call_count("screenshot:"), 0);

    let run = h.services.pipeline.run("run-1").unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("#missing"));

    let job = h.services.jobs.status("run-1").unwrap().unwrap();
    assert_eq!(job.attempts, 1);

    workers.stop().await;
}

#[tokio::test]
async fn test_cancel_before_dequeue_never_starts() {
    let site = FakeSite::new();
    let h = Harness::new(FakeLauncher::new(site.clone()));
    let mut rx = h.services.events.subscribe();

    let open = || vec![Task::new("open", TaskKind::Navigate).with_url("https://example.com")];
    h.services.pipeline.submit(payload("run-1", open()), 0).await.unwrap();
    assert_eq!(
        h.services.pipeline.cancel("run-1").unwrap(),
        CancelOutcome::Removed
    );
    assert!(h.services.jobs.status("run-1").unwrap().is_none());

    let mut workers = h.start_workers();
    h.services.pipeline.submit(payload("run-2", open()), 0).await.unwrap();

    // Everything published before run-2 finished.
    let mut seen = Vec::new();
    let collect = async {
        loop {
            let event = rx.recv().await.unwrap();
            let done = event.run_id() == Some("run-2") && is_terminal(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect).await.unwrap();

    assert!(!seen
        .iter()
        .any(|e| matches!(e, RunEvent::Started { run_id, .. } if run_id == "run-1")));
    assert!(seen
        .iter()
        .any(|e| matches!(e, RunEvent::Cancelled { run_id } if run_id == "run-1")));
    assert_eq!(
        h.services.pipeline.run("run-1").unwrap().unwrap().status,
        RunStatus::Cancelled
    );
    assert_eq!(site.call_count("goto:"), 1);

    workers.stop().await;
}

#[tokio::test]
async fn test_duplicate_submit_executes_once() {
    let site = FakeSite::new();
    let h = Harness::new(FakeLauncher::new(site.clone()));
    let mut rx = h.services.events.subscribe();

    let tasks = vec![Task::new("open", TaskKind::Navigate).with_url("https://example.com")];
    let first = h.services.pipeline.submit(payload("run-1", tasks.clone()), 0).await.unwrap();
    let second = h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();
    assert!(first.created);
    assert!(!second.created);

    let mut workers = h.start_workers();
    run_events(&mut rx, "run-1").await;
    workers.stop().await;

    assert_eq!(site.call_count("goto:"), 1);
    let counts = h.services.jobs.counts().unwrap();
    assert_eq!(counts.get("completed"), Some(&1));
    assert_eq!(counts.values().sum::<u64>(), 1);
}

#[tokio::test]
async fn test_engine_outage_is_retried_at_job_level() {
    let site = FakeSite::new();
    let launcher = FakeLauncher::new(site.clone());
    launcher.set_fail_launch(true);
    // Long enough to flip the launcher back before the retry is claimed.
    let h = Harness::with_backoff(launcher.clone(), 500);
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let tasks = vec![Task::new("open", TaskKind::Navigate).with_url("https://example.com")];
    h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();

    // First attempt: started, then a warning about the retry.
    let warned = async {
        loop {
            if let RunEvent::Log { run_id, level: LogLevel::Warn, message } = rx.recv().await.unwrap() {
                if run_id == "run-1" {
                    return message;
                }
            }
        }
    };
    let message = tokio::time::timeout(Duration::from_secs(10), warned).await.unwrap();
    assert!(message.contains("infrastructure failure"));
    launcher.set_fail_launch(false);

    let events = run_events(&mut rx, "run-1").await;
    assert_eq!(lifecycle(&events), ["started", "progress:100", "completed"]);

    let job = h.services.jobs.status("run-1").unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(
        h.services.pipeline.run("run-1").unwrap().unwrap().status,
        RunStatus::Completed
    );

    workers.stop().await;
}

/// Wait for the log line of the first finished task of `run_id`. On the
/// single-threaded test runtime the worker is already inside the next task
/// by the time this returns.
async fn first_task_logged(rx: &mut Receiver<RunEvent>, run_id: &str) {
    let logged = async {
        loop {
            if let RunEvent::Log { run_id: id, .. } = rx.recv().await.unwrap() {
                if id == run_id {
                    return;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), logged)
        .await
        .expect("first task never finished");
}

fn assert_settled_cancelled(h: &Harness, events: &[RunEvent], run_id: &str) {
    let terminal: Vec<_> = events.iter().filter(|e| is_terminal(e)).collect();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], RunEvent::Cancelled { .. }));

    let run = h.services.pipeline.run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let job = h.services.jobs.status(run_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_during_last_task_settles_as_cancelled() {
    let site = FakeSite::new();
    let h = Harness::new(FakeLauncher::new(site.clone()));
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let tasks = vec![
        Task::new("open", TaskKind::Navigate).with_url("https://example.com"),
        Task::new("pause", TaskKind::Wait).with_value("500"),
    ];
    h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();
    first_task_logged(&mut rx, "run-1").await;
    assert_eq!(
        h.services.pipeline.cancel("run-1").unwrap(),
        CancelOutcome::Signalled
    );

    let events = run_events(&mut rx, "run-1").await;
    assert_eq!(lifecycle(&events), ["progress:100", "cancelled"]);
    assert_settled_cancelled(&h, &events, "run-1");

    // Nothing else is published for the run once it settled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = rx.try_recv() {
        assert_ne!(event.run_id(), Some("run-1"), "late event {event:?}");
    }

    workers.stop().await;
}

#[tokio::test]
async fn test_cancel_mid_run_stops_at_next_task_boundary() {
    let site = FakeSite::new();
    let h = Harness::new(FakeLauncher::new(site.clone()));
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let tasks = vec![
        Task::new("open", TaskKind::Navigate).with_url("https://example.com"),
        Task::new("pause", TaskKind::Wait).with_value("500"),
        Task::new("shot", TaskKind::Screenshot),
    ];
    h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();
    first_task_logged(&mut rx, "run-1").await;
    assert_eq!(
        h.services.pipeline.cancel("run-1").unwrap(),
        CancelOutcome::Signalled
    );

    let events = run_events(&mut rx, "run-1").await;
    assert_eq!(lifecycle(&events), ["progress:66", "cancelled"]);
    assert_settled_cancelled(&h, &events, "run-1");
    assert_eq!(site.call_count("screenshot:"), 0);

    workers.stop().await;
}

#[tokio::test]
async fn test_executor_panic_returns_page_and_engine() {
    let site = FakeSite::new().panic_on_script("boom()");
    let launcher = FakeLauncher::new(site.clone());
    let h = Harness::new(launcher.clone());
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let tasks = vec![Task::new("crash", TaskKind::Custom).with_script("boom()")];
    h.services.pipeline.submit(payload("run-1", tasks), 0).await.unwrap();
    let events = run_events(&mut rx, "run-1").await;
    let Some(RunEvent::Failed { error, .. }) = events.last() else {
        panic!("last event is not run:failed");
    };
    assert!(error.contains("worker panicked: script 'boom()' crashed the driver"));
    assert_eq!(site.call_count("close"), 1);
    assert_eq!(h.services.engines.stats().await.leases, 0);

    let tasks = vec![Task::new("open", TaskKind::Navigate).with_url("https://example.com")];
    h.services.pipeline.submit(payload("run-2", tasks), 0).await.unwrap();
    let events = run_events(&mut rx, "run-2").await;
    assert_eq!(lifecycle(&events).last().map(String::as_str), Some("completed"));
    assert_eq!(launcher.launch_count(), 1);

    workers.stop().await;
}

struct PanickingLauncher;

#[async_trait::async_trait]
impl BrowserLauncher for PanickingLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, EngineError> {
        panic!("driver exploded");
    }
}

#[tokio::test]
async fn test_worker_survives_panicking_run() {
    let h = Harness::new(Arc::new(PanickingLauncher));
    let mut rx = h.services.events.subscribe();
    let mut workers = h.start_workers();

    let open = || vec![Task::new("open", TaskKind::Navigate).with_url("https://example.com")];
    for run_id in ["run-1", "run-2"] {
        h.services.pipeline.submit(payload(run_id, open()), 0).await.unwrap();
        let events = run_events(&mut rx, run_id).await;
        let Some(RunEvent::Failed { error, .. }) = events.last() else {
            panic!("{run_id}: last event is not run:failed");
        };
        assert!(error.contains("worker panicked: driver exploded"));

        let run = h.services.pipeline.run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    workers.stop().await;
}
