//! Durable run records, run logs and artifact references.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Pool;
use crate::executor::artifacts::{Artifact, ArtifactKind};
use crate::plan::JobPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            other => anyhow::bail!("unknown run status '{other}'"),
        })
    }
}

/// One execution of one plan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub plan_id: String,
    pub project_id: String,
    pub tenant_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub level: String,
    pub message: String,
    pub created_at: String,
}

/// Terminal outcome written by the worker.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub duration_ms: i64,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct RunStore {
    pool: Pool,
}

impl RunStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert the run as `queued`. Returns false if the id already exists.
    pub fn create(&self, payload: &JobPayload) -> Result<bool> {
        let conn = self.pool.get()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO runs (id, plan_id, project_id, tenant_id, status)
                 VALUES (?1, ?2, ?3, ?4, 'queued')",
                params![
                    payload.run_id,
                    payload.plan_id,
                    payload.project_id,
                    payload.tenant_id
                ],
            )
            .context("Failed to insert run")?;
        Ok(inserted == 1)
    }

    /// Transition `queued -> running`. False when the run was cancelled meanwhile.
    pub fn mark_running(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'running', started_at = ?2, updated_at = datetime('now')
             WHERE id = ?1 AND status = 'queued'",
            params![run_id, started_at.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Write the terminal outcome. A run already in a terminal state is left untouched.
    pub fn finish(&self, run_id: &str, completion: &RunCompletion) -> Result<bool> {
        let result_json = completion
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?2, finished_at = ?3, duration_ms = ?4,
                 result_json = ?5, error_message = ?6, updated_at = datetime('now')
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![
                run_id,
                completion.status.as_str(),
                Utc::now().to_rfc3339(),
                completion.duration_ms,
                result_json,
                completion.error_message
            ],
        )?;
        Ok(changed == 1)
    }

    /// Flip a non-terminal run to `cancelled`.
    pub fn mark_cancelled(&self, run_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'cancelled', finished_at = ?2, updated_at = datetime('now')
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![run_id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Put a running run back to `queued` after an infrastructure retry was scheduled.
    pub fn requeue(&self, run_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'queued', updated_at = datetime('now')
             WHERE id = ?1 AND status = 'running'",
            params![run_id],
        )?;
        Ok(changed == 1)
    }

    /// Startup recovery: runs left `running` whose job went back to the queue.
    pub fn requeue_interrupted(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'queued', updated_at = datetime('now')
             WHERE status = 'running'
               AND id IN (SELECT run_id FROM jobs WHERE state = 'waiting')",
            [],
        )?;
        Ok(changed)
    }

    pub fn append_log(&self, run_id: &str, level: &str, message: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_logs (run_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, level, message, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn append_artifact(&self, run_id: &str, artifact: &Artifact) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_artifacts (run_id, task_id, kind, path, url, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                artifact.task_id,
                artifact.kind.as_str(),
                artifact.path.to_string_lossy(),
                artifact.url,
                i64::try_from(artifact.size_bytes)?,
                artifact.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, plan_id, project_id, tenant_id, status, started_at, finished_at,
                        duration_ms, result_json, error_message
                 FROM runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, plan_id, project_id, tenant_id, status, started, finished, duration, result, error)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(Run {
            artifacts: self.artifacts(&id)?,
            id,
            plan_id,
            project_id,
            tenant_id,
            status: status.parse()?,
            started_at: started.as_deref().map(parse_ts).transpose()?,
            finished_at: finished.as_deref().map(parse_ts).transpose()?,
            duration_ms: duration,
            result: result.as_deref().map(serde_json::from_str).transpose()?,
            error_message: error,
        }))
    }

    pub fn artifacts(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, path, url, size_bytes, created_at
             FROM run_artifacts WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut artifacts = Vec::new();
        for r in rows {
            let (task_id, kind, path, url, size, created) = r?;
            artifacts.push(Artifact {
                task_id,
                kind: kind.parse::<ArtifactKind>()?,
                path: path.into(),
                url,
                size_bytes: u64::try_from(size)?,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(artifacts)
    }

    pub fn logs(&self, run_id: &str) -> Result<Vec<RunLogEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT level, message, created_at FROM run_logs WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(RunLogEntry {
                level: row.get(0)?,
                message: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        let mut logs = Vec::new();
        for r in rows {
            logs.push(r?);
        }
        Ok(logs)
    }

    /// Queued plus running runs for a tenant.
    pub fn count_active(&self, tenant_id: &str) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE tenant_id = ?1 AND status IN ('queued', 'running')",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count)?)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{s}'"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Task, TaskKind};
    use crate::storage::test_pool;

    fn payload(run_id: &str) -> JobPayload {
        JobPayload {
            run_id: run_id.into(),
            plan_id: "plan".into(),
            project_id: "proj".into(),
            tenant_id: "acme".into(),
            tasks: vec![Task::new("t1", TaskKind::Screenshot)],
        }
    }

    #[test]
    fn test_create_is_idempotent() {
        let (_dir, pool) = test_pool();
        let runs = RunStore::new(pool);
        assert!(runs.create(&payload("r1")).unwrap());
        assert!(!runs.create(&payload("r1")).unwrap());
        assert_eq!(runs.get("r1").unwrap().unwrap().status, RunStatus::Queued);
        assert!(runs.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_lifecycle_and_terminal_immutability() {
        let (_dir, pool) = test_pool();
        let runs = RunStore::new(pool);
        runs.create(&payload("r1")).unwrap();
        assert_eq!(runs.count_active("acme").unwrap(), 1);

        assert!(runs.mark_running("r1", Utc::now()).unwrap());
        assert!(!runs.mark_running("r1", Utc::now()).unwrap());

        let done = RunCompletion {
            status: RunStatus::Completed,
            duration_ms: 1500,
            result: Some(serde_json::json!({"ok": true})),
            error_message: None,
        };
        assert!(runs.finish("r1", &done).unwrap());

        // Terminal rows are not rewritten.
        assert!(!runs.mark_cancelled("r1").unwrap());
        let failed = RunCompletion {
            status: RunStatus::Failed,
            error_message: Some("late".into()),
            ..done
        };
        assert!(!runs.finish("r1", &failed).unwrap());

        let run = runs.get("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.duration_ms, Some(1500));
        assert_eq!(run.result.unwrap()["ok"], true);
        assert!(run.started_at.is_some());
        assert_eq!(runs.count_active("acme").unwrap(), 0);
    }

    #[test]
    fn test_requeue_interrupted_follows_job_state() {
        let (_dir, pool) = test_pool();
        let runs = RunStore::new(pool.clone());
        let jobs = crate::queue::JobStore::new(
            pool,
            crate::config::QueueConfig::default(),
            std::time::Duration::from_millis(10),
        );
        for id in ["r1", "r2"] {
            runs.create(&payload(id)).unwrap();
            jobs.enqueue(id, &payload(id), 0).unwrap();
            runs.mark_running(id, Utc::now()).unwrap();
        }
        // r1 is claimed by a live worker; r2 is back in the queue.
        jobs.try_dequeue().unwrap().unwrap();
        let claimed = runs.requeue_interrupted().unwrap();

        assert_eq!(claimed, 1);
        assert_eq!(runs.get("r1").unwrap().unwrap().status, RunStatus::Running);
        assert_eq!(runs.get("r2").unwrap().unwrap().status, RunStatus::Queued);
    }

    #[test]
    fn test_cancel_before_start_blocks_running() {
        let (_dir, pool) = test_pool();
        let runs = RunStore::new(pool);
        runs.create(&payload("r1")).unwrap();
        assert!(runs.mark_cancelled("r1").unwrap());
        assert!(!runs.mark_running("r1", Utc::now()).unwrap());
        assert_eq!(runs.get("r1").unwrap().unwrap().status, RunStatus::Cancelled);
    }

    #[test]
    fn test_logs_and_artifacts_round_trip() {
        let (_dir, pool) = test_pool();
        let runs = RunStore::new(pool);
        runs.create(&payload("r1")).unwrap();
        runs.append_log("r1", "info", "hello").unwrap();
        runs.append_log("r1", "warn", "careful").unwrap();
        runs.append_artifact(
            "r1",
            &Artifact {
                task_id: "t1".into(),
                kind: ArtifactKind::Screenshot,
                path: "/tmp/x.png".into(),
                url: "http://h/x.png".into(),
                size_bytes: 42,
                created_at: Utc::now(),
            },
        )
        .unwrap();

        let logs = runs.logs("r1").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, "warn");

        let run = runs.get("r1").unwrap().unwrap();
        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(run.artifacts[0].kind, ArtifactKind::Screenshot);
        assert_eq!(run.artifacts[0].size_bytes, 42);
    }
}
