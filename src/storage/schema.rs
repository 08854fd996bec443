//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL UNIQUE,
            payload_json TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            failed_reason TEXT,
            available_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            processed_on INTEGER,
            finished_on INTEGER
        );

        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            duration_ms INTEGER,
            result_json TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS run_logs (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS run_artifacts (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            path TEXT NOT NULL,
            url TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS usage_records (
            tenant_id TEXT NOT NULL,
            metric TEXT NOT NULL,
            period_start TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 0,
            direct_quantity INTEGER NOT NULL DEFAULT 0,
            unit TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (tenant_id, metric, period_start)
        );

        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            tier TEXT NOT NULL DEFAULT 'free',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tenant_members (
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (tenant_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON jobs(state, priority, seq);
        CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(finished_on);
        CREATE INDEX IF NOT EXISTS idx_runs_tenant_status ON runs(tenant_id, status);
        CREATE INDEX IF NOT EXISTS idx_run_logs_run ON run_logs(run_id);
        CREATE INDEX IF NOT EXISTS idx_run_artifacts_run ON run_artifacts(run_id);
        CREATE INDEX IF NOT EXISTS idx_usage_period ON usage_records(period_start);
        CREATE INDEX IF NOT EXISTS idx_projects_tenant ON projects(tenant_id);",
    )?;

    // v2: in-flight cancellation flag survives restarts
    let has_cancel: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('jobs') WHERE name='cancel_requested'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_cancel == 0 {
        conn.execute(
            "ALTER TABLE jobs ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
