//! Tenant facts the quota gate counts against: tier, projects, members,
//! active runs.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use crate::storage::{Pool, RunStore};

pub trait TenantDirectory: Send + Sync {
    /// Tier name, or `None` for an unknown tenant.
    fn tier(&self, tenant_id: &str) -> Result<Option<String>>;
    fn project_count(&self, tenant_id: &str) -> Result<u64>;
    fn member_count(&self, tenant_id: &str) -> Result<u64>;
    /// Runs that are queued or running.
    fn active_runs(&self, tenant_id: &str) -> Result<u64>;
}

#[derive(Clone)]
pub struct SqliteTenantDirectory {
    pool: Pool,
}

impl SqliteTenantDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create or update a tenant's tier.
    pub fn upsert_tenant(&self, tenant_id: &str, tier: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO tenants (id, tier) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET tier = excluded.tier",
            params![tenant_id, tier],
        )
        .context("Failed to upsert tenant")?;
        Ok(())
    }

    pub fn add_project(&self, tenant_id: &str, project_id: &str, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO projects (id, tenant_id, name) VALUES (?1, ?2, ?3)",
            params![project_id, tenant_id, name],
        )?;
        Ok(())
    }

    pub fn add_member(&self, tenant_id: &str, user_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO tenant_members (tenant_id, user_id) VALUES (?1, ?2)",
            params![tenant_id, user_id],
        )?;
        Ok(())
    }

    fn count(&self, sql: &str, tenant_id: &str) -> Result<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(sql, params![tenant_id], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

impl TenantDirectory for SqliteTenantDirectory {
    fn tier(&self, tenant_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let tier = conn
            .query_row(
                "SELECT tier FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tier)
    }

    fn project_count(&self, tenant_id: &str) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM projects WHERE tenant_id = ?1", tenant_id)
    }

    fn member_count(&self, tenant_id: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM tenant_members WHERE tenant_id = ?1",
            tenant_id,
        )
    }

    fn active_runs(&self, tenant_id: &str) -> Result<u64> {
        RunStore::new(self.pool.clone()).count_active(tenant_id)
    }
}
