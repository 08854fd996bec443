//! Durable usage history in `usage_records`.
//!
//! `quantity` holds the last flushed fast-store value and is overwritten by
//! each flush. `direct_quantity` accumulates writes made while the fast
//! store was down, so a later flush never erases them. The durable total of
//! a counter is the sum of both columns.

use anyhow::{Context, Result};
use rusqlite::params;

use super::store::UsageStore;
use super::{BillingPeriod, Metric, UsageCounter, UsageKey};
use crate::storage::Pool;

#[derive(Clone)]
pub struct SqliteUsageStore {
    pool: Pool,
}

impl SqliteUsageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Record flushed fast-store totals for one period.
    pub fn write_flushed(&self, counters: &[UsageCounter]) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO usage_records (tenant_id, metric, period_start, quantity, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(tenant_id, metric, period_start) DO UPDATE SET
                     quantity = excluded.quantity,
                     updated_at = datetime('now')",
            )?;
            for c in counters {
                stmt.execute(params![
                    c.key.tenant_id,
                    c.key.metric.as_str(),
                    c.key.period.start_key(),
                    i64::try_from(c.quantity)?,
                    c.key.metric.unit()
                ])?;
            }
        }
        tx.commit().context("Failed to commit usage flush")?;
        Ok(counters.len())
    }

    /// Flushed (fast-store) totals of `period`, excluding direct writes.
    pub fn flushed(&self, period: BillingPeriod) -> Result<Vec<UsageCounter>> {
        self.query(
            "SELECT tenant_id, metric, quantity FROM usage_records WHERE period_start = ?1",
            period,
        )
    }

    fn query(&self, sql: &str, period: BillingPeriod) -> Result<Vec<UsageCounter>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![period.start_key()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut counters = Vec::new();
        for r in rows {
            let (tenant_id, metric, quantity) = r?;
            counters.push(UsageCounter {
                key: UsageKey::new(&tenant_id, metric.parse::<Metric>()?, period),
                quantity: quantity.max(0) as u64,
            });
        }
        Ok(counters)
    }
}

#[async_trait::async_trait]
impl UsageStore for SqliteUsageStore {
    async fn increment(&self, key: &UsageKey, amount: u64) -> Result<u64> {
        let conn = self.pool.get()?;
        let total: i64 = conn
            .query_row(
                "INSERT INTO usage_records (tenant_id, metric, period_start, direct_quantity, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(tenant_id, metric, period_start) DO UPDATE SET
                     direct_quantity = direct_quantity + excluded.direct_quantity,
                     updated_at = datetime('now')
                 RETURNING quantity + direct_quantity",
                params![
                    key.tenant_id,
                    key.metric.as_str(),
                    key.period.start_key(),
                    i64::try_from(amount)?,
                    key.metric.unit()
                ],
                |row| row.get(0),
            )
            .context("Failed to write usage directly")?;
        Ok(total.max(0) as u64)
    }

    async fn get(&self, key: &UsageKey) -> Result<u64> {
        let conn = self.pool.get()?;
        let total: Option<i64> = conn.query_row(
            "SELECT SUM(quantity + direct_quantity) FROM usage_records
             WHERE tenant_id = ?1 AND metric = ?2 AND period_start = ?3",
            params![key.tenant_id, key.metric.as_str(), key.period.start_key()],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    async fn snapshot(&self, period: BillingPeriod) -> Result<Vec<UsageCounter>> {
        self.query(
            "SELECT tenant_id, metric, quantity + direct_quantity FROM usage_records
             WHERE period_start = ?1",
            period,
        )
    }

    /// History is kept; nothing to reset.
    async fn reset(&self, _period: BillingPeriod) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn period() -> BillingPeriod {
        "2026-10".parse().unwrap()
    }

    #[tokio::test]
    async fn test_direct_writes_survive_flush() {
        let (_dir, pool) = test_pool();
        let store = SqliteUsageStore::new(pool);
        let key = UsageKey::new("t1", Metric::Screenshots, period());

        assert_eq!(store.increment(&key, 2).await.unwrap(), 2);
        assert_eq!(store.increment(&key, 3).await.unwrap(), 5);

        store
            .write_flushed(&[UsageCounter { key: key.clone(), quantity: 10 }])
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), 15);

        store
            .write_flushed(&[UsageCounter { key: key.clone(), quantity: 12 }])
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), 17);
        assert_eq!(store.flushed(period()).unwrap()[0].quantity, 12);
    }

    #[tokio::test]
    async fn test_get_unknown_is_zero() {
        let (_dir, pool) = test_pool();
        let store = SqliteUsageStore::new(pool);
        let key = UsageKey::new("nobody", Metric::Tokens, period());
        assert_eq!(store.get(&key).await.unwrap(), 0);
        assert!(store.snapshot(period()).await.unwrap().is_empty());
    }
}
