//! Per-tenant usage metering.
//!
//! Counters are keyed by (tenant, metric, billing period). Increments go to
//! the fast store and fall back to a direct durable write; a scheduled flush
//! copies fast counters into `usage_records`.

pub mod sqlite;
pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use self::sqlite::SqliteUsageStore;
pub use self::store::{MemoryUsageStore, TieredUsageStore, UsageStore};
use crate::config::UsageConfig;
use crate::events::{EventBus, QuotaThreshold, RunEvent};
use crate::quota::tiers::{percentage, PlanResolver, UNLIMITED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Tokens,
    RunMinutes,
    Screenshots,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Tokens, Metric::RunMinutes, Metric::Screenshots];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Tokens => "tokens",
            Metric::RunMinutes => "run_minutes",
            Metric::Screenshots => "screenshots",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Tokens => "tokens",
            Metric::RunMinutes => "minutes",
            Metric::Screenshots => "images",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "tokens" => Metric::Tokens,
            "run_minutes" => Metric::RunMinutes,
            "screenshots" => Metric::Screenshots,
            other => anyhow::bail!("unknown metric '{other}'"),
        })
    }
}

/// A UTC calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BillingPeriod {
    year: i32,
    month: u32,
}

impl BillingPeriod {
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// `period_start` column value, e.g. `2026-10-01`.
    pub fn start_key(&self) -> String {
        format!("{:04}-{:02}-01", self.year, self.month)
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingPeriod {
    type Err = anyhow::Error;

    /// Accepts `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| anyhow!("billing period must be YYYY-MM, got '{s}'"))?;
        let year: i32 = y.parse()?;
        let month: u32 = m.parse()?;
        if !(1..=12).contains(&month) {
            anyhow::bail!("month out of range in '{s}'");
        }
        Ok(Self { year, month })
    }
}

impl From<BillingPeriod> for String {
    fn from(p: BillingPeriod) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for BillingPeriod {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub tenant_id: String,
    pub metric: Metric,
    pub period: BillingPeriod,
}

impl UsageKey {
    pub fn new(tenant_id: &str, metric: Metric, period: BillingPeriod) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            metric,
            period,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounter {
    pub key: UsageKey,
    pub quantity: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub metric: Metric,
    pub period: BillingPeriod,
    pub current: u64,
    pub limit: i64,
    pub percentage: f64,
    pub unlimited: bool,
}

/// Whole minutes billed for a run, rounded up.
pub fn run_minutes(duration: Duration) -> u64 {
    duration.as_nanos().div_ceil(60_000_000_000) as u64
}

pub struct UsageMeter {
    store: Arc<dyn UsageStore>,
    durable: SqliteUsageStore,
    plans: PlanResolver,
    events: EventBus,
    warning_percent: f64,
    critical_percent: f64,
    /// Last period seen by the flush schedule, for rollover detection.
    flushed_period: Mutex<BillingPeriod>,
}

impl UsageMeter {
    pub fn new(
        fast: Arc<dyn UsageStore>,
        durable: SqliteUsageStore,
        plans: PlanResolver,
        events: EventBus,
        config: &UsageConfig,
    ) -> Self {
        let store = Arc::new(TieredUsageStore::new(fast, Arc::new(durable.clone())));
        Self {
            store,
            durable,
            plans,
            events,
            warning_percent: config.warning_percent,
            critical_percent: config.critical_percent,
            flushed_period: Mutex::new(BillingPeriod::current()),
        }
    }

    /// Add `amount` to the tenant's current-period counter and return the new
    /// total. Non-positive amounts are ignored and yield `None`.
    pub async fn increment(
        &self,
        tenant_id: &str,
        metric: Metric,
        amount: i64,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Option<u64>> {
        if amount <= 0 {
            warn!(tenant = %tenant_id, %metric, amount, "ignoring non-positive usage increment");
            return Ok(None);
        }

        let key = UsageKey::new(tenant_id, metric, BillingPeriod::current());
        let total = self.store.increment(&key, amount as u64).await?;
        debug!(
            tenant = %tenant_id,
            %metric,
            amount,
            total,
            metadata = %metadata.cloned().unwrap_or_default(),
            "usage recorded"
        );

        match self.plans.limits_for(tenant_id) {
            Ok(limits) => self.emit_threshold(tenant_id, metric, total, limits.metered(metric)),
            Err(e) => warn!(tenant = %tenant_id, error = %e, "threshold check skipped"),
        }

        Ok(Some(total))
    }

    fn emit_threshold(&self, tenant_id: &str, metric: Metric, current: u64, limit: i64) {
        if limit == UNLIMITED {
            return;
        }
        let pct = percentage(current, limit);
        let threshold = QuotaThreshold {
            tenant_id: tenant_id.to_string(),
            metric,
            current,
            limit,
            percentage: pct,
        };
        if pct >= self.critical_percent {
            warn!(tenant = %tenant_id, %metric, current, limit, "usage at critical threshold");
            self.events.publish(RunEvent::QuotaCritical(threshold));
        } else if pct >= self.warning_percent {
            info!(tenant = %tenant_id, %metric, current, limit, "usage at warning threshold");
            self.events.publish(RunEvent::QuotaWarning(threshold));
        }
    }

    pub async fn current_usage(&self, tenant_id: &str, metric: Metric) -> Result<u64> {
        let key = UsageKey::new(tenant_id, metric, BillingPeriod::current());
        self.store.get(&key).await
    }

    pub async fn stats(&self, tenant_id: &str, metric: Metric) -> Result<UsageStats> {
        let current = self.current_usage(tenant_id, metric).await?;
        let limit = self.plans.limits_for(tenant_id)?.metered(metric);
        Ok(UsageStats {
            metric,
            period: BillingPeriod::current(),
            current,
            limit,
            percentage: percentage(current, limit),
            unlimited: limit == UNLIMITED,
        })
    }

    /// True iff `current + additional > limit` for a finite limit.
    pub async fn is_exceeded(&self, tenant_id: &str, metric: Metric, additional: u64) -> Result<bool> {
        let stats = self.stats(tenant_id, metric).await?;
        Ok(!stats.unlimited && stats.current.saturating_add(additional) > stats.limit as u64)
    }

    /// Copy every fast counter of `period` into the durable table.
    pub async fn flush(&self, period: BillingPeriod) -> Result<usize> {
        let counters = self.store.snapshot(period).await?;

        let mut summed: HashMap<UsageKey, u64> = HashMap::new();
        for c in counters {
            *summed.entry(c.key).or_default() += c.quantity;
        }
        let counters: Vec<UsageCounter> = summed
            .into_iter()
            .map(|(key, quantity)| UsageCounter { key, quantity })
            .collect();

        let written = self.durable.write_flushed(&counters)?;
        info!(%period, counters = written, "usage flushed");
        Ok(written)
    }

    /// Scheduled flush. When the month has rolled over since the last tick,
    /// the previous period is flushed one last time and dropped from the
    /// fast store.
    pub async fn flush_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let current = BillingPeriod::containing(now);
        let last = {
            let mut guard = self
                .flushed_period
                .lock()
                .map_err(|_| anyhow!("flush period lock poisoned"))?;
            std::mem::replace(&mut *guard, current)
        };

        let mut written = 0;
        if last != current {
            written += self.flush(last).await?;
            let dropped = self.store.reset(last).await?;
            info!(period = %last, dropped, "billing period closed");
        }
        written += self.flush(current).await?;
        Ok(written)
    }

    /// Restore flushed totals of `period` into the fast store after a restart.
    pub fn hydrate(&self, fast: &MemoryUsageStore, period: BillingPeriod) -> Result<usize> {
        let counters = self.durable.flushed(period)?;
        fast.seed(&counters)?;
        Ok(counters.len())
    }
}
