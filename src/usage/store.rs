//! Counter backends.
//!
//! The fast store answers real-time checks; the durable store holds history
//! and takes direct writes while the fast store is unavailable.
//! [`TieredUsageStore`] composes the two.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use tracing::warn;

use super::{BillingPeriod, UsageCounter, UsageKey};

#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    /// Add `amount` and return the new total.
    async fn increment(&self, key: &UsageKey, amount: u64) -> Result<u64>;
    async fn get(&self, key: &UsageKey) -> Result<u64>;
    /// Every counter of `period`.
    async fn snapshot(&self, period: BillingPeriod) -> Result<Vec<UsageCounter>>;
    /// Drop the counters of `period`. Returns how many were removed.
    async fn reset(&self, period: BillingPeriod) -> Result<usize>;
}

/// Lock-light in-process counters: the map lock is only taken for writing
/// when a key is seen for the first time.
#[derive(Default)]
pub struct MemoryUsageStore {
    counters: RwLock<HashMap<UsageKey, Arc<AtomicU64>>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise counters to at least the given values. Used to restore flushed
    /// totals after a restart.
    pub fn seed(&self, counters: &[UsageCounter]) -> Result<()> {
        for c in counters {
            self.counter(&c.key)?.fetch_max(c.quantity, Ordering::SeqCst);
        }
        Ok(())
    }

    fn counter(&self, key: &UsageKey) -> Result<Arc<AtomicU64>> {
        {
            let map = self
                .counters
                .read()
                .map_err(|_| anyhow!("usage counter map poisoned"))?;
            if let Some(c) = map.get(key) {
                return Ok(Arc::clone(c));
            }
        }
        let mut map = self
            .counters
            .write()
            .map_err(|_| anyhow!("usage counter map poisoned"))?;
        Ok(Arc::clone(map.entry(key.clone()).or_default()))
    }
}

#[async_trait::async_trait]
impl UsageStore for MemoryUsageStore {
    async fn increment(&self, key: &UsageKey, amount: u64) -> Result<u64> {
        let counter = self.counter(key)?;
        Ok(counter.fetch_add(amount, Ordering::SeqCst).saturating_add(amount))
    }

    async fn get(&self, key: &UsageKey) -> Result<u64> {
        let map = self
            .counters
            .read()
            .map_err(|_| anyhow!("usage counter map poisoned"))?;
        Ok(map.get(key).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0))
    }

    async fn snapshot(&self, period: BillingPeriod) -> Result<Vec<UsageCounter>> {
        let map = self
            .counters
            .read()
            .map_err(|_| anyhow!("usage counter map poisoned"))?;
        Ok(map
            .iter()
            .filter(|(k, _)| k.period == period)
            .map(|(k, v)| UsageCounter {
                key: k.clone(),
                quantity: v.load(Ordering::SeqCst),
            })
            .collect())
    }

    async fn reset(&self, period: BillingPeriod) -> Result<usize> {
        let mut map = self
            .counters
            .write()
            .map_err(|_| anyhow!("usage counter map poisoned"))?;
        let before = map.len();
        map.retain(|k, _| k.period != period);
        Ok(before - map.len())
    }
}

/// Fast store first, durable store when the fast one errors.
pub struct TieredUsageStore {
    fast: Arc<dyn UsageStore>,
    durable: Arc<dyn UsageStore>,
}

impl TieredUsageStore {
    pub fn new(fast: Arc<dyn UsageStore>, durable: Arc<dyn UsageStore>) -> Self {
        Self { fast, durable }
    }
}

#[async_trait::async_trait]
impl UsageStore for TieredUsageStore {
    async fn increment(&self, key: &UsageKey, amount: u64) -> Result<u64> {
        match self.fast.increment(key, amount).await {
            Ok(total) => Ok(total),
            Err(e) => {
                warn!(
                    tenant = %key.tenant_id,
                    metric = %key.metric,
                    amount,
                    error = %e,
                    "fast usage store unavailable, writing directly to durable store"
                );
                self.durable.increment(key, amount).await
            }
        }
    }

    async fn get(&self, key: &UsageKey) -> Result<u64> {
        match self.fast.get(key).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(error = %e, "fast usage store unavailable, reading durable store");
                self.durable.get(key).await
            }
        }
    }

    async fn snapshot(&self, period: BillingPeriod) -> Result<Vec<UsageCounter>> {
        self.fast.snapshot(period).await
    }

    async fn reset(&self, period: BillingPeriod) -> Result<usize> {
        self.fast.reset(period).await
    }
}
