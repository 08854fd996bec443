//! Plan tiers and their numeric limits.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::directory::TenantDirectory;
use crate::usage::Metric;

/// Limit value meaning "no limit".
pub const UNLIMITED: i64 = -1;

pub const DEFAULT_TIER: &str = "free";

/// Admission rule shared by every gate: allowed iff unlimited or under the limit.
pub fn admits(limit: i64, count: u64) -> bool {
    limit == UNLIMITED || (limit >= 0 && count < limit as u64)
}

/// `current / limit` as a percentage. 0 when unlimited, 100 for a zero limit.
pub fn percentage(current: u64, limit: i64) -> f64 {
    match limit {
        UNLIMITED => 0.0,
        l if l <= 0 => 100.0,
        l => current as f64 * 100.0 / l as f64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub tokens: i64,
    pub run_minutes: i64,
    pub screenshots: i64,
    pub concurrent_runs: i64,
    pub projects: i64,
    pub members: i64,
}

impl PlanLimits {
    pub const fn unlimited() -> Self {
        Self {
            tokens: UNLIMITED,
            run_minutes: UNLIMITED,
            screenshots: UNLIMITED,
            concurrent_runs: UNLIMITED,
            projects: UNLIMITED,
            members: UNLIMITED,
        }
    }

    pub fn metered(&self, metric: Metric) -> i64 {
        match metric {
            Metric::Tokens => self.tokens,
            Metric::RunMinutes => self.run_minutes,
            Metric::Screenshots => self.screenshots,
        }
    }

    /// Every limit must be `-1` or non-negative.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tokens", self.tokens),
            ("run_minutes", self.run_minutes),
            ("screenshots", self.screenshots),
            ("concurrent_runs", self.concurrent_runs),
            ("projects", self.projects),
            ("members", self.members),
        ] {
            if value < UNLIMITED {
                anyhow::bail!("{name} must be -1 (unlimited) or >= 0, got {value}");
            }
        }
        Ok(())
    }
}

/// Tier name -> limits, built-ins merged with configured overrides.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: HashMap<String, PlanLimits>,
}

impl Default for TierCatalog {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "free".to_string(),
            PlanLimits {
                tokens: 10_000,
                run_minutes: 60,
                screenshots: 100,
                concurrent_runs: 1,
                projects: 3,
                members: 1,
            },
        );
        tiers.insert(
            "starter".to_string(),
            PlanLimits {
                tokens: 100_000,
                run_minutes: 600,
                screenshots: 1_000,
                concurrent_runs: 3,
                projects: 10,
                members: 5,
            },
        );
        tiers.insert(
            "pro".to_string(),
            PlanLimits {
                tokens: 1_000_000,
                run_minutes: 3_000,
                screenshots: 10_000,
                concurrent_runs: 10,
                projects: 50,
                members: 20,
            },
        );
        tiers.insert("enterprise".to_string(), PlanLimits::unlimited());
        Self { tiers }
    }
}

impl TierCatalog {
    pub fn with_overrides(overrides: &HashMap<String, PlanLimits>) -> Self {
        let mut catalog = Self::default();
        for (name, limits) in overrides {
            catalog.tiers.insert(name.clone(), *limits);
        }
        catalog
    }

    /// Limits for `tier`; unknown tiers get the free tier.
    pub fn limits(&self, tier: &str) -> PlanLimits {
        if let Some(limits) = self.tiers.get(tier) {
            return *limits;
        }
        warn!(tier = %tier, fallback = DEFAULT_TIER, "unknown plan tier");
        self.tiers
            .get(DEFAULT_TIER)
            .copied()
            .unwrap_or_else(PlanLimits::unlimited)
    }
}

/// Resolves a tenant to its active limits.
#[derive(Clone)]
pub struct PlanResolver {
    catalog: Arc<TierCatalog>,
    directory: Arc<dyn TenantDirectory>,
}

impl PlanResolver {
    pub fn new(catalog: TierCatalog, directory: Arc<dyn TenantDirectory>) -> Self {
        Self {
            catalog: Arc::new(catalog),
            directory,
        }
    }

    pub fn directory(&self) -> &Arc<dyn TenantDirectory> {
        &self.directory
    }

    pub fn limits_for(&self, tenant_id: &str) -> Result<PlanLimits> {
        let tier = self
            .directory
            .tier(tenant_id)?
            .unwrap_or_else(|| DEFAULT_TIER.to_string());
        debug!(tenant = %tenant_id, tier = %tier, "resolved plan tier");
        Ok(self.catalog.limits(&tier))
    }
}
