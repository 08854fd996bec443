//! TOML configuration for the planrunner daemon.
//!
//! Every section carries compiled-in defaults, so an empty file (or no file
//! at all) yields a working single-node setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::ReadyState;
use crate::quota::tiers::PlanLimits;

const CONFIG_ENV: &str = "PLANRUNNER_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/planrunner/planrunner.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    /// Per-tier limit overrides, merged over the built-in catalog.
    #[serde(default)]
    pub tiers: HashMap<String, PlanLimits>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Resolve configuration in order: explicit path, `PLANRUNNER_CONFIG`,
    /// `/etc/planrunner/planrunner.toml`, compiled-in defaults.
    ///
    /// An explicit path that fails to load is an error; the implicit
    /// locations only warn.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PLANRUNNER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.concurrency == 0 {
            anyhow::bail!("workers.concurrency must be at least 1");
        }
        if self.workers.rate_limit_jobs == 0 {
            anyhow::bail!("workers.rate_limit_jobs must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be at least 1");
        }
        if self.engine.max_instances == 0 {
            anyhow::bail!("engine.max_instances must be at least 1");
        }
        if self.engine.port_range_start > self.engine.port_range_end {
            anyhow::bail!("engine.port_range_start must not exceed engine.port_range_end");
        }
        if !(0.0..=100.0).contains(&self.usage.warning_percent)
            || !(0.0..=100.0).contains(&self.usage.critical_percent)
            || self.usage.warning_percent > self.usage.critical_percent
        {
            anyhow::bail!("usage thresholds must satisfy 0 <= warning <= critical <= 100");
        }
        crate::scheduler::Cadence::parse_cron(&self.usage.flush_schedule)
            .context("usage.flush_schedule")?;
        for (name, limits) in &self.tiers {
            limits
                .validate()
                .with_context(|| format!("tiers.{name}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/planrunner.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Prefix for artifact URLs handed back to callers.
    pub public_base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            public_base_url: "http://localhost:8080/artifacts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent dequeue loops.
    pub concurrency: usize,
    /// Maximum runs started per rolling window, across all loops.
    pub rate_limit_jobs: u32,
    pub rate_limit_window_ms: u64,
    /// Fallback poll interval when no enqueue notification arrives.
    pub dequeue_poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_jobs: 10,
            rate_limit_window_ms: 60_000,
            dequeue_poll_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn dequeue_poll(&self) -> Duration {
        Duration::from_millis(self.dequeue_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts (including the first) before an infrastructure failure is terminal.
    pub max_attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub backoff_ms: u64,
    /// How long completed and failed jobs stay queryable.
    pub retention_hours: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 5_000,
            retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on live browser instances.
    pub max_instances: usize,
    /// WebDriver binary spawned per instance (e.g. `chromedriver`).
    pub driver_path: String,
    /// Attach to an existing WebDriver endpoint instead of spawning drivers.
    pub remote_url: Option<String>,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub browser_name: String,
    pub headless: bool,
    pub extra_args: Vec<String>,
    pub startup_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    pub readiness: ReadyState,
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instances: 3,
            driver_path: "chromedriver".to_string(),
            remote_url: None,
            port_range_start: 9515,
            port_range_end: 9555,
            browser_name: "chrome".to_string(),
            headless: true,
            extra_args: vec![
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ],
            startup_timeout_ms: 10_000,
            navigation_timeout_ms: 30_000,
            readiness: ReadyState::Load,
            sweep_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub artifacts_root: PathBuf,
    pub default_task_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            artifacts_root: PathBuf::from("data/artifacts"),
            default_task_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Cron expression (with seconds field) driving the durable flush.
    pub flush_schedule: String,
    pub warning_percent: f64,
    pub critical_percent: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            flush_schedule: "0 */5 * * * *".to_string(),
            warning_percent: 80.0,
            critical_percent: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
