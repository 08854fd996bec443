use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use planrunner::config::PipelineConfig;
use planrunner::engine::webdriver::WebDriverLauncher;
use planrunner::plan::JobPayload;
use planrunner::usage::{BillingPeriod, Metric};
use planrunner::Services;

#[derive(Parser)]
#[command(
    name = "planrunner",
    about = "Durable execution pipeline for browser automation plans",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (falls back to PLANRUNNER_CONFIG, then /etc/planrunner/planrunner.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + workers + scheduler)
    Serve,

    /// Submit a run from a JSON job payload
    Enqueue {
        /// Path to the payload file
        #[arg(long)]
        file: PathBuf,

        /// Lower numbers run first
        #[arg(long, default_value = "0")]
        priority: i64,
    },

    /// Show job status and run record
    Status {
        run_id: String,
    },

    /// Cancel a queued or running run
    Cancel {
        run_id: String,
    },

    /// Show a tenant's usage of one metric for the current period
    Usage {
        tenant_id: String,
        /// tokens, run_minutes or screenshots
        metric: String,
    },

    /// Flush usage counters for a billing period (YYYY-MM) to the durable table
    Flush {
        #[arg(long)]
        period: Option<String>,
    },

    /// Delete terminal jobs past the retention window
    Purge,

    /// Preview what maintenance will run in the next N hours
    Schedule {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve => {
            tracing::info!(bind = %config.api.bind, "starting planrunner daemon");
            planrunner::serve(config).await?;
        }
        Commands::Enqueue { file, priority } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let payload: JobPayload = serde_json::from_str(&raw)
                .with_context(|| format!("invalid job payload in {}", file.display()))?;
            let services = offline_services(&config)?;
            let handle = services.pipeline.submit(payload, priority).await?;
            print_json(&handle)?;
        }
        Commands::Status { run_id } => {
            let services = offline_services(&config)?;
            let view = services.pipeline.status(&run_id)?;
            if view.is_empty() {
                anyhow::bail!("run '{run_id}' not found");
            }
            print_json(&view)?;
        }
        Commands::Cancel { run_id } => {
            let services = offline_services(&config)?;
            let outcome = services.pipeline.cancel(&run_id)?;
            println!("{run_id}: {outcome:?}");
        }
        Commands::Usage { tenant_id, metric } => {
            let metric: Metric = metric.parse()?;
            let services = offline_services(&config)?;
            // A fresh process has no fast counters; read flushed totals.
            services
                .meter
                .hydrate(&services.fast_usage, BillingPeriod::current())?;
            let stats = services.meter.stats(&tenant_id, metric).await?;
            print_json(&stats)?;
        }
        Commands::Flush { period } => {
            let period = match period {
                Some(p) => p.parse::<BillingPeriod>()?,
                None => BillingPeriod::current(),
            };
            let services = offline_services(&config)?;
            services.meter.hydrate(&services.fast_usage, period)?;
            let flushed = services.meter.flush(period).await?;
            println!("flushed {flushed} counters for {period}");
        }
        Commands::Purge => {
            let services = offline_services(&config)?;
            let purged = services.jobs.purge_expired()?;
            println!("purged {purged} jobs");
        }
        Commands::Schedule { hours } => {
            let services = offline_services(&config)?;
            let preview = services.scheduler(&config)?.preview(hours);
            if preview.is_empty() {
                println!("Nothing scheduled in the next {hours} hours.");
            } else {
                println!("Upcoming maintenance (next {hours} hours):");
                for (at, name) in preview {
                    println!("{} : {name}", at.to_rfc3339());
                }
            }
        }
    }

    Ok(())
}

/// Components for one-shot commands. The launcher is never asked to start a
/// driver outside `serve`.
fn offline_services(config: &PipelineConfig) -> Result<Services> {
    let launcher = Arc::new(WebDriverLauncher::new(config.engine.clone())?);
    Services::build(config, launcher)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(config: &PipelineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
