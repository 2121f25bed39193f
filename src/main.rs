//! # Dripwise Worker
//!
//! Runs the batch passes of the Dripwise automation core against the shared
//! SQLite database. Meant to be invoked by an external cron, or left running
//! with `run`.
//!
//! Usage:
//!   dripwise scheduled-pass                  # Fire due scheduled automations once
//!   dripwise nurture-pass                    # Advance due nurture enrollments once
//!   dripwise missed-appointments --owner o1 --bookings bookings.json
//!   dripwise run --interval-secs 300         # Both passes on an interval
//!   dripwise check-config                    # Print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dripwise_core::DripConfig;
use dripwise_scheduler::dispatch::{
    action_runner_from_config, message_sender_from_config, subscription_provider_from_config,
};
use dripwise_scheduler::{
    Booking, BraceTemplateRenderer, EventDispatcher, NurtureSequencer, ScheduledAutomationRunner,
    SchedulerDb,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dripwise", version, about = "💧 Dripwise: automation and drip campaign worker")]
struct Cli {
    /// Config file (default: ~/.dripwise/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overrides [database] path
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fire due scheduled_time triggers across tenants
    ScheduledPass {
        #[arg(long)]
        owners_limit: Option<usize>,
        #[arg(long)]
        max_fires: Option<usize>,
    },
    /// Advance due nurture enrollments
    NurturePass {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Dispatch missed_appointment for one tenant's ended bookings (JSON array file)
    MissedAppointments {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        bookings: PathBuf,
    },
    /// Run both passes on an interval until interrupted
    Run {
        #[arg(long, default_value = "300")]
        interval_secs: u64,
    },
    /// Print the effective configuration
    CheckConfig,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&Path>) -> Result<DripConfig> {
    let mut config = match path {
        Some(path) => DripConfig::load_from(path)?,
        None => DripConfig::load()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

fn open_db(config: &DripConfig, override_path: Option<&str>) -> Result<Arc<SchedulerDb>> {
    let db_path = expand_path(override_path.unwrap_or(&config.database.path));
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = SchedulerDb::open(Path::new(&db_path)).with_context(|| format!("opening {db_path}"))?;
    tracing::debug!("🗄️ Database: {db_path}");
    Ok(Arc::new(db))
}

fn scheduled_runner(db: Arc<SchedulerDb>, config: &DripConfig) -> ScheduledAutomationRunner {
    ScheduledAutomationRunner::new(
        db,
        action_runner_from_config(config),
        config.scheduler.clone(),
    )
}

fn nurture_sequencer(db: Arc<SchedulerDb>, config: &DripConfig) -> NurtureSequencer {
    NurtureSequencer::new(
        db,
        message_sender_from_config(config),
        subscription_provider_from_config(&config.billing),
        Arc::new(BraceTemplateRenderer),
        config,
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "dripwise=debug,dripwise_scheduler=debug,dripwise_core=debug"
    } else {
        "dripwise=info,dripwise_scheduler=info,dripwise_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    let db_override = cli.db.as_deref();

    match cli.command {
        Command::ScheduledPass {
            owners_limit,
            max_fires,
        } => {
            let db = open_db(&config, db_override)?;
            let runner = scheduled_runner(db, &config);
            let report = runner
                .run_scheduled_pass(
                    owners_limit.unwrap_or(config.scheduler.owners_limit),
                    max_fires.unwrap_or(config.scheduler.per_owner_max_fires),
                    chrono::Utc::now(),
                )
                .await?;
            print_json(&report)?;
        }
        Command::NurturePass { batch_size } => {
            if let Some(batch_size) = batch_size {
                config.nurture.batch_size = batch_size;
            }
            let db = open_db(&config, db_override)?;
            let report = nurture_sequencer(db, &config).run().await?;
            print_json(&report)?;
        }
        Command::MissedAppointments { owner, bookings } => {
            let raw = std::fs::read_to_string(&bookings)
                .with_context(|| format!("reading {}", bookings.display()))?;
            let bookings: Vec<Booking> = serde_json::from_str(&raw).context("parsing bookings")?;
            let db = open_db(&config, db_override)?;
            let dispatcher = EventDispatcher::new(
                db,
                action_runner_from_config(&config),
                config.events.clone(),
                config.scheduler.collaborator_timeout_secs,
            );
            let report = dispatcher
                .dispatch_missed_appointments(&owner, &bookings, chrono::Utc::now())
                .await?;
            print_json(&report)?;
        }
        Command::Run { interval_secs } => {
            let db = open_db(&config, db_override)?;
            let scheduled = Arc::new(scheduled_runner(db.clone(), &config));
            let nurture = Arc::new(nurture_sequencer(db, &config));
            println!("💧 Dripwise worker v{}", env!("CARGO_PKG_VERSION"));
            tokio::select! {
                _ = dripwise_scheduler::run_worker_loop(scheduled, nurture, interval_secs) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("👋 Shutting down");
                }
            }
        }
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            if config.billing.dev_bypass(&config.messaging) {
                println!("# billing gate: bypassed (non-production, nothing configured)");
            } else if config.billing.is_production() && config.billing.stripe_secret_key.is_none() {
                println!("# ⚠️ production without STRIPE_SECRET_KEY: every campaign will pause");
            }
        }
    }

    Ok(())
}
