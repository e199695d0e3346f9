//! quota-rs: token-quota accounting service
//!
//! # Usage
//!
//! ```bash
//! # Serve the HTTP API with background maintenance
//! quota-rs --config quota.toml serve
//!
//! # One-shot maintenance pass (for cron)
//! quota-rs --config quota.toml sweep
//!
//! # Print a tenant's pool and today's member usage
//! quota-rs --config quota.toml status acme
//! ```

use clap::{Parser, Subcommand};
use quota_rs::api::ApiServer;
use quota_rs::clock::SystemClock;
use quota_rs::config::{Config, SchedulerConfig};
use quota_rs::notify::LogSink;
use quota_rs::persistence::SqliteLedgerStore;
use quota_rs::QuotaEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quota-rs")]
#[command(about = "Hierarchical token-quota accounting engine", long_about = None)]
struct Cli {
    /// Configuration file (TOML); QUOTA__SECTION__KEY variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run maintenance in the background
    Serve,
    /// Expire stale reservations, run the daily and monthly sweeps, save
    Sweep,
    /// Show a tenant's pool and today's member usage
    Status {
        /// Tenant identifier
        tenant_id: String,
    },
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("quota_rs={},tower_http=info", config.logging.level).into()
    });
    let json = config.logging.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Build an engine from configuration and the stored snapshot
async fn open_engine(config: &Config) -> anyhow::Result<(Arc<QuotaEngine>, Arc<SqliteLedgerStore>)> {
    let store = Arc::new(SqliteLedgerStore::new(&config.storage.database_url).await?);
    let snapshot = store.load_snapshot().await?;

    let engine = QuotaEngine::new(config, Arc::new(SystemClock)).with_sink(Arc::new(LogSink));
    engine.restore(snapshot).await;

    let seeded = engine.seed_tenants(&config.tenants).await?;
    if seeded > 0 {
        info!("Registered {} tenants from configuration", seeded);
    }

    Ok((Arc::new(engine), store))
}

async fn persist(engine: &QuotaEngine, store: &SqliteLedgerStore) {
    let snapshot = engine.snapshot().await;
    if let Err(e) = store.save_snapshot(&snapshot).await {
        error!("Failed to persist snapshot: {}", e);
    }
}

/// Periodic expiry, sweeps and persistence until `shutdown` fires
async fn maintenance_loop(
    engine: Arc<QuotaEngine>,
    store: Arc<SqliteLedgerStore>,
    intervals: SchedulerConfig,
    shutdown: CancellationToken,
) {
    let mut expiry = tokio::time::interval(Duration::from_secs(intervals.expiry_interval_secs));
    let mut reset = tokio::time::interval(Duration::from_secs(intervals.reset_interval_secs));
    let mut save = tokio::time::interval(Duration::from_secs(intervals.persist_interval_secs));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = expiry.tick() => {
                let sweep = engine.expire_stale().await;
                let timeouts = engine.purge_expired_queue().await;
                if !sweep.expired.is_empty() || !timeouts.is_empty() {
                    info!(
                        "Expired {} reservations and {} queued requests",
                        sweep.expired.len(),
                        timeouts.len()
                    );
                }
            }
            _ = reset.tick() => {
                engine.run_daily_sweep().await;
                let monthly = engine.run_monthly_sweep().await;
                for err in &monthly.invalid {
                    error!("Reset sweep: {}", err);
                }
            }
            _ = save.tick() => persist(&engine, &store).await,
        }
    }

    info!("Maintenance task stopped");
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let (engine, store) = open_engine(&config).await?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    let maintenance = tokio::spawn(maintenance_loop(
        engine.clone(),
        store.clone(),
        config.scheduler.clone(),
        shutdown.clone(),
    ));

    let server = ApiServer::new(engine.clone(), config.api.listen_addr.clone());
    let result = server.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = maintenance.await {
        error!("Maintenance task failed: {}", e);
    }
    persist(&engine, &store).await;

    result?;
    Ok(())
}

async fn sweep(config: Config) -> anyhow::Result<()> {
    let (engine, store) = open_engine(&config).await?;
    let report = engine.run_maintenance().await;
    store.save_snapshot(&engine.snapshot().await).await?;

    println!("Expired reservations: {}", report.expired_reservations);
    println!("Timed-out queued requests: {}", report.queue_timeouts);
    if let Some(daily) = &report.daily {
        println!("Allocation rows purged: {}", daily.purged_rows);
    }
    if let Some(monthly) = &report.monthly {
        println!("Tenants reset: {}", monthly.reset.len());
        for err in &monthly.invalid {
            eprintln!("Error: {}", err);
        }
    }
    Ok(())
}

async fn status(config: Config, tenant_id: &str) -> anyhow::Result<()> {
    let (engine, _store) = open_engine(&config).await?;
    let usage = engine.tenant_usage(tenant_id).await?;
    println!("{}", serde_json::to_string_pretty(&usage)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config);

    info!("Starting quota-rs v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Sweep => sweep(config).await,
        Commands::Status { tenant_id } => status(config, &tenant_id).await,
    }
}
