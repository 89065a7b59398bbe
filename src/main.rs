//! copytrader command line: run the replication engine or inspect its
//! persisted state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use copytrader::broker;
use copytrader::config::{AppConfig, LogFormat, LoggingConfig};
use copytrader::db::{Database, MappingFilter, OperationFilter};
use copytrader::models::{MappingStatus, OperationStatus};
use copytrader::trading::Engine;

/// Trade copier CLI.
#[derive(Parser)]
#[command(name = "copytrader")]
#[command(about = "Mirror positions from a master trading account onto slave accounts", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "COPIER_CONFIG", default_value = "copier.toml")]
    config: PathBuf,

    /// Database URL, overrides the config file
    #[arg(short, long)]
    database: Option<String>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replication engine
    Run,

    /// List position mappings
    Positions {
        /// open, closed or error
        #[arg(short, long)]
        status: Option<String>,

        /// Only this slave
        #[arg(long)]
        slave: Option<String>,
    },

    /// Position and queue statistics
    Stats,

    /// List queue entries
    Queue {
        /// pending, processing, completed or failed
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Show the audit trail, newest first
    Audit {
        /// Maximum number of records to show
        #[arg(short, long, default_value = "50")]
        limit: i64,

        /// Only this event type (e.g. position_opened)
        #[arg(short, long)]
        event: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(url) = cli.database {
        config.database.url = url;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run => run(config).await?,

        Commands::Positions { status, slave } => {
            let db = open_database(&config).await?;
            let status = status
                .map(|s| s.parse::<MappingStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let mappings = db
                .list_mappings(&MappingFilter {
                    status,
                    slave_name: slave,
                    master_ticket: None,
                })
                .await?;

            if mappings.is_empty() {
                println!("No position mappings.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<16} {:<12} {:<10} {:<5} {:>10} {:>10} {:<8}",
                "MASTER", "SLAVE", "SLAVE TKT", "SYMBOL", "DIR", "MASTER VOL", "SLAVE VOL", "STATUS"
            );
            println!("{}", "-".repeat(90));
            for m in &mappings {
                println!(
                    "{:<12} {:<16} {:<12} {:<10} {:<5} {:>10} {:>10} {:<8}",
                    m.master_ticket,
                    truncate(&m.slave_name, 16),
                    m.slave_ticket.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
                    m.symbol,
                    m.direction.as_str(),
                    m.master_volume,
                    m.slave_volume,
                    m.status.as_str()
                );
                if let Some(error) = &m.last_error {
                    println!("    error: {}", error);
                }
            }
        }

        Commands::Stats => {
            let db = open_database(&config).await?;
            let positions = db.position_stats().await?;
            let queue = db.queue_stats().await?;

            println!("\n=== Positions ===");
            println!("Master positions copied: {}", positions.total_master_positions);
            println!("Open slave positions:    {}", positions.total_slave_positions);

            if !positions.positions_by_slave.is_empty() {
                println!("\nBy slave:");
                for (slave, count) in &positions.positions_by_slave {
                    println!("  {:<20} {:>6}", slave, count);
                }
            }
            if !positions.positions_by_symbol.is_empty() {
                println!("\nBy symbol:");
                for (symbol, count) in &positions.positions_by_symbol {
                    println!("  {:<20} {:>6}", symbol, count);
                }
            }
            if !positions.mappings_by_status.is_empty() {
                println!("\nMappings by status:");
                for (status, count) in &positions.mappings_by_status {
                    println!("  {:<20} {:>6}", status, count);
                }
            }

            println!("\n=== Queue ===");
            println!("Pending:    {}", queue.pending);
            println!("Processing: {}", queue.processing);
            println!("Completed:  {}", queue.completed);
            println!("Failed:     {}", queue.failed);
        }

        Commands::Queue { status, limit } => {
            let db = open_database(&config).await?;
            let status = status
                .map(|s| s.parse::<OperationStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let entries = db
                .list_operations(&OperationFilter {
                    status,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;

            if entries.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }

            println!(
                "\n{:>8} {:<14} {:<12} {:<16} {:<11} {:>8} {:<20}",
                "ID", "OPERATION", "MASTER", "SLAVE", "STATUS", "ATTEMPTS", "NEXT RETRY"
            );
            println!("{}", "-".repeat(95));
            for op in &entries {
                println!(
                    "{:>8} {:<14} {:<12} {:<16} {:<11} {:>5}/{:<2} {:<20}",
                    op.id,
                    op.operation_type.as_str(),
                    op.master_ticket,
                    truncate(&op.slave_name, 16),
                    op.status.as_str(),
                    op.attempts,
                    op.max_attempts,
                    op.next_retry_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(error) = &op.error_message {
                    println!("    error: {}", error);
                }
            }
        }

        Commands::Audit { limit, event } => {
            let db = open_database(&config).await?;
            let records = db.recent_audit(limit, event.as_deref()).await?;

            if records.is_empty() {
                println!("No audit records.");
                return Ok(());
            }

            for record in &records {
                println!(
                    "{} {:<24} master={} slave={} {}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.event_type,
                    record.master_ticket.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
                    record.slave_name.as_deref().unwrap_or("-"),
                    record.details
                );
            }
        }

        Commands::Config => print_config(&config),
    }

    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    let db = open_database(&config).await?;
    let master = broker::connect(&config.master.connection, config.settings.broker_timeout())
        .context("Failed to connect master account")?;

    let engine = Arc::new(Engine::new(
        config.settings.clone(),
        db,
        config.master.clone(),
        master,
    ));
    for slave in &config.slaves {
        engine
            .add_slave(slave.clone())
            .await
            .with_context(|| format!("Failed to add slave {}", slave.name))?;
    }

    println!("\n=== Trade Copier ===");
    println!("Master:        {} ({})", config.master.name, config.master.connection.endpoint());
    println!("Slaves:        {}", config.slaves.len());
    println!("Poll interval: {}ms", config.settings.poll_interval_ms);
    println!("Database:      {}", config.database.url);
    println!("\nPress Ctrl+C to stop.\n");

    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        signal_engine.shutdown();
    });

    let result = engine.run().await;
    if let Err(e) = &result {
        error!(error = %e, "Engine stopped on error");
    }

    match engine.status().await {
        Ok(status) => println!("\n{}", status),
        Err(e) => error!(error = %e, "Could not read final status"),
    }
    engine.database().close().await;

    result.context("Replication engine failed")
}

async fn open_database(config: &AppConfig) -> Result<Database> {
    Database::new(&config.database.url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level {}", logging.level))?;

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match logging.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

fn print_config(config: &AppConfig) {
    let s = &config.settings;

    println!("\n=== Copier Configuration ===\n");
    println!("Database:             {}", config.database.url);
    println!("Log level:            {} ({:?})", config.logging.level, config.logging.format);

    println!("\nEngine:");
    println!("  Poll Interval:      {}ms", s.poll_interval_ms);
    println!("  Drain Interval:     {}ms", s.drain_interval_ms);
    println!("  Heartbeat:          {}ms", s.heartbeat_interval_ms);
    println!("  Broker Timeout:     {}ms", s.broker_timeout_ms);
    println!("  Max Attempts:       {}", s.max_attempts);
    println!("  Retry Backoff:      {}ms .. {}ms", s.retry_base_ms, s.retry_max_ms);
    println!("  Default Lot Step:   {}", s.default_lot_step);
    println!("  Copy Existing:      {}", s.copy_existing_on_startup);
    println!("  Auto Reconnect:     {}", s.auto_reconnect);

    println!("\nMaster:");
    println!("  {} ({})", config.master.name, config.master.connection.endpoint());

    println!("\nSlaves:");
    if config.slaves.is_empty() {
        println!("  (none)");
    }
    for slave in &config.slaves {
        println!(
            "  {:<16} {:<8} {:<12} value={} lots=[{}, {}] magic={} invert={} {}",
            truncate(&slave.name, 16),
            if slave.enabled { "enabled" } else { "disabled" },
            slave.lot_mode.as_str(),
            slave.lot_value,
            slave.min_lot,
            slave.max_lot,
            slave.magic_number,
            slave.invert_trades,
            slave.connection.endpoint()
        );
    }
}

/// Truncate a string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
