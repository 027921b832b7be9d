//! Kuba Rollup daemon
//!
//! Runs the rollup levels in the background and offers a few offline tools.
//!
//! # CLI Commands
//!
//! - `start` - Run every enabled level until Ctrl+C or SIGTERM (default)
//! - `check-config` - Validate the configuration and print a summary
//! - `plan` - Plan a query and print the chosen precision, table and clause
//! - `split-points` - Print partition counts and boundaries for the inventory
//!
//! # Configuration
//!
//! Read from, in order:
//! 1. `--config <path>`
//! 2. `ROLLUP_CONFIG` environment variable (path to TOML file)
//! 3. Defaults
//!
//! `ROLLUP_*` variables and `RUST_LOG` override file values.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use kuba_rollup::config::Config;
use kuba_rollup::metadata::{InMemoryMetadataStore, SeriesIdentityCache};
use kuba_rollup::metrics;
use kuba_rollup::query::{
    PlanOutcome, QueryPlanner, QueryRequest, TopNFunction, TopNSpec,
};
use kuba_rollup::services::{
    build_rollup_services, register_rollup_services, FileCheckpointStore, RollupStores,
    ServiceConfig, ServiceManager,
};
use kuba_rollup::storage::split_points::boundary_hex;
use kuba_rollup::storage::{compute_split_points, InMemoryStore};
use kuba_rollup::types::Precision;

// =============================================================================
// CLI Definition
// =============================================================================

/// Kuba Rollup - multi-precision rollups for cluster telemetry
#[derive(Parser)]
#[command(name = "kuba-rollup")]
#[command(version)]
#[command(about = "Host and cluster metric rollups with a precision-aware query planner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (overrides ROLLUP_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rollup levels (default)
    Start,

    /// Validate configuration file without starting anything
    CheckConfig,

    /// Plan a query and print the resulting condition
    Plan {
        /// Metric names, comma separated, `%` allowed
        #[arg(short, long, value_delimiter = ',', required = true)]
        metrics: Vec<String>,

        /// Host names, comma separated; omit for cluster tables
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,

        /// App id
        #[arg(long)]
        app_id: Option<String>,

        /// Window start, epoch seconds or ms (default: one hour before end)
        #[arg(long)]
        start: Option<i64>,

        /// Window end, epoch seconds or ms (default: now)
        #[arg(long)]
        end: Option<i64>,

        /// Force a precision (seconds, minutes, hours, days)
        #[arg(short, long)]
        precision: Option<Precision>,

        /// Row limit
        #[arg(long)]
        limit: Option<usize>,

        /// Keep only the top N series
        #[arg(long)]
        top_n: Option<usize>,

        /// Ranking function for --top-n (max, min, avg, sum)
        #[arg(long, default_value = "max")]
        top_function: TopNFunction,

        /// Keep the bottom N instead
        #[arg(long)]
        bottom: bool,
    },

    /// Print initial partition boundaries for the configured inventory
    SplitPoints {
        /// Override the number of slave hosts
        #[arg(long)]
        slave_count: Option<u32>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

// =============================================================================
// Setup
// =============================================================================

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("ROLLUP_CONFIG").ok().map(PathBuf::from));

    let config = match path {
        Some(path) => Config::from_file_with_env(&path.to_string_lossy())?,
        None => Config::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Graceful shutdown signal handler
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(
                    error = %e,
                    "Ctrl+C handler installation failed - graceful shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(
                    error = %e,
                    "SIGTERM handler installation failed - SIGTERM shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(config: &Config) {
    println!("Configuration is valid!");
    println!();
    println!("Rollup Levels:");
    for kind in kuba_rollup::services::LevelKind::ALL {
        let level = config.aggregators.level(kind);
        println!(
            "  {:<15} every {:>6}s  cutoff {}{}",
            level.name,
            level.interval.as_secs(),
            level.cutoff,
            if level.disabled { "  (disabled)" } else { "" }
        );
    }
    println!("  Cluster apps: {:?}", config.aggregators.cluster_app_ids);
    println!();
    println!("Query Planner:");
    println!("  Result limit: {}", config.query.result_limit);
    println!("  Max IN clause keys: {}", config.query.max_in_clause_keys);
    println!();
    println!("Storage:");
    println!("  Checkpoint directory: {:?}", config.storage.checkpoint_dir);
    println!();
    println!("Monitoring:");
    println!("  Prometheus enabled: {}", config.monitoring.metrics_enabled);
    match &config.monitoring.metrics_file {
        Some(path) => println!(
            "  Metrics export: {} every {}s",
            path.display(),
            config.monitoring.metrics_interval_secs
        ),
        None => println!(
            "  Metrics export: debug log every {}s",
            config.monitoring.metrics_interval_secs
        ),
    }
    println!("  Log level: {}", config.monitoring.log_level);
}

/// Plan a query against an empty identity cache
#[allow(clippy::too_many_arguments)]
fn cmd_plan(
    config: &Config,
    metrics: &[String],
    hosts: &[String],
    app_id: Option<&str>,
    start: Option<i64>,
    end: Option<i64>,
    precision: Option<Precision>,
    limit: Option<usize>,
    top_n: Option<TopNSpec>,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = chrono::Utc::now().timestamp_millis();
    let end = end.unwrap_or(now);
    let start = start.unwrap_or(end - 3_600_000);

    let mut builder = QueryRequest::builder()
        .metrics(metrics.iter().cloned())
        .hosts(hosts.iter().cloned())
        .start_time(start)
        .end_time(end);
    if let Some(app) = app_id {
        builder = builder.app_id(app);
    }
    if let Some(p) = precision {
        builder = builder.precision(p);
    }
    if let Some(l) = limit {
        builder = builder.limit(l);
    }
    if let Some(spec) = top_n {
        builder = builder.top_n(spec);
    }
    let request = builder.build()?;

    let cache = Arc::new(SeriesIdentityCache::new(
        Arc::new(InMemoryMetadataStore::new()),
        &config.metadata,
    )?);
    let planner = QueryPlanner::new(cache, config.query.clone());
    let outcome = planner.plan_at(&request, now)?;

    if let PlanOutcome::InvalidTopN { .. } = outcome {
        println!("Top-N does not apply to this metric/host combination; planned without it");
    }
    let condition = outcome.into_condition();
    let params: Vec<String> = condition.params().iter().map(|p| p.to_string()).collect();

    println!("Precision: {}", condition.precision);
    println!("Table:     {}", condition.table);
    println!("Estimate:  {} points", condition.estimated_points);
    println!("Clause:    {}", condition.clause().trim_start());
    println!("Params:    [{}]", params.join(", "));
    println!("SQL:       {}", condition.statement(config.query.result_limit));
    Ok(())
}

/// Print split points for the configured inventory
fn cmd_split_points(
    config: &Config,
    slave_count: Option<u32>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut inventory = config.provisioning.inventory();
    if let Some(count) = slave_count {
        inventory.slave_count = count;
    }
    let set = compute_split_points(&inventory, &config.provisioning.storage_params())?;

    if format == "json" {
        let hex = |keys: &[Vec<u8>]| keys.iter().map(|k| boundary_hex(k)).collect::<Vec<_>>();
        let doc = serde_json::json!({
            "estimated_series": set.estimated_series,
            "host_precision": hex(&set.host_precision),
            "host_aggregate": hex(&set.host_aggregate),
            "cluster_aggregate": hex(&set.cluster_aggregate),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Estimated series: {}", set.estimated_series);
    println!();
    for (label, partitions, keys) in [
        ("Host precision", set.raw_partitions(), &set.host_precision),
        ("Host aggregate", set.host_aggregate_partitions(), &set.host_aggregate),
        ("Cluster aggregate", set.cluster_aggregate_partitions(), &set.cluster_aggregate),
    ] {
        println!("{} tables: {} partitions", label, partitions);
        for key in keys {
            println!("  {}", boundary_hex(key));
        }
    }
    Ok(())
}

/// Export metrics every `every`, and once more when `stop` fires
async fn export_metrics(target: Option<PathBuf>, every: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => metrics::export(target.as_deref()).await,
        }
    }
    metrics::export(target.as_deref()).await;
}

/// Run every level until a shutdown signal arrives
async fn cmd_start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let (exporter_tx, exporter_rx) = oneshot::channel();
    let exporter = if config.monitoring.metrics_enabled {
        metrics::init();
        Some(tokio::spawn(export_metrics(
            config.monitoring.metrics_file.clone(),
            Duration::from_secs(config.monitoring.metrics_interval_secs),
            exporter_rx,
        )))
    } else {
        None
    };

    let store = Arc::new(InMemoryStore::new());
    let checkpoints = Arc::new(FileCheckpointStore::new(config.storage.checkpoint_dir.clone()));
    let cache = Arc::new(SeriesIdentityCache::new(
        Arc::new(InMemoryMetadataStore::new()),
        &config.metadata,
    )?);
    let loaded = cache.warm_up().await?;
    debug!(series = loaded, "Identity cache loaded");

    let stores = RollupStores::in_memory(store, checkpoints, cache);
    let services = build_rollup_services(&config.aggregators, &stores)?;

    let manager = ServiceManager::new(ServiceConfig::default());
    register_rollup_services(&manager, &services)?;
    manager.start_all().await?;
    info!(
        levels = services.len(),
        checkpoint_dir = ?config.storage.checkpoint_dir,
        "Rollup levels running"
    );

    shutdown_signal().await;
    manager.shutdown().await?;

    if let Some(exporter) = exporter {
        metrics::shutdown();
        let _ = exporter_tx.send(());
        if let Err(e) = exporter.await {
            warn!(error = %e, "Metrics exporter task failed");
        }
    }

    for service in &services {
        let stats = service.stats();
        debug!(
            level = service.level().name,
            cycles = stats.cycles,
            windows = stats.windows_aggregated,
            failures = stats.failures,
            lag_events = stats.lag_events,
            "Level summary"
        );
    }

    info!("Rollup daemon shutdown complete");
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Some(Commands::CheckConfig) => {
            cmd_check_config(&config);
            Ok(())
        },
        Some(Commands::Plan {
            metrics,
            hosts,
            app_id,
            start,
            end,
            precision,
            limit,
            top_n,
            top_function,
            bottom,
        }) => {
            let spec = top_n.map(|n| TopNSpec {
                n,
                function: *top_function,
                bottom: *bottom,
            });
            cmd_plan(
                &config,
                metrics,
                hosts,
                app_id.as_deref(),
                *start,
                *end,
                *precision,
                *limit,
                spec,
            )
        },
        Some(Commands::SplitPoints {
            slave_count,
            format,
        }) => cmd_split_points(&config, *slave_count, format),
        Some(Commands::Start) | None => {
            init_tracing(&config.monitoring.log_level);
            info!("Starting Kuba Rollup v{}", env!("CARGO_PKG_VERSION"));
            cmd_start(config).await
        },
    }
}
