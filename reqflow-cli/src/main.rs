use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reqflow_core::{ChannelConfig, Filter, MemoryDataSource, MemoryTransport};
use reqflow_orchestrator::{
    init_metrics, metrics, ListOptions, Orchestrator, OrchestratorConfig, Priority,
};

#[derive(Parser)]
#[command(name = "reqflow")]
#[command(version)]
#[command(about = "Reqflow - request orchestration for remote data services", long_about = None)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config {
        /// Start from a preset instead of the environment
        #[arg(short, long)]
        preset: Option<Preset>,
    },

    /// Drive a synthetic workload through every component
    Simulate {
        /// Number of scheduled row lookups
        #[arg(short, long, default_value_t = 200)]
        requests: usize,

        /// Rows in the simulated table
        #[arg(long, default_value_t = 100)]
        rows: usize,

        /// Configuration preset
        #[arg(short, long)]
        preset: Option<Preset>,

        /// Also print Prometheus metrics
        #[arg(long)]
        prometheus: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    LowLatency,
    HighThroughput,
}

fn load_config(preset: Option<Preset>) -> OrchestratorConfig {
    match preset {
        None => OrchestratorConfig::from_env(),
        Some(Preset::Default) => OrchestratorConfig::default(),
        Some(Preset::LowLatency) => OrchestratorConfig::low_latency(),
        Some(Preset::HighThroughput) => OrchestratorConfig::high_throughput(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "reqflow=debug" } else { "reqflow=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Config { preset } => print_config(&load_config(preset)),
        Commands::Simulate {
            requests,
            rows,
            preset,
            prometheus,
        } => simulate(load_config(preset), requests, rows, prometheus).await?,
    }

    Ok(())
}

fn print_config(config: &OrchestratorConfig) {
    println!("=== Cache ===");
    println!("Capacity: {}", config.cache.capacity);
    println!("Default TTL: {}s", config.cache.default_ttl.as_secs());
    println!("Evict ratio: {:.0}%", config.cache.evict_ratio * 100.0);
    println!();

    println!("=== Memory ===");
    println!("Budget: {} bytes", config.memory.max_bytes);
    println!("Max age: {}s", config.memory.max_age.as_secs());
    println!("Image retention: {:?} ({} images)", config.memory.retention, config.memory.image_capacity);
    println!();

    println!("=== Rate Limits ===");
    let mut categories: Vec<_> = config.rate_limits.limits.iter().collect();
    categories.sort_by(|a, b| a.0.cmp(b.0));
    for (category, limit) in categories {
        println!(
            "{}: {} per {}s",
            category,
            limit.max_requests,
            limit.window.as_secs()
        );
    }
    println!("Queue per category: {}", config.rate_limits.max_queue_per_category);
    println!();

    println!("=== Scheduler ===");
    println!("Max concurrent: {}", config.scheduler.max_concurrent);
    println!("Max queue: {}", config.scheduler.max_queue_size);
    println!("Process interval: {}ms", config.scheduler.process_interval.as_millis());
    println!(
        "Retries: {} (delay {}ms)",
        config.scheduler.default_max_retries,
        config.scheduler.retry_delay.as_millis()
    );
    println!();

    println!("=== Batcher ===");
    println!("Debounce: {}ms", config.batch.debounce.as_millis());
    println!("Max batch: {}", config.batch.max_batch_size);
    println!("Count TTL: {}s", config.batch.count_ttl.as_secs());
    println!();

    println!("=== Connection Pool ===");
    println!("Max channels: {}", config.pool.max_channels);
    println!("Idle TTL: {}s", config.pool.idle_ttl.as_secs());
    println!();

    println!("=== Query Optimizer ===");
    println!("Row TTL: {}s", config.optimizer.default_ttl.as_secs());
    println!("List TTL: {}s", config.optimizer.list_ttl.as_secs());
    println!("Slow query: {}ms", config.optimizer.slow_query_threshold.as_millis());
}

async fn simulate(
    config: OrchestratorConfig,
    requests: usize,
    rows: usize,
    prometheus: bool,
) -> anyhow::Result<()> {
    init_metrics();

    let rows = rows.max(1);
    let source = Arc::new(MemoryDataSource::new());
    source.insert(
        "items",
        (1..=rows).map(|i| json!({"id": i, "name": format!("item-{}", i), "price": (i % 50) * 3})),
    );
    source.set_latency(Duration::from_millis(5));
    let transport = MemoryTransport::new();

    let orchestrator = Orchestrator::new(config, source.clone(), transport.clone());
    orchestrator.start();
    info!(requests, rows, "Starting simulation");

    // Scheduled row lookups across every tier
    let tickets: Vec<_> = (0..requests)
        .map(|i| {
            let optimizer = orchestrator.optimizer.clone();
            let id = (i % rows) + 1;
            let priority = Priority::ALL[i % Priority::ALL.len()];
            orchestrator.scheduler.enqueue(
                move || {
                    let optimizer = optimizer.clone();
                    async move { optimizer.get_by_id("items", id, "*", None).await }
                },
                priority,
                None,
            )
        })
        .collect();
    let lookups = join_all(tickets).await;
    let failed = lookups.iter().filter(|r| r.is_err()).count();

    // Rate-limited list pages behind the response cache
    for page in 1..=5 {
        let optimizer = orchestrator.optimizer.clone();
        let key = format!("items:page:{}", page);
        orchestrator
            .limiter
            .execute("api", move || async move {
                let options = ListOptions::new().order("price", false).page(page, 10);
                let result = optimizer.get_list("items", &options).await?;
                Ok(serde_json::to_value(result)?)
            })
            .await
            .map(|value| orchestrator.cache.set(key, value, None))
            .context("list page failed")?;
    }

    let expensive = orchestrator
        .batcher
        .count("items", &[Filter::gte("price", 100)])
        .await
        .context("count failed")?;

    // Shared realtime channels
    let feed = ChannelConfig::table("items").event("UPDATE");
    for _ in 0..3 {
        orchestrator
            .pool
            .get_channel("items-feed", &feed)
            .await
            .context("channel subscription failed")?;
    }
    for _ in 0..3 {
        orchestrator.pool.release_channel("items-feed", &feed).await?;
    }

    for i in 0..rows.min(50) {
        orchestrator
            .memory
            .cache_data(format!("detail:{}", i), json!({"id": i, "blob": "x".repeat(256)}));
    }
    orchestrator.on_inactive();

    let stats = orchestrator.stats().await;
    orchestrator.shutdown().await;

    println!("=== Simulation ===");
    println!("Lookups: {} ({} failed)", requests, failed);
    println!("Backend selects: {}", source.select_calls());
    println!("Backend counts: {}", source.count_calls());
    println!("Items priced >= 100: {}", expensive);
    println!("Channels opened: {}", transport.subscribe_calls());
    println!();

    println!("=== JSON Output ===");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if prometheus {
        println!();
        println!("=== Prometheus ===");
        println!("{}", metrics::encode_metrics());
    }

    Ok(())
}
