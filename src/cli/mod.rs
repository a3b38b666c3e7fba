//! Command-line interface for `intervald`.
//!
//! Runs an accumulator engine fed by the synthetic trace generator and logs
//! what it flushes. Useful for demos and for sizing a configuration.

use crate::accumulator::{EngineHandle, IntervalConsumer, NamespaceFilter};
use crate::core::config::ConfigBuilder;
use crate::core::{AccumulatorError, Config, Result};
use crate::generator::TraceGenerator;
use crate::interval::ClosedInterval;
use crate::monitoring::StatsReporter;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Interval accumulation engine demo daemon
#[derive(Parser, Debug)]
#[command(name = "intervald")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/intervald/config.yaml)
    #[arg(short, long, env = "INTERVALD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of shard workers
    #[arg(long, env = "INTERVALD_SHARDS")]
    pub shards: Option<usize>,

    /// Flush period in seconds
    #[arg(long, env = "INTERVALD_FLUSH_PERIOD")]
    pub flush_period: Option<u64>,

    /// Maximum intervals per consumer batch
    #[arg(long, env = "INTERVALD_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Synthetic traces per second (0 disables the generator)
    #[arg(long, env = "INTERVALD_RATE", default_value_t = 1000)]
    pub rate: u32,

    /// Enable debug logging
    #[arg(short, long, env = "INTERVALD_DEBUG")]
    pub debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Environment variables
    /// 3. Config file
    /// 4. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = match &self.config {
            Some(path) => path.clone(),
            None => {
                let default_path = default_config_path();
                if !default_path.exists() {
                    return self.build_config_from_args(builder);
                }
                default_path
            }
        };

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                builder = builder.from_yaml(&content)?;
            }
            Err(e) if self.config.is_some() => {
                return Err(AccumulatorError::config(format!(
                    "Failed to read config file {:?}: {}",
                    config_path, e
                )));
            }
            Err(_) => {}
        }

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(shards) = self.shards {
            builder = builder.shard_count(shards);
        }
        if let Some(secs) = self.flush_period {
            builder = builder.flush_period(Duration::from_secs(secs));
        }
        if let Some(size) = self.batch_size {
            builder = builder.flush_batch_size(size);
        }

        builder.debug(self.debug).build()
    }

    /// Initialize logging.
    ///
    /// `--debug` wins, then `RUST_LOG`, then `INTERVALD_LOG_LEVEL`, then the
    /// configured level.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let filter = if self.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = std::env::var("INTERVALD_LOG_LEVEL")
                    .unwrap_or_else(|_| config.logging.level.as_str().to_string());
                EnvFilter::new(level)
            })
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_names(config.logging.thread_names)
            .compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| AccumulatorError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("intervald").join("config.yaml"))
        .unwrap_or_else(|| PathBuf::from("~/.config/intervald/config.yaml"))
}

/// Consumer that logs a summary of every batch it receives.
#[derive(Debug, Default)]
pub struct LoggingConsumer {
    batches: AtomicU64,
    intervals: AtomicU64,
}

impl LoggingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intervals(&self) -> u64 {
        self.intervals.load(Ordering::Relaxed)
    }
}

impl IntervalConsumer for LoggingConsumer {
    fn id(&self) -> &str {
        "log"
    }

    fn submit_intervals(&self, intervals: &[ClosedInterval]) {
        let batch = self.batches.fetch_add(1, Ordering::Relaxed) + 1;
        self.intervals
            .fetch_add(intervals.len() as u64, Ordering::Relaxed);

        let traces: u64 = intervals.iter().map(|i| i.count).sum();
        let urgent = intervals.iter().filter(|i| i.urgent).count();
        tracing::info!(batch, intervals = intervals.len(), traces, urgent, "Received interval batch");

        for interval in intervals.iter().filter(|i| i.count > 0) {
            tracing::debug!(
                metric = %interval.metric_id,
                count = interval.count,
                value = ?interval.value,
                "Interval closed"
            );
        }
    }
}

/// Execute the daemon.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config().await?;
    cli.init_logging(&config)?;

    if cli.check_config {
        println!("Configuration is valid!");
        println!("  Shards: {}", config.engine.shard_count);
        println!("  Flush period: {:?}", config.engine.flush_period);
        println!("  Flush batch size: {}", config.engine.flush_batch_size);
        println!("  Outbound queue: {}", config.engine.outbound_queue_size);
        println!("  Inbound queue per shard: {}", config.shard.inbound_queue_size);
        return Ok(());
    }

    run(config, cli.rate).await
}

async fn run(config: Config, rate: u32) -> Result<()> {
    let flush_period = config.engine.flush_period;
    let handle = Arc::new(EngineHandle::new(config));
    handle.register_consumer(Arc::new(LoggingConsumer::new()), NamespaceFilter::All)?;

    let engine = handle.engine()?;
    tracing::info!(
        shards = engine.shard_count(),
        flush_period = ?flush_period,
        rate,
        "intervald running"
    );

    let reporter = StatsReporter::new(Arc::clone(&handle), flush_period);
    let reporter_task = reporter.start();

    let generator = Arc::new(TraceGenerator::new()?);
    let generator_task = (rate > 0).then(|| {
        let generator = Arc::clone(&generator);
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            generator
                .run(rate, move |trace| {
                    handle.ingest(trace);
                })
                .await;
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");

    generator.stop().await;
    if let Some(task) = generator_task {
        let _ = task.await;
    }
    reporter.stop();
    reporter_task.abort();

    // Shutdown joins threads, keep it off the async workers
    let closing = Arc::clone(&handle);
    if let Err(e) = tokio::task::spawn_blocking(move || closing.shutdown()).await {
        tracing::error!("Engine shutdown task failed: {}", e);
    }

    let stats = engine.stats();
    tracing::info!(
        intervals = stats.intervals_delivered,
        cycles = stats.flush_cycles,
        drops = stats.total_drops(),
        "intervald stopped"
    );
    Ok(())
}
