//! Configuration management for the interval accumulator.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - CLI argument overrides (see `cli`)
//! - Validation and defaults
//!
//! Configuration is read once when an engine generation starts. Changing it
//! requires starting a new generation through `EngineHandle::reconfigure`.

use crate::core::{AccumulatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default per-shard aggregate map size
pub const DEFAULT_SHARD_MAP_SIZE: usize = 256;
/// Default per-shard aggregate map load factor
pub const DEFAULT_SHARD_MAP_LOAD_FACTOR: f32 = 0.75;
/// Default per-shard inbound queue size
pub const DEFAULT_SHARD_QUEUE_SIZE: usize = 200;
/// Default outbound queue slots per shard
pub const DEFAULT_OUTBOUND_QUEUE_PER_SHARD: usize = 256;
/// Default flush batch size
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 50;
/// Maximum number of downstream consumers
pub const MAX_CONSUMERS: usize = 64;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine-wide configuration
    pub engine: EngineConfig,
    /// Per-shard configuration
    pub shard: ShardConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of shard workers
    pub shard_count: usize,
    /// Capacity of the shared outbound queue
    pub outbound_queue_size: usize,
    /// Requested fairness of the outbound queue
    pub outbound_queue_fair: bool,
    /// Upper bound on one shard's whole submission in a flush cycle
    #[serde(with = "humantime_serde")]
    pub outbound_insert_timeout: Duration,
    /// Period between flush cycles
    #[serde(with = "humantime_serde")]
    pub flush_period: Duration,
    /// Maximum intervals handed to consumers per batch
    pub flush_batch_size: usize,
    /// How long the flush driver waits for shards to report in
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,
}

/// Per-shard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Expected number of open intervals per shard
    pub map_size: usize,
    /// Load factor used to size the aggregate map
    pub map_load_factor: f32,
    /// Capacity of each shard's inbound queue
    pub inbound_queue_size: usize,
    /// Requested fairness of the inbound queue
    pub inbound_queue_fair: bool,
    /// How long a shard waits for its peers after flushing
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,
    /// How long a shard waits to insert one interval into the outbound queue
    #[serde(with = "humantime_serde")]
    pub outbound_submit_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Include thread names in log lines
    pub thread_names: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let shard_count = available_cores();
        EngineConfig {
            shard_count,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_PER_SHARD * shard_count,
            outbound_queue_fair: false,
            outbound_insert_timeout: Duration::from_millis(50),
            flush_period: Duration::from_secs(15),
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            barrier_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            map_size: DEFAULT_SHARD_MAP_SIZE,
            map_load_factor: DEFAULT_SHARD_MAP_LOAD_FACTOR,
            inbound_queue_size: DEFAULT_SHARD_QUEUE_SIZE,
            inbound_queue_fair: false,
            barrier_timeout: Duration::from_millis(500),
            outbound_submit_timeout: Duration::from_millis(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            thread_names: true,
        }
    }
}

/// Number of available processor cores, at least 1
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl EngineConfig {
    /// Validate engine-wide settings
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(AccumulatorError::config("shard_count must be greater than 0"));
        }
        if self.outbound_queue_size == 0 {
            return Err(AccumulatorError::config("outbound_queue_size must be greater than 0"));
        }
        if self.flush_period.is_zero() {
            return Err(AccumulatorError::config("flush_period must be greater than 0"));
        }
        if self.flush_batch_size == 0 {
            return Err(AccumulatorError::config("flush_batch_size must be greater than 0"));
        }
        if self.barrier_timeout.is_zero() {
            return Err(AccumulatorError::config("barrier_timeout must be greater than 0"));
        }
        Ok(())
    }
}

impl ShardConfig {
    /// Validate per-shard settings
    pub fn validate(&self) -> Result<()> {
        if self.inbound_queue_size == 0 {
            return Err(AccumulatorError::config("inbound_queue_size must be greater than 0"));
        }
        if !(self.map_load_factor > 0.0 && self.map_load_factor <= 1.0) {
            return Err(AccumulatorError::config(format!(
                "map_load_factor must be in (0, 1], got {}",
                self.map_load_factor
            )));
        }
        Ok(())
    }

    /// Initial aggregate map capacity derived from size and load factor
    pub fn map_capacity(&self) -> usize {
        (self.map_size as f64 / f64::from(self.map_load_factor)).ceil() as usize
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.shard.validate()?;
        Ok(())
    }

    /// Load and validate configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AccumulatorError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        ConfigBuilder::new().from_yaml(&content)?.build()
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| AccumulatorError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set shard count. The outbound queue is resized to keep its
    /// per-shard share unless it was set explicitly afterwards.
    pub fn shard_count(mut self, shards: usize) -> Self {
        self.config.engine.shard_count = shards;
        self.config.engine.outbound_queue_size = DEFAULT_OUTBOUND_QUEUE_PER_SHARD * shards.max(1);
        self
    }

    /// Set outbound queue size
    pub fn outbound_queue_size(mut self, size: usize) -> Self {
        self.config.engine.outbound_queue_size = size;
        self
    }

    /// Set outbound insert timeout
    pub fn outbound_insert_timeout(mut self, timeout: Duration) -> Self {
        self.config.engine.outbound_insert_timeout = timeout;
        self
    }

    /// Set flush period
    pub fn flush_period(mut self, period: Duration) -> Self {
        self.config.engine.flush_period = period;
        self
    }

    /// Set flush batch size
    pub fn flush_batch_size(mut self, size: usize) -> Self {
        self.config.engine.flush_batch_size = size;
        self
    }

    /// Set the flush driver's barrier timeout
    pub fn engine_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.config.engine.barrier_timeout = timeout;
        self
    }

    /// Set shard inbound queue size
    pub fn inbound_queue_size(mut self, size: usize) -> Self {
        self.config.shard.inbound_queue_size = size;
        self
    }

    /// Set shard barrier timeout
    pub fn shard_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.config.shard.barrier_timeout = timeout;
        self
    }

    /// Set shard outbound submit timeout
    pub fn outbound_submit_timeout(mut self, timeout: Duration) -> Self {
        self.config.shard.outbound_submit_timeout = timeout;
        self
    }

    /// Set log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.logging.level = level;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
