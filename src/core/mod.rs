//! Core domain types, configuration and errors.
//!
//! This module contains the value objects every other part of the
//! accumulator is built on: metric identities, traces, configuration
//! and the crate error type.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    Config, ConfigBuilder, EngineConfig, LogLevel, ShardConfig, DEFAULT_OUTBOUND_QUEUE_PER_SHARD,
};
pub use error::{AccumulatorError, Result};
pub use types::{MetricId, MetricType, Trace, TraceValue, ValueKind, DELIMITER};
