//! Interval accumulator - sharded aggregation of metric traces.
//!
//! The accumulator takes a continuous stream of individual measurements
//! ("traces") and compresses them, per metric, into periodic interval
//! summaries that are handed to downstream consumers.
//!
//! # Features
//!
//! - **Non-blocking ingestion**: producers never wait; overload is dropped and counted
//! - **Sharded workers**: each metric is owned by exactly one shard thread
//! - **Coordinated flushes**: a bounded barrier seals every shard's window together
//! - **Live reconfiguration**: swap in a new engine generation without a restart
//! - **Filtered fan-out**: consumers subscribe to metric namespace prefixes
//!
//! # Architecture
//!
//! - `core`: metric identity, traces, configuration and errors
//! - `interval`: per-metric interval aggregates
//! - `accumulator`: shards, flush context, engine and handle
//! - `monitoring`: counters and health
//! - `generator`: synthetic traces for demos and tests
//! - `cli`: the `intervald` binary
//!
//! # Example
//!
//! ```no_run
//! use interval_accumulator::accumulator::EngineHandle;
//! use interval_accumulator::core::{Config, MetricId, MetricType, Trace};
//!
//! # fn main() -> interval_accumulator::Result<()> {
//! let handle = EngineHandle::new(Config::default());
//! let latency = MetricId::parse(MetricType::LongAvg, "web-01/api/latency-ms")?;
//! handle.ingest(Trace::long(latency, 42));
//! let report = handle.flush_now()?;
//! println!("flushed {} intervals", report.intervals);
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod accumulator;
pub mod cli;
pub mod core;
pub mod generator;
pub mod interval;
pub mod monitoring;

// Re-export core types for convenience
pub use crate::accumulator::{EngineHandle, IntervalConsumer};
pub use crate::core::{Config, Result};
pub use crate::interval::ClosedInterval;
