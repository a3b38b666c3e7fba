//! Read-only operational view of the accumulator.
//!
//! Every counter here is maintained by the engine whether or not anything
//! reads it. [`StatsReporter`] periodically logs a summary for the binary.

use crate::accumulator::{EngineHandle, EngineState};
use crate::core::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineHealth {
    /// No drops, no missed barriers.
    Healthy,
    /// Data was dropped or a shard missed a barrier.
    Degraded,
    /// Flush cycles are failing or most cycles are partial.
    Unhealthy,
    /// Engine is not running.
    Stopped,
}

impl EngineHealth {
    /// Get color representation for display.
    pub fn color(&self) -> &'static str {
        match self {
            EngineHealth::Healthy => "green",
            EngineHealth::Degraded => "yellow",
            EngineHealth::Unhealthy => "red",
            EngineHealth::Stopped => "gray",
        }
    }

    /// Get severity score (0-100).
    pub fn severity(&self) -> u8 {
        match self {
            EngineHealth::Healthy => 0,
            EngineHealth::Degraded => 25,
            EngineHealth::Unhealthy => 75,
            EngineHealth::Stopped => 100,
        }
    }
}

/// Counters of one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub index: usize,
    /// Flushes performed, including the final one on shutdown
    pub flush_count: u64,
    pub last_flush_micros: u64,
    /// Snapshots accepted by the outbound queue in the last flush
    pub last_flush_accepted: u64,
    /// Snapshots dropped in the last flush
    pub last_flush_dropped: u64,
    /// Traces applied in the last closed window
    pub last_window_processed: u64,
    pub open_intervals: u64,
    pub inbound_drops: u64,
    pub outbound_drops: u64,
    pub failed_applies: u64,
    pub barrier_timeouts: u64,
    /// Traces waiting in the inbound queue
    pub queued: usize,
}

impl ShardStats {
    pub fn last_flush_duration(&self) -> Duration {
        Duration::from_micros(self.last_flush_micros)
    }
}

/// Counters of one engine generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub generation: u64,
    pub state: EngineState,
    pub shard_count: usize,
    /// Traces rejected at ingest, across generations of the same handle
    pub ingest_drops: u64,
    pub inbound_drops: u64,
    pub outbound_drops: u64,
    pub failed_applies: u64,
    pub flush_cycles: u64,
    /// Cycles where at least one shard missed the barrier
    pub partial_cycles: u64,
    /// Cycles that panicked
    pub failed_cycles: u64,
    pub batches_delivered: u64,
    pub intervals_delivered: u64,
    pub consumers: usize,
    pub consumer_panics: u64,
    pub shards: Vec<ShardStats>,
}

impl EngineStats {
    /// Traces and snapshots lost at any drop point
    pub fn total_drops(&self) -> u64 {
        self.ingest_drops + self.inbound_drops + self.outbound_drops
    }

    pub fn health(&self) -> EngineHealth {
        if !self.state.is_accepting() {
            return EngineHealth::Stopped;
        }
        if self.failed_cycles > 0 || self.partial_cycles * 2 > self.flush_cycles {
            return EngineHealth::Unhealthy;
        }
        if self.total_drops() > 0
            || self.partial_cycles > 0
            || self.failed_applies > 0
            || self.consumer_panics > 0
        {
            return EngineHealth::Degraded;
        }
        EngineHealth::Healthy
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Periodically logs engine stats.
#[derive(Debug)]
pub struct StatsReporter {
    handle: Arc<EngineHandle>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
}

impl StatsReporter {
    pub fn new(handle: Arc<EngineHandle>, period: Duration) -> Self {
        Self {
            handle,
            period,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start reporting on the tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let handle = Arc::clone(&self.handle);
        let shutdown = Arc::clone(&self.shutdown);
        let period = self.period;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Some(stats) = handle.stats() {
                    report(&stats);
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn report(stats: &EngineStats) {
    let health = stats.health();
    let open: u64 = stats.shards.iter().map(|s| s.open_intervals).sum();
    if health.severity() >= EngineHealth::Unhealthy.severity() && health != EngineHealth::Stopped {
        warn!(
            generation = stats.generation,
            health = ?health,
            partial_cycles = stats.partial_cycles,
            failed_cycles = stats.failed_cycles,
            "Accumulator engine unhealthy"
        );
    }
    info!(
        generation = stats.generation,
        state = %stats.state,
        health = ?health,
        cycles = stats.flush_cycles,
        intervals = stats.intervals_delivered,
        open_intervals = open,
        drops = stats.total_drops(),
        consumers = stats.consumers,
        "Accumulator stats"
    );
    match stats.to_json() {
        Ok(json) => debug!(stats = %json, "Accumulator stats detail"),
        Err(e) => warn!(error = %e, "Failed to encode accumulator stats"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> EngineStats {
        EngineStats {
            generation: 1,
            state: EngineState::Running,
            shard_count: 2,
            ingest_drops: 0,
            inbound_drops: 0,
            outbound_drops: 0,
            failed_applies: 0,
            flush_cycles: 10,
            partial_cycles: 0,
            failed_cycles: 0,
            batches_delivered: 10,
            intervals_delivered: 100,
            consumers: 1,
            consumer_panics: 0,
            shards: vec![ShardStats::default(), ShardStats::default()],
        }
    }

    #[test]
    fn test_health_classification() {
        assert_eq!(stats().health(), EngineHealth::Healthy);

        let mut degraded = stats();
        degraded.inbound_drops = 3;
        assert_eq!(degraded.total_drops(), 3);
        assert_eq!(degraded.health(), EngineHealth::Degraded);

        let mut unhealthy = stats();
        unhealthy.partial_cycles = 6;
        assert_eq!(unhealthy.health(), EngineHealth::Unhealthy);

        let mut stopped = stats();
        stopped.state = EngineState::Stopped;
        assert_eq!(stopped.health(), EngineHealth::Stopped);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(EngineHealth::Healthy.severity() < EngineHealth::Degraded.severity());
        assert!(EngineHealth::Degraded.severity() < EngineHealth::Unhealthy.severity());
        assert_eq!(EngineHealth::Healthy.color(), "green");
    }

    #[test]
    fn test_stats_serialize() {
        let json: serde_json::Value = serde_json::from_str(&stats().to_json().unwrap()).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["shards"].as_array().unwrap().len(), 2);
    }
}
