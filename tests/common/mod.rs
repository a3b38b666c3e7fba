//! Common test utilities and fixtures.

#![allow(dead_code)]

use interval_accumulator::accumulator::{EngineHandle, IntervalConsumer, NamespaceFilter};
use interval_accumulator::core::{Config, ConfigBuilder, MetricId, MetricType};
use interval_accumulator::interval::ClosedInterval;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Consumer that keeps every interval it receives.
pub struct CollectingConsumer {
    id: String,
    batches: Mutex<Vec<Vec<ClosedInterval>>>,
    delay: Duration,
}

impl CollectingConsumer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            batches: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        })
    }

    /// A consumer that sleeps for `delay` on every batch
    pub fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            batches: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn intervals(&self) -> Vec<ClosedInterval> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }

    /// Intervals received for one metric
    pub fn for_metric(&self, metric_id: &MetricId) -> Vec<ClosedInterval> {
        self.intervals()
            .into_iter()
            .filter(|i| &i.metric_id == metric_id)
            .collect()
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

impl IntervalConsumer for CollectingConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn submit_intervals(&self, intervals: &[ClosedInterval]) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.batches.lock().push(intervals.to_vec());
    }
}

/// Config with a flush period long enough that only explicit flushes run.
pub fn manual_flush_config(shards: usize) -> ConfigBuilder {
    ConfigBuilder::new()
        .shard_count(shards)
        .flush_period(Duration::from_secs(3600))
}

/// Handle with a collecting consumer registered for every namespace.
pub fn handle_with_collector(config: Config) -> (EngineHandle, Arc<CollectingConsumer>) {
    let handle = EngineHandle::new(config);
    let collector = CollectingConsumer::new("collector");
    handle
        .register_consumer(
            Arc::clone(&collector) as Arc<dyn IntervalConsumer>,
            NamespaceFilter::All,
        )
        .unwrap();
    (handle, collector)
}

/// `count` distinct metric ids that route to `shard` out of `shards`.
pub fn metrics_on_shard(
    metric_type: MetricType,
    shard: usize,
    shards: usize,
    count: usize,
) -> Vec<MetricId> {
    (0..)
        .map(|i| MetricId::parse(metric_type, &format!("test/shard/m{}", i)).unwrap())
        .filter(|id| id.shard_index(shards) == shard)
        .take(count)
        .collect()
}
