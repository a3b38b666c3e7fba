//! Engine generation: shard pool, flush context and the flush driver.
//!
//! One [`Engine`] is one generation. It is configured once, started once and
//! shut down once; reconfiguration builds a new generation (see
//! [`EngineHandle`](super::EngineHandle)).

use super::consumer::ConsumerRegistry;
use super::context::FlushContext;
use super::shard::ShardWorker;
use crate::core::{AccumulatorError, Config, Result, Trace};
use crate::monitoring::EngineStats;
use crossbeam_channel::{select, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of one engine generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Unstarted,
    Running,
    Flushing,
    Stopping,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Unstarted,
            1 => EngineState::Running,
            2 => EngineState::Flushing,
            3 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineState::Unstarted => 0,
            EngineState::Running => 1,
            EngineState::Flushing => 2,
            EngineState::Stopping => 3,
            EngineState::Stopped => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Unstarted => "unstarted",
            EngineState::Running => "running",
            EngineState::Flushing => "flushing",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }

    /// Returns true while the engine accepts traces
    pub fn is_accepting(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Flushing)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingestion drops counted above the shards. Shared by every generation
/// built from the same handle.
#[derive(Debug, Default)]
pub struct DropCounters {
    ingest: AtomicU64,
}

impl DropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingest_drop(&self) {
        self.ingest.fetch_add(1, Ordering::Relaxed);
    }

    /// Traces rejected by `ingest`
    pub fn ingest_drops(&self) -> u64 {
        self.ingest.load(Ordering::Relaxed)
    }
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlushReport {
    pub epoch: u64,
    /// Shards that reported before the barrier timed out
    pub responded: usize,
    /// Shards that did not report in time
    pub unresponsive: usize,
    pub batches: usize,
    pub intervals: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl FlushReport {
    /// Returns true if some shard missed the barrier
    pub fn is_partial(&self) -> bool {
        self.unresponsive > 0
    }
}

#[derive(Debug, Default)]
struct CycleCounters {
    cycles: AtomicU64,
    partial: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    intervals: AtomicU64,
}

struct Scheduler {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// One engine generation.
pub struct Engine {
    generation: u64,
    config: Config,
    context: Arc<FlushContext>,
    shards: Vec<ShardWorker>,
    registry: Arc<ConsumerRegistry>,
    drops: Arc<DropCounters>,
    state: AtomicU8,
    cycle_lock: Mutex<()>,
    scheduler: Mutex<Option<Scheduler>>,
    counters: CycleCounters,
}

impl Engine {
    /// Build an unstarted engine. Fails if the configuration is invalid.
    pub fn new(
        config: Config,
        registry: Arc<ConsumerRegistry>,
        drops: Arc<DropCounters>,
    ) -> Result<Self> {
        config.validate()?;

        if config.engine.outbound_queue_fair {
            debug!("Outbound queue fairness requested; queue is FIFO");
        }

        let context = Arc::new(FlushContext::new(config.engine.clone(), config.shard.clone()));
        let shards = (0..config.engine.shard_count)
            .map(|index| ShardWorker::new(index, Arc::clone(&context)))
            .collect();

        Ok(Self {
            generation: 1,
            config,
            context,
            shards,
            registry,
            drops,
            state: AtomicU8::new(EngineState::Unstarted.as_u8()),
            cycle_lock: Mutex::new(()),
            scheduler: Mutex::new(None),
            counters: CycleCounters::default(),
        })
    }

    /// Tag the engine with its generation number
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Spawn the shard workers and the flush scheduler.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.transition(EngineState::Unstarted, EngineState::Running) {
            return Err(AccumulatorError::AlreadyStarted);
        }

        if let Err(e) = self.spawn_threads() {
            error!(generation = self.generation, error = %e, "Failed to start engine");
            self.shutdown();
            return Err(e);
        }

        info!(
            generation = self.generation,
            shards = self.shards.len(),
            flush_period = ?self.config.engine.flush_period,
            "Accumulator engine started"
        );
        Ok(())
    }

    fn spawn_threads(self: &Arc<Self>) -> Result<()> {
        for shard in &self.shards {
            shard.spawn()?;
        }

        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let ticker = crossbeam_channel::tick(self.config.engine.flush_period);
        let engine: Weak<Self> = Arc::downgrade(self);
        let generation = self.generation;

        let thread = thread::Builder::new()
            .name("accumulator-flush".to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => match engine.upgrade() {
                            Some(engine) => engine.scheduled_cycle(),
                            None => break,
                        },
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!(generation, "Flush scheduler stopped");
            })?;

        *self.scheduler.lock() = Some(Scheduler { stop, thread });
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Route a trace to its shard without blocking.
    ///
    /// Returns false, and counts a drop, when the engine is not accepting
    /// traces or the shard's queue is full.
    pub fn ingest(&self, trace: Trace) -> bool {
        if self.state().is_accepting() {
            let index = trace.metric_id().shard_index(self.shards.len());
            if self.shards[index].accumulate(trace) {
                return true;
            }
        }
        self.drops.record_ingest_drop();
        false
    }

    /// Run one flush cycle now, serialized with scheduled cycles.
    pub fn flush_now(&self) -> Result<FlushReport> {
        let _cycle = self.cycle_lock.lock();
        if self.state() != EngineState::Running {
            return Err(AccumulatorError::NotRunning);
        }
        Ok(self.run_cycle())
    }

    fn scheduled_cycle(&self) {
        let _cycle = self.cycle_lock.lock();
        if self.state() != EngineState::Running {
            return;
        }

        match catch_unwind(AssertUnwindSafe(|| self.run_cycle())) {
            Ok(report) => debug!(
                generation = self.generation,
                epoch = report.epoch,
                intervals = report.intervals,
                batches = report.batches,
                elapsed = ?report.elapsed,
                "Scheduled flush complete"
            ),
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.context.end_round();
                self.transition(EngineState::Flushing, EngineState::Running);
                error!(generation = self.generation, "Flush cycle panicked, schedule continues");
            }
        }
    }

    fn run_cycle(&self) -> FlushReport {
        let started = Instant::now();
        self.transition(EngineState::Running, EngineState::Flushing);

        let round = self.context.begin_round(self.shards.len());
        for shard in &self.shards {
            shard.wake();
        }

        let resolved = round.latch.wait_timeout(self.context.barrier_timeout());
        let unresponsive = round.latch.remaining();
        self.context.end_round();
        self.transition(EngineState::Flushing, EngineState::Running);

        if !resolved {
            self.counters.partial.fetch_add(1, Ordering::Relaxed);
            warn!(
                generation = self.generation,
                epoch = round.epoch,
                unresponsive,
                "Barrier timed out, draining a partial cycle"
            );
        }

        let (batches, intervals) = self.drain_outbound();
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);

        FlushReport {
            epoch: round.epoch,
            responded: self.shards.len() - unresponsive,
            unresponsive,
            batches,
            intervals,
            elapsed: started.elapsed(),
        }
    }

    /// Drain the outbound queue in batches and fan each batch out.
    fn drain_outbound(&self) -> (usize, usize) {
        let batch_size = self.config.engine.flush_batch_size;
        let mut batches = 0;
        let mut intervals = 0;

        loop {
            let batch = self.context.drain_batch(batch_size);
            if batch.is_empty() {
                break;
            }
            batches += 1;
            intervals += batch.len();
            self.registry.dispatch(&batch);
        }

        self.counters.batches.fetch_add(batches as u64, Ordering::Relaxed);
        self.counters
            .intervals
            .fetch_add(intervals as u64, Ordering::Relaxed);
        (batches, intervals)
    }

    /// Stop the scheduler, let every shard drain and flush locally, deliver
    /// what they produced and join all threads.
    pub fn shutdown(&self) {
        {
            let _cycle = self.cycle_lock.lock();
            match self.state() {
                EngineState::Stopping | EngineState::Stopped => return,
                EngineState::Unstarted => {
                    self.set_state(EngineState::Stopped);
                    return;
                }
                EngineState::Running | EngineState::Flushing => {
                    self.set_state(EngineState::Stopping)
                }
            }
        }

        if let Some(scheduler) = self.scheduler.lock().take() {
            let _ = scheduler.stop.send(());
            if scheduler.thread.join().is_err() {
                error!(generation = self.generation, "Flush scheduler panicked");
            }
        }

        for shard in &self.shards {
            shard.shutdown();
        }

        // Keep room in the outbound queue while shards do their final flush
        while !self.shards.iter().all(ShardWorker::is_finished) {
            let (batches, _) = self.drain_outbound();
            if batches == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        for shard in &self.shards {
            shard.join();
        }
        let (_, intervals) = self.drain_outbound();

        self.set_state(EngineState::Stopped);
        info!(
            generation = self.generation,
            final_intervals = intervals,
            dropped = self.context.dropped(),
            "Accumulator engine stopped"
        );
    }

    /// Snapshot of every counter this generation holds
    pub fn stats(&self) -> EngineStats {
        let shards: Vec<_> = self.shards.iter().map(ShardWorker::stats).collect();
        EngineStats {
            generation: self.generation,
            state: self.state(),
            shard_count: self.shards.len(),
            ingest_drops: self.drops.ingest_drops(),
            inbound_drops: shards.iter().map(|s| s.inbound_drops).sum(),
            outbound_drops: shards.iter().map(|s| s.outbound_drops).sum(),
            failed_applies: shards.iter().map(|s| s.failed_applies).sum(),
            flush_cycles: self.counters.cycles.load(Ordering::Relaxed),
            partial_cycles: self.counters.partial.load(Ordering::Relaxed),
            failed_cycles: self.counters.failed.load(Ordering::Relaxed),
            batches_delivered: self.counters.batches.load(Ordering::Relaxed),
            intervals_delivered: self.counters.intervals.load(Ordering::Relaxed),
            consumers: self.registry.len(),
            consumer_panics: self.registry.panics(),
            shards,
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("shards", &self.shards.len())
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{IntervalConsumer, NamespaceFilter};
    use crate::core::{ConfigBuilder, MetricId, MetricType};
    use crate::interval::{ClosedInterval, IntervalValue};

    #[derive(Default)]
    struct Sink {
        intervals: Mutex<Vec<ClosedInterval>>,
    }

    impl IntervalConsumer for Sink {
        fn id(&self) -> &str {
            "sink"
        }

        fn submit_intervals(&self, intervals: &[ClosedInterval]) {
            self.intervals.lock().extend_from_slice(intervals);
        }
    }

    fn engine(config: Config) -> (Arc<Engine>, Arc<Sink>, Arc<DropCounters>) {
        let registry = Arc::new(ConsumerRegistry::new());
        let sink = Arc::new(Sink::default());
        registry
            .register(Arc::clone(&sink) as Arc<dyn IntervalConsumer>, NamespaceFilter::All)
            .unwrap();
        let drops = Arc::new(DropCounters::new());
        let engine = Arc::new(Engine::new(config, registry, Arc::clone(&drops)).unwrap());
        (engine, sink, drops)
    }

    fn config(shards: usize) -> Config {
        ConfigBuilder::new()
            .shard_count(shards)
            .flush_period(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(1);
        bad.engine.flush_batch_size = 0;
        let result = Engine::new(bad, Arc::new(ConsumerRegistry::new()), Arc::new(DropCounters::new()));
        assert!(matches!(result, Err(AccumulatorError::Config(_))));
    }

    #[test]
    fn test_lifecycle() {
        let (engine, _sink, _drops) = engine(config(2));
        assert_eq!(engine.state(), EngineState::Unstarted);
        assert!(matches!(engine.flush_now(), Err(AccumulatorError::NotRunning)));

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(matches!(engine.start(), Err(AccumulatorError::AlreadyStarted)));

        engine.shutdown();
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.shutdown();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_ingest_before_start_is_dropped() {
        let (engine, _sink, drops) = engine(config(1));
        let id = MetricId::parse(MetricType::LongAvg, "app/x").unwrap();
        assert!(!engine.ingest(Trace::long(id, 1)));
        assert_eq!(drops.ingest_drops(), 1);
        assert_eq!(engine.stats().ingest_drops, 1);
    }

    #[test]
    fn test_flush_now_delivers_aggregate() {
        let (engine, sink, _drops) = engine(config(2));
        engine.start().unwrap();
        let id = MetricId::parse(MetricType::LongAvg, "app/latency").unwrap();

        for v in 1..=100 {
            assert!(engine.ingest(Trace::long(id.clone(), v)));
        }
        let report = engine.flush_now().unwrap();

        assert_eq!(report.epoch, 1);
        assert_eq!(report.responded, 2);
        assert!(!report.is_partial());
        assert_eq!(report.intervals, 1);
        assert_eq!(report.batches, 1);

        let delivered = sink.intervals.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].count, 100);
        assert_eq!(
            delivered[0].value,
            IntervalValue::Numeric {
                min: 1,
                max: 100,
                avg: 50.5,
                total: 5050.0
            }
        );

        engine.shutdown();
    }

    #[test]
    fn test_barrier_wait_is_bounded() {
        // One slot in the outbound queue and a long per-item wait keep the
        // shard blocked in submit well past the driver's barrier timeout
        let config = ConfigBuilder::new()
            .shard_count(1)
            .outbound_queue_size(1)
            .outbound_insert_timeout(Duration::from_millis(500))
            .outbound_submit_timeout(Duration::from_millis(500))
            .engine_barrier_timeout(Duration::from_millis(50))
            .flush_period(Duration::from_secs(3600))
            .build()
            .unwrap();
        let (engine, _sink, _drops) = engine(config);
        engine.start().unwrap();

        for name in ["app/a", "app/b"] {
            let id = MetricId::parse(MetricType::IntervalIncident, name).unwrap();
            assert!(engine.ingest(Trace::incident(id, 1)));
        }

        let started = Instant::now();
        let report = engine.flush_now().unwrap();
        assert!(report.is_partial());
        assert_eq!(report.unresponsive, 1);
        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(engine.stats().partial_cycles, 1);

        engine.shutdown();
    }

    /// Records when each batch arrives
    #[derive(Default)]
    struct StampedSink {
        arrivals: Mutex<Vec<(Instant, usize)>>,
    }

    impl IntervalConsumer for StampedSink {
        fn id(&self) -> &str {
            "stamped"
        }

        fn submit_intervals(&self, intervals: &[ClosedInterval]) {
            self.arrivals.lock().push((Instant::now(), intervals.len()));
        }
    }

    #[test]
    fn test_drain_waits_for_delayed_shard() {
        // Shard 0 blocks in submit behind a one-slot outbound queue while
        // shard 1 reports straight away
        let barrier = Duration::from_millis(100);
        let config = ConfigBuilder::new()
            .shard_count(2)
            .outbound_queue_size(1)
            .outbound_insert_timeout(Duration::from_millis(500))
            .outbound_submit_timeout(Duration::from_millis(500))
            .engine_barrier_timeout(barrier)
            .flush_period(Duration::from_secs(3600))
            .build()
            .unwrap();
        let registry = Arc::new(ConsumerRegistry::new());
        let sink = Arc::new(StampedSink::default());
        registry
            .register(Arc::clone(&sink) as Arc<dyn IntervalConsumer>, NamespaceFilter::All)
            .unwrap();
        let engine = Arc::new(Engine::new(config, registry, Arc::new(DropCounters::new())).unwrap());
        engine.start().unwrap();

        let delayed: Vec<MetricId> = (0..)
            .map(|i| MetricId::parse(MetricType::IntervalIncident, &format!("app/m{}", i)).unwrap())
            .filter(|id| id.shard_index(2) == 0)
            .take(2)
            .collect();
        for id in delayed {
            assert!(engine.ingest(Trace::incident(id, 1)));
        }

        let started = Instant::now();
        let report = engine.flush_now().unwrap();

        assert!(report.elapsed >= barrier);
        assert!(started.elapsed() >= barrier);
        assert_eq!(report.responded, 1);
        assert_eq!(report.unresponsive, 1);
        assert!(report.intervals >= 1);

        let arrivals = sink.arrivals.lock().clone();
        assert!(!arrivals.is_empty());
        // Nothing reached the consumer before the barrier gave up
        assert!(arrivals.iter().all(|(at, _)| *at >= started + barrier));

        engine.shutdown();
    }

    #[test]
    fn test_shutdown_delivers_open_windows() {
        let (engine, sink, drops) = engine(config(2));
        engine.start().unwrap();
        let id = MetricId::parse(MetricType::IntervalIncident, "app/errors").unwrap();
        for _ in 0..10 {
            engine.ingest(Trace::incident(id.clone(), 1));
        }

        engine.shutdown();

        let delivered = sink.intervals.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].value, IntervalValue::Incident { total: 10 });
        assert!(!engine.ingest(Trace::incident(id, 1)));
        assert_eq!(drops.ingest_drops(), 1);
    }

    #[test]
    fn test_scheduled_flush_fires() {
        let config = ConfigBuilder::new()
            .shard_count(1)
            .flush_period(Duration::from_millis(25))
            .build()
            .unwrap();
        let (engine, sink, _drops) = engine(config);
        engine.start().unwrap();
        let id = MetricId::parse(MetricType::IntervalIncident, "app/ticks").unwrap();
        engine.ingest(Trace::incident(id, 3));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.intervals.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!sink.intervals.lock().is_empty());
        assert!(engine.stats().flush_cycles >= 1);

        engine.shutdown();
    }
}
