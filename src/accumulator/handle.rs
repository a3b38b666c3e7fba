//! Owner of the current engine generation.

use super::consumer::{ConsumerRegistry, ConsumerSlot, IntervalConsumer, NamespaceFilter};
use super::manager::{DropCounters, Engine, FlushReport};
use crate::core::{AccumulatorError, Config, EngineConfig, Result, ShardConfig, Trace};
use crate::monitoring::EngineStats;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, trace};

/// Entry point for producers, consumers and operators.
///
/// The handle owns at most one running [`Engine`]. The first call that needs
/// it creates and starts it; [`reconfigure`](EngineHandle::reconfigure)
/// replaces it with a new generation. Consumer registrations and ingest drop
/// counters belong to the handle and survive every replacement.
pub struct EngineHandle {
    config: Mutex<Config>,
    current: ArcSwapOption<Engine>,
    init_lock: Mutex<()>,
    registry: Arc<ConsumerRegistry>,
    drops: Arc<DropCounters>,
    generations: AtomicU64,
    closed: AtomicBool,
}

impl EngineHandle {
    pub fn new(config: Config) -> Self {
        Self {
            config: Mutex::new(config),
            current: ArcSwapOption::empty(),
            init_lock: Mutex::new(()),
            registry: Arc::new(ConsumerRegistry::new()),
            drops: Arc::new(DropCounters::new()),
            generations: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The running engine, created and started on first access.
    pub fn engine(&self) -> Result<Arc<Engine>> {
        if let Some(engine) = self.current.load_full() {
            return Ok(engine);
        }

        let _init = self.init_lock.lock();
        if let Some(engine) = self.current.load_full() {
            return Ok(engine);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(AccumulatorError::NotRunning);
        }

        let config = self.config.lock().clone();
        let engine = self.launch(config)?;
        self.current.store(Some(Arc::clone(&engine)));
        Ok(engine)
    }

    /// The running engine, if one has been created
    pub fn current(&self) -> Option<Arc<Engine>> {
        self.current.load_full()
    }

    /// Start a new generation with the given settings, swap it in and
    /// drain the previous one.
    ///
    /// On error the current generation stays in place.
    pub fn reconfigure(&self, engine: EngineConfig, shard: ShardConfig) -> Result<Arc<Engine>> {
        let _init = self.init_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(AccumulatorError::NotRunning);
        }

        let mut config = self.config.lock().clone();
        config.engine = engine;
        config.shard = shard;

        let next = self.launch(config.clone())?;
        *self.config.lock() = config;

        if let Some(previous) = self.current.swap(Some(Arc::clone(&next))) {
            info!(
                previous = previous.generation(),
                next = next.generation(),
                shards = next.shard_count(),
                "Replacing accumulator engine"
            );
            previous.shutdown();
        }
        Ok(next)
    }

    fn launch(&self, config: Config) -> Result<Arc<Engine>> {
        let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let engine = Arc::new(
            Engine::new(config, Arc::clone(&self.registry), Arc::clone(&self.drops))?
                .with_generation(generation),
        );
        engine.start()?;
        Ok(engine)
    }

    /// Hand a trace to the current engine. Never blocks.
    pub fn ingest(&self, trace: Trace) -> bool {
        match self.engine() {
            Ok(engine) => engine.ingest(trace),
            Err(e) => {
                self.drops.record_ingest_drop();
                trace!(error = %e, "Engine unavailable, trace dropped");
                false
            }
        }
    }

    pub fn register_consumer(
        &self,
        consumer: Arc<dyn IntervalConsumer>,
        filter: NamespaceFilter,
    ) -> Result<ConsumerSlot> {
        self.registry.register(consumer, filter)
    }

    pub fn unregister_consumer(&self, id: &str) -> bool {
        self.registry.unregister(id)
    }

    /// Run a flush cycle on the current engine now
    pub fn flush_now(&self) -> Result<FlushReport> {
        self.engine()?.flush_now()
    }

    /// Drain and join the current engine. The handle refuses to start
    /// another one afterwards.
    pub fn shutdown(&self) {
        let _init = self.init_lock.lock();
        self.closed.store(true, Ordering::Release);
        if let Some(engine) = self.current.swap(None) {
            engine.shutdown();
        }
    }

    pub fn stats(&self) -> Option<EngineStats> {
        self.current().map(|engine| engine.stats())
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Traces rejected across all generations
    pub fn ingest_drops(&self) -> u64 {
        self.drops.ingest_drops()
    }

    /// Configuration the next lazily created generation would use
    pub fn config(&self) -> Config {
        self.config.lock().clone()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(engine) = self.current.swap(None) {
            engine.shutdown();
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("current", &self.current())
            .field("registry", &self.registry)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
