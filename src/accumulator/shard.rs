//! Shard worker: one bounded inbound queue, one private aggregate map,
//! one dedicated thread.

use super::context::{FlushContext, FlushRound, SubmitOutcome};
use crate::core::{MetricId, Result, Trace};
use crate::interval::{create_aggregate, IntervalAggregate};
use crate::monitoring::ShardStats;
use ahash::AHashMap;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Signals sent to a shard loop alongside its data queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Re-check the flush flag
    Wake,
    /// Stop waiting for wakes; the loop drains until the inbound side closes
    Shutdown,
}

/// Counters published by the shard loop.
#[derive(Debug, Default)]
struct ShardCounters {
    flushes: AtomicU64,
    last_flush_micros: AtomicU64,
    last_accepted: AtomicU64,
    last_dropped: AtomicU64,
    last_window_processed: AtomicU64,
    open_intervals: AtomicU64,
    inbound_drops: AtomicU64,
    outbound_drops: AtomicU64,
    failed_applies: AtomicU64,
    barrier_timeouts: AtomicU64,
}

/// Handle to one shard.
///
/// Producers call [`accumulate`](ShardWorker::accumulate), which never
/// blocks. Everything else happens on the shard's own thread once
/// [`spawn`](ShardWorker::spawn) has been called.
///
/// The inbound sender is cleared on shutdown. The shard thread drains
/// until every in-flight producer has released it, so a trace accepted
/// by `accumulate` is always applied before the final flush.
pub struct ShardWorker {
    index: usize,
    context: Arc<FlushContext>,
    inbound: ArcSwapOption<Sender<Trace>>,
    control: Sender<Control>,
    receivers: Mutex<Option<(Receiver<Trace>, Receiver<Control>)>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<ShardCounters>,
}

impl ShardWorker {
    pub fn new(index: usize, context: Arc<FlushContext>) -> Self {
        let shard = context.shard_config();
        let (inbound, inbound_rx) = crossbeam_channel::bounded(shard.inbound_queue_size);
        let (control, control_rx) = crossbeam_channel::bounded(1);
        if shard.inbound_queue_fair {
            debug!(shard = index, "Inbound queue fairness requested; queue is FIFO");
        }

        Self {
            index,
            context,
            inbound: ArcSwapOption::from_pointee(inbound),
            control,
            receivers: Mutex::new(Some((inbound_rx, control_rx))),
            thread: Mutex::new(None),
            counters: Arc::new(ShardCounters::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Start the shard thread. Calling it again is a no-op.
    pub fn spawn(&self) -> Result<()> {
        let Some((inbound, control)) = self.receivers.lock().take() else {
            return Ok(());
        };

        let capacity = self.context.shard_config().map_capacity();
        let shard_loop = ShardLoop {
            index: self.index,
            context: Arc::clone(&self.context),
            inbound,
            control,
            counters: Arc::clone(&self.counters),
            aggregates: AHashMap::with_capacity(capacity),
            last_epoch: self.context.epoch(),
            window_processed: 0,
            window_start: Utc::now(),
        };

        let handle = thread::Builder::new()
            .name(format!("accumulator-shard-{}", self.index))
            .spawn(move || shard_loop.run())?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Offer a trace without blocking. Returns false and counts a drop
    /// when the inbound queue is full or the shard is shutting down.
    pub fn accumulate(&self, trace: Trace) -> bool {
        let guard = self.inbound.load();
        let sent = match guard.as_ref() {
            Some(inbound) => match inbound.try_send(trace) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        };
        if !sent {
            self.counters.inbound_drops.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Ask the shard to check the flush flag. Wakes coalesce.
    pub fn wake(&self) {
        let _ = self.control.try_send(Control::Wake);
    }

    /// Close the inbound side, then ask the shard to drain, flush locally
    /// and exit.
    pub fn shutdown(&self) {
        self.inbound.store(None);
        if self.thread.lock().is_some() {
            // Errors mean the loop already exited
            let _ = self.control.send(Control::Shutdown);
        }
    }

    /// True once the shard thread has exited, or if it never started
    pub fn is_finished(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Wait for the shard thread to exit
    pub fn join(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.join().is_err() {
            error!(shard = self.index, "Shard worker panicked");
        }
    }

    /// Traces waiting in the inbound queue
    pub fn queued(&self) -> usize {
        self.inbound
            .load()
            .as_ref()
            .map_or(0, |inbound| inbound.len())
    }

    pub fn stats(&self) -> ShardStats {
        let c = &self.counters;
        ShardStats {
            index: self.index,
            flush_count: c.flushes.load(Ordering::Relaxed),
            last_flush_micros: c.last_flush_micros.load(Ordering::Relaxed),
            last_flush_accepted: c.last_accepted.load(Ordering::Relaxed),
            last_flush_dropped: c.last_dropped.load(Ordering::Relaxed),
            last_window_processed: c.last_window_processed.load(Ordering::Relaxed),
            open_intervals: c.open_intervals.load(Ordering::Relaxed),
            inbound_drops: c.inbound_drops.load(Ordering::Relaxed),
            outbound_drops: c.outbound_drops.load(Ordering::Relaxed),
            failed_applies: c.failed_applies.load(Ordering::Relaxed),
            barrier_timeouts: c.barrier_timeouts.load(Ordering::Relaxed),
            queued: self.queued(),
        }
    }
}

impl std::fmt::Debug for ShardWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWorker")
            .field("index", &self.index)
            .field("queued", &self.queued())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// State owned by the shard thread.
struct ShardLoop {
    index: usize,
    context: Arc<FlushContext>,
    inbound: Receiver<Trace>,
    control: Receiver<Control>,
    counters: Arc<ShardCounters>,
    aggregates: AHashMap<MetricId, Box<dyn IntervalAggregate>>,
    last_epoch: u64,
    window_processed: u64,
    window_start: DateTime<Utc>,
}

impl ShardLoop {
    fn run(mut self) {
        debug!(shard = self.index, "Shard worker started");
        let inbound = self.inbound.clone();
        let control = self.control.clone();

        loop {
            select! {
                recv(inbound) -> msg => match msg {
                    Ok(trace) => self.apply(trace),
                    Err(_) => break,
                },
                recv(control) -> msg => match msg {
                    Ok(Control::Wake) => {}
                    Ok(Control::Shutdown) | Err(_) => break,
                },
            }
            self.check_flush();
        }

        // Blocks until the last producer holding the sender lets go
        for trace in inbound.iter() {
            self.apply(trace);
        }
        let outcome = self.seal_window();
        debug!(
            shard = self.index,
            accepted = outcome.accepted,
            dropped = outcome.dropped,
            "Shard worker stopped after final flush"
        );
    }

    fn apply(&mut self, trace: Trace) {
        let start = self.window_start;
        let aggregate = self
            .aggregates
            .entry(trace.metric_id().clone())
            .or_insert_with(|| create_aggregate(trace.metric_id(), start));

        match aggregate.apply(&trace) {
            Ok(()) => self.window_processed += 1,
            Err(e) => {
                self.counters.failed_applies.fetch_add(1, Ordering::Relaxed);
                warn!(shard = self.index, error = %e, "Skipping trace that failed to apply");
            }
        }
    }

    fn check_flush(&mut self) {
        let Some(round) = self.context.pending_round(self.last_epoch) else {
            return;
        };

        // Traces queued before the request belong to the closing window
        let queued = self.inbound.len();
        for _ in 0..queued {
            match self.inbound.try_recv() {
                Ok(trace) => self.apply(trace),
                Err(_) => break,
            }
        }

        self.flush(&round);
    }

    fn flush(&mut self, round: &FlushRound) {
        let started = Instant::now();
        let outcome = self.seal_window();
        self.counters
            .last_flush_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.last_epoch = round.epoch;

        trace!(
            shard = self.index,
            epoch = round.epoch,
            accepted = outcome.accepted,
            dropped = outcome.dropped,
            "Shard flushed"
        );
        if !outcome.is_complete() {
            warn!(
                shard = self.index,
                epoch = round.epoch,
                dropped = outcome.dropped,
                "Outbound queue full, dropped interval snapshots"
            );
        }

        if !self.context.flush_complete(round) {
            self.counters.barrier_timeouts.fetch_add(1, Ordering::Relaxed);
            debug!(
                shard = self.index,
                epoch = round.epoch,
                remaining = round.latch.remaining(),
                "Barrier timed out, continuing"
            );
        }
    }

    /// Close, snapshot and reset every aggregate, then submit the snapshots.
    fn seal_window(&mut self) -> SubmitOutcome {
        let now = Utc::now();
        let mut batch = Vec::with_capacity(self.aggregates.len());
        for aggregate in self.aggregates.values_mut() {
            aggregate.close(now);
            batch.push(aggregate.snapshot());
            aggregate.reset(now);
        }
        self.window_start = now;

        let outcome = self.context.submit(&mut batch);

        let c = &self.counters;
        c.flushes.fetch_add(1, Ordering::Relaxed);
        c.last_accepted.store(outcome.accepted as u64, Ordering::Relaxed);
        c.last_dropped.store(outcome.dropped as u64, Ordering::Relaxed);
        c.outbound_drops
            .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        c.last_window_processed
            .store(self.window_processed, Ordering::Relaxed);
        c.open_intervals
            .store(self.aggregates.len() as u64, Ordering::Relaxed);
        self.window_processed = 0;

        outcome
    }
}
