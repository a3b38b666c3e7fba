//! Synchronization surface shared by every shard of one engine generation.

use super::latch::FlushLatch;
use crate::core::{EngineConfig, ShardConfig};
use crate::interval::ClosedInterval;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One flush cycle: its epoch number and the barrier shards report to.
#[derive(Debug)]
pub struct FlushRound {
    pub epoch: u64,
    pub latch: FlushLatch,
}

/// Result of handing a batch of snapshots to the outbound queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: usize,
    pub dropped: usize,
}

impl SubmitOutcome {
    /// Returns true if nothing was dropped
    pub fn is_complete(&self) -> bool {
        self.dropped == 0
    }
}

/// Flush flag, current round, outbound queue and the generation's
/// configuration.
///
/// The manager opens a round with [`begin_round`](FlushContext::begin_round),
/// shards pick it up with [`pending_round`](FlushContext::pending_round) and
/// report in with [`flush_complete`](FlushContext::flush_complete).
pub struct FlushContext {
    engine: EngineConfig,
    shard: ShardConfig,
    flush_requested: AtomicBool,
    round: ArcSwap<FlushRound>,
    epoch: AtomicU64,
    outbound_tx: Sender<ClosedInterval>,
    outbound_rx: Receiver<ClosedInterval>,
    dropped: AtomicU64,
}

impl FlushContext {
    pub fn new(engine: EngineConfig, shard: ShardConfig) -> Self {
        let (outbound_tx, outbound_rx) = crossbeam_channel::bounded(engine.outbound_queue_size);
        Self {
            engine,
            shard,
            flush_requested: AtomicBool::new(false),
            // Primed so the first cycle never waits on a stale barrier
            round: ArcSwap::from_pointee(FlushRound {
                epoch: 0,
                latch: FlushLatch::resolved(),
            }),
            epoch: AtomicU64::new(0),
            outbound_tx,
            outbound_rx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn shard_config(&self) -> &ShardConfig {
        &self.shard
    }

    /// Open a new round expecting `participants` shards and raise the flush flag.
    pub fn begin_round(&self, participants: usize) -> Arc<FlushRound> {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let round = Arc::new(FlushRound {
            epoch,
            latch: FlushLatch::new(participants),
        });
        self.round.store(Arc::clone(&round));
        self.flush_requested.store(true, Ordering::Release);
        round
    }

    /// Lower the flush flag
    pub fn end_round(&self) {
        self.flush_requested.store(false, Ordering::Release);
    }

    pub fn is_flush_requested(&self) -> bool {
        self.flush_requested.load(Ordering::Acquire)
    }

    /// The current round, if a flush is requested and the caller has not
    /// flushed for it yet.
    pub fn pending_round(&self, last_epoch: u64) -> Option<Arc<FlushRound>> {
        if !self.is_flush_requested() {
            return None;
        }
        let round = self.round.load_full();
        (round.epoch > last_epoch).then_some(round)
    }

    /// Push snapshots into the outbound queue.
    ///
    /// Each insert waits at most the shard's submit timeout and the whole
    /// call at most the engine's insert timeout. The first failed insert
    /// ends the submission: everything still in `batch` is dropped. `batch`
    /// is always empty on return.
    pub fn submit(&self, batch: &mut Vec<ClosedInterval>) -> SubmitOutcome {
        let total = batch.len();
        let deadline = Instant::now() + self.engine.outbound_insert_timeout;
        let mut accepted = 0;

        for interval in batch.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = self.shard.outbound_submit_timeout.min(remaining);
            if self.outbound_tx.send_timeout(interval, wait).is_err() {
                break;
            }
            accepted += 1;
        }

        let dropped = total - accepted;
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        SubmitOutcome { accepted, dropped }
    }

    /// Report this shard's flush and wait, bounded by the shard barrier
    /// timeout, for the rest. Returns true if the barrier resolved.
    pub fn flush_complete(&self, round: &FlushRound) -> bool {
        round.latch.count_down();
        round.latch.wait_timeout(self.shard.barrier_timeout)
    }

    /// Take up to `max` snapshots from the outbound queue
    pub fn drain_batch(&self, max: usize) -> Vec<ClosedInterval> {
        self.outbound_rx.try_iter().take(max).collect()
    }

    /// Snapshots waiting in the outbound queue
    pub fn outbound_len(&self) -> usize {
        self.outbound_rx.len()
    }

    /// Snapshots dropped by submissions over the generation's lifetime
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current epoch (0 before the first round)
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Timeout the flush driver applies to the barrier
    pub fn barrier_timeout(&self) -> Duration {
        self.engine.barrier_timeout
    }
}

impl std::fmt::Debug for FlushContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushContext")
            .field("epoch", &self.epoch())
            .field("flush_requested", &self.is_flush_requested())
            .field("outbound_len", &self.outbound_len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
