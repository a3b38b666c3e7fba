//! Sharded interval accumulation engine.
//!
//! Traces enter through [`EngineHandle::ingest`] and are routed by metric
//! identity to one of N [`ShardWorker`]s. Every flush period the engine
//! raises a flush round: each shard seals its open intervals, pushes the
//! snapshots to the shared outbound queue and reports to the round's
//! barrier. The engine then drains the queue in batches and hands each
//! batch to the registered [`IntervalConsumer`]s.
//!
//! Producers never block. Overload is absorbed by dropping and counting,
//! at the shard inbound queues and at the shared outbound queue.

pub mod consumer;
pub mod context;
pub mod handle;
pub mod latch;
pub mod manager;
pub mod shard;

pub use consumer::{ConsumerRegistry, ConsumerSlot, IntervalConsumer, NamespaceFilter};
pub use context::{FlushContext, FlushRound, SubmitOutcome};
pub use handle::EngineHandle;
pub use latch::FlushLatch;
pub use manager::{DropCounters, Engine, EngineState, FlushReport};
pub use shard::ShardWorker;
