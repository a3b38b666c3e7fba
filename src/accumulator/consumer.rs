//! Downstream consumers of flushed interval batches.

use crate::core::config::MAX_CONSUMERS;
use crate::core::{AccumulatorError, MetricId, Result, DELIMITER};
use crate::interval::ClosedInterval;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Receives every batch of closed intervals drained after a flush.
///
/// Called from the flush driver thread, once per batch. Implementations
/// should hand the batch off quickly; a slow consumer delays the drain.
pub trait IntervalConsumer: Send + Sync {
    /// Unique consumer id
    fn id(&self) -> &str;

    /// Handle one batch
    fn submit_intervals(&self, intervals: &[ClosedInterval]);
}

/// Which intervals a consumer wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NamespaceFilter {
    /// Every interval
    #[default]
    All,
    /// Intervals whose metric namespace starts with these segments
    Prefix(Vec<String>),
}

impl NamespaceFilter {
    /// Build a prefix filter from a `/` separated path such as `host/app`
    pub fn prefix(path: &str) -> Self {
        let segments: Vec<String> = path
            .split(DELIMITER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if segments.is_empty() {
            NamespaceFilter::All
        } else {
            NamespaceFilter::Prefix(segments)
        }
    }

    pub fn matches(&self, metric_id: &MetricId) -> bool {
        match self {
            NamespaceFilter::All => true,
            NamespaceFilter::Prefix(segments) => metric_id.matches_prefix(segments),
        }
    }

    fn view<'a>(&self, batch: &'a [ClosedInterval]) -> Cow<'a, [ClosedInterval]> {
        match self {
            NamespaceFilter::All => Cow::Borrowed(batch),
            NamespaceFilter::Prefix(_) => Cow::Owned(
                batch
                    .iter()
                    .filter(|interval| self.matches(&interval.metric_id))
                    .cloned()
                    .collect(),
            ),
        }
    }
}

/// A consumer's allocated slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSlot {
    pub index: usize,
    pub id: String,
}

struct Registration {
    slot: usize,
    consumer: Arc<dyn IntervalConsumer>,
    filter: NamespaceFilter,
}

/// Registry of downstream consumers, shared by every engine generation
/// built from the same handle.
pub struct ConsumerRegistry {
    consumers: DashMap<String, Registration>,
    slots: Mutex<u64>,
    panics: AtomicU64,
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self {
            consumers: DashMap::new(),
            slots: Mutex::new(0),
            panics: AtomicU64::new(0),
        }
    }

    /// Register a consumer under its id with a namespace filter.
    pub fn register(
        &self,
        consumer: Arc<dyn IntervalConsumer>,
        filter: NamespaceFilter,
    ) -> Result<ConsumerSlot> {
        let id = consumer.id().to_string();
        let mut slots = self.slots.lock();

        if self.consumers.contains_key(&id) {
            return Err(AccumulatorError::ConsumerAlreadyRegistered(id));
        }
        if *slots == u64::MAX {
            return Err(AccumulatorError::ConsumerSlotsExhausted { max: MAX_CONSUMERS });
        }

        let slot = (!*slots).trailing_zeros() as usize;
        *slots |= 1u64 << slot;
        self.consumers.insert(
            id.clone(),
            Registration {
                slot,
                consumer,
                filter,
            },
        );
        trace!(consumer = %id, slot, "Registered consumer");
        Ok(ConsumerSlot { index: slot, id })
    }

    /// Remove a consumer and free its slot. Returns false if unknown.
    pub fn unregister(&self, id: &str) -> bool {
        let mut slots = self.slots.lock();
        match self.consumers.remove(id) {
            Some((_, registration)) => {
                *slots &= !(1u64 << registration.slot);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Registered consumer ids in slot order
    pub fn ids(&self) -> Vec<String> {
        let mut entries: Vec<(usize, String)> = self
            .consumers
            .iter()
            .map(|entry| (entry.slot, entry.key().clone()))
            .collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Consumer panics caught during dispatch
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Hand a batch to every consumer whose filter selects at least one
    /// interval. Returns the number of consumers that received it.
    pub fn dispatch(&self, batch: &[ClosedInterval]) -> usize {
        if batch.is_empty() {
            return 0;
        }

        // Collected first so no map lock is held while consumers run
        let mut targets: Vec<(usize, Arc<dyn IntervalConsumer>, NamespaceFilter)> = self
            .consumers
            .iter()
            .map(|entry| (entry.slot, Arc::clone(&entry.consumer), entry.filter.clone()))
            .collect();
        targets.sort_unstable_by_key(|(slot, _, _)| *slot);

        let mut delivered = 0;
        for (_, consumer, filter) in targets {
            let view = filter.view(batch);
            if view.is_empty() {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| consumer.submit_intervals(&view)));
            match outcome {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.panics.fetch_add(1, Ordering::Relaxed);
                    error!(consumer = consumer.id(), "Consumer panicked while handling batch");
                }
            }
        }
        delivered
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("consumers", &self.ids())
            .field("panics", &self.panics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MetricType, Trace};
    use crate::interval::create_aggregate;
    use chrono::Utc;

    struct Collector {
        id: String,
        seen: Mutex<Vec<String>>,
    }

    impl Collector {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl IntervalConsumer for Collector {
        fn id(&self) -> &str {
            &self.id
        }

        fn submit_intervals(&self, intervals: &[ClosedInterval]) {
            self.seen
                .lock()
                .extend(intervals.iter().map(|i| i.metric_id.fqn()));
        }
    }

    struct Panicker;

    impl IntervalConsumer for Panicker {
        fn id(&self) -> &str {
            "panicker"
        }

        fn submit_intervals(&self, _intervals: &[ClosedInterval]) {
            panic!("consumer failure");
        }
    }

    fn closed(fqn: &str) -> ClosedInterval {
        let id = MetricId::parse(MetricType::IntervalIncident, fqn).unwrap();
        let mut aggregate = create_aggregate(&id, Utc::now());
        aggregate.apply(&Trace::incident(id, 1)).unwrap();
        aggregate.snapshot()
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ConsumerRegistry::new();
        registry.register(Collector::new("a"), NamespaceFilter::All).unwrap();
        let err = registry
            .register(Collector::new("a"), NamespaceFilter::All)
            .unwrap_err();
        assert!(matches!(err, AccumulatorError::ConsumerAlreadyRegistered(id) if id == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_slot_pool_exhaustion_and_reuse() {
        let registry = ConsumerRegistry::new();
        for i in 0..MAX_CONSUMERS {
            let slot = registry
                .register(Collector::new(&format!("c{}", i)), NamespaceFilter::All)
                .unwrap();
            assert_eq!(slot.index, i);
        }

        let err = registry
            .register(Collector::new("overflow"), NamespaceFilter::All)
            .unwrap_err();
        assert!(matches!(err, AccumulatorError::ConsumerSlotsExhausted { max: 64 }));

        assert!(registry.unregister("c7"));
        assert!(!registry.unregister("c7"));
        let slot = registry
            .register(Collector::new("late"), NamespaceFilter::All)
            .unwrap();
        assert_eq!(slot.index, 7);
    }

    #[test]
    fn test_prefix_filter() {
        let registry = ConsumerRegistry::new();
        let all = Collector::new("all");
        let db = Collector::new("db");
        registry.register(Arc::clone(&all) as Arc<dyn IntervalConsumer>, NamespaceFilter::All).unwrap();
        registry
            .register(Arc::clone(&db) as Arc<dyn IntervalConsumer>, NamespaceFilter::prefix("host/db"))
            .unwrap();

        let batch = vec![closed("host/db/errors"), closed("host/web/errors")];
        assert_eq!(registry.dispatch(&batch), 2);

        assert_eq!(all.seen.lock().len(), 2);
        assert_eq!(*db.seen.lock(), vec!["host/db/errors".to_string()]);

        // Nothing for the db consumer here, so it is skipped
        assert_eq!(registry.dispatch(&[closed("host/web/latency")]), 1);
        assert_eq!(db.seen.lock().len(), 1);
    }

    #[test]
    fn test_empty_prefix_means_all() {
        assert_eq!(NamespaceFilter::prefix(" / "), NamespaceFilter::All);
        assert_eq!(
            NamespaceFilter::prefix("a/b"),
            NamespaceFilter::Prefix(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_panicking_consumer_is_isolated() {
        let registry = ConsumerRegistry::new();
        registry.register(Arc::new(Panicker), NamespaceFilter::All).unwrap();
        let healthy = Collector::new("healthy");
        registry.register(Arc::clone(&healthy) as Arc<dyn IntervalConsumer>, NamespaceFilter::All).unwrap();

        assert_eq!(registry.dispatch(&[closed("app/errors")]), 1);
        assert_eq!(registry.panics(), 1);
        assert_eq!(healthy.seen.lock().len(), 1);
    }
}
