//! Interval aggregates.
//!
//! An interval aggregate accumulates every trace applied to one metric
//! during a flush window. Once per flush cycle the owning shard seals it
//! (`close`), takes an isolated copy (`snapshot`) and starts the next
//! window (`reset`). Aggregates are owned by exactly one shard and are
//! never shared across threads while live.

pub mod numeric;
pub mod text;
pub mod timestamp;

use crate::core::{AccumulatorError, MetricId, Result, Trace, ValueKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub use numeric::{IncidentInterval, NumericInterval};
pub use text::{BytesInterval, TextInterval, TextSetInterval};
pub use timestamp::TimestampInterval;

/// Contract shared by every interval aggregate.
pub trait IntervalAggregate: Send {
    /// Identity of the metric this aggregate belongs to
    fn metric_id(&self) -> &MetricId;

    /// Apply one trace to the open window.
    ///
    /// A trace whose value kind does not match the aggregate is rejected
    /// with [`AccumulatorError::TypeMismatch`] and leaves the state untouched.
    fn apply(&mut self, trace: &Trace) -> Result<()>;

    /// Seal the current window at `end`
    fn close(&mut self, end: DateTime<Utc>);

    /// Owned copy of the current window. Later mutation of the live
    /// aggregate never shows through.
    fn snapshot(&self) -> ClosedInterval;

    /// Start a fresh window at `start`
    fn reset(&mut self, start: DateTime<Utc>);

    /// Number of traces applied in the current window
    fn count(&self) -> u64;

    /// Returns true if at least one trace was applied in this window
    fn is_touched(&self) -> bool {
        self.count() > 0
    }
}

/// A sealed, immutable interval summary handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedInterval {
    pub metric_id: MetricId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
    pub urgent: bool,
    pub value: IntervalValue,
}

impl ClosedInterval {
    /// Window length
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Type-specific reduction of one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntervalValue {
    Numeric {
        min: i64,
        max: i64,
        avg: f64,
        total: f64,
    },
    Incident {
        total: u64,
    },
    Timestamp {
        first: Option<DateTime<Utc>>,
        last: Option<DateTime<Utc>>,
        earliest: Option<DateTime<Utc>>,
        latest: Option<DateTime<Utc>>,
        average: Option<DateTime<Utc>>,
    },
    Text {
        message: Option<String>,
    },
    TextSet {
        messages: BTreeMap<String, u64>,
    },
    Bytes {
        payloads: Vec<Vec<u8>>,
    },
}

/// Window bookkeeping shared by all aggregates.
#[derive(Debug, Clone)]
pub(crate) struct Window {
    pub(crate) metric_id: MetricId,
    pub(crate) start: DateTime<Utc>,
    pub(crate) end: DateTime<Utc>,
    pub(crate) count: u64,
    pub(crate) urgent: bool,
}

impl Window {
    pub(crate) fn new(metric_id: MetricId, start: DateTime<Utc>) -> Self {
        Self {
            metric_id,
            start,
            end: start,
            count: 0,
            urgent: false,
        }
    }

    pub(crate) fn record(&mut self, trace: &Trace) {
        self.count += 1;
        self.urgent |= trace.is_urgent();
    }

    pub(crate) fn close(&mut self, end: DateTime<Utc>) {
        self.end = end.max(self.start);
    }

    pub(crate) fn reset(&mut self, start: DateTime<Utc>) {
        self.start = start;
        self.end = start;
        self.count = 0;
        self.urgent = false;
    }

    pub(crate) fn seal(&self, value: IntervalValue) -> ClosedInterval {
        ClosedInterval {
            metric_id: self.metric_id.clone(),
            start: self.start,
            end: self.end,
            count: self.count,
            urgent: self.urgent,
            value,
        }
    }

    pub(crate) fn mismatch(&self, expected: ValueKind, trace: &Trace) -> AccumulatorError {
        AccumulatorError::TypeMismatch {
            metric: self.metric_id.to_string(),
            expected: expected.as_str(),
            found: trace.value().kind().as_str(),
        }
    }
}

/// Create the aggregate matching the metric's value kind.
pub fn create_aggregate(metric_id: &MetricId, start: DateTime<Utc>) -> Box<dyn IntervalAggregate> {
    match metric_id.metric_type().value_kind() {
        ValueKind::Int | ValueKind::Long => Box::new(NumericInterval::new(metric_id.clone(), start)),
        ValueKind::Incident => Box::new(IncidentInterval::new(metric_id.clone(), start)),
        ValueKind::Timestamp => Box::new(TimestampInterval::new(metric_id.clone(), start)),
        ValueKind::Text => Box::new(TextInterval::new(metric_id.clone(), start)),
        ValueKind::TextSet => Box::new(TextSetInterval::new(metric_id.clone(), start)),
        ValueKind::Bytes => Box::new(BytesInterval::new(metric_id.clone(), start)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricType;

    fn id(metric_type: MetricType) -> MetricId {
        MetricId::parse(metric_type, "test/metric").unwrap()
    }

    #[test]
    fn test_factory_dispatches_on_value_kind() {
        let now = Utc::now();
        for metric_type in MetricType::ALL {
            let metric_id = id(metric_type);
            let aggregate = create_aggregate(&metric_id, now);
            assert_eq!(aggregate.metric_id(), &metric_id);
            assert_eq!(aggregate.count(), 0);
            assert!(!aggregate.is_touched());
        }
    }

    #[test]
    fn test_snapshot_is_isolated_from_live_aggregate() {
        let metric_id = id(MetricType::LongAvg);
        let start = Utc::now();
        let mut aggregate = create_aggregate(&metric_id, start);
        for v in [10, 20, 30] {
            aggregate.apply(&Trace::long(metric_id.clone(), v)).unwrap();
        }
        aggregate.close(start + chrono::Duration::seconds(15));
        let snapshot = aggregate.snapshot();

        aggregate.reset(start + chrono::Duration::seconds(15));
        aggregate.apply(&Trace::long(metric_id.clone(), 1000)).unwrap();

        assert_eq!(snapshot.count, 3);
        assert_eq!(
            snapshot.value,
            IntervalValue::Numeric {
                min: 10,
                max: 30,
                avg: 20.0,
                total: 60.0
            }
        );
        assert_eq!(snapshot.duration(), chrono::Duration::seconds(15));
        assert_eq!(aggregate.count(), 1);
    }

    #[test]
    fn test_mismatched_value_is_rejected() {
        let metric_id = id(MetricType::LongAvg);
        let mut aggregate = create_aggregate(&metric_id, Utc::now());
        let err = aggregate
            .apply(&Trace::text(metric_id.clone(), "oops"))
            .unwrap_err();
        assert!(matches!(err, AccumulatorError::TypeMismatch { .. }));
        assert_eq!(aggregate.count(), 0);
    }

    #[test]
    fn test_urgent_flag_is_carried() {
        let metric_id = id(MetricType::IntervalIncident);
        let mut aggregate = create_aggregate(&metric_id, Utc::now());
        aggregate.apply(&Trace::incident(metric_id.clone(), 1)).unwrap();
        assert!(!aggregate.snapshot().urgent);
        aggregate.apply(&Trace::incident(metric_id.clone(), 1).urgent()).unwrap();
        assert!(aggregate.snapshot().urgent);
        aggregate.reset(Utc::now());
        assert!(!aggregate.snapshot().urgent);
    }

    #[test]
    fn test_close_never_precedes_start() {
        let metric_id = id(MetricType::IntAvg);
        let start = Utc::now();
        let mut aggregate = create_aggregate(&metric_id, start);
        aggregate.close(start - chrono::Duration::seconds(5));
        let snapshot = aggregate.snapshot();
        assert_eq!(snapshot.end, start);
    }
}
