//! Timestamp range aggregate.

use super::{ClosedInterval, IntervalAggregate, IntervalValue, Window};
use crate::core::{MetricId, Result, Trace, TraceValue, ValueKind};
use chrono::{DateTime, TimeZone, Utc};

/// Tracks first/last/earliest/latest and the mean instant of the
/// timestamps reported in a window.
#[derive(Debug, Clone)]
pub struct TimestampInterval {
    window: Window,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
    total_millis: i128,
}

impl TimestampInterval {
    pub fn new(metric_id: MetricId, start: DateTime<Utc>) -> Self {
        Self {
            window: Window::new(metric_id, start),
            first: None,
            last: None,
            earliest: None,
            latest: None,
            total_millis: 0,
        }
    }

    fn average(&self) -> Option<DateTime<Utc>> {
        if self.window.count == 0 {
            return None;
        }
        let mean = self.total_millis / i128::from(self.window.count);
        i64::try_from(mean)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

impl IntervalAggregate for TimestampInterval {
    fn metric_id(&self) -> &MetricId {
        &self.window.metric_id
    }

    fn apply(&mut self, trace: &Trace) -> Result<()> {
        let TraceValue::Timestamp(at) = trace.value() else {
            return Err(self.window.mismatch(ValueKind::Timestamp, trace));
        };
        let at = *at;
        self.window.record(trace);
        if self.first.is_none() {
            self.first = Some(at);
        }
        self.last = Some(at);
        self.earliest = Some(self.earliest.map_or(at, |e| e.min(at)));
        self.latest = Some(self.latest.map_or(at, |l| l.max(at)));
        self.total_millis += i128::from(at.timestamp_millis());
        Ok(())
    }

    fn close(&mut self, end: DateTime<Utc>) {
        self.window.close(end);
    }

    fn snapshot(&self) -> ClosedInterval {
        self.window.seal(IntervalValue::Timestamp {
            first: self.first,
            last: self.last,
            earliest: self.earliest,
            latest: self.latest,
            average: self.average(),
        })
    }

    fn reset(&mut self, start: DateTime<Utc>) {
        self.window.reset(start);
        self.first = None;
        self.last = None;
        self.earliest = None;
        self.latest = None;
        self.total_millis = 0;
    }

    fn count(&self) -> u64 {
        self.window.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricType;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    #[test]
    fn test_timestamp_range() {
        let id = MetricId::parse(MetricType::Timestamp, "jobs/last-run").unwrap();
        let mut interval = TimestampInterval::new(id.clone(), at(0));

        for ms in [3_000, 1_000, 5_000] {
            interval.apply(&Trace::timestamp(id.clone(), at(ms))).unwrap();
        }

        assert_eq!(
            interval.snapshot().value,
            IntervalValue::Timestamp {
                first: Some(at(3_000)),
                last: Some(at(5_000)),
                earliest: Some(at(1_000)),
                latest: Some(at(5_000)),
                average: Some(at(3_000)),
            }
        );
    }

    #[test]
    fn test_empty_window_has_no_values() {
        let id = MetricId::parse(MetricType::Timestamp, "jobs/last-run").unwrap();
        let mut interval = TimestampInterval::new(id.clone(), at(0));
        interval.apply(&Trace::timestamp(id, at(10))).unwrap();
        interval.reset(at(20));

        assert_eq!(
            interval.snapshot().value,
            IntervalValue::Timestamp {
                first: None,
                last: None,
                earliest: None,
                latest: None,
                average: None,
            }
        );
    }
}
