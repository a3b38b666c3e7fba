//! Text, text-set and byte payload aggregates.

use super::{ClosedInterval, IntervalAggregate, IntervalValue, Window};
use crate::core::{MetricId, Result, Trace, TraceValue, ValueKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Keeps the last message of the window. Sticky types carry it over a reset.
#[derive(Debug, Clone)]
pub struct TextInterval {
    window: Window,
    sticky: bool,
    message: Option<String>,
}

impl TextInterval {
    pub fn new(metric_id: MetricId, start: DateTime<Utc>) -> Self {
        Self {
            sticky: metric_id.metric_type().is_sticky(),
            window: Window::new(metric_id, start),
            message: None,
        }
    }
}

impl IntervalAggregate for TextInterval {
    fn metric_id(&self) -> &MetricId {
        &self.window.metric_id
    }

    fn apply(&mut self, trace: &Trace) -> Result<()> {
        let TraceValue::Text(message) = trace.value() else {
            return Err(self.window.mismatch(ValueKind::Text, trace));
        };
        self.window.record(trace);
        self.message = Some(message.clone());
        Ok(())
    }

    fn close(&mut self, end: DateTime<Utc>) {
        self.window.close(end);
    }

    fn snapshot(&self) -> ClosedInterval {
        self.window.seal(IntervalValue::Text {
            message: self.message.clone(),
        })
    }

    fn reset(&mut self, start: DateTime<Utc>) {
        self.window.reset(start);
        if !self.sticky {
            self.message = None;
        }
    }

    fn count(&self) -> u64 {
        self.window.count
    }
}

/// Distinct messages seen in the window with their occurrence counts.
#[derive(Debug, Clone)]
pub struct TextSetInterval {
    window: Window,
    messages: BTreeMap<String, u64>,
}

impl TextSetInterval {
    pub fn new(metric_id: MetricId, start: DateTime<Utc>) -> Self {
        Self {
            window: Window::new(metric_id, start),
            messages: BTreeMap::new(),
        }
    }
}

impl IntervalAggregate for TextSetInterval {
    fn metric_id(&self) -> &MetricId {
        &self.window.metric_id
    }

    fn apply(&mut self, trace: &Trace) -> Result<()> {
        let TraceValue::Text(message) = trace.value() else {
            return Err(self.window.mismatch(ValueKind::TextSet, trace));
        };
        self.window.record(trace);
        *self.messages.entry(message.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn close(&mut self, end: DateTime<Utc>) {
        self.window.close(end);
    }

    fn snapshot(&self) -> ClosedInterval {
        self.window.seal(IntervalValue::TextSet {
            messages: self.messages.clone(),
        })
    }

    fn reset(&mut self, start: DateTime<Utc>) {
        self.window.reset(start);
        self.messages.clear();
    }

    fn count(&self) -> u64 {
        self.window.count
    }
}

/// Every byte payload applied in the window, in arrival order.
#[derive(Debug, Clone)]
pub struct BytesInterval {
    window: Window,
    payloads: Vec<Vec<u8>>,
}

impl BytesInterval {
    pub fn new(metric_id: MetricId, start: DateTime<Utc>) -> Self {
        Self {
            window: Window::new(metric_id, start),
            payloads: Vec::new(),
        }
    }
}

impl IntervalAggregate for BytesInterval {
    fn metric_id(&self) -> &MetricId {
        &self.window.metric_id
    }

    fn apply(&mut self, trace: &Trace) -> Result<()> {
        let TraceValue::Bytes(payload) = trace.value() else {
            return Err(self.window.mismatch(ValueKind::Bytes, trace));
        };
        self.window.record(trace);
        self.payloads.push(payload.clone());
        Ok(())
    }

    fn close(&mut self, end: DateTime<Utc>) {
        self.window.close(end);
    }

    fn snapshot(&self) -> ClosedInterval {
        self.window.seal(IntervalValue::Bytes {
            payloads: self.payloads.clone(),
        })
    }

    fn reset(&mut self, start: DateTime<Utc>) {
        self.window.reset(start);
        self.payloads.clear();
    }

    fn count(&self) -> u64 {
        self.window.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricType;

    #[test]
    fn test_last_message_wins() {
        let id = MetricId::parse(MetricType::String, "app/status").unwrap();
        let mut interval = TextInterval::new(id.clone(), Utc::now());
        interval.apply(&Trace::text(id.clone(), "starting")).unwrap();
        interval.apply(&Trace::text(id.clone(), "ready")).unwrap();
        assert_eq!(
            interval.snapshot().value,
            IntervalValue::Text {
                message: Some("ready".to_string())
            }
        );

        // String metrics are sticky
        interval.reset(Utc::now());
        assert_eq!(interval.count(), 0);
        assert_eq!(
            interval.snapshot().value,
            IntervalValue::Text {
                message: Some("ready".to_string())
            }
        );
    }

    #[test]
    fn test_text_set_counts_and_sorts() {
        let id = MetricId::parse(MetricType::Strings, "app/events").unwrap();
        let mut interval = TextSetInterval::new(id.clone(), Utc::now());
        for message in ["gc", "alloc", "gc"] {
            interval.apply(&Trace::text(id.clone(), message)).unwrap();
        }

        let IntervalValue::TextSet { messages } = interval.snapshot().value else {
            panic!("Expected text set");
        };
        assert_eq!(
            messages.into_iter().collect::<Vec<_>>(),
            vec![("alloc".to_string(), 1), ("gc".to_string(), 2)]
        );

        interval.reset(Utc::now());
        assert_eq!(
            interval.snapshot().value,
            IntervalValue::TextSet {
                messages: BTreeMap::new()
            }
        );
    }

    #[test]
    fn test_bytes_preserve_order() {
        let id = MetricId::parse(MetricType::Bytes, "app/dump").unwrap();
        let mut interval = BytesInterval::new(id.clone(), Utc::now());
        interval.apply(&Trace::bytes(id.clone(), vec![1, 2])).unwrap();
        interval.apply(&Trace::bytes(id.clone(), vec![3])).unwrap();
        let snapshot = interval.snapshot();
        interval.reset(Utc::now());

        assert_eq!(
            snapshot.value,
            IntervalValue::Bytes {
                payloads: vec![vec![1, 2], vec![3]]
            }
        );
        assert_eq!(interval.count(), 0);
        assert!(interval.apply(&Trace::text(id, "nope")).is_err());
    }
}
