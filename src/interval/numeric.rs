//! Min/max/average and incident aggregates.

use super::{ClosedInterval, IntervalAggregate, IntervalValue, Window};
use crate::core::{MetricId, Result, Trace, TraceValue, ValueKind};
use chrono::{DateTime, Utc};

/// Min/max/avg reduction for int and long metrics.
///
/// Sticky metrics keep min/max/avg across a reset so an idle window
/// reports the last known reading. Delta metrics apply the difference
/// between successive raw values; the first raw value only sets the
/// baseline, and the baseline survives resets. A raw value below the
/// baseline is a counter reset: it rebases and records nothing.
#[derive(Debug, Clone)]
pub struct NumericInterval {
    window: Window,
    kind: ValueKind,
    sticky: bool,
    delta: bool,
    min: i64,
    max: i64,
    total: f64,
    avg: f64,
    baseline: Option<i64>,
}

impl NumericInterval {
    pub fn new(metric_id: MetricId, start: DateTime<Utc>) -> Self {
        let metric_type = metric_id.metric_type();
        Self {
            kind: metric_type.value_kind(),
            sticky: metric_type.is_sticky(),
            delta: metric_type.is_delta(),
            window: Window::new(metric_id, start),
            min: 0,
            max: 0,
            total: 0.0,
            avg: 0.0,
            baseline: None,
        }
    }

    fn raw_value(&self, trace: &Trace) -> Option<i64> {
        match (self.kind, trace.value()) {
            (ValueKind::Int, TraceValue::Int(v)) => Some(i64::from(*v)),
            (ValueKind::Long, TraceValue::Long(v)) => Some(*v),
            // Widening is lossless
            (ValueKind::Long, TraceValue::Int(v)) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

impl IntervalAggregate for NumericInterval {
    fn metric_id(&self) -> &MetricId {
        &self.window.metric_id
    }

    fn apply(&mut self, trace: &Trace) -> Result<()> {
        let raw = self
            .raw_value(trace)
            .ok_or_else(|| self.window.mismatch(self.kind, trace))?;

        let value = if self.delta {
            match self.baseline.replace(raw) {
                Some(previous) if raw >= previous => raw.saturating_sub(previous),
                // First reading or counter reset only moves the baseline
                _ => return Ok(()),
            }
        } else {
            raw
        };

        if self.window.count == 0 || value > self.max {
            self.max = value;
        }
        if self.window.count == 0 || value < self.min {
            self.min = value;
        }
        self.window.record(trace);
        self.total += value as f64;
        self.avg = self.total / self.window.count as f64;
        Ok(())
    }

    fn close(&mut self, end: DateTime<Utc>) {
        self.window.close(end);
    }

    fn snapshot(&self) -> ClosedInterval {
        self.window.seal(IntervalValue::Numeric {
            min: self.min,
            max: self.max,
            avg: self.avg,
            total: self.total,
        })
    }

    fn reset(&mut self, start: DateTime<Utc>) {
        self.window.reset(start);
        self.total = 0.0;
        if !self.sticky {
            self.min = 0;
            self.max = 0;
            self.avg = 0.0;
        }
    }

    fn count(&self) -> u64 {
        self.window.count
    }
}

/// Counts incidents within a window.
#[derive(Debug, Clone)]
pub struct IncidentInterval {
    window: Window,
    total: u64,
}

impl IncidentInterval {
    pub fn new(metric_id: MetricId, start: DateTime<Utc>) -> Self {
        Self {
            window: Window::new(metric_id, start),
            total: 0,
        }
    }
}

impl IntervalAggregate for IncidentInterval {
    fn metric_id(&self) -> &MetricId {
        &self.window.metric_id
    }

    fn apply(&mut self, trace: &Trace) -> Result<()> {
        let TraceValue::Incident(incidents) = trace.value() else {
            return Err(self.window.mismatch(ValueKind::Incident, trace));
        };
        self.window.record(trace);
        self.total = self.total.saturating_add(*incidents);
        Ok(())
    }

    fn close(&mut self, end: DateTime<Utc>) {
        self.window.close(end);
    }

    fn snapshot(&self) -> ClosedInterval {
        self.window.seal(IntervalValue::Incident { total: self.total })
    }

    fn reset(&mut self, start: DateTime<Utc>) {
        self.window.reset(start);
        self.total = 0;
    }

    fn count(&self) -> u64 {
        self.window.count
    }
}
