use crate::core::error::{AccumulatorError, Result};
use chrono::{DateTime, Utc};
use rustc_hash::FxHasher;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Namespace delimiter used in fully qualified metric names
pub const DELIMITER: char = '/';

/// Metric types understood by the accumulator.
///
/// The type decides which interval aggregate a metric gets and how
/// that aggregate behaves across flush windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    IntAvg,
    LongAvg,
    StickyIntAvg,
    StickyLongAvg,
    DeltaIntAvg,
    DeltaLongAvg,
    StickyDeltaIntAvg,
    StickyDeltaLongAvg,
    IntervalIncident,
    Timestamp,
    String,
    Strings,
    Bytes,
}

/// Kind of value an aggregate consumes. Keys the aggregate factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Int,
    Long,
    Incident,
    Timestamp,
    Text,
    TextSet,
    Bytes,
}

impl ValueKind {
    /// Short name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Int => "int",
            ValueKind::Long => "long",
            ValueKind::Incident => "incident",
            ValueKind::Timestamp => "timestamp",
            ValueKind::Text => "text",
            ValueKind::TextSet => "text-set",
            ValueKind::Bytes => "bytes",
        }
    }
}

impl MetricType {
    /// All metric types in code order
    pub const ALL: [MetricType; 13] = [
        MetricType::IntAvg,
        MetricType::LongAvg,
        MetricType::StickyIntAvg,
        MetricType::StickyLongAvg,
        MetricType::DeltaIntAvg,
        MetricType::DeltaLongAvg,
        MetricType::StickyDeltaIntAvg,
        MetricType::StickyDeltaLongAvg,
        MetricType::IntervalIncident,
        MetricType::Timestamp,
        MetricType::String,
        MetricType::Strings,
        MetricType::Bytes,
    ];

    /// Stable numeric code of this type
    pub fn code(&self) -> u8 {
        match self {
            MetricType::IntAvg => 1,
            MetricType::LongAvg => 2,
            MetricType::StickyIntAvg => 3,
            MetricType::StickyLongAvg => 4,
            MetricType::DeltaIntAvg => 5,
            MetricType::DeltaLongAvg => 6,
            MetricType::StickyDeltaIntAvg => 7,
            MetricType::StickyDeltaLongAvg => 8,
            MetricType::IntervalIncident => 9,
            MetricType::Timestamp => 10,
            MetricType::String => 11,
            MetricType::Strings => 12,
            MetricType::Bytes => 13,
        }
    }

    /// Resolve a metric type from its numeric code
    pub fn from_code(code: u8) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(AccumulatorError::UnknownMetricType(code))
    }

    /// Sticky aggregates carry their last reading into an idle window
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            MetricType::StickyIntAvg
                | MetricType::StickyLongAvg
                | MetricType::StickyDeltaIntAvg
                | MetricType::StickyDeltaLongAvg
                | MetricType::String
        )
    }

    /// Delta aggregates apply the difference between successive raw values
    pub fn is_delta(&self) -> bool {
        matches!(
            self,
            MetricType::DeltaIntAvg
                | MetricType::DeltaLongAvg
                | MetricType::StickyDeltaIntAvg
                | MetricType::StickyDeltaLongAvg
        )
    }

    /// Returns true for the min/max/avg numeric family
    pub fn is_numeric(&self) -> bool {
        matches!(self.value_kind(), ValueKind::Int | ValueKind::Long)
    }

    /// The value kind this type aggregates
    pub fn value_kind(&self) -> ValueKind {
        match self {
            MetricType::IntAvg
            | MetricType::StickyIntAvg
            | MetricType::DeltaIntAvg
            | MetricType::StickyDeltaIntAvg => ValueKind::Int,
            MetricType::LongAvg
            | MetricType::StickyLongAvg
            | MetricType::DeltaLongAvg
            | MetricType::StickyDeltaLongAvg => ValueKind::Long,
            MetricType::IntervalIncident => ValueKind::Incident,
            MetricType::Timestamp => ValueKind::Timestamp,
            MetricType::String => ValueKind::Text,
            MetricType::Strings => ValueKind::TextSet,
            MetricType::Bytes => ValueKind::Bytes,
        }
    }

    /// Human readable description
    pub fn description(&self) -> &'static str {
        match self {
            MetricType::IntAvg => "Interval averaged integer",
            MetricType::LongAvg => "Interval averaged long",
            MetricType::StickyIntAvg => "Sticky averaged integer",
            MetricType::StickyLongAvg => "Sticky averaged long",
            MetricType::DeltaIntAvg => "Delta integer",
            MetricType::DeltaLongAvg => "Delta long",
            MetricType::StickyDeltaIntAvg => "Sticky delta integer",
            MetricType::StickyDeltaLongAvg => "Sticky delta long",
            MetricType::IntervalIncident => "Interval incident count",
            MetricType::Timestamp => "Interval timestamp range",
            MetricType::String => "Last message of the interval",
            MetricType::Strings => "All messages in the interval",
            MetricType::Bytes => "All byte payloads in the interval",
        }
    }

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::IntAvg => "INT_AVG",
            MetricType::LongAvg => "LONG_AVG",
            MetricType::StickyIntAvg => "STICKY_INT_AVG",
            MetricType::StickyLongAvg => "STICKY_LONG_AVG",
            MetricType::DeltaIntAvg => "DELTA_INT_AVG",
            MetricType::DeltaLongAvg => "DELTA_LONG_AVG",
            MetricType::StickyDeltaIntAvg => "STICKY_DELTA_INT_AVG",
            MetricType::StickyDeltaLongAvg => "STICKY_DELTA_LONG_AVG",
            MetricType::IntervalIncident => "INTERVAL_INCIDENT",
            MetricType::Timestamp => "TIMESTAMP",
            MetricType::String => "STRING",
            MetricType::Strings => "STRINGS",
            MetricType::Bytes => "BYTES",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct MetricIdInner {
    namespace: SmallVec<[Arc<str>; 4]>,
    name: Arc<str>,
    metric_type: MetricType,
    hash: u64,
}

/// Normalized, hashable metric identity.
///
/// Cloning is cheap: the interior is shared. The routing hash is computed
/// once at construction; the shard index is derived from it by whichever
/// engine receives the trace.
#[derive(Debug, Clone)]
pub struct MetricId {
    inner: Arc<MetricIdInner>,
}

impl MetricId {
    /// Creates a metric id from namespace segments and a metric name.
    ///
    /// Segments are trimmed, empty segments are dropped and segments
    /// containing the delimiter are split.
    pub fn new<I, S>(metric_type: MetricType, namespace: I, name: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(AccumulatorError::invalid_metric("metric name cannot be empty"));
        }
        if name.contains(DELIMITER) {
            return Err(AccumulatorError::invalid_metric(format!(
                "metric name cannot contain '{}': {}",
                DELIMITER, name
            )));
        }

        let mut segments: SmallVec<[Arc<str>; 4]> = SmallVec::new();
        for segment in namespace {
            for part in segment.as_ref().split(DELIMITER) {
                let part = part.trim();
                if !part.is_empty() {
                    segments.push(Arc::from(part));
                }
            }
        }

        let hash = routing_hash(&segments, name);
        Ok(Self {
            inner: Arc::new(MetricIdInner {
                namespace: segments,
                name: Arc::from(name),
                metric_type,
                hash,
            }),
        })
    }

    /// Parses a fully qualified name such as `host/app/db/query-time`.
    /// The last segment is the metric name.
    pub fn parse(metric_type: MetricType, fqn: &str) -> Result<Self> {
        let trimmed = fqn.trim().trim_end_matches(DELIMITER);
        match trimmed.rsplit_once(DELIMITER) {
            Some((namespace, name)) => Self::new(metric_type, [namespace], name),
            None => Self::new(metric_type, std::iter::empty::<&str>(), trimmed),
        }
    }

    /// Namespace segments, outermost first
    pub fn namespace(&self) -> impl Iterator<Item = &str> {
        self.inner.namespace.iter().map(|s| s.as_ref())
    }

    /// Metric name (last segment)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Metric type
    pub fn metric_type(&self) -> MetricType {
        self.inner.metric_type
    }

    /// Routing hash (stable across processes)
    pub fn routing_hash(&self) -> u64 {
        self.inner.hash
    }

    /// Shard this metric routes to in an engine with `shard_count` shards.
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        let shards = shard_count.max(1) as u64;
        (self.inner.hash % shards) as usize
    }

    /// Fully qualified name: namespace segments and name joined by `/`
    pub fn fqn(&self) -> String {
        let mut fqn = String::new();
        for segment in &self.inner.namespace {
            fqn.push_str(segment);
            fqn.push(DELIMITER);
        }
        fqn.push_str(&self.inner.name);
        fqn
    }

    /// Returns true if the namespace starts with `prefix`
    pub fn matches_prefix<S: AsRef<str>>(&self, prefix: &[S]) -> bool {
        prefix.len() <= self.inner.namespace.len()
            && prefix
                .iter()
                .zip(self.inner.namespace.iter())
                .all(|(want, have)| want.as_ref() == have.as_ref())
    }
}

fn routing_hash(namespace: &[Arc<str>], name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    for segment in namespace {
        segment.as_ref().hash(&mut hasher);
    }
    name.hash(&mut hasher);
    hasher.finish()
}

impl PartialEq for MetricId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.hash == other.inner.hash
                && self.inner.metric_type == other.inner.metric_type
                && self.inner.name == other.inner.name
                && self.inner.namespace == other.inner.namespace)
    }
}

impl Eq for MetricId {}

impl Hash for MetricId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.inner.hash);
        self.inner.metric_type.hash(state);
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.inner.metric_type, self.fqn())
    }
}

impl Serialize for MetricId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let namespace: Vec<&str> = self.namespace().collect();
        let mut state = serializer.serialize_struct("MetricId", 3)?;
        state.serialize_field("namespace", &namespace)?;
        state.serialize_field("name", self.name())?;
        state.serialize_field("type", &self.inner.metric_type)?;
        state.end()
    }
}

/// A single raw measurement value
#[derive(Debug, Clone, PartialEq)]
pub enum TraceValue {
    Int(i32),
    Long(i64),
    Incident(u64),
    Timestamp(DateTime<Utc>),
    Text(String),
    Bytes(Vec<u8>),
}

impl TraceValue {
    /// Value kind carried by this value
    pub fn kind(&self) -> ValueKind {
        match self {
            TraceValue::Int(_) => ValueKind::Int,
            TraceValue::Long(_) => ValueKind::Long,
            TraceValue::Incident(_) => ValueKind::Incident,
            TraceValue::Timestamp(_) => ValueKind::Timestamp,
            TraceValue::Text(_) => ValueKind::Text,
            TraceValue::Bytes(_) => ValueKind::Bytes,
        }
    }
}

/// Immutable measurement produced by collectors and consumed by exactly one shard.
#[derive(Debug, Clone)]
pub struct Trace {
    metric_id: MetricId,
    value: TraceValue,
    timestamp: DateTime<Utc>,
    urgent: bool,
    temporal: bool,
}

impl Trace {
    /// Creates a trace stamped with the current time
    pub fn new(metric_id: MetricId, value: TraceValue) -> Self {
        Self {
            metric_id,
            value,
            timestamp: Utc::now(),
            urgent: false,
            temporal: false,
        }
    }

    /// Integer measurement
    pub fn int(metric_id: MetricId, value: i32) -> Self {
        Self::new(metric_id, TraceValue::Int(value))
    }

    /// Long measurement
    pub fn long(metric_id: MetricId, value: i64) -> Self {
        Self::new(metric_id, TraceValue::Long(value))
    }

    /// Incident occurrence(s)
    pub fn incident(metric_id: MetricId, count: u64) -> Self {
        Self::new(metric_id, TraceValue::Incident(count))
    }

    /// Timestamp measurement
    pub fn timestamp(metric_id: MetricId, at: DateTime<Utc>) -> Self {
        Self::new(metric_id, TraceValue::Timestamp(at))
    }

    /// Text message
    pub fn text<S: Into<String>>(metric_id: MetricId, message: S) -> Self {
        Self::new(metric_id, TraceValue::Text(message.into()))
    }

    /// Opaque byte payload
    pub fn bytes(metric_id: MetricId, payload: Vec<u8>) -> Self {
        Self::new(metric_id, TraceValue::Bytes(payload))
    }

    /// Override the trace timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the trace urgent
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Mark the trace temporal
    pub fn temporal(mut self) -> Self {
        self.temporal = true;
        self
    }

    pub fn metric_id(&self) -> &MetricId {
        &self.metric_id
    }

    pub fn value(&self) -> &TraceValue {
        &self.value
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    pub fn is_temporal(&self) -> bool {
        self.temporal
    }
}
