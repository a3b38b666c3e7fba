use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccumulatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid metric id: {0}")]
    InvalidMetricId(String),

    #[error("Unknown metric type code: {0}")]
    UnknownMetricType(u8),

    #[error("Type mismatch for {metric}: aggregate expects {expected}, trace carries {found}")]
    TypeMismatch {
        metric: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Consumer already registered: {0}")]
    ConsumerAlreadyRegistered(String),

    #[error("Consumer slots exhausted: maximum of {max} consumers already registered")]
    ConsumerSlotsExhausted { max: usize },

    #[error("Engine already started")]
    AlreadyStarted,

    #[error("Engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for accumulator operations
pub type Result<T> = std::result::Result<T, AccumulatorError>;

impl AccumulatorError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new invalid metric id error
    pub fn invalid_metric<S: Into<String>>(msg: S) -> Self {
        Self::InvalidMetricId(msg.into())
    }

    /// Returns true if retrying the operation may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConsumerSlotsExhausted { .. } => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidMetricId(_) | Self::UnknownMetricType(_) | Self::TypeMismatch { .. } => {
                "validation"
            },
            Self::ConsumerAlreadyRegistered(_) | Self::ConsumerSlotsExhausted { .. } => "consumer",
            Self::AlreadyStarted | Self::NotRunning => "lifecycle",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}
