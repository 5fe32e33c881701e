use thiserror::Error;

/// Failure reported by a [`Producer`](crate::producer::Producer) implementation.
///
/// Producers are external collaborators; the engine only needs a message to
/// log and retry against, not a structured cause.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProduceError {
    message: String,
}

impl ProduceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Engine error taxonomy.
///
/// `get`/`put` never surface errors for expected conditions (a miss is
/// `None`, not an error); producer failures stay contained inside the
/// revalidation workers and the warmer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store full: capacity {capacity} reached and overflow policy is `reject`")]
    StoreFull { capacity: usize },

    #[error("producer failed for key `{key}`: {source}")]
    Producer {
        key: String,
        #[source]
        source: ProduceError,
    },

    #[error("producer timed out for key `{key}` after {elapsed_ms}ms")]
    ProducerTimeout { key: String, elapsed_ms: u64 },

    #[error("no producer registered for key `{key}`")]
    NoProducer { key: String },

    #[error("invalid schedule `{spec}`: {detail}")]
    InvalidSchedule { spec: String, detail: String },

    #[error("telemetry init failed: {0}")]
    Telemetry(String),
}

impl EngineError {
    pub fn store_full(capacity: usize) -> Self {
        Self::StoreFull { capacity }
    }

    pub fn producer(key: impl Into<String>, source: ProduceError) -> Self {
        Self::Producer {
            key: key.into(),
            source,
        }
    }

    pub fn producer_timeout(key: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::ProducerTimeout {
            key: key.into(),
            elapsed_ms,
        }
    }

    pub fn no_producer(key: impl Into<String>) -> Self {
        Self::NoProducer { key: key.into() }
    }

    pub fn invalid_schedule(spec: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            spec: spec.into(),
            detail: detail.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    /// True for failures the retry policy is allowed to re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Producer { .. } | Self::ProducerTimeout { .. } | Self::NoProducer { .. }
        )
    }
}
