//! Error types for the pipeline.

use thiserror::Error;

/// Result type alias using the pipeline's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// The retriever backend failed after exhausting retries.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// The generator backend timed out producing a candidate.
    #[error("generation timed out after {duration_ms}ms")]
    GenerationTimeout { duration_ms: u64 },

    /// The generator backend refused to produce a candidate.
    #[error("generation refused: {0}")]
    GenerationRefused(String),

    /// The judge backend failed after exhausting retries (callers should
    /// fall back to heuristic scoring rather than propagate this).
    #[error("judge unavailable: {0}")]
    JudgeUnavailable(String),

    /// Publishing an event to the bus failed or timed out.
    #[error("event bus publish failed: {0}")]
    BusPublish(String),

    /// An event envelope could not be deserialized.
    #[error("malformed event: {0}")]
    BusDeserialize(String),

    /// The aggregator has more open batches than `MAX_OPEN_BATCHES`.
    #[error("aggregator backpressure: {open} open batches exceeds cap {cap}")]
    AggregatorOverflow { open: usize, cap: usize },

    /// A sink append/flush/fsync failed.
    #[error("sink I/O error for {path}: {message}")]
    SinkIo { path: String, message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for invariants that should never be reachable in practice.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a retrieval-unavailable error.
    pub fn retrieval_unavailable(message: impl Into<String>) -> Self {
        Self::RetrievalUnavailable(message.into())
    }

    /// Create a generation-timeout error.
    pub fn generation_timeout(duration_ms: u64) -> Self {
        Self::GenerationTimeout { duration_ms }
    }

    /// Create a sink I/O error.
    pub fn sink_io(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkIo {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether this error represents a transient condition worth retrying
    /// (timeouts and explicitly "unavailable" backends).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RetrievalUnavailable(_)
                | Self::GenerationTimeout { .. }
                | Self::JudgeUnavailable(_)
        )
    }
}
