//! Error taxonomy for the intake and dispatch pipeline.
//!
//! Ingress errors ([`MalformedEventError`], [`PublishError`]) are returned to the
//! HTTP caller. Processing errors ([`ProcessingError`]) never reach the original
//! requester; they only decide whether the queue redelivers or drops a message.

use std::time::Duration;

/// The inbound payload could not be turned into an event. Never queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEventError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unsupported payload type: {0}")]
    UnsupportedType(String),
}

/// Bad plugin configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate enabled plugin name: {0}")]
    DuplicateName(String),

    #[error("plugin '{plugin}' has no patterns")]
    NoPatterns { plugin: String },

    #[error("plugin '{plugin}' has invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        plugin: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("plugin '{plugin}' names unknown handler '{handler}'")]
    UnknownHandler { plugin: String, handler: String },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// The queue did not accept an envelope at ingress.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish did not complete within {0:?}")]
    Timeout(Duration),

    #[error("queue is closed")]
    Closed,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Dedup store backend failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("dedup store task failed: {0}")]
    Task(String),
}

/// Outbound response delivery failure. Always retryable.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform rejected message: {0}")]
    Api(String),
}

/// Failure while processing a dequeued envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    /// Transient; redeliver until the attempt budget is spent.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Defect that retrying cannot fix; acknowledge and drop.
    #[error("non-retryable: {0}")]
    NonRetryable(String),
}

impl ProcessingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Retryable(_))
    }
}
