use std::time::Duration;

use thiserror::Error;

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("consumer shutdown timeout after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("producer is closed")]
    ProducerClosed,

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    /// Processing was aborted by shutdown before it could finish.
    #[error("processing aborted by shutdown")]
    Shutdown,

    #[error(transparent)]
    Handler(HandlerError),

    #[error("failed to publish to DLQ topic {topic}: {source}")]
    DlqPublish {
        topic: String,
        #[source]
        source: Box<TransportError>,
    },
}

/// Error returned by a [`Handler`](crate::Handler), tagged with an explicit
/// retryability decision.
///
/// Plain errors converted via `From<anyhow::Error>` (and therefore the `?`
/// operator) default to retryable; only an explicit
/// [`HandlerError::non_retryable`] skips the backoff loop and escalates to
/// the DLQ immediately.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct HandlerError {
    cause: anyhow::Error,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl HandlerError {
    /// An error worth retrying with the configured backoff.
    pub fn retryable(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
            retryable: true,
            retry_after: None,
        }
    }

    /// An error that retrying cannot fix; escalates straight to the DLQ.
    pub fn non_retryable(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// Suggest a delay before the next attempt, overriding the computed
    /// backoff for that attempt.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(cause: anyhow::Error) -> Self {
        Self::retryable(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_errors_default_to_retryable() {
        let err: HandlerError = anyhow::anyhow!("downstream 503").into();
        assert!(err.is_retryable());
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn non_retryable_carries_flag_and_message() {
        let err = HandlerError::non_retryable(anyhow::anyhow!("bad schema"));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "bad schema");
    }

    #[test]
    fn retry_after_hint_is_preserved() {
        let err = HandlerError::retryable(anyhow::anyhow!("throttled"))
            .with_retry_after(Duration::from_millis(250));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
    }
}
