use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::HandlerError;

/// Business-logic hook invoked for every consumed envelope.
///
/// Any returned error is treated as retryable unless it was built with
/// [`HandlerError::non_retryable`](crate::HandlerError::non_retryable).
/// Implementations must not block indefinitely: the consumer only observes
/// shutdown between handler invocations and backoff waits.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}
