use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ReliabilityConfig;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::handler::Handler;
use crate::message::RawMessage;
use crate::metrics::{ProcessingStatus, TransportMetrics};
use crate::producer::Producer;

/// Sentinel retry count recorded when a message never reached the handler
/// because its envelope could not be decoded.
const PARSE_FAILURE_RETRIES: i32 = -1;

/// Bounded retry with exponential backoff, escalating to the DLQ on
/// exhaustion or on an explicitly non-retryable error.
///
/// Not designed for concurrent `process_with_retry` calls on the same
/// message; one consumer read loop drives one processor.
pub struct RetryProcessor {
    config: ReliabilityConfig,
    producer: Arc<dyn Producer>,
    metrics: Arc<dyn TransportMetrics>,
}

impl RetryProcessor {
    pub fn new(
        config: ReliabilityConfig,
        producer: Arc<dyn Producer>,
        metrics: Arc<dyn TransportMetrics>,
    ) -> Self {
        Self {
            config,
            producer,
            metrics,
        }
    }

    /// Drive a message through the handler with bounded retries.
    ///
    /// The shutdown token only interrupts the backoff wait between attempts;
    /// an attempt that has started always runs to completion, and DLQ
    /// delivery runs under its own timeout decoupled from the token.
    pub async fn process_with_retry(
        &self,
        shutdown: &CancellationToken,
        msg: &RawMessage,
        handler: &dyn Handler,
    ) -> Result<(), TransportError> {
        let envelope = match Envelope::from_bytes(&msg.value) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, topic = %msg.topic, offset = msg.offset, "Failed to parse message");
                self.metrics
                    .inc_messages_processed(&msg.topic, ProcessingStatus::ParseError);
                return self
                    .send_to_dlq(msg, TransportError::Json(err), PARSE_FAILURE_RETRIES)
                    .await;
            }
        };

        let prior_retries = self.prior_retry_count(msg);
        let mut attempt: u32 = 0;

        loop {
            let err = match handler.handle(&envelope).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            event_id = %envelope.event_id,
                            retry_count = attempt,
                            "Message processed successfully after retry"
                        );
                        self.metrics
                            .inc_messages_processed(&msg.topic, ProcessingStatus::RetrySuccess);
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            if attempt > 0 {
                self.metrics.inc_retry_attempts(&msg.topic, attempt);
            }

            if !err.is_retryable() {
                error!(
                    error = %err,
                    event_id = %envelope.event_id,
                    "Non-retryable error, sending to DLQ"
                );
                self.metrics
                    .inc_messages_processed(&msg.topic, ProcessingStatus::NonRetryable);
                return self
                    .send_to_dlq(
                        msg,
                        TransportError::Handler(err),
                        prior_retries + attempt as i32,
                    )
                    .await;
            }

            if attempt >= self.config.retry_count {
                error!(
                    error = %err,
                    event_id = %envelope.event_id,
                    total_retries = self.config.retry_count,
                    "All retry attempts exhausted, sending to DLQ"
                );
                self.metrics
                    .inc_messages_processed(&msg.topic, ProcessingStatus::RetryExhausted);
                return self
                    .send_to_dlq(
                        msg,
                        TransportError::Handler(err),
                        prior_retries + self.config.retry_count as i32,
                    )
                    .await;
            }

            let backoff = err
                .retry_after()
                .unwrap_or_else(|| self.config.backoff_for_attempt(attempt));
            warn!(
                error = %err,
                event_id = %envelope.event_id,
                attempt = attempt + 1,
                max_retries = self.config.retry_count,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying message processing"
            );
            self.metrics
                .inc_messages_processed(&msg.topic, ProcessingStatus::Retry);

            tokio::select! {
                _ = shutdown.cancelled() => return Err(TransportError::Shutdown),
                _ = tokio::time::sleep(backoff) => {}
            }

            attempt += 1;
        }
    }

    /// Escalate a failed message to the configured dead letter queue.
    ///
    /// When the DLQ is disabled or has no topic, the original error is
    /// surfaced unchanged and the message is dropped (the consumer still
    /// commits its offset).
    async fn send_to_dlq(
        &self,
        msg: &RawMessage,
        cause: TransportError,
        total_retries: i32,
    ) -> Result<(), TransportError> {
        if !self.config.dlq_enabled || self.config.dlq_topic.is_empty() {
            warn!(original_topic = %msg.topic, "DLQ disabled, dropping message");
            return Err(cause);
        }

        let headers = self.dlq_headers(msg, &cause, total_retries);

        // Own timeout, independent of the consumer's shutdown: escalation of
        // an already-failed message must not be starved by the same shutdown
        // that triggered draining.
        let publish = self.producer.publish_with_headers(
            &self.config.dlq_topic,
            &msg.key,
            &msg.value,
            &headers,
        );
        let result = match tokio::time::timeout(self.config.dlq_publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::PublishTimeout(
                self.config.dlq_publish_timeout,
            )),
        };

        if let Err(err) = result {
            error!(
                error = %err,
                dlq_topic = %self.config.dlq_topic,
                original_topic = %msg.topic,
                "Failed to send message to DLQ"
            );
            return Err(TransportError::DlqPublish {
                topic: self.config.dlq_topic.clone(),
                source: Box::new(err),
            });
        }

        self.metrics
            .inc_dlq_messages(&msg.topic, &self.config.dlq_topic);
        self.metrics
            .inc_messages_processed(&msg.topic, ProcessingStatus::Dlq);

        info!(
            dlq_topic = %self.config.dlq_topic,
            original_topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            total_retries,
            "Message sent to DLQ"
        );

        Ok(())
    }

    /// Copy of the original headers minus the retry header, plus the retry
    /// count, error message, failure timestamp and original coordinates.
    fn dlq_headers(
        &self,
        msg: &RawMessage,
        cause: &TransportError,
        total_retries: i32,
    ) -> Vec<(String, Vec<u8>)> {
        let mut headers = Vec::with_capacity(msg.headers.len() + 6);

        for (key, value) in &msg.headers {
            if key != &self.config.dlq_retry_header {
                headers.push((key.clone(), value.clone()));
            }
        }

        headers.push((
            self.config.dlq_retry_header.clone(),
            total_retries.to_string().into_bytes(),
        ));
        headers.push((
            self.config.dlq_error_header.clone(),
            cause.to_string().into_bytes(),
        ));
        headers.push((
            self.config.dlq_timestamp_header.clone(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .into_bytes(),
        ));
        headers.push(("x-original-topic".to_string(), msg.topic.clone().into_bytes()));
        headers.push((
            "x-original-partition".to_string(),
            msg.partition.to_string().into_bytes(),
        ));
        headers.push((
            "x-original-offset".to_string(),
            msg.offset.to_string().into_bytes(),
        ));

        headers
    }

    fn prior_retry_count(&self, msg: &RawMessage) -> i32 {
        msg.header(&self.config.dlq_retry_header)
            .and_then(|value| std::str::from_utf8(value).ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}
