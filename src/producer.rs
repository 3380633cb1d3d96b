use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as RdKafkaProducer};
use rdkafka::util::Timeout;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{base_client_config, KafkaConfig};
use crate::error::TransportError;
use crate::metrics::{PublishStatus, TransportMetrics};

/// Publishing side of the transport.
///
/// Safe for concurrent `publish` calls from multiple tasks. `close` drains
/// buffered records before returning.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), TransportError> {
        self.publish_with_headers(topic, key, value, &[]).await
    }

    async fn publish_with_headers(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Kafka producer configured for at-least-once delivery: idempotent writes,
/// configurable acks/compression, and a flush-on-close drain.
pub struct KafkaProducer {
    inner: FutureProducer,
    default_topic: String,
    send_timeout: Duration,
    flush_timeout: Duration,
    metrics: Arc<dyn TransportMetrics>,
    closed: RwLock<bool>,
}

impl KafkaProducer {
    pub fn new(
        cfg: &KafkaConfig,
        metrics: Arc<dyn TransportMetrics>,
    ) -> Result<Self, TransportError> {
        let mut client_config = base_client_config(cfg);

        let producer: FutureProducer = client_config
            .set("acks", &cfg.producer.acks)
            .set(
                "enable.idempotence",
                if cfg.producer.enable_idempotence {
                    "true"
                } else {
                    "false"
                },
            )
            .set(
                "max.in.flight.requests.per.connection",
                cfg.producer.max_in_flight.to_string(),
            )
            .set("retries", cfg.producer.retries.to_string())
            .set("compression.type", &cfg.producer.compression)
            .set("linger.ms", cfg.producer.linger_ms.to_string())
            .set("batch.size", cfg.producer.batch_size.to_string())
            .set(
                "request.timeout.ms",
                cfg.producer.request_timeout_ms.to_string(),
            )
            .set(
                "delivery.timeout.ms",
                cfg.producer.delivery_timeout_ms.to_string(),
            )
            .create()?;

        metrics.set_active_producers(1);
        info!(
            brokers = %cfg.brokers,
            default_topic = %cfg.producer.topic,
            "Kafka producer initialized"
        );

        Ok(Self {
            inner: producer,
            default_topic: cfg.producer.topic.clone(),
            send_timeout: Duration::from_millis(u64::from(cfg.producer.request_timeout_ms)),
            flush_timeout: Duration::from_millis(u64::from(cfg.producer.delivery_timeout_ms)),
            metrics,
            closed: RwLock::new(false),
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn publish_with_headers(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> Result<(), TransportError> {
        let started = Instant::now();

        {
            let closed = self.closed.read().await;
            if *closed {
                return Err(TransportError::ProducerClosed);
            }
        }

        let topic = if topic.is_empty() {
            self.default_topic.as_str()
        } else {
            topic
        };

        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(topic).key(key).payload(value);
        if !headers.is_empty() {
            let mut owned = OwnedHeaders::new_with_capacity(headers.len());
            for (header_key, header_value) in headers {
                owned = owned.insert(Header {
                    key: header_key,
                    value: Some(header_value.as_slice()),
                });
            }
            record = record.headers(owned);
        }

        let result = self.inner.send(record, Timeout::After(self.send_timeout)).await;
        self.metrics.record_publish_time(topic, started.elapsed());

        match result {
            Ok((partition, offset)) => {
                self.metrics.inc_messages_sent(topic, PublishStatus::Success);
                tracing::debug!(topic, partition, offset, "Message published");
                Ok(())
            }
            Err((err, _)) => {
                self.metrics.inc_messages_sent(topic, PublishStatus::Error);
                error!(error = %err, topic, "Failed to publish message");
                Err(TransportError::Kafka(err))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut closed = self.closed.write().await;
        if *closed {
            return Ok(());
        }

        info!("Closing producer...");
        self.metrics.set_active_producers(0);

        // Waits for all buffered records to be delivered or to fail.
        if let Err(err) = self.inner.flush(Timeout::After(self.flush_timeout)) {
            error!(error = %err, "Error flushing Kafka producer");
            return Err(TransportError::Kafka(err));
        }

        *closed = true;
        info!("Producer closed successfully");
        Ok(())
    }
}
