//! Reliability layer for a Kafka transport.
//!
//! Provides an at-least-once consumer with graceful shutdown, bounded
//! retries with exponential backoff, dead-letter-queue escalation, a
//! draining producer and an event publisher, all reporting through an
//! injectable [`TransportMetrics`] interface.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use kafka_transport::{
//!     Consumer, Envelope, Handler, HandlerError, KafkaConfig, NoOpMetrics,
//! };
//!
//! struct OrderHandler;
//!
//! #[async_trait]
//! impl Handler for OrderHandler {
//!     async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
//!         tracing::info!(event_id = %envelope.event_id, "handling order event");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = KafkaConfig::from_env();
//!     let consumer = Consumer::new(&cfg, "orders", Arc::new(OrderHandler), Arc::new(NoOpMetrics))?;
//!     consumer.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod publisher;
pub mod retry;

pub use config::{ConsumerConfig, KafkaConfig, ProducerConfig, ReliabilityConfig, SaslConfig};
pub use consumer::{Consumer, ConsumerState};
pub use envelope::Envelope;
pub use error::{HandlerError, TransportError};
pub use handler::Handler;
pub use message::RawMessage;
pub use metrics::{
    NoOpMetrics, PrometheusMetrics, ProcessingStatus, PublishStatus, TransportMetrics,
};
pub use producer::{KafkaProducer, Producer};
pub use publisher::EventPublisher;
pub use retry::RetryProcessor;
