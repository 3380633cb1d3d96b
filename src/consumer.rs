use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{base_client_config, KafkaConfig};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::handler::Handler;
use crate::message::RawMessage;
use crate::metrics::{ProcessingStatus, TransportMetrics};
use crate::producer::KafkaProducer;
use crate::retry::RetryProcessor;

/// Lifecycle of a [`Consumer`]'s read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, `run` not yet called.
    Idle,
    /// Read loop active.
    Running,
    /// Shutdown requested, loop draining.
    Stopping,
    /// Read loop exited.
    Stopped,
}

/// Kafka consumer with manual commits, bounded retries and graceful
/// shutdown.
///
/// Offsets are committed only after a message has been processed, retried
/// or escalated to the DLQ, so delivery is at-least-once: a crash between
/// processing and commit redelivers the message.
pub struct Consumer {
    inner: StreamConsumer,
    topic: String,
    handler: Arc<dyn Handler>,
    retry_processor: Option<RetryProcessor>,
    metrics: Arc<dyn TransportMetrics>,
    state: Mutex<ConsumerState>,
    shutdown: CancellationToken,
    done_tx: watch::Sender<bool>,
    poll_timeout: Duration,
    shutdown_grace: Duration,
}

impl Consumer {
    /// Build a consumer subscribed to `topic`.
    ///
    /// When retries or the DLQ are enabled, a dedicated producer is created
    /// for DLQ delivery; failure to create it logs an error and falls back
    /// to direct handler dispatch rather than failing the consumer.
    pub fn new(
        cfg: &KafkaConfig,
        topic: &str,
        handler: Arc<dyn Handler>,
        metrics: Arc<dyn TransportMetrics>,
    ) -> Result<Self, TransportError> {
        let mut client_config = base_client_config(cfg);
        client_config
            .set("group.id", &cfg.consumer.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &cfg.consumer.auto_offset_reset)
            .set("fetch.min.bytes", cfg.consumer.min_fetch_bytes.to_string())
            .set("fetch.max.bytes", cfg.consumer.max_fetch_bytes.to_string())
            .set(
                "fetch.wait.max.ms",
                cfg.consumer.fetch_max_wait_ms.to_string(),
            )
            .set(
                "session.timeout.ms",
                cfg.consumer.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                cfg.consumer.heartbeat_interval_ms.to_string(),
            )
            .set("allow.auto.create.topics", "true");

        let inner: StreamConsumer = client_config.create()?;
        inner.subscribe(&[topic])?;

        let reliability = cfg.reliability.clone();
        let retry_processor = if reliability.retry_count > 0 || reliability.dlq_enabled {
            match KafkaProducer::new(cfg, metrics.clone()) {
                Ok(dlq_producer) => Some(RetryProcessor::new(
                    reliability,
                    Arc::new(dlq_producer),
                    metrics.clone(),
                )),
                Err(err) => {
                    error!(
                        error = %err,
                        "Failed to create DLQ producer, retry processing disabled"
                    );
                    None
                }
            }
        } else {
            None
        };

        let (done_tx, _) = watch::channel(false);

        info!(
            topic = %topic,
            group_id = %cfg.consumer.group_id,
            retry_enabled = retry_processor.is_some(),
            "Consumer created"
        );

        Ok(Self {
            inner,
            topic: topic.to_string(),
            handler,
            retry_processor,
            metrics,
            state: Mutex::new(ConsumerState::Idle),
            shutdown: CancellationToken::new(),
            done_tx,
            poll_timeout: cfg.consumer.poll_timeout,
            shutdown_grace: cfg.consumer.shutdown_grace,
        })
    }

    /// Run the read loop until [`stop`](Self::stop) is called or the
    /// shutdown token is cancelled.
    ///
    /// Returns `AlreadyRunning` when the loop is already active. Transient
    /// read and commit errors are logged and tolerated; only shutdown exits
    /// the loop.
    ///
    /// A consumer is single-use: the shutdown token stays cancelled after
    /// the loop exits, so a later `run` on a `Stopped` consumer returns
    /// immediately.
    pub async fn run(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConsumerState::Running | ConsumerState::Stopping => {
                    return Err(TransportError::AlreadyRunning)
                }
                _ => *state = ConsumerState::Running,
            }
        }
        self.done_tx.send_replace(false);
        self.metrics.set_active_consumers(1);
        // Runs even when a handler panics, so the gauge resets and waiters
        // are released.
        let _guard = RunGuard { consumer: self };
        info!(topic = %self.topic, "Starting consumer...");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = tokio::time::timeout(self.poll_timeout, self.inner.recv()) => {
                    match read {
                        // idle poll window elapsed, check shutdown and poll again
                        Err(_) => continue,
                        Ok(Err(err)) => {
                            error!(error = %err, topic = %self.topic, "Failed to read message");
                            continue;
                        }
                        Ok(Ok(msg)) => self.handle_message(&msg).await,
                    }
                }
            }
        }

        info!(topic = %self.topic, "Consumer stopped");
        Ok(())
    }

    async fn handle_message(&self, msg: &BorrowedMessage<'_>) {
        self.metrics
            .inc_messages_received(msg.topic(), msg.partition());

        let raw = RawMessage::from_borrowed(msg);
        let started = Instant::now();

        let result = self.dispatch(&raw).await;
        self.metrics
            .record_processing_time(&raw.topic, started.elapsed());

        match &result {
            Ok(()) => self
                .metrics
                .inc_messages_processed(&raw.topic, ProcessingStatus::Success),
            Err(err) => {
                error!(
                    error = %err,
                    topic = %raw.topic,
                    partition = raw.partition,
                    offset = raw.offset,
                    "Failed to process message"
                );
                self.metrics
                    .inc_messages_processed(&raw.topic, ProcessingStatus::Error);
            }
        }

        // A failed message was already retried or routed to the DLQ, so the
        // offset advances either way and the partition cannot wedge on one
        // poison message.
        if let Err(err) = self.inner.commit_message(msg, CommitMode::Sync) {
            error!(
                error = %err,
                topic = %raw.topic,
                offset = raw.offset,
                "Failed to commit message"
            );
        }
    }

    async fn dispatch(&self, raw: &RawMessage) -> Result<(), TransportError> {
        match &self.retry_processor {
            Some(processor) => {
                processor
                    .process_with_retry(&self.shutdown, raw, self.handler.as_ref())
                    .await
            }
            None => {
                let envelope = Envelope::from_bytes(&raw.value)?;
                self.handler
                    .handle(&envelope)
                    .await
                    .map_err(TransportError::Handler)
            }
        }
    }

    /// Request shutdown of the read loop. No-op unless the loop is running.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConsumerState::Running {
            info!(topic = %self.topic, "Stopping consumer...");
            *state = ConsumerState::Stopping;
            self.shutdown.cancel();
        }
    }

    /// Wait until the read loop has exited, up to `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<(), TransportError> {
        {
            let state = self.state.lock().unwrap();
            if matches!(*state, ConsumerState::Idle | ConsumerState::Stopped) {
                return Ok(());
            }
        }

        let mut done = self.done_tx.subscribe();
        let result = tokio::time::timeout(timeout, done.wait_for(|done| *done)).await;
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(TransportError::ShutdownTimeout(timeout)),
        }
    }

    /// Stop the read loop, wait for it to drain within the configured grace
    /// period, and unsubscribe. A loop that outlives the grace period is
    /// logged, not treated as fatal.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.stop();
        if let Err(err) = self.wait(self.shutdown_grace).await {
            warn!(error = %err, topic = %self.topic, "Consumer did not stop within grace period");
        }
        self.inner.unsubscribe();
        info!(topic = %self.topic, "Consumer closed");
        Ok(())
    }

    /// Token cancelled when shutdown is requested. Cancelling it externally
    /// has the same effect on the read loop as [`stop`](Self::stop).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap()
    }
}

/// Marks the read loop as stopped when `run` unwinds, whether cleanly or
/// through a panicking handler.
struct RunGuard<'a> {
    consumer: &'a Consumer,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.consumer.metrics.set_active_consumers(0);
        if let Ok(mut state) = self.consumer.state.lock() {
            *state = ConsumerState::Stopped;
        }
        self.consumer.done_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::metrics::NoOpMetrics;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct GaugeMetrics {
        consumer_gauge: std::sync::Mutex<Vec<i64>>,
    }

    impl TransportMetrics for GaugeMetrics {
        fn inc_messages_received(&self, _topic: &str, _partition: i32) {}
        fn inc_messages_processed(&self, _topic: &str, _status: ProcessingStatus) {}
        fn record_processing_time(&self, _topic: &str, _duration: Duration) {}
        fn inc_retry_attempts(&self, _topic: &str, _attempt: u32) {}
        fn inc_messages_sent(&self, _topic: &str, _status: crate::metrics::PublishStatus) {}
        fn record_publish_time(&self, _topic: &str, _duration: Duration) {}
        fn inc_dlq_messages(&self, _original_topic: &str, _dlq_topic: &str) {}
        fn set_active_consumers(&self, count: i64) {
            self.consumer_gauge.lock().unwrap().push(count);
        }
        fn set_active_producers(&self, _count: i64) {}
        fn record_uptime(&self, _uptime: Duration) {}
    }

    // Unreachable broker: rdkafka connects lazily, so construction and
    // lifecycle transitions work without a live cluster.
    fn test_config() -> KafkaConfig {
        let mut cfg = KafkaConfig::default();
        cfg.brokers = "127.0.0.1:9".to_string();
        cfg.consumer.poll_timeout = Duration::from_millis(100);
        cfg.consumer.shutdown_grace = Duration::from_secs(1);
        cfg
    }

    fn test_consumer() -> Consumer {
        Consumer::new(
            &test_config(),
            "orders",
            Arc::new(NoopHandler),
            Arc::new(NoOpMetrics),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stop_before_run_is_a_noop() {
        let consumer = test_consumer();
        consumer.stop();
        assert_eq!(consumer.state(), ConsumerState::Idle);
        assert!(!consumer.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn wait_before_run_returns_immediately() {
        let consumer = test_consumer();
        consumer.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn close_before_run_is_idempotent() {
        let consumer = test_consumer();
        consumer.close().await.unwrap();
        consumer.close().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn run_stop_wait_cycle() {
        let consumer = Arc::new(test_consumer());

        let loop_handle = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumer.state(), ConsumerState::Running);

        // second run must fail fast while the loop is active
        assert!(matches!(
            consumer.run().await,
            Err(TransportError::AlreadyRunning)
        ));

        consumer.stop();
        consumer.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        loop_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_while_loop_is_running() {
        let consumer = Arc::new(test_consumer());

        let loop_handle = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = consumer.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::ShutdownTimeout(_))));

        consumer.stop();
        consumer.wait(Duration::from_secs(2)).await.unwrap();
        loop_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn active_consumer_gauge_resets_when_loop_exits() {
        let metrics = Arc::new(GaugeMetrics::default());
        let consumer = Arc::new(
            Consumer::new(&test_config(), "orders", Arc::new(NoopHandler), metrics.clone())
                .unwrap(),
        );

        let loop_handle = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop();
        consumer.wait(Duration::from_secs(2)).await.unwrap();
        loop_handle.await.unwrap().unwrap();

        assert_eq!(*metrics.consumer_gauge.lock().unwrap(), vec![1, 0]);

        // single-use: the token stays cancelled, a later run exits at once
        consumer.run().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(*metrics.consumer_gauge.lock().unwrap(), vec![1, 0, 1, 0]);
    }

    #[tokio::test]
    async fn external_token_cancellation_stops_the_loop() {
        let consumer = Arc::new(test_consumer());
        let token = consumer.shutdown_token();

        let loop_handle = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        consumer.wait(Duration::from_secs(2)).await.unwrap();
        loop_handle.await.unwrap().unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }
}
