use std::time::{Duration, Instant};

use prometheus::{Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use tokio_util::sync::CancellationToken;

/// Outcome label recorded against the processed-messages counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Success,
    Error,
    Retry,
    RetrySuccess,
    NonRetryable,
    RetryExhausted,
    Dlq,
    ParseError,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Success => "success",
            ProcessingStatus::Error => "error",
            ProcessingStatus::Retry => "retry",
            ProcessingStatus::RetrySuccess => "retry_success",
            ProcessingStatus::NonRetryable => "non_retryable",
            ProcessingStatus::RetryExhausted => "retry_exhausted",
            ProcessingStatus::Dlq => "dlq",
            ProcessingStatus::ParseError => "parse_error",
        }
    }
}

/// Outcome label recorded against the sent-messages counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    Success,
    Error,
}

impl PublishStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishStatus::Success => "success",
            PublishStatus::Error => "error",
        }
    }
}

/// Capability interface every transport component reports through.
///
/// Injected explicitly at construction time; [`NoOpMetrics`] is the default
/// when observability is disabled. Implementations must be safe for
/// concurrent use.
pub trait TransportMetrics: Send + Sync {
    fn inc_messages_received(&self, topic: &str, partition: i32);
    fn inc_messages_processed(&self, topic: &str, status: ProcessingStatus);
    fn record_processing_time(&self, topic: &str, duration: Duration);
    fn inc_retry_attempts(&self, topic: &str, attempt: u32);

    fn inc_messages_sent(&self, topic: &str, status: PublishStatus);
    fn record_publish_time(&self, topic: &str, duration: Duration);

    fn inc_dlq_messages(&self, original_topic: &str, dlq_topic: &str);

    fn set_active_consumers(&self, count: i64);
    fn set_active_producers(&self, count: i64);
    fn record_uptime(&self, uptime: Duration);
}

/// Metrics sink that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl TransportMetrics for NoOpMetrics {
    fn inc_messages_received(&self, _topic: &str, _partition: i32) {}
    fn inc_messages_processed(&self, _topic: &str, _status: ProcessingStatus) {}
    fn record_processing_time(&self, _topic: &str, _duration: Duration) {}
    fn inc_retry_attempts(&self, _topic: &str, _attempt: u32) {}
    fn inc_messages_sent(&self, _topic: &str, _status: PublishStatus) {}
    fn record_publish_time(&self, _topic: &str, _duration: Duration) {}
    fn inc_dlq_messages(&self, _original_topic: &str, _dlq_topic: &str) {}
    fn set_active_consumers(&self, _count: i64) {}
    fn set_active_producers(&self, _count: i64) {}
    fn record_uptime(&self, _uptime: Duration) {}
}

/// Prometheus implementation of [`TransportMetrics`].
///
/// Metric names are derived from the provided service name:
///   - `{service}_messages_received_total`            {topic, partition}
///   - `{service}_messages_processed_total`           {topic, status}
///   - `{service}_message_processing_duration_seconds` {topic}
///   - `{service}_retry_attempts_total`               {topic, attempt}
///   - `{service}_messages_sent_total`                {topic, status}
///   - `{service}_message_publish_duration_seconds`   {topic}
///   - `{service}_dlq_messages_total`                 {original_topic, dlq_topic}
///   - `{service}_active_consumers` / `_active_producers` / `_uptime_seconds`
///
/// All collectors are registered against the caller's [`Registry`] rather
/// than the process-global one.
pub struct PrometheusMetrics {
    messages_received: IntCounterVec,
    messages_processed: IntCounterVec,
    processing_time: HistogramVec,
    retry_attempts: IntCounterVec,
    messages_sent: IntCounterVec,
    publish_time: HistogramVec,
    dlq_messages: IntCounterVec,
    active_consumers: IntGauge,
    active_producers: IntGauge,
    uptime: Gauge,
    started_at: Instant,
}

impl PrometheusMetrics {
    pub fn new(service_name: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let service = if service_name.is_empty() {
            "kafka_transport"
        } else {
            service_name
        };

        let messages_received = IntCounterVec::new(
            Opts::new(
                format!("{service}_messages_received_total"),
                "Total number of messages received from Kafka topics",
            ),
            &["topic", "partition"],
        )?;
        let messages_processed = IntCounterVec::new(
            Opts::new(
                format!("{service}_messages_processed_total"),
                "Total number of messages processed",
            ),
            &["topic", "status"],
        )?;
        let processing_time = HistogramVec::new(
            HistogramOpts::new(
                format!("{service}_message_processing_duration_seconds"),
                "Time spent processing messages",
            ),
            &["topic"],
        )?;
        let retry_attempts = IntCounterVec::new(
            Opts::new(
                format!("{service}_retry_attempts_total"),
                "Total number of retry attempts",
            ),
            &["topic", "attempt"],
        )?;
        let messages_sent = IntCounterVec::new(
            Opts::new(
                format!("{service}_messages_sent_total"),
                "Total number of messages sent to Kafka topics",
            ),
            &["topic", "status"],
        )?;
        let publish_time = HistogramVec::new(
            HistogramOpts::new(
                format!("{service}_message_publish_duration_seconds"),
                "Time spent publishing messages",
            ),
            &["topic"],
        )?;
        let dlq_messages = IntCounterVec::new(
            Opts::new(
                format!("{service}_dlq_messages_total"),
                "Total number of messages sent to the Dead Letter Queue",
            ),
            &["original_topic", "dlq_topic"],
        )?;
        let active_consumers = IntGauge::new(
            format!("{service}_active_consumers"),
            "Number of active consumers",
        )?;
        let active_producers = IntGauge::new(
            format!("{service}_active_producers"),
            "Number of active producers",
        )?;
        let uptime = Gauge::new(
            format!("{service}_uptime_seconds"),
            "Transport uptime in seconds",
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(processing_time.clone()))?;
        registry.register(Box::new(retry_attempts.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(publish_time.clone()))?;
        registry.register(Box::new(dlq_messages.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;
        registry.register(Box::new(active_producers.clone()))?;
        registry.register(Box::new(uptime.clone()))?;

        Ok(Self {
            messages_received,
            messages_processed,
            processing_time,
            retry_attempts,
            messages_sent,
            publish_time,
            dlq_messages,
            active_consumers,
            active_producers,
            uptime,
            started_at: Instant::now(),
        })
    }

    /// Refresh the uptime gauge every 10 seconds until the token is
    /// cancelled. Spawn this from the composition root alongside the
    /// consumers it observes.
    pub async fn run_uptime_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    self.uptime.set(self.started_at.elapsed().as_secs_f64());
                }
            }
        }
    }
}

impl TransportMetrics for PrometheusMetrics {
    fn inc_messages_received(&self, topic: &str, partition: i32) {
        self.messages_received
            .with_label_values(&[topic, &partition.to_string()])
            .inc();
    }

    fn inc_messages_processed(&self, topic: &str, status: ProcessingStatus) {
        self.messages_processed
            .with_label_values(&[topic, status.as_str()])
            .inc();
    }

    fn record_processing_time(&self, topic: &str, duration: Duration) {
        self.processing_time
            .with_label_values(&[topic])
            .observe(duration.as_secs_f64());
    }

    fn inc_retry_attempts(&self, topic: &str, attempt: u32) {
        self.retry_attempts
            .with_label_values(&[topic, &attempt.to_string()])
            .inc();
    }

    fn inc_messages_sent(&self, topic: &str, status: PublishStatus) {
        self.messages_sent
            .with_label_values(&[topic, status.as_str()])
            .inc();
    }

    fn record_publish_time(&self, topic: &str, duration: Duration) {
        self.publish_time
            .with_label_values(&[topic])
            .observe(duration.as_secs_f64());
    }

    fn inc_dlq_messages(&self, original_topic: &str, dlq_topic: &str) {
        self.dlq_messages
            .with_label_values(&[original_topic, dlq_topic])
            .inc();
    }

    fn set_active_consumers(&self, count: i64) {
        self.active_consumers.set(count);
    }

    fn set_active_producers(&self, count: i64) {
        self.active_producers.set(count);
    }

    fn record_uptime(&self, uptime: Duration) {
        self.uptime.set(uptime.as_secs_f64());
    }
}
