use std::str::FromStr;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use tracing::info;

/// Connection and behavior settings for the Kafka transport.
///
/// Loadable from environment variables with sensible defaults via
/// [`KafkaConfig::from_env`].
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Comma-separated broker list (e.g. "kafka1:9092,kafka2:9092").
    pub brokers: String,
    /// SSL/TLS enabled for the broker connection.
    pub ssl_enabled: bool,
    /// Path to a CA certificate file (for self-signed certificates).
    pub ssl_ca_location: Option<String>,
    /// SASL credentials; `None` disables authentication.
    pub sasl: Option<SaslConfig>,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub reliability: ReliabilityConfig,
}

#[derive(Clone, Debug)]
pub struct SaslConfig {
    /// SASL mechanism (e.g. "SCRAM-SHA-512", "PLAIN").
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct ProducerConfig {
    /// Default topic used when none is provided to publish.
    pub topic: String,
    /// "zstd" | "snappy" | "gzip" | "lz4" | "none"
    pub compression: String,
    /// "all" | "1" | "0" | "-1"
    pub acks: String,
    pub linger_ms: u32,
    pub batch_size: u32,
    pub max_in_flight: u32,
    pub retries: u32,
    pub request_timeout_ms: u32,
    pub delivery_timeout_ms: u32,
    pub enable_idempotence: bool,
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Consumer group ID shared by cooperating workers.
    pub group_id: String,
    pub min_fetch_bytes: u32,
    pub max_fetch_bytes: u32,
    pub fetch_max_wait_ms: u32,
    /// "earliest" | "latest"
    pub auto_offset_reset: String,
    pub session_timeout_ms: u32,
    pub heartbeat_interval_ms: u32,
    /// Upper bound on a single read so the loop observes shutdown promptly
    /// even when the topic is idle.
    pub poll_timeout: Duration,
    /// How long `close()` waits for the read loop before forcing shutdown.
    pub shutdown_grace: Duration,
}

/// Retry and dead-letter-queue policy.
#[derive(Clone, Debug)]
pub struct ReliabilityConfig {
    /// Maximum number of retries after the first attempt.
    pub retry_count: u32,
    /// Base delay between retries.
    pub retry_backoff: Duration,
    /// Exponential growth factor applied per attempt (>= 1).
    pub retry_backoff_multiplier: f64,
    /// Upper bound for the computed backoff.
    pub max_retry_backoff: Duration,
    /// Enable routing of exhausted/poison messages to the DLQ topic.
    pub dlq_enabled: bool,
    /// Target topic for DLQ messages. Empty degrades DLQ delivery to
    /// "log, drop and surface the original error".
    pub dlq_topic: String,
    /// Header carrying the accumulated retry count.
    pub dlq_retry_header: String,
    /// Header carrying the final error message.
    pub dlq_error_header: String,
    /// Header carrying the failure timestamp (RFC3339 UTC).
    pub dlq_timestamp_header: String,
    /// Bound on a single DLQ publish, independent of the caller's
    /// cancellation so escalation is not starved by the same shutdown that
    /// triggered draining.
    pub dlq_publish_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            compression: "snappy".to_string(),
            acks: "all".to_string(),
            linger_ms: 10,
            batch_size: 16384,
            max_in_flight: 5,
            retries: 10,
            request_timeout_ms: 30_000,
            delivery_timeout_ms: 120_000,
            enable_idempotence: true,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "kafka-transport-workers".to_string(),
            min_fetch_bytes: 1,
            max_fetch_bytes: 1_048_576,
            fetch_max_wait_ms: 500,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            poll_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_backoff: Duration::from_secs(1),
            retry_backoff_multiplier: 2.0,
            max_retry_backoff: Duration::from_secs(30),
            dlq_enabled: true,
            dlq_topic: String::new(),
            dlq_retry_header: "x-retry-count".to_string(),
            dlq_error_header: "x-error-message".to_string(),
            dlq_timestamp_header: "x-failed-timestamp".to_string(),
            dlq_publish_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl: None,
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

impl ReliabilityConfig {
    /// Backoff before the retry that follows `attempt` (0-based):
    /// `retry_backoff * retry_backoff_multiplier^attempt`, capped at
    /// `max_retry_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let mut backoff = self.retry_backoff;
        for _ in 0..attempt {
            backoff = backoff.mul_f64(self.retry_backoff_multiplier);
            if backoff > self.max_retry_backoff {
                return self.max_retry_backoff;
            }
        }
        backoff.min(self.max_retry_backoff)
    }
}

impl KafkaConfig {
    /// Load configuration from `KAFKA_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Self {
        let sasl = match (
            std::env::var("KAFKA_SASL_MECHANISM").ok(),
            std::env::var("KAFKA_SASL_USERNAME").ok(),
            std::env::var("KAFKA_SASL_PASSWORD").ok(),
        ) {
            (Some(mechanism), Some(username), Some(password)) => Some(SaslConfig {
                mechanism,
                username,
                password,
            }),
            _ => None,
        };

        Self {
            brokers: env_string("KAFKA_BROKERS", "localhost:9092"),
            ssl_enabled: env_parse("KAFKA_SSL_ENABLED", false),
            ssl_ca_location: std::env::var("KAFKA_SSL_CA_LOCATION").ok(),
            sasl,
            producer: ProducerConfig {
                topic: env_string("KAFKA_PRODUCER_TOPIC", ""),
                compression: env_string("KAFKA_PRODUCER_COMPRESSION", "snappy"),
                acks: env_string("KAFKA_PRODUCER_ACKS", "all"),
                linger_ms: env_parse("KAFKA_PRODUCER_LINGER_MS", 10),
                batch_size: env_parse("KAFKA_PRODUCER_BATCH_SIZE", 16384),
                max_in_flight: env_parse("KAFKA_PRODUCER_MAX_IN_FLIGHT", 5),
                retries: env_parse("KAFKA_PRODUCER_RETRIES", 10),
                request_timeout_ms: env_parse("KAFKA_PRODUCER_REQUEST_TIMEOUT_MS", 30_000),
                delivery_timeout_ms: env_parse("KAFKA_PRODUCER_DELIVERY_TIMEOUT_MS", 120_000),
                enable_idempotence: env_parse("KAFKA_PRODUCER_ENABLE_IDEMPOTENCE", true),
            },
            consumer: ConsumerConfig {
                group_id: env_string("KAFKA_CONSUMER_GROUP", "kafka-transport-workers"),
                min_fetch_bytes: env_parse("KAFKA_CONSUMER_MIN_FETCH_BYTES", 1),
                max_fetch_bytes: env_parse("KAFKA_CONSUMER_MAX_FETCH_BYTES", 1_048_576),
                fetch_max_wait_ms: env_parse("KAFKA_CONSUMER_FETCH_MAX_WAIT_MS", 500),
                auto_offset_reset: env_string("KAFKA_CONSUMER_AUTO_OFFSET_RESET", "earliest"),
                session_timeout_ms: env_parse("KAFKA_CONSUMER_SESSION_TIMEOUT_MS", 30_000),
                heartbeat_interval_ms: env_parse("KAFKA_CONSUMER_HEARTBEAT_INTERVAL_MS", 3_000),
                poll_timeout: Duration::from_millis(env_parse(
                    "KAFKA_CONSUMER_POLL_TIMEOUT_MS",
                    5_000u64,
                )),
                shutdown_grace: Duration::from_millis(env_parse(
                    "KAFKA_CONSUMER_SHUTDOWN_GRACE_MS",
                    30_000u64,
                )),
            },
            reliability: ReliabilityConfig {
                retry_count: env_parse("KAFKA_RETRY_COUNT", 3),
                retry_backoff: Duration::from_millis(env_parse("KAFKA_RETRY_BACKOFF_MS", 1_000u64)),
                retry_backoff_multiplier: env_parse("KAFKA_RETRY_BACKOFF_MULTIPLIER", 2.0),
                max_retry_backoff: Duration::from_millis(env_parse(
                    "KAFKA_MAX_RETRY_BACKOFF_MS",
                    30_000u64,
                )),
                dlq_enabled: env_parse("KAFKA_DLQ_ENABLED", true),
                dlq_topic: env_string("KAFKA_DLQ_TOPIC", ""),
                dlq_retry_header: env_string("KAFKA_DLQ_RETRY_HEADER", "x-retry-count"),
                dlq_error_header: env_string("KAFKA_DLQ_ERROR_HEADER", "x-error-message"),
                dlq_timestamp_header: env_string("KAFKA_DLQ_TIMESTAMP_HEADER", "x-failed-timestamp"),
                dlq_publish_timeout: Duration::from_millis(env_parse(
                    "KAFKA_DLQ_PUBLISH_TIMEOUT_MS",
                    10_000u64,
                )),
            },
        }
    }
}

/// Base `rdkafka` client configuration shared by producers and consumers.
///
/// Handles bootstrap servers, SSL/TLS and SASL authentication so both sides
/// of the transport are configured consistently.
pub fn base_client_config(cfg: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &cfg.brokers);
    client_config.set("security.protocol", "plaintext");

    if cfg.ssl_enabled {
        info!("Enabling SSL/TLS for Kafka connection");
        client_config.set("security.protocol", "ssl");
    }

    if let Some(ca_location) = &cfg.ssl_ca_location {
        client_config.set("ssl.ca.location", ca_location);
    }

    if let Some(sasl) = &cfg.sasl {
        info!(sasl_mechanism = %sasl.mechanism, "Configuring SASL authentication");
        client_config
            .set("sasl.mechanism", &sasl.mechanism)
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);

        if cfg.ssl_enabled {
            client_config.set("security.protocol", "sasl_ssl");
        } else {
            client_config.set("security.protocol", "sasl_plaintext");
        }
    }

    client_config
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
