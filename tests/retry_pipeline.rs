use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kafka_transport::{
    Envelope, EventPublisher, Handler, HandlerError, NoOpMetrics, Producer, RawMessage,
    ReliabilityConfig, RetryProcessor, TransportError,
};

#[derive(Clone)]
struct CapturedRecord {
    topic: String,
    key: Vec<u8>,
    value: Vec<u8>,
    headers: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct CapturingProducer {
    records: Mutex<Vec<CapturedRecord>>,
}

impl CapturingProducer {
    fn records(&self) -> Vec<CapturedRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Producer for CapturingProducer {
    async fn publish_with_headers(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> Result<(), TransportError> {
        self.records.lock().unwrap().push(CapturedRecord {
            topic: topic.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
            headers: headers.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct RejectingHandler;

#[async_trait]
impl Handler for RejectingHandler {
    async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
        Err(HandlerError::retryable(anyhow::anyhow!("downstream unavailable")))
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct OrderCreated {
    order_id: u64,
    amount_cents: i64,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn reliability(retry_count: u32) -> ReliabilityConfig {
    ReliabilityConfig {
        retry_count,
        retry_backoff: Duration::from_millis(5),
        dlq_topic: "orders-dlq".to_string(),
        ..Default::default()
    }
}

fn header_str<'a>(record: &'a CapturedRecord, key: &str) -> Option<&'a str> {
    record
        .headers
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| std::str::from_utf8(v).unwrap())
}

#[tokio::test]
async fn publisher_wraps_payload_in_envelope_keyed_by_event_id() {
    init_tracing();
    let producer = Arc::new(CapturingProducer::default());
    let publisher = EventPublisher::new(producer.clone(), "orders");

    let payload = OrderCreated {
        order_id: 42,
        amount_cents: 1999,
    };
    publisher
        .publish("order.created", "evt-42", &payload)
        .await
        .unwrap();

    let records = producer.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.topic, "orders");
    assert_eq!(record.key, b"evt-42");

    let envelope = Envelope::from_bytes(&record.value).unwrap();
    assert_eq!(envelope.event_id, "evt-42");
    assert_eq!(envelope.event_type, "order.created");
    let decoded: OrderCreated = serde_json::from_str(envelope.payload.get()).unwrap();
    assert_eq!(decoded, payload);
}

#[tokio::test]
async fn publisher_generates_event_id_when_empty() {
    let producer = Arc::new(CapturingProducer::default());
    let publisher = EventPublisher::new(producer.clone(), "orders");

    publisher
        .publish("order.created", "", &OrderCreated { order_id: 1, amount_cents: 100 })
        .await
        .unwrap();

    let records = producer.records();
    let envelope = Envelope::from_bytes(&records[0].value).unwrap();
    assert!(Uuid::parse_str(&envelope.event_id).is_ok());
    assert_eq!(records[0].key, envelope.event_id.as_bytes());
}

#[tokio::test]
async fn publisher_serialization_failure_reaches_no_broker() {
    let producer = Arc::new(CapturingProducer::default());
    let publisher = EventPublisher::new(producer.clone(), "orders");

    // JSON object keys must be strings, so this payload cannot serialize
    let mut payload: HashMap<(u32, u32), &str> = HashMap::new();
    payload.insert((1, 2), "unrepresentable");

    let result = publisher.publish("order.created", "evt-1", &payload).await;

    assert!(matches!(result, Err(TransportError::Json(_))));
    assert!(producer.records().is_empty());
}

#[tokio::test]
async fn dlq_retry_count_accumulates_across_redeliveries() {
    init_tracing();
    let producer = Arc::new(CapturingProducer::default());
    let processor = RetryProcessor::new(reliability(1), producer.clone(), Arc::new(NoOpMetrics));

    let publish_producer = Arc::new(CapturingProducer::default());
    let publisher = EventPublisher::new(publish_producer.clone(), "orders");
    publisher
        .publish("order.created", "evt-7", &OrderCreated { order_id: 7, amount_cents: 1 })
        .await
        .unwrap();
    let wire = publish_producer.records().remove(0);

    let first_delivery = RawMessage {
        topic: "orders".to_string(),
        partition: 0,
        offset: 10,
        key: wire.key.clone(),
        value: wire.value.clone(),
        headers: vec![],
    };
    processor
        .process_with_retry(&CancellationToken::new(), &first_delivery, &RejectingHandler)
        .await
        .unwrap();

    let dlq_records = producer.records();
    assert_eq!(dlq_records.len(), 1);
    let first_dlq = &dlq_records[0];
    assert_eq!(first_dlq.topic, "orders-dlq");
    assert_eq!(header_str(first_dlq, "x-retry-count"), Some("1"));
    // the original record survives the escalation byte for byte
    assert_eq!(first_dlq.value, wire.value);
    assert_eq!(first_dlq.key, wire.key);

    // replay from the DLQ: the recorded count seeds the next accumulation
    let second_delivery = RawMessage {
        topic: "orders".to_string(),
        partition: 0,
        offset: 11,
        key: first_dlq.key.clone(),
        value: first_dlq.value.clone(),
        headers: first_dlq.headers.clone(),
    };
    processor
        .process_with_retry(&CancellationToken::new(), &second_delivery, &RejectingHandler)
        .await
        .unwrap();

    let dlq_records = producer.records();
    assert_eq!(dlq_records.len(), 2);
    let second_dlq = &dlq_records[1];
    assert_eq!(header_str(second_dlq, "x-retry-count"), Some("2"));
    // still exactly one retry header after the replay
    let retry_headers = second_dlq
        .headers
        .iter()
        .filter(|(k, _)| k == "x-retry-count")
        .count();
    assert_eq!(retry_headers, 1);
    assert_eq!(header_str(second_dlq, "x-original-topic"), Some("orders"));
    // non-retry headers from the first escalation are carried along, so the
    // coordinates of the latest failure are the last occurrence
    let last_offset = second_dlq
        .headers
        .iter()
        .rev()
        .find(|(k, _)| k == "x-original-offset")
        .map(|(_, v)| std::str::from_utf8(v).unwrap());
    assert_eq!(last_offset, Some("11"));
}
