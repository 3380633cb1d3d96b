use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::producer::Producer;

/// Wraps domain payloads in an [`Envelope`] and publishes them keyed by
/// event ID, so all records for one event land on the same partition.
pub struct EventPublisher {
    producer: Arc<dyn Producer>,
    topic: String,
}

impl EventPublisher {
    pub fn new(producer: Arc<dyn Producer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    /// Publish `payload` as an event of type `event_type`.
    ///
    /// An empty `event_id` gets a generated UUID. Payload serialization
    /// failure is terminal; nothing reaches the broker.
    pub async fn publish<P>(
        &self,
        event_type: &str,
        event_id: &str,
        payload: &P,
    ) -> Result<(), TransportError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::value::to_raw_value(payload).map_err(|err| {
            error!(error = %err, event_type = %event_type, "Failed to serialize event payload");
            TransportError::Json(err)
        })?;

        let event_id = if event_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            event_id.to_string()
        };

        let envelope = Envelope {
            event_id,
            event_type: event_type.to_string(),
            occurred_at: Utc::now(),
            payload,
        };
        let value = envelope.to_bytes()?;

        debug!(
            event_id = %envelope.event_id,
            event_type = %event_type,
            topic = %self.topic,
            "Publishing event"
        );

        self.producer
            .publish(&self.topic, envelope.event_id.as_bytes(), &value)
            .await
    }
}
