use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Wire-level event wrapper.
///
/// Constructed at publish time, deserialized at consume time, never mutated.
/// The payload is kept as raw JSON so its bytes survive a round-trip
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub event_type: String,
    /// UTC timestamp of when the event occurred (RFC3339 on the wire).
    pub occurred_at: DateTime<Utc>,
    pub payload: Box<RawValue>,
}

impl Envelope {
    /// Decode an envelope from its JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode the envelope to its JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
