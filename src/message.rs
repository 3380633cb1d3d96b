use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::Message;

/// Snapshot of a broker-native record.
///
/// Owned by the consumer for the duration of one processing cycle so the
/// retry path can inspect headers and rebuild the record for DLQ routing
/// without borrowing from the rdkafka client.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Ordered list of (key, value) header pairs.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RawMessage {
    pub(crate) fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| {
                        (
                            h.key.to_string(),
                            h.value.map(|v| v.to_vec()).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()).unwrap_or_default(),
            value: msg.payload().map(|v| v.to_vec()).unwrap_or_default(),
            headers,
        }
    }

    /// Value of the first header with the given key, if present.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}
