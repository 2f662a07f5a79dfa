use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Header carrying the payload media type.
pub const CONTENT_TYPE: &str = "content-type";

/// Media type set by [`Message::json`].
pub const APPLICATION_JSON: &str = "application/json";

// ════════════════════════════════════════════════════════════════
//  Message
// ════════════════════════════════════════════════════════════════

/// An immutable message.
///
/// Built with the `with_*` methods before it is handed to a publisher. The
/// publisher stamps the publish timestamp and sequence; after that the value
/// is only read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    headers: HashMap<String, Vec<u8>>,
    timestamp: u64,
    sequence: u64,
    ttl_ms: Option<u64>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            payload: payload.into(),
            headers: HashMap::new(),
            timestamp: 0,
            sequence: 0,
            ttl_ms: None,
        }
    }

    /// JSON payload with `content-type: application/json`.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(payload).with_header(CONTENT_TYPE, APPLICATION_JSON))
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Expire the message if it is still undelivered `ttl` after publish.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    /// Set the publish timestamp (ms). Called by the publisher at send time.
    pub fn with_timestamp(mut self, ts_ms: u64) -> Self {
        self.timestamp = ts_ms;
        self
    }

    /// Set the per-publisher send sequence. Called by the publisher at send time.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    pub fn headers(&self) -> &HashMap<String, Vec<u8>> {
        &self.headers
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Strictly increasing within one publisher, starting at 1. 0 = not published.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Whether the TTL has elapsed at `now_ms`. Messages without TTL never expire.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now_ms.saturating_sub(self.timestamp) > ttl,
            None => false,
        }
    }

    /// Decode the payload as JSON, regardless of the declared content type.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

// ════════════════════════════════════════════════════════════════
//  Identifiers
// ════════════════════════════════════════════════════════════════

/// A partition of a topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub topic: String,
    pub partition: u32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Position of a message in the log: unique per broker.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub partition: PartitionId,
    pub offset: u64,
}

impl MessageId {
    pub fn new(partition: PartitionId, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A message read back from a partition together with its offset.
#[derive(Clone, Debug)]
pub struct FetchedRecord {
    pub offset: u64,
    pub message: Message,
}

/// A message handed to a consumer handler.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub id: MessageId,
    pub message: Message,
    /// 1 on first delivery, +1 per redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn partition(&self) -> &PartitionId {
        &self.id.partition
    }

    pub fn offset(&self) -> u64 {
        self.id.offset
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
