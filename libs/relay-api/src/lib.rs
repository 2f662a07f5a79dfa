pub mod dead_letter;
pub mod error;
pub mod message;
pub mod offset;
pub mod partition;
pub mod transport;

use std::time::{SystemTime, UNIX_EPOCH};

pub use dead_letter::{DeadLetter, DeadLetterReason};
pub use error::{ErrorKind, TransportError};
pub use message::{
    APPLICATION_JSON, CONTENT_TYPE, Delivery, FetchedRecord, Message, MessageId, PartitionId,
};
pub use offset::{Cursor, OffsetError, OffsetStore, OffsetStoreFactory, RegressionError};
pub use partition::{FixedPartitioner, HashPartitioner, Partitioner, fnv1a};
pub use transport::{ConnectionState, Connector, RecordStream, Transport};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
