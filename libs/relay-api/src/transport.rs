use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::TransportError;
use crate::message::{FetchedRecord, Message, PartitionId};

// ════════════════════════════════════════════════════════════════
//  Broker seam
// ════════════════════════════════════════════════════════════════
//
// The broker wire protocol is not part of this workspace. A broker client
// library (or the loopback broker used in tests) is plugged in behind these
// two traits. The API crate defines only the traits, without a tokio
// dependency.

/// Opens connections to a broker endpoint.
pub trait Connector: Send + Sync {
    /// Establish a new connection. Transient failures carry `ErrorKind::Io`;
    /// a malformed endpoint carries `ErrorKind::Config`.
    fn connect<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Transport>, TransportError>> + Send + 'a>>;
}

/// One live connection to a broker.
///
/// The broker is assumed to provide durable log storage per partition,
/// assign increasing offsets on append, and keep messages after they are read.
pub trait Transport: Send + Sync {
    /// Number of partitions of `topic`. Unknown topic → `ErrorKind::Unroutable`.
    fn partitions<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u32, TransportError>> + Send + 'a>>;

    /// Append a message and wait for the broker acknowledgment.
    /// Returns the offset assigned to the message.
    fn produce<'a>(
        &'a self,
        topic: &'a str,
        partition: u32,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<u64, TransportError>> + Send + 'a>>;

    /// Pull up to `max` records starting at `offset`.
    ///
    /// If nothing is available the call may wait up to `max_wait` for new data
    /// and then return an empty batch.
    fn fetch<'a>(
        &'a self,
        partition: &'a PartitionId,
        offset: u64,
        max: usize,
        max_wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FetchedRecord>, TransportError>> + Send + 'a>>;

    /// Offset the next appended message will receive (the log end).
    fn end_offset<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, TransportError>> + Send + 'a>>;

    /// Push delivery: the broker streams records from `offset` onward.
    /// `buffer` bounds the number of records in flight to the client.
    fn stream<'a>(
        &'a self,
        partition: &'a PartitionId,
        offset: u64,
        buffer: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn RecordStream>, TransportError>> + Send + 'a>>;

    /// Close the connection. Further calls fail with `ErrorKind::Closed`.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// Push-delivered records of one partition.
pub trait RecordStream: Send + Sync {
    /// Next record. `None` = stream ended (connection closed by the peer).
    #[allow(clippy::type_complexity)]
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<FetchedRecord, TransportError>>> + Send + '_>>;
}

// ════════════════════════════════════════════════════════════════
//  Connection state
// ════════════════════════════════════════════════════════════════

/// Observable lifecycle of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}
