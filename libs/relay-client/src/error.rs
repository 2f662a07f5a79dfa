use std::time::Duration;

use relay_api::{MessageId, OffsetError, PartitionId, RegressionError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config (read): '{path}': {detail}")]
    Read { path: String, detail: String },

    #[error("config (parse): {0}")]
    Parse(String),

    #[error("config (invalid): {0}")]
    Invalid(String),

    #[error("config (offsets): {0}")]
    OffsetStore(TransportError),
}

/// The connection could not be (re)established.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect to '{endpoint}' failed after {attempts} attempts: {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last: TransportError,
    },

    #[error("connect to '{endpoint}' rejected: {cause}")]
    Fatal {
        endpoint: String,
        cause: TransportError,
    },

    #[error("connection manager closed")]
    Closed,
}

/// Error of a unit of work run through `ConnectionManager::with_connection`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a publish was not acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no broker acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("unroutable: {0}")]
    Unroutable(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl From<SessionError> for DeliveryError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Transport(t) if t.kind() == relay_api::ErrorKind::Unroutable => {
                DeliveryError::Unroutable(t.message().to_string())
            }
            other => DeliveryError::ConnectionLost(other.to_string()),
        }
    }
}

/// A message that kept failing in the handler. Logged and dead-lettered,
/// never returned to the caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("poison message {id} after {delivery_count} deliveries: {error}")]
pub struct PoisonMessageError {
    pub id: MessageId,
    pub delivery_count: u32,
    pub error: String,
}

/// Terminal failure of a subscription.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Regression(#[from] RegressionError),

    #[error("offset store: {0}")]
    OffsetStore(TransportError),

    #[error("transport: {0}")]
    Transport(TransportError),

    #[error("dead-letter of {id} failed: {cause}")]
    DeadLetter { id: MessageId, cause: TransportError },

    #[error("partition worker {0} panicked")]
    WorkerPanicked(PartitionId),
}

impl From<OffsetError> for ConsumeError {
    fn from(e: OffsetError) -> Self {
        match e {
            OffsetError::Regression(r) => ConsumeError::Regression(r),
            OffsetError::Storage(t) => ConsumeError::OffsetStore(t),
        }
    }
}

impl From<SessionError> for ConsumeError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Connection(c) => ConsumeError::Connection(c),
            SessionError::Transport(t) => ConsumeError::Transport(t),
        }
    }
}
