use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::message::PartitionId;

/// Last confirmed-processed position of a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub partition: PartitionId,
    pub offset: u64,
}

/// An attempt to move a cursor backward. Always a logic error in the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cursor regression on {partition}: current {current}, attempted {attempted}")]
pub struct RegressionError {
    pub partition: PartitionId,
    pub current: u64,
    pub attempted: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OffsetError {
    #[error(transparent)]
    Regression(#[from] RegressionError),
    #[error("offset storage: {0}")]
    Storage(#[from] TransportError),
}

/// Cursor storage.
///
/// `advance` must be monotonic per partition: an offset lower than the stored
/// cursor is rejected with [`RegressionError`] and leaves the cursor as is.
/// Re-advancing to the current offset is accepted.
pub trait OffsetStore: Send + Sync {
    /// Stored cursor of `partition`, `None` if nothing was committed yet.
    fn load<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>, OffsetError>> + Send + 'a>>;

    fn advance<'a>(
        &'a self,
        partition: &'a PartitionId,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OffsetError>> + Send + 'a>>;

    /// All stored cursors, ordered by partition.
    fn cursors(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Cursor>, OffsetError>> + Send + '_>>;

    /// Make previously advanced cursors durable. Default: nothing to do.
    fn flush(&self) -> Pin<Box<dyn Future<Output = Result<(), OffsetError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Creates an offset store from the JSON form of its config table.
///
/// The client does not know concrete stores; it resolves a factory by the
/// `offsets.store` name and hands it the `offsets.config` table.
pub trait OffsetStoreFactory: Send + Sync {
    fn create(&self, config_json: &str) -> Result<Arc<dyn OffsetStore>, TransportError>;
}

/// Shared check used by store implementations.
pub fn check_advance(
    partition: &PartitionId,
    current: Option<u64>,
    attempted: u64,
) -> Result<(), RegressionError> {
    match current {
        Some(current) if attempted < current => Err(RegressionError {
            partition: partition.clone(),
            current,
            attempted,
        }),
        _ => Ok(()),
    }
}
