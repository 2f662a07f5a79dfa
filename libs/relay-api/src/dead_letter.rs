use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::error::TransportError;
use crate::message::Delivery;

/// Header names attached to dead-lettered messages.
pub const HEADER_REASON: &str = "x-dead-letter-reason";
pub const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";
pub const HEADER_ORIGINAL_OFFSET: &str = "x-original-offset";
pub const HEADER_ORIGINAL_PARTITION: &str = "x-original-partition";

/// Why a message left the redelivery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Nacked with requeue after `max_redeliveries` deliveries.
    MaxRedeliveries,
    /// Nacked without requeue.
    Rejected,
    /// The handler kept failing (error or panic) until the poison threshold.
    Poison { error: String },
    /// Received after its TTL elapsed; the handler was not invoked.
    TtlElapsed,
}

impl DeadLetterReason {
    /// Short stable label, used as the `x-dead-letter-reason` header value.
    pub fn label(&self) -> &'static str {
        match self {
            DeadLetterReason::MaxRedeliveries => "max_redeliveries",
            DeadLetterReason::Rejected => "rejected",
            DeadLetterReason::Poison { .. } => "poison",
            DeadLetterReason::TtlElapsed => "ttl_elapsed",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::Poison { error } => write!(f, "poison: {error}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Side channel for messages removed from the redelivery cycle.
///
/// Called at most once per message. An error is retried by the consumer with
/// backoff; a message is not committed until its dead-letter call succeeded.
pub trait DeadLetter: Send + Sync {
    fn dead_letter<'a>(
        &'a self,
        delivery: &'a Delivery,
        reason: &'a DeadLetterReason,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;
}
