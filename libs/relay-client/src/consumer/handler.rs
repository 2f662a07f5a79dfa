use std::future::Future;
use std::pin::Pin;

use relay_api::Delivery;

/// Handler verdict for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// `requeue = true`: redeliver (bounded by `max_redeliveries`).
    /// `requeue = false`: dead-letter now.
    Nack { requeue: bool },
}

impl Outcome {
    pub fn retry() -> Self {
        Outcome::Nack { requeue: true }
    }

    pub fn reject() -> Self {
        Outcome::Nack { requeue: false }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<Outcome, HandlerError>;

/// Per-message handler.
///
/// An `Err` (or a panic) counts as `Nack { requeue: true }` until the poison
/// threshold is reached. Closures `Fn(Delivery) -> impl Future<Output = HandlerResult>`
/// implement this trait.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, delivery: Delivery) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, delivery: Delivery) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>> {
        Box::pin(self(delivery))
    }
}

/// Batch handler: up to `batch_size` deliveries of one partition, in offset order.
///
/// Returns one outcome per delivery, by position. Missing outcomes count as
/// `Nack { requeue: true }`; an `Err` applies to the whole batch.
pub trait BatchHandler: Send + Sync + 'static {
    fn handle_batch(
        &self,
        batch: Vec<Delivery>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Outcome>, HandlerError>> + Send + 'static>>;
}

impl<F, Fut> BatchHandler for F
where
    F: Fn(Vec<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Outcome>, HandlerError>> + Send + 'static,
{
    fn handle_batch(
        &self,
        batch: Vec<Delivery>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Outcome>, HandlerError>> + Send + 'static>> {
        Box::pin(self(batch))
    }
}
