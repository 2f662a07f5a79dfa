use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relay_api::dead_letter::{
    HEADER_DELIVERY_COUNT, HEADER_ORIGINAL_OFFSET, HEADER_ORIGINAL_PARTITION, HEADER_REASON,
};
use relay_api::{DeadLetter, DeadLetterReason, Delivery, Message, TransportError};

use crate::error::DeliveryError;
use crate::publisher::{PublishOptions, Publisher};

/// Dead-letter sink that only logs. Default for [`Consumer`](crate::Consumer).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetter;

impl DeadLetter for LogDeadLetter {
    fn dead_letter<'a>(
        &'a self,
        delivery: &'a Delivery,
        reason: &'a DeadLetterReason,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            tracing::warn!(
                message = %delivery.id,
                reason = %reason,
                delivery_count = delivery.delivery_count,
                payload_len = delivery.message.payload().len(),
                "dead letter"
            );
            Ok(())
        })
    }
}

/// Republishes dead letters to `<topic><suffix>`.
///
/// The copy keeps key, payload and headers, drops the TTL, and carries the
/// reason, delivery count and original position as `x-*` headers.
pub struct TopicDeadLetter {
    publisher: Arc<Publisher>,
    suffix: String,
}

impl TopicDeadLetter {
    pub fn new(publisher: Arc<Publisher>, suffix: impl Into<String>) -> Self {
        Self {
            publisher,
            suffix: suffix.into(),
        }
    }

    pub fn target(&self, topic: &str) -> String {
        format!("{topic}{}", self.suffix)
    }
}

/// Copy of `delivery` as published to the dead-letter topic.
pub fn dead_letter_message(delivery: &Delivery, reason: &DeadLetterReason) -> Message {
    let original = &delivery.message;
    let mut message = Message::new(original.payload().to_vec());
    if let Some(key) = original.key() {
        message = message.with_key(key.to_vec());
    }
    for (name, value) in original.headers() {
        message = message.with_header(name.clone(), value.clone());
    }
    message
        .with_header(HEADER_REASON, reason.label())
        .with_header(HEADER_DELIVERY_COUNT, delivery.delivery_count.to_string())
        .with_header(HEADER_ORIGINAL_OFFSET, delivery.offset().to_string())
        .with_header(HEADER_ORIGINAL_PARTITION, delivery.partition().to_string())
}

impl DeadLetter for TopicDeadLetter {
    fn dead_letter<'a>(
        &'a self,
        delivery: &'a Delivery,
        reason: &'a DeadLetterReason,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.target(&delivery.partition().topic);
            let message = dead_letter_message(delivery, reason);
            let receipt = self
                .publisher
                .publish(&target, message, PublishOptions::new().mandatory(true))
                .await
                .await
                .map_err(|e| match e {
                    DeliveryError::Unroutable(m) => {
                        TransportError::unroutable(m).with_context(format!("dead-letter topic '{target}'"))
                    }
                    other => TransportError::io(other.to_string()),
                })?;
            tracing::debug!(message = %delivery.id, target = %target, offset = ?receipt.offset(), "dead letter published");
            Ok(())
        })
    }
}
