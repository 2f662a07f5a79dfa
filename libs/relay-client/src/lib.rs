//! Надёжный publish/consume поверх любого [`relay_api::Transport`].
//!
//! - [`ConnectionManager`]: одно разделяемое соединение, переподключение с backoff
//! - [`Publisher`]: окно неподтверждённых отправок, порядок по партиции
//! - [`Consumer`]: pull/push доставка, ack/nack, redelivery, dead-letter, курсоры

pub mod backoff;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod publisher;
pub mod tracker;

use std::sync::Arc;

use relay_api::{OffsetStore, OffsetStoreFactory};

pub use backoff::Backoff;
pub use config::{
    AckMode, BackoffConfig, ConsumerConfig, DeadLetterConfig, DeadLetterMode, DeliveryMode,
    MAX_IN_FLIGHT, OffsetStoreKind, OffsetsConfig, PublisherConfig, RelayConfig, StartPosition,
};
pub use connection::{ConnectionManager, Lease};
pub use consumer::{
    BatchHandler, Consumer, HandlerError, HandlerResult, MessageHandler, Outcome,
    SubscribeOptions, Subscription, SubscriptionStats,
};
pub use dead_letter::{LogDeadLetter, TopicDeadLetter};
pub use error::{
    ConfigError, ConnectionError, ConsumeError, DeliveryError, PoisonMessageError, SessionError,
};
pub use publisher::{DeliveryFuture, DeliveryReceipt, PublishOptions, Publisher};
pub use tracker::{AckTracker, DeliveryState};

/// Build the offset store named by `[offsets]`.
///
/// `{group}` in the file store path is replaced by `group_id`, so that
/// consumer groups keep separate cursor files.
pub fn open_offset_store(
    config: &OffsetsConfig,
    group_id: &str,
) -> Result<Arc<dyn OffsetStore>, ConfigError> {
    let mut config = config.clone();
    if let Some(toml::Value::String(path)) = config.config.get_mut("path") {
        *path = path.replace("{group}", group_id);
    }
    let factory: Box<dyn OffsetStoreFactory> = match config.store {
        OffsetStoreKind::Memory => Box::new(offset_store_memory::MemoryOffsetStoreFactory),
        OffsetStoreKind::File => Box::new(offset_store_file::FileOffsetStoreFactory),
    };
    let json = config.config_json()?;
    let store = factory.create(&json).map_err(ConfigError::OffsetStore)?;
    tracing::debug!(store = ?config.store, group = group_id, "offset store opened");
    Ok(store)
}
