use relay_client::{ConfigError, ConnectionError, ConsumeError, DeliveryError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("invalid argument: {0}")]
    Args(String),

    #[error("{0}")]
    Connection(#[from] ConnectionError),

    #[error("publish: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("consume: {0}")]
    Consume(#[from] ConsumeError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("consumer did not catch up within {0}s")]
    Timeout(u64),
}
