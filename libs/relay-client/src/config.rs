use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

// ════════════════════════════════════════════════════════════════
//  Enums
// ════════════════════════════════════════════════════════════════

/// Where a new subscription starts reading a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// From the first retained offset.
    Earliest,
    /// Only messages appended after the subscription started.
    Latest,
    /// Resume after the stored cursor; `Earliest` when nothing is stored.
    #[default]
    #[serde(alias = "cursor")]
    FromCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The worker long-polls `fetch`.
    #[default]
    Pull,
    /// The broker streams records, bounded by `prefetch`.
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The handler outcome decides Ack/Nack.
    #[default]
    Manual,
    /// Ack on delivery, before the handler runs (at-most-once processing).
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OffsetStoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterMode {
    /// Log the message and drop it.
    #[default]
    Log,
    /// Republish to `<topic><suffix>`.
    Topic,
}

// ════════════════════════════════════════════════════════════════
//  Sections
// ════════════════════════════════════════════════════════════════

fn default_endpoint() -> String {
    "loopback://local".to_string()
}
fn default_base_ms() -> u64 {
    100
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    5
}
/// Upper bound of `publisher.max_in_flight`.
pub const MAX_IN_FLIGHT: u32 = 1 << 20;

fn default_max_in_flight() -> usize {
    256
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_group_id() -> String {
    "default".to_string()
}
fn default_prefetch() -> usize {
    64
}
fn default_batch_size() -> usize {
    16
}
fn default_max_redeliveries() -> u32 {
    5
}
fn default_poison_threshold() -> u32 {
    3
}
fn default_drain_timeout_ms() -> u64 {
    5_000
}
fn default_poll_wait_ms() -> u64 {
    500
}
fn default_dlq_suffix() -> String {
    ".dlq".to_string()
}

/// Reconnect backoff: `base_ms * multiplier^n`, capped at `max_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Connect attempts before a fatal `ConnectionError`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    /// Unacknowledged sends allowed before `publish` suspends.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Default per-send deadline.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Default for `PublishOptions::mandatory`.
    #[serde(default = "default_true")]
    pub mandatory: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            timeout_ms: default_timeout_ms(),
            mandatory: default_true(),
        }
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub start_position: StartPosition,
    /// Records fetched ahead of the handler per partition.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Upper bound of a batch passed to a batch handler.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default)]
    pub ack_mode: AckMode,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Handler failures (error or panic) tolerated before a message is treated as poison.
    #[serde(default = "default_poison_threshold")]
    pub poison_threshold: u32,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            start_position: StartPosition::default(),
            prefetch: default_prefetch(),
            batch_size: default_batch_size(),
            delivery: DeliveryMode::default(),
            ack_mode: AckMode::default(),
            max_redeliveries: default_max_redeliveries(),
            poison_threshold: default_poison_threshold(),
            drain_timeout_ms: default_drain_timeout_ms(),
            poll_wait_ms: default_poll_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct OffsetsConfig {
    #[serde(default)]
    pub store: OffsetStoreKind,
    /// Store-specific table, handed to the store factory as JSON.
    #[serde(default)]
    pub config: toml::Table,
}

impl OffsetsConfig {
    pub fn config_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(&self.config)
            .map_err(|e| ConfigError::Invalid(format!("offsets.config: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadLetterConfig {
    #[serde(default)]
    pub mode: DeadLetterMode,
    #[serde(default = "default_dlq_suffix")]
    pub suffix: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            mode: DeadLetterMode::default(),
            suffix: default_dlq_suffix(),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  RelayConfig
// ════════════════════════════════════════════════════════════════

/// Client configuration, usually read from a TOML file.
///
/// ```toml
/// endpoint = "loopback://local"
///
/// [backoff]
/// base_ms = 100
/// max_attempts = 5
///
/// [consumer]
/// group_id = "billing"
/// start_position = "from_cursor"
///
/// [offsets]
/// store = "file"
/// config = { path = "data/billing.json" }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub offsets: OffsetsConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            backoff: BackoffConfig::default(),
            publisher: PublisherConfig::default(),
            consumer: ConsumerConfig::default(),
            offsets: OffsetsConfig::default(),
            dead_letter: DeadLetterConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        }

        if self.endpoint.trim().is_empty() {
            return invalid("endpoint must not be empty");
        }
        let b = &self.backoff;
        if b.base_ms == 0 {
            return invalid("backoff.base_ms must be > 0");
        }
        if b.multiplier.is_nan() || b.multiplier < 1.0 {
            return invalid("backoff.multiplier must be >= 1.0");
        }
        if b.max_ms < b.base_ms {
            return invalid("backoff.max_ms must be >= backoff.base_ms");
        }
        if b.max_attempts == 0 {
            return invalid("backoff.max_attempts must be > 0");
        }
        if self.publisher.max_in_flight == 0 {
            return invalid("publisher.max_in_flight must be > 0");
        }
        if self.publisher.max_in_flight > MAX_IN_FLIGHT as usize {
            return invalid(&format!("publisher.max_in_flight must be <= {MAX_IN_FLIGHT}"));
        }
        if self.publisher.timeout_ms == 0 {
            return invalid("publisher.timeout_ms must be > 0");
        }
        let c = &self.consumer;
        if c.group_id.trim().is_empty() {
            return invalid("consumer.group_id must not be empty");
        }
        if c.prefetch == 0 {
            return invalid("consumer.prefetch must be > 0");
        }
        if c.batch_size == 0 {
            return invalid("consumer.batch_size must be > 0");
        }
        if c.max_redeliveries == 0 {
            return invalid("consumer.max_redeliveries must be > 0");
        }
        if c.poison_threshold == 0 {
            return invalid("consumer.poison_threshold must be > 0");
        }
        if c.poll_wait_ms == 0 {
            return invalid("consumer.poll_wait_ms must be > 0");
        }
        if self.dead_letter.suffix.is_empty() {
            return invalid("dead_letter.suffix must not be empty");
        }
        if self.offsets.store == OffsetStoreKind::File && !self.offsets.config.contains_key("path") {
            return invalid("offsets.config.path is required for the file store");
        }
        Ok(())
    }
}
