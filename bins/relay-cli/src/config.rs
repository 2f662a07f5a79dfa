use clap::{Args, Parser, Subcommand};

use relay_client::{ConfigError, RelayConfig};

#[derive(Parser)]
#[command(name = "relay", about = "Надёжный publish/consume: демо и проверка конфигурации")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish and consume through an in-process loopback broker
    Demo(DemoArgs),
    /// Validate a config file and print the effective settings
    Check(CheckArgs),
}

#[derive(Args, Clone, Debug)]
pub struct DemoArgs {
    /// Путь к TOML конфиг файлу (без него используются значения по умолчанию)
    #[arg(long, env = "RELAY_CONFIG")]
    pub config: Option<String>,

    #[arg(long, default_value = "demo")]
    pub topic: String,

    #[arg(long, default_value_t = 3)]
    pub partitions: u32,

    /// Number of messages to publish
    #[arg(long, default_value_t = 30)]
    pub messages: u64,

    /// Distinct partition keys
    #[arg(long, default_value_t = 5)]
    pub keys: u64,

    /// Nack every Nth handled message to exercise redelivery
    #[arg(long)]
    pub fail_every: Option<u64>,

    /// Overrides `consumer.group_id`
    #[arg(long, env = "RELAY_GROUP")]
    pub group: Option<String>,

    /// Give up if the consumer has not caught up by then
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

#[derive(Args, Clone, Debug)]
pub struct CheckArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "relay.toml", env = "RELAY_CONFIG")]
    pub config: String,
}

/// Load `path`, or the defaults when no file is given.
pub fn load(path: Option<&str>) -> Result<RelayConfig, ConfigError> {
    match path {
        Some(path) => {
            let config = RelayConfig::load(path)?;
            tracing::info!(config = %path, "loaded config");
            Ok(config)
        }
        None => Ok(RelayConfig::default()),
    }
}
