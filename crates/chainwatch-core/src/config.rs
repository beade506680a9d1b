//! Configuration management for Chainwatch

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable prefix for every option
pub const ENV_PREFIX: &str = "CHAINWATCH";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rate and concurrency ceilings for outbound requests
    pub governor: GovernorConfig,

    /// Retry policy for outbound requests
    pub retry: RetryConfig,

    /// Poll intervals per watch kind
    pub polling: PollingConfig,

    /// Alert deduplication
    pub dedup: DedupConfig,

    /// Upstream data providers
    pub provider: ProviderConfig,

    /// Notification delivery
    pub notifier: NotifierConfig,

    /// Target record store
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file, then `CHAINWATCH_*` env vars.
    ///
    /// Nested keys use `__` as separator, e.g. `CHAINWATCH_RETRY__MAX_RETRIES=3`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the governor or poller cannot run with
    pub fn validate(&self) -> Result<()> {
        let g = &self.governor;
        if g.bucket_capacity == 0 {
            return Err(Error::config("governor.bucket_capacity must be greater than zero"));
        }
        if g.tokens_per_interval == 0 || g.interval_ms == 0 {
            return Err(Error::config(
                "governor.tokens_per_interval and governor.interval_ms must be greater than zero",
            ));
        }
        if g.max_concurrent == 0 {
            return Err(Error::config("governor.max_concurrent must be greater than zero"));
        }

        let r = &self.retry;
        if r.backoff_factor < 1.0 || !r.backoff_factor.is_finite() {
            return Err(Error::config("retry.backoff_factor must be a finite number >= 1"));
        }
        if r.min_delay_ms > r.max_delay_ms {
            return Err(Error::config("retry.min_delay_ms must not exceed retry.max_delay_ms"));
        }

        if self.polling.supply_poll_interval_ms == 0 || self.polling.holding_poll_interval_ms == 0 {
            return Err(Error::config("polling intervals must be greater than zero"));
        }
        if self.dedup.ttl_ms == 0 {
            return Err(Error::config("dedup.ttl_ms must be greater than zero"));
        }

        Ok(())
    }
}

/// Token bucket and concurrency limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Tokens added on every refill tick
    pub tokens_per_interval: u32,
    /// Refill cadence in milliseconds
    pub interval_ms: u64,
    /// Maximum tokens the bucket holds
    pub bucket_capacity: u32,
    /// Maximum in-flight requests
    pub max_concurrent: usize,
}

impl GovernorConfig {
    /// Refill cadence
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            tokens_per_interval: 60,
            interval_ms: 60_000,
            bucket_capacity: 60,
            max_concurrent: 5,
        }
    }
}

/// Backoff retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay in milliseconds
    pub min_delay_ms: u64,
    /// Delay ceiling in milliseconds
    pub max_delay_ms: u64,
    /// Exponential growth factor
    pub backoff_factor: f64,
    /// Base delay used instead of `min_delay_ms` after a rate-limited response
    pub rate_limited_min_delay_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            min_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            rate_limited_min_delay_ms: None,
        }
    }
}

/// Poll interval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Tick interval for supply watches in milliseconds
    pub supply_poll_interval_ms: u64,
    /// Tick interval for holding watches in milliseconds
    pub holding_poll_interval_ms: u64,
}

impl PollingConfig {
    /// Supply-watch tick interval
    pub fn supply_interval(&self) -> Duration {
        Duration::from_millis(self.supply_poll_interval_ms)
    }

    /// Holding-watch tick interval
    pub fn holding_interval(&self) -> Duration {
        Duration::from_millis(self.holding_poll_interval_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            supply_poll_interval_ms: 30_000,
            holding_poll_interval_ms: 60_000,
        }
    }
}

/// Alert deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Suppression window in milliseconds
    pub ttl_ms: u64,
    /// How often expired keys are swept, in milliseconds
    pub sweep_interval_ms: u64,
    /// Entry count that forces an immediate sweep
    pub max_entries: usize,
}

impl DedupConfig {
    /// Suppression window
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Sweep cadence
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 600_000,
            sweep_interval_ms: 60_000,
            max_entries: 100_000,
        }
    }
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Alchemy API key, appended to the NFT API base URL
    pub alchemy_api_key: Option<String>,
    /// Alchemy NFT API base URL template; `{network}` is replaced per chain
    pub alchemy_base_url: String,
    /// OpenSea API key, sent as `x-api-key`
    pub opensea_api_key: Option<String>,
    /// OpenSea API base URL
    pub opensea_base_url: String,
    /// Chains the provider can serve
    pub supported_chains: Vec<String>,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            alchemy_api_key: None,
            alchemy_base_url: "https://{network}.g.alchemy.com/nft/v2".to_string(),
            opensea_api_key: None,
            opensea_base_url: "https://api.opensea.io/api/v2".to_string(),
            supported_chains: vec![
                "ethereum".to_string(),
                "polygon".to_string(),
                "arbitrum".to_string(),
                "optimism".to_string(),
                "base".to_string(),
            ],
            request_timeout_ms: 30_000,
        }
    }
}

/// Notification delivery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Webhook receiving alerts; alerts are only logged when unset
    pub webhook_url: Option<String>,
    /// Payload shape posted to the webhook
    pub format: WebhookFormat,
}

/// Payload shape for webhook delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    /// Discord-style `{"embeds": [...]}`
    #[default]
    Discord,
    /// The alert event as plain JSON
    Generic,
}

/// Target record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON document holding tracked targets
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("storage/targets.json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
