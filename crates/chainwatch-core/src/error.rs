//! Error types for Chainwatch

use thiserror::Error;

/// Result type alias using Chainwatch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Chainwatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure talking to an upstream provider
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream provider throttled the request
    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    /// Upstream answered with a non-retryable status
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// More tokens requested than the bucket can ever hold
    #[error("Token request of {requested} exceeds bucket capacity {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },

    /// Operation abandoned because its cancellation signal fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Snapshot fields missing or malformed
    #[error("Provider data error: {0}")]
    ProviderData(String),

    /// Notification sink failed to accept an alert
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provider data error
    pub fn provider_data(msg: impl Into<String>) -> Self {
        Self::ProviderData(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    /// Whether the backoff retrier should try the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited(_) | Self::Io(_))
    }

    /// Whether the error is the upstream throttling the caller
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::ProviderData(err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 => Self::RateLimited(err.to_string()),
            Some(status) if !status.is_server_error() => Self::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            },
            _ => Self::Network(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
