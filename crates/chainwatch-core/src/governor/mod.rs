//! Outbound request governor
//!
//! Every call to an upstream provider goes through [`RequestGovernor::execute`],
//! which applies, in order:
//!
//! 1. the global [`TokenBucket`] rate ceiling,
//! 2. the [`ConcurrencyLimiter`] in-flight ceiling,
//! 3. the [`BackoffRetrier`] retry policy, inside the concurrency slot.
//!
//! A caller waiting for tokens never holds a concurrency slot.

mod backoff;
mod bucket;
mod limiter;

pub use backoff::BackoffRetrier;
pub use bucket::TokenBucket;
pub use limiter::ConcurrencyLimiter;

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;

/// Rate, concurrency and retry policy for outbound calls
pub struct RequestGovernor {
    bucket: Arc<TokenBucket>,
    limiter: ConcurrencyLimiter,
    retrier: BackoffRetrier,
    shutdown: CancellationToken,
}

impl RequestGovernor {
    /// Compose a governor from its parts
    pub fn new(
        bucket: Arc<TokenBucket>,
        limiter: ConcurrencyLimiter,
        retrier: BackoffRetrier,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bucket,
            limiter,
            retrier,
            shutdown,
        }
    }

    /// Build a governor from configuration
    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Self {
        Self::new(
            Arc::new(TokenBucket::from_config(&config.governor)),
            ConcurrencyLimiter::new(config.governor.max_concurrent),
            BackoffRetrier::from_config(&config.retry),
            shutdown,
        )
    }

    /// Start refilling the token bucket until shutdown
    pub fn start(&self) -> JoinHandle<()> {
        self.bucket.spawn_refill(self.shutdown.clone())
    }

    /// Perform one outbound call, cancelled by the governor's shutdown signal
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(&self.shutdown, op).await
    }

    /// Perform one outbound call with an explicit cancellation signal
    pub async fn execute_with<F, Fut, T>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.bucket.acquire(1, cancel).await?;
        self.limiter
            .run(cancel, || self.retrier.retry(cancel, op))
            .await
    }

    /// The token bucket
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// The concurrency limiter
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// The retry policy
    pub fn retrier(&self) -> &BackoffRetrier {
        &self.retrier
    }

    /// Shutdown signal shared by all governed calls
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
