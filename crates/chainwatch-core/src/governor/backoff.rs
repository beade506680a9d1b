//! Exponential backoff with jitter

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Retries a fallible operation with bounded exponential backoff.
///
/// The delay before retry `k` (1-based) is
/// `min(min_delay * factor^(k-1), max_delay)`, scaled by a uniform jitter in
/// `[0, 1)` when jitter is enabled. Only [`Error::is_retryable`] errors are
/// retried; after `max_retries` retries the last error is returned as-is.
#[derive(Debug, Clone)]
pub struct BackoffRetrier {
    max_retries: u32,
    min_delay: Duration,
    max_delay: Duration,
    factor: f64,
    rate_limited_min_delay: Option<Duration>,
    jitter: bool,
}

impl BackoffRetrier {
    /// Create a retrier with full jitter
    pub fn new(max_retries: u32, min_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            max_retries,
            min_delay,
            max_delay,
            factor,
            rate_limited_min_delay: None,
            jitter: true,
        }
    }

    /// Create a retrier from retry settings
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
        )
        .with_rate_limited_min_delay(config.rate_limited_min_delay_ms.map(Duration::from_millis))
    }

    /// Use a longer base delay after rate-limited failures
    pub fn with_rate_limited_min_delay(mut self, delay: Option<Duration>) -> Self {
        self.rate_limited_min_delay = delay;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Un-jittered delay before retry `attempt` (1-based) after `err`
    pub fn ceiling(&self, attempt: u32, err: &Error) -> Duration {
        let base = match self.rate_limited_min_delay {
            Some(rl) if err.is_rate_limited() => rl.max(self.min_delay),
            _ => self.min_delay,
        };
        let cap = self.max_delay.max(base);

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = base.as_secs_f64() * 1000.0 * self.factor.powi(exponent);
        let cap_millis = cap.as_secs_f64() * 1000.0;
        if !millis.is_finite() || millis >= cap_millis {
            return cap;
        }
        Duration::from_secs_f64(millis / 1000.0)
    }

    /// Delay to sleep before retry `attempt`, with jitter applied
    pub fn delay(&self, attempt: u32, err: &Error) -> Duration {
        let ceiling = self.ceiling(attempt, err);
        if !self.jitter {
            return ceiling;
        }
        let scale: f64 = rand::thread_rng().gen();
        ceiling.mul_f64(scale)
    }

    /// Run `op` until it succeeds, fails terminally, or `cancel` fires.
    pub async fn retry<F, Fut, T>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = op() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            attempt += 1;

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt > self.max_retries {
                warn!(attempts = attempt, error = %err, "Retries exhausted");
                return Err(err);
            }

            let delay = self.delay(attempt, &err);
            warn!(
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Request failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}

impl Default for BackoffRetrier {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
