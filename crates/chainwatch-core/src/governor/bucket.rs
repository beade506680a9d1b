//! Token bucket enforcing the global outbound request rate

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::GovernorConfig;
use crate::error::{Error, Result};

struct Waiter {
    count: u32,
    tx: oneshot::Sender<()>,
}

struct BucketState {
    tokens: u32,
    waiters: VecDeque<Waiter>,
}

impl BucketState {
    /// Hand tokens to queued waiters strictly in arrival order.
    fn drain(&mut self) {
        loop {
            let Some(front) = self.waiters.front() else {
                break;
            };
            if front.tx.is_closed() {
                self.waiters.pop_front();
                continue;
            }
            if front.count > self.tokens {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.tokens -= waiter.count;
            if waiter.tx.send(()).is_err() {
                // receiver went away between the check and the send
                self.tokens += waiter.count;
            }
        }
    }
}

/// Token bucket with a FIFO waiter queue.
///
/// Starts full. Every refill tick adds `tokens_per_interval` tokens, capped at
/// `capacity`, and then serves queued waiters in arrival order. A caller that
/// arrives while others are queued queues behind them even if enough tokens
/// are available.
pub struct TokenBucket {
    capacity: u32,
    tokens_per_interval: u32,
    interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u32, tokens_per_interval: u32, interval: Duration) -> Self {
        Self {
            capacity,
            tokens_per_interval,
            interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Create a bucket from governor settings
    pub fn from_config(config: &GovernorConfig) -> Self {
        Self::new(
            config.bucket_capacity,
            config.tokens_per_interval,
            config.interval(),
        )
    }

    /// Maximum tokens the bucket holds
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens currently available
    pub fn available(&self) -> u32 {
        self.state.lock().tokens
    }

    /// Number of callers waiting for tokens
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Take `count` tokens without waiting.
    ///
    /// Returns `Ok(false)` when the tokens are not available right now or
    /// earlier callers are still queued.
    pub fn try_acquire(&self, count: u32) -> Result<bool> {
        self.check_capacity(count)?;
        let mut state = self.state.lock();
        state.drain();
        if state.waiters.is_empty() && state.tokens >= count {
            state.tokens -= count;
            return Ok(true);
        }
        Ok(false)
    }

    /// Take `count` tokens, waiting in FIFO order for refills if needed.
    pub async fn acquire(&self, count: u32, cancel: &CancellationToken) -> Result<()> {
        self.check_capacity(count)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut rx = {
            let mut state = self.state.lock();
            state.drain();
            if state.waiters.is_empty() && state.tokens >= count {
                state.tokens -= count;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { count, tx });
            debug!(count, queued = state.waiters.len(), "Waiting for rate limit tokens");
            rx
        };

        tokio::select! {
            biased;
            granted = &mut rx => granted.map_err(|_| Error::Cancelled),
            _ = cancel.cancelled() => {
                rx.close();
                if rx.try_recv().is_ok() {
                    // granted just before cancellation; give the tokens back
                    self.release(count);
                }
                Err(Error::Cancelled)
            }
        }
    }

    /// Add one interval's worth of tokens and serve waiters
    pub fn refill(&self) {
        let mut state = self.state.lock();
        state.tokens = state
            .tokens
            .saturating_add(self.tokens_per_interval)
            .min(self.capacity);
        state.drain();
        trace!(tokens = state.tokens, queued = state.waiters.len(), "Token bucket refilled");
    }

    /// Spawn the refill loop. It stops on shutdown or once the bucket is dropped.
    pub fn spawn_refill(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let bucket = Arc::downgrade(self);
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(bucket) = bucket.upgrade() else {
                            break;
                        };
                        bucket.refill();
                    }
                }
            }
            debug!("Token bucket refill loop stopped");
        })
    }

    fn release(&self, count: u32) {
        let mut state = self.state.lock();
        state.tokens = state.tokens.saturating_add(count).min(self.capacity);
        state.drain();
    }

    fn check_capacity(&self, count: u32) -> Result<()> {
        if count > self.capacity {
            return Err(Error::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
