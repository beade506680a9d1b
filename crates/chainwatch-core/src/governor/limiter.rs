//! Bounded concurrency for outbound requests

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Caps the number of in-flight operations.
///
/// Backed by a fair [`Semaphore`]: a freed slot is handed to the oldest
/// waiter before any new arrival can take it.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `max_concurrent` operations at once
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Configured ceiling
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Operations currently holding a slot
    pub fn running(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Run `f` once a slot is free. The slot is released when `f` completes,
    /// fails, or is dropped.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| Error::Cancelled)?,
        };

        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready_ok};

    #[tokio::test(start_paused = true)]
    async fn test_running_never_exceeds_limit() {
        let limiter = ConcurrencyLimiter::new(3);
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .run(&cancel, || async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(limiter.running() <= 3);
                        tokio::time::sleep(Duration::from_millis(10 + i % 4)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.running(), 0);
    }

    #[test]
    fn test_freed_slot_goes_to_oldest_waiter() {
        let limiter = ConcurrencyLimiter::new(1);
        let cancel = CancellationToken::new();
        let (release, hold) = oneshot::channel::<()>();

        let mut holder = task::spawn(limiter.run(&cancel, || async move {
            let _ = hold.await;
            Ok(())
        }));
        assert_pending!(holder.poll());
        assert_eq!(limiter.running(), 1);

        let mut waiter = task::spawn(limiter.run(&cancel, || async { Ok(1) }));
        assert_pending!(waiter.poll());

        release.send(()).unwrap();
        assert_ready_ok!(holder.poll());

        let mut late = task::spawn(limiter.run(&cancel, || async { Ok(2) }));
        assert_pending!(late.poll());
        assert_eq!(assert_ready_ok!(waiter.poll()), 1);
        assert_eq!(assert_ready_ok!(late.poll()), 2);
    }

    #[test]
    fn test_slot_released_on_failure() {
        let limiter = ConcurrencyLimiter::new(1);
        let cancel = CancellationToken::new();
        let result: Result<()> = tokio_test::block_on(
            limiter.run(&cancel, || async { Err(Error::network("reset")) }),
        );
        assert!(result.is_err());
        assert_eq!(limiter.running(), 0);
    }

    #[test]
    fn test_cancelled_waiter_gives_up() {
        let limiter = ConcurrencyLimiter::new(1);
        let cancel = CancellationToken::new();
        let waiter_cancel = CancellationToken::new();
        let (_release, hold) = oneshot::channel::<()>();

        let mut holder = task::spawn(limiter.run(&cancel, || async move {
            let _ = hold.await;
            Ok(())
        }));
        assert_pending!(holder.poll());

        let mut waiter = task::spawn(limiter.run(&waiter_cancel, || async { Ok(()) }));
        assert_pending!(waiter.poll());
        waiter_cancel.cancel();
        let result = tokio_test::assert_ready!(waiter.poll());
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
