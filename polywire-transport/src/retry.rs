//! Connection retry loop shared by connection-oriented transports.

use std::future::Future;
use std::io;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::NetworkAddress;
use crate::error::TransportError;
use crate::tasks::Cancellation;

/// Fixed pause between failed attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// How many times to try, and how long each try may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempt_timeout: Option<Duration>,
    backoff: Duration,
}

impl RetryPolicy {
    /// Policy from descriptor values. A timeout of `0` means wait indefinitely.
    pub fn new(max_attempts: u32, timeout_secs: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            backoff: RETRY_BACKOFF,
        }
    }

    /// Override the pause between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Get the attempt count.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Get the per-attempt timeout.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }
}

/// Run `attempt` until it succeeds, attempts run out or `cancel` fires.
///
/// Cancellation interrupts a blocked attempt as well as the backoff sleep.
/// Exhaustion yields [`TransportError::ConnectionFailed`] for `address`.
pub async fn connect_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    address: &NetworkAddress,
    cancel: &Cancellation,
    mut attempt: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    for n in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        debug!(attempt = n, max = policy.max_attempts, %address, "connection attempt");

        let fut = attempt(n);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            r = bounded(policy.attempt_timeout, fut) => r,
        };

        match outcome {
            Ok(value) => {
                info!(attempt = n, %address, "connected");
                return Ok(value);
            }
            Err(e) => warn!(attempt = n, %address, error = %e, "connection attempt failed"),
        }

        if n < policy.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(policy.backoff) => {}
            }
        }
    }

    Err(TransportError::ConnectionFailed(address.clone()))
}

async fn bounded<T, Fut>(limit: Option<Duration>, fut: Fut) -> io::Result<T>
where
    Fut: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "attempt timed out")),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "refused")
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_address() {
        let registry = TaskRegistry::new();
        let address = NetworkAddress::ip("127.0.0.1:9".parse().unwrap());
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = connect_with_retry(
            &RetryPolicy::new(3, 60),
            &address,
            &registry.cancellation(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            },
        )
        .await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed(a)) if a == address));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= RETRY_BACKOFF * 2 && elapsed < RETRY_BACKOFF * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let registry = TaskRegistry::new();
        let start = Instant::now();

        let result: Result<(), _> = connect_with_retry(
            &RetryPolicy::new(2, 10),
            &NetworkAddress::default(),
            &registry.cancellation(),
            |_| std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(25) && elapsed < Duration::from_secs(26));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_attempt() {
        let registry = TaskRegistry::new();
        let result = connect_with_retry(
            &RetryPolicy::new(3, 0),
            &NetworkAddress::default(),
            &registry.cancellation(),
            |n| async move {
                if n < 3 {
                    Err(refused())
                } else {
                    Ok(n)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_indefinite_attempt() {
        let registry = Arc::new(TaskRegistry::new());
        let token = registry.cancellation();

        let canceller = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1000)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = connect_with_retry(
            &RetryPolicy::new(3, 0),
            &NetworkAddress::default(),
            &token,
            |_| std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, 0);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.attempt_timeout(), None);
    }
}
