//! Bounded retry with capped exponential backoff.
//!
//! One combinator for every storage and delivery call: `max_attempts` tries,
//! `base * 2^n` between them (capped at `max_delay`), only for errors that say
//! they are retriable. A stop request ends the loop early with the last error.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use notecall_core::config::BackoffConfig;
use notecall_core::Retriable;

use crate::shutdown::ShutdownSignal;

/// Attempt budget and delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// Delay after the `n`-th failed retry (0-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Retry counters, shared across ticks.
#[derive(Debug, Default)]
pub struct RetryStats {
    retries: AtomicU64,
    exhausted: AtomicU64,
    interrupted: AtomicU64,
}

impl RetryStats {
    /// Extra attempts made after a retriable failure.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Calls that ran out of attempts.
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Calls cut short by a stop request.
    pub fn interrupted(&self) -> u64 {
        self.interrupted.load(Ordering::Relaxed)
    }
}

/// Run `op` under `policy`.
///
/// Non-retriable errors are returned immediately.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
    stats: &RetryStats,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retriable + std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) => e,
        };

        if attempt >= policy.max_attempts {
            stats.exhausted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("❌ {label}: giving up after {attempt} attempts: {err}");
            return Err(err);
        }

        let delay = policy.delay_for(attempt - 1);
        tracing::warn!(
            "🔁 {label} failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
            policy.max_attempts
        );
        if !shutdown.sleep(delay).await {
            stats.interrupted.fetch_add(1, Ordering::Relaxed);
            tracing::info!("⏹️ {label}: retry interrupted by shutdown");
            return Err(err);
        }
        stats.retries.fetch_add(1, Ordering::Relaxed);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use notecall_core::{DeliveryError, StorageError};
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(60), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_errors() {
        let shutdown = Shutdown::new();
        let stats = RetryStats::default();
        let calls = AtomicU32::new(0);

        let result = retry(&fast_policy(3), &shutdown.signal(), &stats, "load", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StorageError::Transient("busy".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.retries(), 2);
        assert_eq!(stats.exhausted(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let shutdown = Shutdown::new();
        let stats = RetryStats::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> =
            retry(&fast_policy(3), &shutdown.signal(), &stats, "send", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::Transient("timeout".into())) }
            })
            .await;

        assert_eq!(result, Err(DeliveryError::Transient("timeout".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.exhausted(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let shutdown = Shutdown::new();
        let stats = RetryStats::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> =
            retry(&fast_policy(5), &shutdown.signal(), &stats, "send", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::Permanent("blocked".into())) }
            })
            .await;

        assert!(matches!(result, Err(DeliveryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.retries(), 0);
    }

    #[tokio::test]
    async fn test_stop_cuts_retry_short() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let stats = RetryStats::default();
        let calls = AtomicU32::new(0);
        let slow = RetryPolicy::new(10, Duration::from_secs(3600), Duration::from_secs(3600));

        let result: Result<(), _> = retry(&slow, &shutdown.signal(), &stats, "save", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Transient("locked".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.interrupted(), 1);
    }
}
