//! Supervisor: keeps a long-running task alive.
//!
//! The task runs on its own tokio task so both errors and panics come back
//! here. Each crash is followed by a backoff that doubles with consecutive
//! crashes (capped); a run that got through enough ticks before crashing
//! resets the count.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notecall_core::config::SupervisorConfig;
use notecall_core::{NotecallError, Result};

use crate::shutdown::ShutdownSignal;

/// Restart backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A crashed run that completed at least this many ticks was healthy.
    pub healthy_ticks_to_reset: u64,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            healthy_ticks_to_reset: config.healthy_ticks_to_reset,
            max_restarts: config.max_restarts,
        }
    }

    /// Wait before restarting after `failures` consecutive crashes (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1);
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            healthy_ticks_to_reset: 10,
            max_restarts: None,
        }
    }
}

pub struct Supervisor {
    name: String,
    policy: RestartPolicy,
    /// Ticks completed by the supervised task, across runs.
    progress: Arc<AtomicU64>,
    restarts: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl Supervisor {
    pub fn new(name: &str, policy: RestartPolicy, progress: Arc<AtomicU64>) -> Self {
        Self {
            name: name.to_string(),
            policy,
            progress,
            restarts: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Run `factory()` until it returns `Ok` or `shutdown` fires.
    ///
    /// Errors only once `max_restarts` is used up.
    pub async fn run<F, Fut>(&self, mut factory: F, shutdown: ShutdownSignal) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = &self.name;
        loop {
            let ticks_before = self.progress.load(Ordering::Relaxed);
            let handle = tokio::spawn(factory());

            let error = match handle.await {
                Ok(Ok(())) => {
                    tracing::info!("✅ {name} finished");
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) if e.is_panic() => format!("panicked: {}", panic_message(e.into_panic())),
                Err(e) => format!("task aborted: {e}"),
            };

            if shutdown.is_stopped() {
                tracing::warn!("⚠️ {name} failed while stopping: {error}");
                return Ok(());
            }

            let ticks = self.progress.load(Ordering::Relaxed).saturating_sub(ticks_before);
            if ticks >= self.policy.healthy_ticks_to_reset && self.consecutive_failures() > 0 {
                tracing::info!("🔄 {name} ran {ticks} healthy tick(s); backoff reset");
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

            let restarts = self.restarts();
            if self.policy.max_restarts.is_some_and(|max| restarts >= max) {
                tracing::error!("🛑 {name} crashed ({error}); giving up after {restarts} restart(s)");
                return Err(NotecallError::Other(format!(
                    "{name} gave up after {restarts} restart(s): {error}"
                )));
            }

            let delay = self.policy.delay_for(failures);
            tracing::error!(
                "💥 {name} crashed ({error}); restart #{} in {delay:?}",
                restarts + 1
            );
            if !shutdown.sleep(delay).await {
                tracing::info!("⏹️ {name} not restarted: shutdown requested");
                return Ok(());
            }
            self.restarts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
