//! Cooperative stop signal.
//!
//! The scheduler loop checks it at the top of every tick, the retry
//! combinator between attempts, and the supervisor between restarts. All
//! waits go through [`ShutdownSignal::sleep`] so a stop never has to wait out
//! a full backoff.

use std::time::Duration;
use tokio::sync::watch;

/// Owning side. Dropping it without calling `trigger` never stops anyone.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Ask everything holding a signal to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
        tracing::info!("🛑 Shutdown requested");
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            // Owner dropped without stopping: nobody can stop us any more.
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`. Returns `false` if interrupted by a stop.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }
}
