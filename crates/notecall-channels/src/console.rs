//! Console channel: logs reminders instead of sending them (dry run).

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use notecall_core::traits::DeliveryChannel;
use notecall_core::{DeliveryError, Note};

#[derive(Debug, Default)]
pub struct ConsoleDelivery {
    sent: AtomicU64,
}

impl ConsoleDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reminders "sent" so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryChannel for ConsoleDelivery {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, user: &str, note: &Note) -> Result<(), DeliveryError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        match &note.payload_ref {
            Some(path) => tracing::info!(
                "📨 [dry-run] {user} ← {} note {} ({path}): {}",
                note.kind,
                note.id,
                note.preview(80)
            ),
            None => tracing::info!(
                "📨 [dry-run] {user} ← {} note {}: {}",
                note.kind,
                note.id,
                note.preview(80)
            ),
        }
        Ok(())
    }

    async fn deliver_text_fallback(&self, user: &str, text: &str) -> Result<(), DeliveryError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::info!("📨 [dry-run] {user} ← text: {text}");
        Ok(())
    }
}
