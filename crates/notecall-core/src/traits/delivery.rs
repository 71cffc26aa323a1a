//! Delivery channel trait: how a reminder reaches the user.

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::types::Note;

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Send the note in its original medium.
    async fn deliver(&self, user: &str, note: &Note) -> Result<(), DeliveryError>;

    /// Degraded, text-only delivery.
    async fn deliver_text_fallback(&self, user: &str, text: &str) -> Result<(), DeliveryError>;
}
