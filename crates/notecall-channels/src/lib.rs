//! # Notecall Channels
//! Delivery channels: how a reminder reaches the user.

pub mod console;
pub mod telegram;

pub use console::ConsoleDelivery;
pub use telegram::TelegramDelivery;
