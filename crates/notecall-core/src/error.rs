//! Notecall error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NotecallError>;

#[derive(Debug, Error)]
pub enum NotecallError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure reported by a note repository.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Connection hiccup, lock contention; worth another attempt.
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Fatal(String),
}

/// Failure reported by a delivery channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Network timeout, rate limit, upstream 5xx.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The user blocked the bot, the chat is gone. Retrying cannot help.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Errors a retry loop is allowed to retry.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

impl Retriable for StorageError {
    fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl Retriable for DeliveryError {
    fn is_retriable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}
