//! # Notecall Core
//!
//! Shared vocabulary of the reminder engine: notes, per-user schedule state,
//! the error taxonomy, configuration, and the narrow traits through which the
//! scheduler talks to the note repository, the delivery channel and the clock.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{NotecallConfig, ReminderWindow};
pub use error::{DeliveryError, NotecallError, Result, Retriable, StorageError};
pub use types::{Note, NoteKind, ReminderOutcome, ReminderRecord, UserId, UserScheduleState};
