//! # Notecall Scheduler
//!
//! Multi-user reminder engine: every other day, at a random moment inside the
//! reminder window, each user gets one of their own notes back.
//!
//! ## Design Principles
//! - Pure policy: eligibility and timing are functions of state + clock
//! - SQLite persistence, so schedule state survives restarts
//! - Tokio timers only, zero overhead between ticks
//! - At most one reminder per user per eligible day, even across crashes
//!
//! ## Architecture
//! ```text
//! Supervisor (restart with backoff)
//!   └── ReminderEngine::run (tokio interval)
//!         └── per user, bounded concurrency, serialized per user:
//!               load state → policy::evaluate → Fire?
//!                 ├── NoteRepository::random_note
//!                 ├── DeliveryChannel::deliver (retry) → text fallback
//!                 └── policy::record_fire → save state (retry)
//! ```

pub mod engine;
pub mod history;
pub mod persistence;
pub mod policy;
pub mod retry;
pub mod shutdown;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use engine::{EngineSettings, ReminderEngine, SchedulerStats, TickReport};
pub use history::OutcomeHistory;
pub use persistence::NoteDb;
pub use policy::{Action, Decision};
pub use retry::{RetryPolicy, RetryStats};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use supervisor::{RestartPolicy, Supervisor};
