//! Note repository trait: where notes and per-user schedule state live.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{Note, ReminderRecord, UserId, UserScheduleState};

/// Storage consumed by the reminder engine.
///
/// Implementations own note selection: `random_note` must pick uniformly
/// among the user's notes.
#[async_trait]
pub trait NoteRepository: Send + Sync {
    fn name(&self) -> &str;

    /// All registered users.
    async fn list_users(&self) -> Result<Vec<UserId>, StorageError>;

    async fn count_notes(&self, user: &str) -> Result<u64, StorageError>;

    /// A uniformly random note of `user`, or `None` if they have none.
    async fn random_note(&self, user: &str) -> Result<Option<Note>, StorageError>;

    /// Stored state, or a fresh `UserScheduleState::new(user)` if none exists.
    async fn load_schedule_state(&self, user: &str) -> Result<UserScheduleState, StorageError>;

    /// Replace the stored state. Must be atomic per user.
    async fn save_schedule_state(
        &self,
        user: &str,
        state: &UserScheduleState,
    ) -> Result<(), StorageError>;

    /// Append a fired reminder to the reminder log.
    async fn record_outcome(&self, record: &ReminderRecord) -> Result<(), StorageError>;

    async fn total_users(&self) -> Result<u64, StorageError>;

    async fn total_notes(&self) -> Result<u64, StorageError>;
}
