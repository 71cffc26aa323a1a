//! In-memory collaborators for engine tests, with scripted failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use notecall_core::traits::{DeliveryChannel, NoteRepository};
use notecall_core::{
    DeliveryError, Note, ReminderRecord, StorageError, UserId, UserScheduleState,
};

/// Repository operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoOp {
    ListUsers,
    CountNotes,
    RandomNote,
    Load,
    Save,
}

#[derive(Default)]
pub struct MemoryRepository {
    users: Mutex<Vec<UserId>>,
    notes: Mutex<HashMap<UserId, Vec<Note>>>,
    states: Mutex<HashMap<UserId, UserScheduleState>>,
    records: Mutex<Vec<ReminderRecord>>,
    failures: Mutex<HashMap<(RepoOp, UserId), VecDeque<StorageError>>>,
    saves: Mutex<HashMap<UserId, u32>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` with `count` text notes.
    pub fn add_user(&self, user: &str, count: usize) {
        self.users.lock().unwrap().push(user.to_string());
        let mut notes = self.notes.lock().unwrap();
        let entry = notes.entry(user.to_string()).or_default();
        for i in 0..count {
            let id = entry.len() as i64 + 1;
            entry.push(Note::text(id, user, &format!("note {i} of {user}")));
        }
    }

    /// Unregister `user` and drop their notes.
    pub fn remove_user(&self, user: &str) {
        self.users.lock().unwrap().retain(|u| u != user);
        self.notes.lock().unwrap().remove(user);
    }

    /// Make the next `errors.len()` calls of `op` for `user` fail in order.
    /// `ListUsers` ignores the user.
    pub fn fail(&self, op: RepoOp, user: &str, errors: Vec<StorageError>) {
        self.failures
            .lock()
            .unwrap()
            .entry((op, user.to_string()))
            .or_default()
            .extend(errors);
    }

    pub fn set_state(&self, state: UserScheduleState) {
        self.states
            .lock()
            .unwrap()
            .insert(state.user_id.clone(), state);
    }

    pub fn state(&self, user: &str) -> Option<UserScheduleState> {
        self.states.lock().unwrap().get(user).cloned()
    }

    pub fn records(&self) -> Vec<ReminderRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn save_count(&self, user: &str) -> u32 {
        self.saves.lock().unwrap().get(user).copied().unwrap_or(0)
    }

    fn check(&self, op: RepoOp, user: &str) -> Result<(), StorageError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&(op, user.to_string())).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NoteRepository for MemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_users(&self) -> Result<Vec<UserId>, StorageError> {
        self.check(RepoOp::ListUsers, "")?;
        Ok(self.users.lock().unwrap().clone())
    }

    async fn count_notes(&self, user: &str) -> Result<u64, StorageError> {
        self.check(RepoOp::CountNotes, user)?;
        Ok(self.notes.lock().unwrap().get(user).map_or(0, Vec::len) as u64)
    }

    async fn random_note(&self, user: &str) -> Result<Option<Note>, StorageError> {
        self.check(RepoOp::RandomNote, user)?;
        let notes = self.notes.lock().unwrap();
        let Some(list) = notes.get(user).filter(|l| !l.is_empty()) else {
            return Ok(None);
        };
        let idx = rand::random::<usize>() % list.len();
        Ok(Some(list[idx].clone()))
    }

    async fn load_schedule_state(&self, user: &str) -> Result<UserScheduleState, StorageError> {
        self.check(RepoOp::Load, user)?;
        Ok(self
            .state(user)
            .unwrap_or_else(|| UserScheduleState::new(user)))
    }

    async fn save_schedule_state(
        &self,
        user: &str,
        state: &UserScheduleState,
    ) -> Result<(), StorageError> {
        self.check(RepoOp::Save, user)?;
        *self.saves.lock().unwrap().entry(user.to_string()).or_default() += 1;
        self.set_state(state.clone());
        Ok(())
    }

    async fn record_outcome(&self, record: &ReminderRecord) -> Result<(), StorageError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn total_users(&self) -> Result<u64, StorageError> {
        Ok(self.users.lock().unwrap().len() as u64)
    }

    async fn total_notes(&self) -> Result<u64, StorageError> {
        Ok(self.notes.lock().unwrap().values().map(Vec::len).sum::<usize>() as u64)
    }
}

/// A delivery attempt seen by [`ScriptedChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Note { user: UserId, note_id: i64 },
    Fallback { user: UserId, text: String },
}

/// Succeeds unless a failure has been scripted for the user.
#[derive(Default)]
pub struct ScriptedChannel {
    deliver_failures: Mutex<HashMap<UserId, VecDeque<DeliveryError>>>,
    fallback_failures: Mutex<HashMap<UserId, VecDeque<DeliveryError>>>,
    sent: Mutex<Vec<Sent>>,
    delay: Mutex<Option<Duration>>,
    panic_for: Mutex<Option<UserId>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `deliver` call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// `deliver` to `user` panics.
    pub fn panic_on(&self, user: &str) {
        *self.panic_for.lock().unwrap() = Some(user.to_string());
    }

    pub fn fail_deliver(&self, user: &str, errors: Vec<DeliveryError>) {
        self.deliver_failures
            .lock()
            .unwrap()
            .entry(user.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn fail_fallback(&self, user: &str, errors: Vec<DeliveryError>) {
        self.fallback_failures
            .lock()
            .unwrap()
            .entry(user.to_string())
            .or_default()
            .extend(errors);
    }

    /// Every attempt, successful or not, in call order.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, user: &str) -> usize {
        self.sent()
            .iter()
            .filter(|s| match s {
                Sent::Note { user: u, .. } | Sent::Fallback { user: u, .. } => u == user,
            })
            .count()
    }
}

fn next_failure(
    script: &Mutex<HashMap<UserId, VecDeque<DeliveryError>>>,
    user: &str,
) -> Result<(), DeliveryError> {
    match script.lock().unwrap().get_mut(user).and_then(VecDeque::pop_front) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn deliver(&self, user: &str, note: &Note) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(Sent::Note {
            user: user.to_string(),
            note_id: note.id,
        });
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let panics = self.panic_for.lock().unwrap().as_deref() == Some(user);
        if panics {
            panic!("delivery to {user} blew up");
        }
        next_failure(&self.deliver_failures, user)
    }

    async fn deliver_text_fallback(&self, user: &str, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(Sent::Fallback {
            user: user.to_string(),
            text: text.to_string(),
        });
        next_failure(&self.fallback_failures, user)
    }
}

/// `hour:minute` UTC on day number `day` (days since 1970-01-01).
pub fn day_at(day: i64, hour: i64, minute: i64) -> chrono::DateTime<Utc> {
    chrono::DateTime::<Utc>::UNIX_EPOCH
        + chrono::Duration::days(day)
        + chrono::Duration::hours(hour)
        + chrono::Duration::minutes(minute)
}
