//! Reminder engine: the loop that evaluates every user on a fixed tick,
//! fires due reminders and persists the resulting schedule state.
//! Uses tokio::interval; sleeps between ticks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;

use notecall_core::traits::{Clock, DeliveryChannel, NoteRepository};
use notecall_core::{
    DeliveryError, Note, NotecallConfig, NotecallError, ReminderOutcome, ReminderRecord,
    ReminderWindow, Result, StorageError, UserId, UserScheduleState,
};

use crate::history::OutcomeHistory;
use crate::policy::{self, Action, Decision};
use crate::retry::{retry, RetryPolicy, RetryStats};
use crate::shutdown::{Shutdown, ShutdownSignal};

/// Everything the engine needs from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub window: ReminderWindow,
    pub tick_period: Duration,
    /// Users evaluated concurrently within one tick.
    pub max_concurrent_users: usize,
    pub storage_retry: RetryPolicy,
    pub delivery_retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &NotecallConfig) -> Result<Self> {
        Ok(Self {
            window: config.reminder.window()?,
            tick_period: config.reminder.tick_period(),
            max_concurrent_users: config.reminder.max_concurrent_users.max(1),
            storage_retry: RetryPolicy::from_config(&config.retry.storage),
            delivery_retry: RetryPolicy::from_config(&config.retry.delivery),
        })
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub users: usize,
    pub scheduled: usize,
    pub fired: usize,
    /// Users whose evaluation was abandoned after storage retries ran out.
    pub failed: usize,
}

/// Scheduler statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_users: u64,
    pub total_notes: u64,
    /// Users with a pending reminder slot.
    pub scheduled_reminders: u64,
    pub fired_total: u64,
    /// Undelivered fires plus abandoned user evaluations.
    pub failed_total: u64,
    pub running: bool,
}

/// What happened to one user in one tick.
#[derive(Debug)]
enum UserTick {
    Idle,
    Scheduled,
    Fired,
}

/// The reminder engine: owns every user's schedule state for the process.
pub struct ReminderEngine {
    repo: Arc<dyn NoteRepository>,
    channel: Arc<dyn DeliveryChannel>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    /// One async lock per user: a user is never evaluated twice at once.
    user_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    /// States whose save ran out of retries. Used instead of the stored copy
    /// until a save succeeds.
    unsaved: Mutex<HashMap<UserId, UserScheduleState>>,
    history: Mutex<OutcomeHistory>,
    ticks: Arc<AtomicU64>,
    fired: AtomicU64,
    failed: AtomicU64,
    retry_stats: RetryStats,
    running: AtomicBool,
}

impl ReminderEngine {
    pub fn new(
        repo: Arc<dyn NoteRepository>,
        channel: Arc<dyn DeliveryChannel>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repo,
            channel,
            clock,
            settings,
            user_locks: Mutex::new(HashMap::new()),
            unsaved: Mutex::new(HashMap::new()),
            history: Mutex::new(OutcomeHistory::new()),
            ticks: Arc::new(AtomicU64::new(0)),
            fired: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retry_stats: RetryStats::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Completed ticks. Shared with the supervisor to judge run health.
    pub fn tick_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.ticks)
    }

    pub fn retry_stats(&self) -> &RetryStats {
        &self.retry_stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// States waiting to be written back.
    pub fn pending_saves(&self) -> usize {
        lock(&self.unsaved).len()
    }

    /// Most recent fired reminders, newest first.
    pub fn recent_outcomes(&self, limit: usize) -> Vec<ReminderRecord> {
        lock(&self.history).recent(limit)
    }

    /// Run ticks until `shutdown` fires. Pending states are flushed before
    /// returning. An error means the user list could not be read at all.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let _running = RunningGuard::set(&self.running);
        let window = &self.settings.window;
        tracing::info!(
            "⏰ Reminder engine started (tick {:?}, window {:02}:00-{:02}:00, every {} day(s), channel: {}, store: {})",
            self.settings.tick_period,
            window.start_hour,
            window.end_hour,
            window.interval_days,
            self.channel.name(),
            self.repo.name()
        );

        let mut interval = tokio::time::interval(self.settings.tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.stopped() => break Ok(()),
            }
            if shutdown.is_stopped() {
                break Ok(());
            }
            if let Err(e) = self.tick(&shutdown).await {
                tracing::error!("❌ Reminder tick failed: {e}");
                break Err(e);
            }
        };

        self.flush_unsaved().await;
        tracing::info!("⏹️ Reminder engine stopped");
        result
    }

    /// Evaluate every user once.
    ///
    /// Per-user failures are counted and logged, never returned; only a user
    /// list that cannot be read fails the tick.
    pub async fn tick(&self, shutdown: &ShutdownSignal) -> Result<TickReport> {
        let users = retry(
            &self.settings.storage_retry,
            shutdown,
            &self.retry_stats,
            "list_users",
            || self.repo.list_users(),
        )
        .await?;
        self.prune_user_locks(&users);

        let results: Vec<(UserId, std::result::Result<UserTick, StorageError>)> =
            futures::stream::iter(users)
                .map(|user| async move {
                    let result = self.process_user(&user, shutdown).await;
                    (user, result)
                })
                .buffer_unordered(self.settings.max_concurrent_users.max(1))
                .collect()
                .await;

        let mut report = TickReport {
            users: results.len(),
            ..TickReport::default()
        };
        for (user, result) in results {
            match result {
                Ok(UserTick::Idle) => {}
                Ok(UserTick::Scheduled) => report.scheduled += 1,
                Ok(UserTick::Fired) => report.fired += 1,
                Err(e) => {
                    report.failed += 1;
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("⚠️ Skipping user {user} this tick: {e}");
                }
            }
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        if report.scheduled + report.fired + report.failed > 0 {
            tracing::info!(
                "📊 Tick: {} user(s), {} scheduled, {} fired, {} failed",
                report.users,
                report.scheduled,
                report.fired,
                report.failed
            );
        } else {
            tracing::debug!("Tick: {} user(s), nothing due", report.users);
        }
        Ok(report)
    }

    /// Load → evaluate → (fire) → save for one user, under that user's lock.
    async fn process_user(
        &self,
        user: &str,
        shutdown: &ShutdownSignal,
    ) -> std::result::Result<UserTick, StorageError> {
        let user_lock = self.user_lock(user);
        let _guard = user_lock.lock().await;

        let cached = lock(&self.unsaved).get(user).cloned();
        let state = match cached {
            Some(ref state) => state.clone(),
            None => {
                retry(
                    &self.settings.storage_retry,
                    shutdown,
                    &self.retry_stats,
                    "load_schedule_state",
                    || self.repo.load_schedule_state(user),
                )
                .await?
            }
        };

        let now = self.clock.now();
        let Decision {
            state: mut next,
            action,
        } = {
            let mut rng = rand::thread_rng();
            policy::evaluate(&state, &self.settings.window, now, &mut rng)
        };

        let tick = match action {
            Action::NoOp => UserTick::Idle,
            Action::ScheduleFire(at) => {
                tracing::info!("📅 Reminder for user {user} scheduled at {at}");
                UserTick::Scheduled
            }
            Action::Fire => {
                let (note_id, outcome) = self.fire(user, shutdown).await?;
                self.fired.fetch_add(1, Ordering::Relaxed);
                if matches!(
                    outcome,
                    ReminderOutcome::PermanentFailure(_) | ReminderOutcome::Failed(_)
                ) {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
                policy::record_fire(&mut next, now, outcome.clone());
                let record = ReminderRecord {
                    user_id: user.to_string(),
                    note_id,
                    outcome,
                    at: now,
                };
                lock(&self.history).record(record.clone());
                if let Err(e) = self.repo.record_outcome(&record).await {
                    tracing::warn!("⚠️ Failed to log reminder outcome for user {user}: {e}");
                }
                UserTick::Fired
            }
        };

        if next != state || cached.is_some() {
            let saved = retry(
                &self.settings.storage_retry,
                shutdown,
                &self.retry_stats,
                "save_schedule_state",
                || self.repo.save_schedule_state(user, &next),
            )
            .await;
            match saved {
                Ok(()) => {
                    lock(&self.unsaved).remove(user);
                }
                Err(e) => {
                    tracing::error!("❌ Schedule state for user {user} not saved, keeping it in memory: {e}");
                    lock(&self.unsaved).insert(user.to_string(), next);
                    return Err(e);
                }
            }
        }

        Ok(tick)
    }

    /// Pick a note and deliver it. Storage errors abandon the fire; delivery
    /// errors become the outcome.
    async fn fire(
        &self,
        user: &str,
        shutdown: &ShutdownSignal,
    ) -> std::result::Result<(Option<i64>, ReminderOutcome), StorageError> {
        let count = retry(
            &self.settings.storage_retry,
            shutdown,
            &self.retry_stats,
            "count_notes",
            || self.repo.count_notes(user),
        )
        .await?;
        if count == 0 {
            tracing::info!("📭 User {user} has no notes, reminder skipped");
            return Ok((None, ReminderOutcome::NoNotesAvailable));
        }

        let note = retry(
            &self.settings.storage_retry,
            shutdown,
            &self.retry_stats,
            "random_note",
            || self.repo.random_note(user),
        )
        .await?;
        let Some(note) = note else {
            tracing::info!("📭 User {user} has no notes, reminder skipped");
            return Ok((None, ReminderOutcome::NoNotesAvailable));
        };

        let outcome = self.deliver(user, &note, shutdown).await;
        Ok((Some(note.id), outcome))
    }

    /// Deliver in the note's own medium, falling back to text once the
    /// retries for a transient failure are used up.
    async fn deliver(&self, user: &str, note: &Note, shutdown: &ShutdownSignal) -> ReminderOutcome {
        let label = format!("deliver {} note {} to {user}", note.kind, note.id);
        let sent = retry(
            &self.settings.delivery_retry,
            shutdown,
            &self.retry_stats,
            &label,
            || self.channel.deliver(user, note),
        )
        .await;

        match sent {
            Ok(()) => {
                tracing::info!("🔔 Reminder sent to user {user} (note {})", note.id);
                ReminderOutcome::Delivered
            }
            Err(DeliveryError::Permanent(reason)) => {
                tracing::warn!("🚫 Reminder for user {user} not deliverable: {reason}");
                ReminderOutcome::PermanentFailure(reason)
            }
            Err(DeliveryError::Transient(reason)) => {
                tracing::warn!("📝 Falling back to text reminder for user {user}");
                match self
                    .channel
                    .deliver_text_fallback(user, &note.reminder_text())
                    .await
                {
                    Ok(()) => {
                        tracing::info!("🔔 Text reminder sent to user {user} (note {})", note.id);
                        ReminderOutcome::DeliveredFallback
                    }
                    Err(e) => {
                        tracing::error!("❌ Reminder for user {user} failed: {reason}; fallback: {e}");
                        ReminderOutcome::Failed(format!("{reason}; fallback: {e}"))
                    }
                }
            }
        }
    }

    /// Write back states whose save failed. One attempt each; what still
    /// fails stays cached.
    async fn flush_unsaved(&self) {
        let pending: Vec<(UserId, UserScheduleState)> = lock(&self.unsaved).drain().collect();
        for (user, state) in pending {
            match self.repo.save_schedule_state(&user, &state).await {
                Ok(()) => tracing::info!("💾 Flushed schedule state for user {user}"),
                Err(e) => {
                    tracing::error!("❌ Could not flush schedule state for user {user}: {e}");
                    lock(&self.unsaved).insert(user, state);
                }
            }
        }
    }

    /// Send a random note right now, outside the schedule. Schedule state is
    /// not touched. Returns `false` when the user has no notes.
    pub async fn send_test_reminder(&self, user: &str) -> Result<bool> {
        let Some(note) = self.repo.random_note(user).await? else {
            tracing::info!("📭 User {user} has no notes to send");
            return Ok(false);
        };

        // Never triggered.
        let signal = Shutdown::new().signal();
        match self.deliver(user, &note, &signal).await {
            ReminderOutcome::PermanentFailure(reason) => {
                Err(NotecallError::Delivery(DeliveryError::Permanent(reason)))
            }
            ReminderOutcome::Failed(reason) => {
                Err(NotecallError::Delivery(DeliveryError::Transient(reason)))
            }
            _ => Ok(true),
        }
    }

    /// Pending reminder slot for `user`, if one is scheduled.
    pub async fn next_reminder_at(&self, user: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.current_state(user).await?.next_fire_at)
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let users = self.repo.list_users().await?;
        let mut scheduled_reminders = 0;
        for user in &users {
            if self.current_state(user).await?.next_fire_at.is_some() {
                scheduled_reminders += 1;
            }
        }

        Ok(SchedulerStats {
            total_users: self.repo.total_users().await?,
            total_notes: self.repo.total_notes().await?,
            scheduled_reminders,
            fired_total: self.fired.load(Ordering::Relaxed),
            failed_total: self.failed.load(Ordering::Relaxed),
            running: self.is_running(),
        })
    }

    /// Unsaved in-memory state wins over the stored copy.
    async fn current_state(&self, user: &str) -> std::result::Result<UserScheduleState, StorageError> {
        let cached = lock(&self.unsaved).get(user).cloned();
        match cached {
            Some(state) => Ok(state),
            None => self.repo.load_schedule_state(user).await,
        }
    }

    fn user_lock(&self, user: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.user_locks).entry(user.to_string()).or_default())
    }

    /// Forget locks of users that are gone. A lock someone still holds stays.
    fn prune_user_locks(&self, users: &[UserId]) {
        let known: HashSet<&str> = users.iter().map(String::as_str).collect();
        lock(&self.user_locks)
            .retain(|user, l| known.contains(user.as_str()) || Arc::strong_count(l) > 1);
    }
}

/// Clears the running flag however `run` ends, unwinding included.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
