//! Reminder policy: decides if and when a user's next reminder fires.
//!
//! Pure: every input (state, window, current time, randomness) is passed in,
//! nothing is read from the environment. The engine owns the side effects.
//!
//! Per user per tick:
//! ```text
//! today != last_evaluated_day ──► eligible(today)? ──yes──► draw slot in [start, end) ──► ScheduleFire(at)
//!                                       └──no──► clear slot ──► NoOp
//! today == last_evaluated_day ──► slot set && now >= slot ──► Fire, else NoOp
//! ```

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rand::Rng;

use notecall_core::{ReminderOutcome, ReminderWindow, UserScheduleState};

/// What the engine should do for a user this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NoOp,
    /// A slot was drawn for today; nothing to send yet.
    ScheduleFire(DateTime<Utc>),
    /// The slot is due: pick a note and deliver it.
    Fire,
}

/// New state plus the action to carry out.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub state: UserScheduleState,
    pub action: Action,
}

/// Day number of `now` in the window's timezone (days since 1970-01-01).
pub fn calendar_day(now: DateTime<Utc>, window: &ReminderWindow) -> i64 {
    let local = now.with_timezone(&window.utc_offset).date_naive();
    local
        .signed_duration_since(DateTime::<Utc>::UNIX_EPOCH.date_naive())
        .num_days()
}

/// Every `interval_days`-th day number is a reminder day, for every user.
pub fn is_eligible_day(day: i64, interval_days: u32) -> bool {
    day.rem_euclid(i64::from(interval_days.max(1))) == 0
}

/// UTC instants of `start_hour` and `end_hour` on local day `day`.
pub fn window_bounds(day: i64, window: &ReminderWindow) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let date: NaiveDate = DateTime::<Utc>::UNIX_EPOCH
        .date_naive()
        .checked_add_signed(Duration::try_days(day)?)?;
    let local_midnight = date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?);
    let utc_midnight = local_midnight
        - Duration::seconds(i64::from(window.utc_offset.local_minus_utc()));
    let midnight = utc_midnight.and_utc();
    Some((
        midnight + Duration::hours(i64::from(window.start_hour)),
        midnight + Duration::hours(i64::from(window.end_hour)),
    ))
}

/// Evaluate one user at `now`.
pub fn evaluate<R: Rng + ?Sized>(
    state: &UserScheduleState,
    window: &ReminderWindow,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Decision {
    let today = calendar_day(now, window);
    let mut next = state.clone();

    if let Some(evaluated) = state.last_evaluated_day {
        // Same day, or a clock that stepped back: never re-evaluate.
        if today <= evaluated {
            let action = match state.next_fire_at {
                Some(at) if now >= at => Action::Fire,
                _ => Action::NoOp,
            };
            return Decision { state: next, action };
        }
    }

    if let Some(missed) = state.next_fire_at {
        tracing::warn!(
            "⏭️ Dropping unfired reminder slot {} for user {} (day changed)",
            missed,
            state.user_id
        );
    }

    next.last_evaluated_day = Some(today);
    next.next_fire_at = None;

    if !is_eligible_day(today, window.interval_days) {
        return Decision {
            state: next,
            action: Action::NoOp,
        };
    }

    match draw_fire_time(today, window, now, rng) {
        Some(at) => {
            next.next_fire_at = Some(at);
            Decision {
                state: next,
                action: Action::ScheduleFire(at),
            }
        }
        None => {
            tracing::debug!(
                "Reminder window already closed today for user {}",
                state.user_id
            );
            Decision {
                state: next,
                action: Action::NoOp,
            }
        }
    }
}

/// Uniform instant in what is left of today's window, or `None` if it closed.
fn draw_fire_time<R: Rng + ?Sized>(
    day: i64,
    window: &ReminderWindow,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<DateTime<Utc>> {
    let (start, end) = window_bounds(day, window)?;
    let from = start.max(now);
    let span = (end - from).num_seconds();
    if span <= 0 {
        return None;
    }
    Some(from + Duration::seconds(rng.gen_range(0..span)))
}

/// Apply the result of a fire to the state.
///
/// The slot is cleared whatever the outcome so the same slot never fires
/// twice; `last_fired_at` only moves on an actual delivery.
pub fn record_fire(state: &mut UserScheduleState, now: DateTime<Utc>, outcome: ReminderOutcome) {
    state.next_fire_at = None;
    if outcome.is_delivered() {
        state.last_fired_at = Some(now);
    }
    state.last_outcome = Some(outcome);
    state.fire_count = state.fire_count.saturating_add(1);
}
