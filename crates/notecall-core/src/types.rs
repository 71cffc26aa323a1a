//! Data model shared by the scheduler, the repository and the channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable user identifier (the Telegram chat id, as text).
pub type UserId = String;

/// Medium a note was captured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Text,
    Image,
    Voice,
    Document,
    Video,
    Audio,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Text => "text",
            NoteKind::Image => "image",
            NoteKind::Voice => "voice",
            NoteKind::Document => "document",
            NoteKind::Video => "video",
            NoteKind::Audio => "audio",
        }
    }

    /// Parse a stored kind. Unknown kinds degrade to `Text`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" => NoteKind::Image,
            "voice" => NoteKind::Voice,
            "document" => NoteKind::Document,
            "video" => NoteKind::Video,
            "audio" => NoteKind::Audio,
            _ => NoteKind::Text,
        }
    }
}

impl std::fmt::Display for NoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured note. Read-only to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub user_id: UserId,
    pub kind: NoteKind,
    /// Path of the stored media file, for non-text notes.
    pub payload_ref: Option<String>,
    /// Text content, or the caption of a media note.
    pub caption: String,
    pub created_at: DateTime<Utc>,
}

impl Note {
    /// Create a plain text note.
    pub fn text(id: i64, user_id: &str, caption: &str) -> Self {
        Self {
            id,
            user_id: user_id.to_string(),
            kind: NoteKind::Text,
            payload_ref: None,
            caption: caption.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Create a media note backed by a file.
    pub fn media(id: i64, user_id: &str, kind: NoteKind, path: &str, caption: &str) -> Self {
        Self {
            kind,
            payload_ref: Some(path.to_string()),
            ..Self::text(id, user_id, caption)
        }
    }

    /// Body of the reminder message. Doubles as the text-only fallback.
    pub fn reminder_text(&self) -> String {
        format!("📚 Reminder:\n{}", self.caption)
    }

    /// Char-safe prefix of the caption, for log lines.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.caption.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

/// How a fired reminder ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ReminderOutcome {
    Delivered,
    /// The rich medium failed; the text-only rendition went through.
    DeliveredFallback,
    /// The user had nothing to be reminded of. Not an error.
    NoNotesAvailable,
    PermanentFailure(String),
    /// Retries and the text fallback were exhausted.
    Failed(String),
}

impl ReminderOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            ReminderOutcome::Delivered | ReminderOutcome::DeliveredFallback
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReminderOutcome::Delivered => "delivered",
            ReminderOutcome::DeliveredFallback => "delivered_fallback",
            ReminderOutcome::NoNotesAvailable => "no_notes",
            ReminderOutcome::PermanentFailure(_) => "permanent_failure",
            ReminderOutcome::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ReminderOutcome::PermanentFailure(d) | ReminderOutcome::Failed(d) => Some(d),
            _ => None,
        }
    }

    /// Rebuild an outcome from its stored `label` / `detail` columns.
    pub fn from_parts(label: &str, detail: Option<String>) -> Option<Self> {
        match label {
            "delivered" => Some(ReminderOutcome::Delivered),
            "delivered_fallback" => Some(ReminderOutcome::DeliveredFallback),
            "no_notes" => Some(ReminderOutcome::NoNotesAvailable),
            "permanent_failure" => Some(ReminderOutcome::PermanentFailure(
                detail.unwrap_or_default(),
            )),
            "failed" => Some(ReminderOutcome::Failed(detail.unwrap_or_default())),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReminderOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{} ({detail})", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

/// One fired reminder, as written to the reminder log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub user_id: UserId,
    /// Note that was picked, if any.
    pub note_id: Option<i64>,
    pub outcome: ReminderOutcome,
    pub at: DateTime<Utc>,
}

/// Per-user scheduling state. Owned by the scheduler loop, persisted through
/// the repository after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserScheduleState {
    pub user_id: UserId,
    /// Day number (days since 1970-01-01, local to the configured offset) of
    /// the last evaluation. `None` until the user is first evaluated.
    pub last_evaluated_day: Option<i64>,
    /// Pending reminder slot on the current eligible day.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Last successful delivery.
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<ReminderOutcome>,
    /// Reminders fired so far, whatever their outcome.
    pub fire_count: u32,
}

impl UserScheduleState {
    /// Fresh, never-evaluated state.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            last_evaluated_day: None,
            next_fire_at: None,
            last_fired_at: None,
            last_outcome: None,
            fire_count: 0,
        }
    }
}
