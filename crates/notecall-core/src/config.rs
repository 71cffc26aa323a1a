//! Notecall configuration system.
//!
//! Loaded from `~/.notecall/config.toml` (every field has a default), then
//! overridden by environment variables, then validated once at startup.

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NotecallError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotecallConfig {
    #[serde(default)]
    pub reminder: ReminderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl NotecallConfig {
    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NotecallError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| NotecallError::Config(format!("Failed to parse config: {e}")))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Notecall home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".notecall")
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(path) = lookup("NOTECALL_DB_PATH") {
            self.database.path = path;
        }
        if let Some(v) = lookup("REMINDER_START_HOUR") {
            self.reminder.start_hour = parse_env("REMINDER_START_HOUR", &v)?;
        }
        if let Some(v) = lookup("REMINDER_END_HOUR") {
            self.reminder.end_hour = parse_env("REMINDER_END_HOUR", &v)?;
        }
        if let Some(v) = lookup("REMINDER_INTERVAL_DAYS") {
            self.reminder.interval_days = parse_env("REMINDER_INTERVAL_DAYS", &v)?;
        }
        if let Some(v) = lookup("REMINDER_TICK_SECS") {
            self.reminder.tick_secs = parse_env("REMINDER_TICK_SECS", &v)?;
        }
        if let Some(v) = lookup("REMINDER_UTC_OFFSET_MINUTES") {
            self.reminder.utc_offset_minutes = parse_env("REMINDER_UTC_OFFSET_MINUTES", &v)?;
        }
        Ok(())
    }

    /// Check every setting the engine depends on.
    pub fn validate(&self) -> Result<()> {
        self.reminder.window()?;
        let r = &self.reminder;
        if r.tick_secs == 0 || r.tick_secs > 60 {
            return Err(NotecallError::Config(format!(
                "tick_secs must be between 1 and 60, got {}",
                r.tick_secs
            )));
        }
        if r.max_concurrent_users == 0 {
            return Err(NotecallError::Config(
                "max_concurrent_users must be at least 1".into(),
            ));
        }
        self.retry.storage.validate("retry.storage")?;
        self.retry.delivery.validate("retry.delivery")?;
        let s = &self.supervisor;
        if s.initial_delay_secs > s.max_delay_secs {
            return Err(NotecallError::Config(format!(
                "supervisor.initial_delay_secs ({}) exceeds max_delay_secs ({})",
                s.initial_delay_secs, s.max_delay_secs
            )));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| NotecallError::Config(format!("{key}: invalid value '{value}'")))
}

/// When and how often reminders fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_interval_days")]
    pub interval_days: u32,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Offset of the users' local time from UTC; days and hours are local.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_max_concurrent_users")]
    pub max_concurrent_users: usize,
}

fn default_start_hour() -> u32 { 8 }
fn default_end_hour() -> u32 { 20 }
fn default_interval_days() -> u32 { 2 }
fn default_tick_secs() -> u64 { 60 }
fn default_max_concurrent_users() -> usize { 4 }

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            interval_days: default_interval_days(),
            tick_secs: default_tick_secs(),
            utc_offset_minutes: 0,
            max_concurrent_users: default_max_concurrent_users(),
        }
    }
}

impl ReminderConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn window(&self) -> Result<ReminderWindow> {
        ReminderWindow::new(self.start_hour, self.end_hour, self.interval_days)?
            .with_utc_offset_minutes(self.utc_offset_minutes)
    }
}

/// Retry settings for storage and delivery calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub storage: BackoffConfig,
    #[serde(default)]
    pub delivery: BackoffConfig,
}

/// Bounded exponential backoff: `base * 2^n`, capped at `max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 30_000 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(NotecallError::Config(format!(
                "{section}.max_attempts must be at least 1"
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(NotecallError::Config(format!(
                "{section}.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Restart behavior of the scheduler supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_supervisor_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Completed ticks after which a crash no longer counts as consecutive.
    #[serde(default = "default_healthy_ticks_to_reset")]
    pub healthy_ticks_to_reset: u64,
    /// Give up after this many restarts. Unlimited when unset.
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

fn default_initial_delay_secs() -> u64 { 30 }
fn default_supervisor_max_delay_secs() -> u64 { 300 }
fn default_healthy_ticks_to_reset() -> u64 { 10 }

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_supervisor_max_delay_secs(),
            healthy_ticks_to_reset: default_healthy_ticks_to_reset(),
            max_restarts: None,
        }
    }
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String { "https://api.telegram.org".into() }
fn default_timeout_secs() -> u64 { 30 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Note database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.notecall/notes.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Validated reminder window. Immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderWindow {
    pub start_hour: u32,
    /// Exclusive; `24` means "until midnight".
    pub end_hour: u32,
    pub interval_days: u32,
    pub utc_offset: FixedOffset,
}

impl ReminderWindow {
    /// Window in UTC. Requires `0 <= start < end <= 24` and `interval >= 1`.
    pub fn new(start_hour: u32, end_hour: u32, interval_days: u32) -> Result<Self> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(NotecallError::Config(format!(
                "reminder window {start_hour}:00-{end_hour}:00 is invalid (need 0 <= start < end <= 24)"
            )));
        }
        if interval_days == 0 {
            return Err(NotecallError::Config(
                "interval_days must be at least 1".into(),
            ));
        }
        Ok(Self {
            start_hour,
            end_hour,
            interval_days,
            utc_offset: FixedOffset::east_opt(0)
                .ok_or_else(|| NotecallError::Config("invalid UTC offset".into()))?,
        })
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Result<Self> {
        self.utc_offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                NotecallError::Config(format!("utc_offset_minutes {minutes} is out of range"))
            })?;
        Ok(self)
    }
}
