//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Utc, Weekday};

use crate::error::ConfigError;

/// Tunables for the meeting pipeline.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Below this confidence the assistant always asks for clarification.
    pub low_threshold: f64,
    /// At or above this confidence an explicit "any time" request is booked.
    pub high_threshold: f64,
    /// Upper bound on a single generative-text call.
    pub llm_timeout: Duration,
    /// Upper bound on a single calendar call.
    pub calendar_timeout: Duration,
    /// Normalized text is truncated to this many characters.
    pub max_text_chars: usize,
    /// Candidate slots start on multiples of this many minutes.
    pub slot_granularity_minutes: u32,
    /// Maximum number of slots returned by the resolver.
    pub max_slots: usize,
    /// Business days searched when the request names no window.
    pub horizon_business_days: u32,
    /// Preferred windows are cut off this many days after now.
    pub max_search_days: u32,
    pub business_hours: BusinessHours,
    /// Calendar id whose availability is always checked (the executive).
    pub calendar_owner: String,
    pub send_attempts: u32,
    pub send_backoff_base: Duration,
    pub store_attempts: u32,
    /// Maximum messages processed at once by `process_batch`.
    pub max_concurrency: usize,
    /// Address alerted when urgent mail arrives. Urgent mail is only logged
    /// and recorded when unset.
    pub urgent_recipient: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.4,
            high_threshold: 0.8,
            llm_timeout: Duration::from_secs(10),
            calendar_timeout: Duration::from_secs(10),
            max_text_chars: 4000,
            slot_granularity_minutes: 15,
            max_slots: 5,
            horizon_business_days: 5,
            max_search_days: 60,
            business_hours: BusinessHours::default(),
            calendar_owner: "primary".to_string(),
            send_attempts: 3,
            send_backoff_base: Duration::from_millis(500),
            store_attempts: 3,
            max_concurrency: 4,
            urgent_recipient: None,
        }
    }
}

impl AssistantConfig {
    /// Build config from `EXEC_ASSIST_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let start_hour = env_or("EXEC_ASSIST_BUSINESS_START_HOUR", defaults.business_hours.start_hour)?;
        let end_hour = env_or("EXEC_ASSIST_BUSINESS_END_HOUR", defaults.business_hours.end_hour)?;
        let offset_minutes: i32 = env_or("EXEC_ASSIST_UTC_OFFSET_MIN", 0)?;
        let business_hours = BusinessHours::new(start_hour, end_hour, offset_minutes)?;

        let config = Self {
            low_threshold: env_or("EXEC_ASSIST_LOW_THRESHOLD", defaults.low_threshold)?,
            high_threshold: env_or("EXEC_ASSIST_HIGH_THRESHOLD", defaults.high_threshold)?,
            llm_timeout: Duration::from_secs(env_or(
                "EXEC_ASSIST_LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            calendar_timeout: Duration::from_secs(env_or(
                "EXEC_ASSIST_CALENDAR_TIMEOUT_SECS",
                defaults.calendar_timeout.as_secs(),
            )?),
            max_text_chars: env_or("EXEC_ASSIST_MAX_TEXT_CHARS", defaults.max_text_chars)?,
            slot_granularity_minutes: env_or(
                "EXEC_ASSIST_SLOT_GRANULARITY_MIN",
                defaults.slot_granularity_minutes,
            )?,
            max_slots: env_or("EXEC_ASSIST_MAX_SLOTS", defaults.max_slots)?,
            horizon_business_days: env_or(
                "EXEC_ASSIST_HORIZON_DAYS",
                defaults.horizon_business_days,
            )?,
            max_search_days: env_or("EXEC_ASSIST_MAX_SEARCH_DAYS", defaults.max_search_days)?,
            business_hours,
            calendar_owner: std::env::var("EXEC_ASSIST_CALENDAR_OWNER")
                .unwrap_or(defaults.calendar_owner),
            send_attempts: env_or("EXEC_ASSIST_SEND_ATTEMPTS", defaults.send_attempts)?,
            send_backoff_base: Duration::from_millis(env_or(
                "EXEC_ASSIST_SEND_BACKOFF_MS",
                defaults.send_backoff_base.as_millis() as u64,
            )?),
            store_attempts: env_or("EXEC_ASSIST_STORE_ATTEMPTS", defaults.store_attempts)?,
            max_concurrency: env_or("EXEC_ASSIST_MAX_CONCURRENCY", defaults.max_concurrency)?,
            urgent_recipient: std::env::var("EXEC_ASSIST_URGENT_RECIPIENT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.low_threshold) || !in_unit(self.high_threshold) {
            return Err(invalid("thresholds", "must be within [0, 1]"));
        }
        if self.low_threshold > self.high_threshold {
            return Err(invalid(
                "EXEC_ASSIST_LOW_THRESHOLD",
                "must not exceed EXEC_ASSIST_HIGH_THRESHOLD",
            ));
        }
        if self.slot_granularity_minutes == 0 {
            return Err(invalid("EXEC_ASSIST_SLOT_GRANULARITY_MIN", "must be positive"));
        }
        if self.max_search_days == 0 {
            return Err(invalid("EXEC_ASSIST_MAX_SEARCH_DAYS", "must be positive"));
        }
        if self.max_slots == 0 {
            return Err(invalid("EXEC_ASSIST_MAX_SLOTS", "must be positive"));
        }
        if self.send_attempts == 0 || self.store_attempts == 0 {
            return Err(invalid("attempts", "must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("EXEC_ASSIST_MAX_CONCURRENCY", "must be positive"));
        }
        Ok(())
    }
}

/// Working-day window, Monday to Friday, at a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub offset: FixedOffset,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            offset: Utc.fix(),
        }
    }
}

impl BusinessHours {
    pub fn new(start_hour: u32, end_hour: u32, offset_minutes: i32) -> Result<Self, ConfigError> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(invalid(
                "EXEC_ASSIST_BUSINESS_START_HOUR",
                &format!("business hours {start_hour}..{end_hour} are not a valid day window"),
            ));
        }
        let offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            invalid("EXEC_ASSIST_UTC_OFFSET_MIN", "offset out of range")
        })?;
        Ok(Self {
            start_hour,
            end_hour,
            offset,
        })
    }

    /// Length of the working day in minutes.
    pub fn day_minutes(&self) -> i64 {
        i64::from(self.end_hour - self.start_hour) * 60
    }

    pub fn is_business_day(&self, at: DateTime<Utc>) -> bool {
        !matches!(
            at.with_timezone(&self.offset).weekday(),
            Weekday::Sat | Weekday::Sun
        )
    }

    /// Whether `[start, end)` lies entirely inside one business day's hours.
    pub fn contains(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if !self.is_business_day(start) {
            return false;
        }
        match self.day_window(start) {
            Some((open, close)) => start >= open && end <= close,
            None => false,
        }
    }

    /// Opening and closing instants of the business day containing `at`.
    pub fn day_window(&self, at: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let date = at.with_timezone(&self.offset).date_naive();
        let open = date.and_hms_opt(self.start_hour, 0, 0)?;
        let close = open + chrono::Duration::minutes(self.day_minutes());
        let open = self.offset.from_local_datetime(&open).single()?;
        let close = self.offset.from_local_datetime(&close).single()?;
        Some((open.with_timezone(&Utc), close.with_timezone(&Utc)))
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Parse an env var, returning `default` when it is unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
