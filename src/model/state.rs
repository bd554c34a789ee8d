use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::time::UtcTime;
use crate::error::{Result, StorageError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SliceState {
    Writing,
    Closing,
    Uploading,
    Uploaded,
    Failed,
    Imported,
}

impl SliceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceState::Writing => "writing",
            SliceState::Closing => "closing",
            SliceState::Uploading => "uploading",
            SliceState::Uploaded => "uploaded",
            SliceState::Failed => "failed",
            SliceState::Imported => "imported",
        }
    }

    pub fn can_transition_to(&self, to: SliceState) -> bool {
        use SliceState::*;
        matches!(
            (self, to),
            (Writing, Closing) | (Closing, Uploading) | (Uploading, Uploaded) | (Uploading, Failed) | (Failed, Uploading) | (Uploaded, Imported)
        )
    }
}

impl Display for SliceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileState {
    Writing,
    Closing,
    Importing,
    Failed,
    Imported,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Writing => "writing",
            FileState::Closing => "closing",
            FileState::Importing => "importing",
            FileState::Failed => "failed",
            FileState::Imported => "imported",
        }
    }

    pub fn can_transition_to(&self, to: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, to),
            (Writing, Closing) | (Closing, Importing) | (Importing, Imported) | (Importing, Failed) | (Failed, Importing)
        )
    }
}

impl Display for FileState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Exponential backoff of failed upload/import attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self { initial: Duration::from_secs(2 * 60), multiplier: 4, max: Duration::from_secs(3 * 60 * 60) }
    }
}

impl RetryBackoff {
    /// Delay before the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut d = self.initial;
        for _ in 1..attempt.max(1) {
            d = d.saturating_mul(self.multiplier);
            if d >= self.max { return self.max; }
        }
        d.min(self.max)
    }

    pub fn retry_after(&self, failed_at: UtcTime, attempt: u32) -> UtcTime {
        let delay = chrono::Duration::from_std(self.delay(attempt)).unwrap_or_else(|_| chrono::Duration::hours(3));
        UtcTime::new(failed_at.as_datetime() + delay)
    }
}

/// Failure bookkeeping shared by slices and files. All fields are set iff `retry_attempt > 0`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retryable {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<UtcTime>,
}

fn is_zero(v: &u32) -> bool { *v == 0 }

impl Retryable {
    pub fn increment(&mut self, now: UtcTime, reason: &str, backoff: &RetryBackoff) {
        self.retry_attempt += 1;
        self.retry_reason = Some(reason.to_string());
        self.last_failed_at = Some(now);
        self.retry_after = Some(backoff.retry_after(now, self.retry_attempt));
    }

    pub fn reset(&mut self) { *self = Retryable::default(); }

    pub fn can_retry(&self, now: UtcTime) -> bool { self.retry_after.map(|t| now >= t).unwrap_or(true) }

    pub fn validate(&self) -> Result<()> {
        let set = [self.retry_reason.is_some(), self.last_failed_at.is_some(), self.retry_after.is_some()];
        let expected = self.retry_attempt > 0;
        if set.iter().any(|s| *s != expected) {
            return Err(StorageError::InvalidTimestamps(format!(
                "retry fields must be set iff retryAttempt > 0, retryAttempt = {}",
                self.retry_attempt
            )));
        }
        Ok(())
    }
}

/// Checks that each timestamp is present iff the state has passed it.
pub(crate) fn check_timestamps(state: &str, fields: &[(&str, bool, bool)]) -> Result<()> {
    for (name, expected, present) in fields {
        if expected != present {
            let msg = if *expected { "must be set" } else { "must not be set" };
            return Err(StorageError::InvalidTimestamps(format!("\"{}\" {} in the \"{}\" state", name, msg, state)));
        }
    }
    Ok(())
}
