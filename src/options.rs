//! Publish and subscribe options, with the validation that runs before any
//! statement reaches the store.

use crate::{
    Result,
    db::Param,
    error::RowQueueError,
    job::JobId,
    schedule::DEFAULT_EXPIRE_IN_SECONDS,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_TEAM_CONCURRENCY: usize = 2;
pub const MAX_TEAM_CONCURRENCY: usize = 1000;
pub const MIN_NEW_JOB_CHECK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_NEW_JOB_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// When a published job becomes eligible for dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAfter {
    At(DateTime<Utc>),
    Delay(Duration),
}

impl From<DateTime<Utc>> for StartAfter {
    fn from(at: DateTime<Utc>) -> Self {
        StartAfter::At(at)
    }
}

impl From<Duration> for StartAfter {
    fn from(delay: Duration) -> Self {
        StartAfter::Delay(delay)
    }
}

/// Options accepted by `publish` and its wrappers.
///
/// The singleton window is taken from `singleton_seconds`, else
/// `singleton_minutes`, else `singleton_hours`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub priority: Option<i32>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
    pub expire_in: Option<Duration>,
    pub start_after: Option<StartAfter>,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<u64>,
    pub singleton_minutes: Option<u64>,
    pub singleton_hours: Option<u64>,
    pub singleton_next_slot: bool,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    /// Seconds between attempts; the base delay when backoff is enabled.
    pub fn with_retry_delay(mut self, retry_delay: i32) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: bool) -> Self {
        self.retry_backoff = Some(retry_backoff);
        self
    }

    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = Some(expire_in);
        self
    }

    pub fn with_start_after(mut self, at: DateTime<Utc>) -> Self {
        self.start_after = Some(StartAfter::At(at));
        self
    }

    pub fn with_start_after_delay(mut self, delay: Duration) -> Self {
        self.start_after = Some(StartAfter::Delay(delay));
        self
    }

    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    pub fn with_singleton_seconds(mut self, seconds: u64) -> Self {
        self.singleton_seconds = Some(seconds);
        self
    }

    pub fn with_singleton_minutes(mut self, minutes: u64) -> Self {
        self.singleton_minutes = Some(minutes);
        self
    }

    pub fn with_singleton_hours(mut self, hours: u64) -> Self {
        self.singleton_hours = Some(hours);
        self
    }

    pub fn with_singleton_next_slot(mut self, next_slot: bool) -> Self {
        self.singleton_next_slot = next_slot;
        self
    }

    /// Singleton window in seconds, if any unit was given.
    fn singleton_window(&self) -> Option<u64> {
        self.singleton_seconds
            .or_else(|| self.singleton_minutes.map(|minutes| minutes.saturating_mul(60)))
            .or_else(|| self.singleton_hours.map(|hours| hours.saturating_mul(3600)))
    }

    /// Validates the options and resolves defaults into an insertable job.
    pub fn normalize(&self, name: &str, data: Option<Value>) -> Result<NewJob> {
        let retry_limit = non_negative("retry_limit", self.retry_limit)?;
        let retry_delay = non_negative("retry_delay", self.retry_delay)?;
        let retry_backoff = self.retry_backoff.unwrap_or(false);

        // backoff needs a base to grow from, and a delay is pointless without a retry
        let retry_delay = if retry_backoff && retry_delay == 0 { 1 } else { retry_delay };
        let retry_limit = if retry_delay > 0 && retry_limit == 0 { 1 } else { retry_limit };

        let expire_in_seconds = match self.expire_in {
            Some(expire_in) => {
                let seconds = whole_seconds("expire_in", expire_in)?;
                if seconds < 1 {
                    return Err(RowQueueError::validation(
                        "expire_in must be at least 1 second",
                    ));
                }
                seconds
            }
            None => DEFAULT_EXPIRE_IN_SECONDS,
        };

        let (start_after, start_after_seconds) = match self.start_after {
            Some(StartAfter::At(at)) => (Some(at), None),
            Some(StartAfter::Delay(delay)) => (None, Some(whole_seconds("start_after", delay)?)),
            None => (None, None),
        };

        let singleton_seconds = match self.singleton_window() {
            Some(0) => {
                return Err(RowQueueError::validation(
                    "singleton window must be at least 1 second",
                ));
            }
            Some(window) => Some(i32::try_from(window).map_err(|_| {
                RowQueueError::validation(format!("singleton window of {}s is too large", window))
            })?),
            None => None,
        };

        Ok(NewJob {
            name: name.to_string(),
            data,
            priority: self.priority.unwrap_or(0),
            retry_limit,
            retry_delay,
            retry_backoff,
            expire_in_seconds,
            start_after,
            start_after_seconds,
            singleton_key: self.singleton_key.clone(),
            singleton_seconds,
            singleton_offset: 0,
            singleton_next_slot: self.singleton_next_slot && singleton_seconds.is_some(),
        })
    }
}

fn non_negative(field: &str, value: Option<i32>) -> Result<i32> {
    match value {
        Some(value) if value < 0 => Err(RowQueueError::validation(format!(
            "{} must be an integer >= 0, got {}",
            field, value
        ))),
        Some(value) => Ok(value),
        None => Ok(0),
    }
}

fn whole_seconds(field: &str, duration: Duration) -> Result<i32> {
    i32::try_from(duration.as_secs())
        .map_err(|_| RowQueueError::validation(format!("{} of {:?} is too large", field, duration)))
}

/// A validated insert, ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub data: Option<Value>,
    pub priority: i32,
    pub retry_limit: i32,
    pub retry_delay: i32,
    pub retry_backoff: bool,
    pub expire_in_seconds: i32,
    pub start_after: Option<DateTime<Utc>>,
    pub start_after_seconds: Option<i32>,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<i32>,
    pub singleton_offset: i32,
    pub singleton_next_slot: bool,
}

impl NewJob {
    /// The follow-up insert a debounced publish makes after a slot collision:
    /// the next slot, starting one window from now.
    pub fn reslot(&self) -> Option<NewJob> {
        let window = self.singleton_seconds.filter(|_| self.singleton_next_slot)?;
        Some(NewJob {
            start_after: None,
            start_after_seconds: Some(window),
            singleton_offset: window,
            singleton_next_slot: false,
            ..self.clone()
        })
    }

    /// Parameters in the order the insert statement binds them.
    pub fn params(&self, id: JobId) -> Vec<Param> {
        vec![
            Param::Uuid(id),
            Param::Text(Some(self.name.clone())),
            Param::Int(Some(self.priority)),
            Param::Int(Some(self.retry_limit)),
            Param::Timestamp(self.start_after),
            Param::Int(self.start_after_seconds),
            Param::Int(Some(self.expire_in_seconds)),
            Param::Json(self.data.clone()),
            Param::Text(self.singleton_key.clone()),
            Param::Int(self.singleton_seconds),
            Param::Int(Some(self.singleton_offset)),
            Param::Int(Some(self.retry_delay)),
            Param::Bool(self.retry_backoff),
        ]
    }
}

/// Options accepted by `subscribe`.
///
/// `batch_size` switches the subscription to batch mode, where the handler
/// receives every fetched job at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub team_size: Option<usize>,
    pub team_concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub new_job_check_interval: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team_size(mut self, team_size: usize) -> Self {
        self.team_size = Some(team_size);
        self
    }

    pub fn with_team_concurrency(mut self, team_concurrency: usize) -> Self {
        self.team_concurrency = Some(team_concurrency);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_new_job_check_interval(mut self, interval: Duration) -> Self {
        self.new_job_check_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.team_concurrency {
            if !(1..=MAX_TEAM_CONCURRENCY).contains(&concurrency) {
                return Err(RowQueueError::validation(format!(
                    "team_concurrency must be an integer between 1 and {}, got {}",
                    MAX_TEAM_CONCURRENCY, concurrency
                )));
            }
        }
        if self.team_size == Some(0) {
            return Err(RowQueueError::validation("team_size must be an integer >= 1"));
        }
        if self.batch_size == Some(0) {
            return Err(RowQueueError::validation("batch_size must be an integer >= 1"));
        }
        if let Some(interval) = self.new_job_check_interval {
            if interval < MIN_NEW_JOB_CHECK_INTERVAL {
                return Err(RowQueueError::validation(format!(
                    "new_job_check_interval must be at least {:?}, got {:?}",
                    MIN_NEW_JOB_CHECK_INTERVAL, interval
                )));
            }
        }
        Ok(())
    }

    pub fn is_batch(&self) -> bool {
        self.batch_size.is_some()
    }

    /// Rows requested per poll.
    pub fn fetch_size(&self) -> usize {
        self.batch_size.or(self.team_size).unwrap_or(1)
    }

    pub fn concurrency(&self) -> usize {
        self.team_concurrency.unwrap_or(DEFAULT_TEAM_CONCURRENCY)
    }

    /// Poll interval, falling back to `default` when unset.
    pub fn interval_or(&self, default: Duration) -> Duration {
        self.new_job_check_interval.unwrap_or(default)
    }
}
