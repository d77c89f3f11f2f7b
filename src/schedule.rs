//! Time arithmetic shared by the statement templates and the in-memory store.
//!
//! The SQL in [`crate::plans`] and the interpreter in [`crate::db::memory`] must agree
//! on singleton slots and retry delays, so both are expressed here once.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::job::{Job, JobState};

/// Upper bound on the backoff exponent; caps the longest retry wait.
pub const MAX_BACKOFF_EXPONENT: i32 = 16;

/// Extra insert attempts a debounced publish makes after a slot collision.
pub const DEBOUNCE_RESLOT_ATTEMPTS: usize = 1;

pub const DEFAULT_EXPIRE_IN_SECONDS: i32 = 15 * 60;

/// Start of the singleton slot of `seconds` length containing `now + offset`.
///
/// Mirrors `'epoch'::timestamp + S * floor((date_part('epoch', now()) + O) / S)`.
/// Sub-second precision never moves a result across a slot boundary because
/// boundaries fall on whole seconds.
pub fn singleton_slot(now: DateTime<Utc>, seconds: i64, offset: i64) -> Option<NaiveDateTime> {
    if seconds <= 0 {
        return None;
    }
    let slot = (now.timestamp() + offset).div_euclid(seconds) * seconds;
    DateTime::from_timestamp(slot, 0).map(|slot| slot.naive_utc())
}

/// Delay in seconds before a failed attempt becomes eligible again.
///
/// `jitter` is a uniform sample in `[0, 1)` and only applies with backoff.
pub fn retry_delay_seconds(retry_delay: i32, retry_count: i32, backoff: bool, jitter: f64) -> f64 {
    if !backoff {
        return f64::from(retry_delay);
    }
    let exponent = MAX_BACKOFF_EXPONENT.min(retry_count.saturating_add(1));
    let base = f64::from(retry_delay) * 2f64.powi(exponent) / 2.0;
    base + base * jitter
}

/// Applies the failure/expiry transition to `job` in place.
///
/// Every branch reads the pre-update row, like the `SET` list of the fail and
/// expire statements.
pub fn apply_failure(job: &mut Job, now: DateTime<Utc>, terminal: JobState, jitter: f64) {
    let retrying = job.retry_count < job.retry_limit;

    let start_after = if job.retry_count == job.retry_limit {
        job.start_after
    } else {
        let delay = retry_delay_seconds(job.retry_delay, job.retry_count, job.retry_backoff, jitter);
        now + Duration::microseconds((delay * 1_000_000.0) as i64)
    };

    job.state = if retrying { JobState::Retry } else { terminal };
    job.completed_on = if retrying { None } else { Some(now) };
    job.start_after = start_after;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn active_job(retry_limit: i32, retry_count: i32, retry_delay: i32, backoff: bool) -> Job {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Job {
            id: Uuid::new_v4(),
            name: "reports".to_string(),
            priority: 0,
            data: None,
            state: JobState::Active,
            retry_limit,
            retry_count,
            retry_delay,
            retry_backoff: backoff,
            start_after: now,
            started_on: Some(now),
            singleton_key: None,
            singleton_on: None,
            expire_in_seconds: DEFAULT_EXPIRE_IN_SECONDS,
            created_on: now,
            completed_on: None,
        }
    }

    #[test]
    fn test_singleton_slot_alignment() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 42).unwrap();
        let slot = singleton_slot(now, 60, 0).unwrap();
        assert_eq!(slot, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap().naive_utc());

        let next = singleton_slot(now, 60, 60).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap().naive_utc());

        let hourly = singleton_slot(now, 3600, 0).unwrap();
        assert_eq!(hourly, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap().naive_utc());

        assert!(singleton_slot(now, 0, 0).is_none());
    }

    #[test]
    fn test_singleton_slot_ignores_subsecond_precision() {
        let boundary = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 59).unwrap();
        let late = boundary + Duration::milliseconds(999);
        assert_eq!(singleton_slot(boundary, 60, 0), singleton_slot(late, 60, 0));
    }

    #[test]
    fn test_fixed_retry_delay() {
        assert_eq!(retry_delay_seconds(5, 0, false, 0.9), 5.0);
        assert_eq!(retry_delay_seconds(5, 10, false, 0.1), 5.0);
    }

    #[test]
    fn test_backoff_retry_delay() {
        // retry_delay * 2^(count + 1) / 2, before jitter
        assert_eq!(retry_delay_seconds(1, 0, true, 0.0), 1.0);
        assert_eq!(retry_delay_seconds(1, 1, true, 0.0), 2.0);
        assert_eq!(retry_delay_seconds(3, 2, true, 0.0), 12.0);
        assert_eq!(retry_delay_seconds(1, 1, true, 0.5), 3.0);
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        let capped = retry_delay_seconds(1, MAX_BACKOFF_EXPONENT - 1, true, 0.0);
        assert_eq!(capped, 32768.0);
        assert_eq!(retry_delay_seconds(1, 100, true, 0.0), capped);
        assert_eq!(retry_delay_seconds(1, i32::MAX, true, 0.0), capped);
    }

    #[test]
    fn test_apply_failure_retries_until_limit() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();
        let mut job = active_job(2, 1, 10, false);

        apply_failure(&mut job, now, JobState::Failed, 0.0);
        assert_eq!(job.state, JobState::Retry);
        assert_eq!(job.start_after, now + Duration::seconds(10));
        assert!(job.completed_on.is_none());
    }

    #[test]
    fn test_apply_failure_final_attempt_keeps_start_after() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();
        let mut job = active_job(2, 2, 10, false);
        let original_start = job.start_after;

        apply_failure(&mut job, now, JobState::Expired, 0.0);
        assert_eq!(job.state, JobState::Expired);
        assert_eq!(job.start_after, original_start);
        assert_eq!(job.completed_on, Some(now));
    }

    #[test]
    fn test_apply_failure_without_retries() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();
        let mut job = active_job(0, 0, 0, false);

        apply_failure(&mut job, now, JobState::Failed, 0.0);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.completed_on, Some(now));
    }
}
