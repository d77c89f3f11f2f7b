use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::RowQueueError;

pub type JobId = Uuid;

/// Name prefix reserved for completion-event jobs.
pub const COMPLETED_JOB_PREFIX: &str = "__state__completed__";

/// Returns the completion topic that carries outcomes of jobs named `name`.
pub fn completion_name(name: &str) -> String {
    format!("{}{}", COMPLETED_JOB_PREFIX, name)
}

pub fn is_completion_name(name: &str) -> bool {
    name.starts_with(COMPLETED_JOB_PREFIX)
}

/// Lifecycle state of a job.
///
/// The declaration order is the ordinal order of the `job_state` enum in the
/// store. Eligibility and terminal checks compare states, so the derived `Ord`
/// must stay in sync with the DDL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Expired,
    Cancelled,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Created,
        JobState::Retry,
        JobState::Active,
        JobState::Completed,
        JobState::Expired,
        JobState::Cancelled,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Retry => "retry",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Expired => "expired",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }

    /// `created` and `retry` are the only states a dequeue will claim.
    pub fn is_eligible(&self) -> bool {
        *self < JobState::Active
    }

    pub fn is_terminal(&self) -> bool {
        *self >= JobState::Completed
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = RowQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| RowQueueError::Store {
                message: format!("Unknown job state: {}", s),
            })
    }
}

/// A job row as stored in the `job` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub priority: i32,
    pub data: Option<serde_json::Value>,
    pub state: JobState,
    pub retry_limit: i32,
    pub retry_count: i32,
    pub retry_delay: i32,
    pub retry_backoff: bool,
    pub start_after: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub singleton_key: Option<String>,
    pub singleton_on: Option<NaiveDateTime>,
    pub expire_in_seconds: i32,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_completion_event(&self) -> bool {
        is_completion_name(&self.name)
    }

    /// Decodes the completion envelope carried by a completion-event job.
    pub fn completion(&self) -> Option<CompletionEnvelope> {
        if !self.is_completion_event() {
            return None;
        }
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }
}

/// The original request recorded inside a completion envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub id: JobId,
    pub name: String,
    pub data: Option<serde_json::Value>,
}

/// Payload of a completion-event job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEnvelope {
    pub request: CompletionRequest,
    pub response: Option<serde_json::Value>,
    pub state: JobState,
    pub retry_count: i32,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub failed: bool,
}

impl CompletionEnvelope {
    /// Builds the envelope for `job` after its terminal transition.
    pub fn for_job(job: &Job, response: Option<serde_json::Value>) -> Self {
        Self {
            request: CompletionRequest {
                id: job.id,
                name: job.name.clone(),
                data: job.data.clone(),
            },
            response,
            state: job.state,
            retry_count: job.retry_count,
            created_on: job.created_on,
            started_on: job.started_on,
            completed_on: job.completed_on,
            failed: job.state != JobState::Completed,
        }
    }
}

/// One or more job ids addressed by `complete`, `fail`, or `cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobIds(pub Vec<JobId>);

impl JobIds {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<JobId> {
        self.0
    }
}

impl From<JobId> for JobIds {
    fn from(id: JobId) -> Self {
        JobIds(vec![id])
    }
}

impl From<Vec<JobId>> for JobIds {
    fn from(ids: Vec<JobId>) -> Self {
        JobIds(ids)
    }
}

impl From<&[JobId]> for JobIds {
    fn from(ids: &[JobId]) -> Self {
        JobIds(ids.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job(name: &str, state: JobState) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: name.to_string(),
            priority: 0,
            data: Some(json!({"to": "user@example.com"})),
            state,
            retry_limit: 0,
            retry_count: 0,
            retry_delay: 0,
            retry_backoff: false,
            start_after: now,
            started_on: Some(now),
            singleton_key: None,
            singleton_on: None,
            expire_in_seconds: 900,
            created_on: now,
            completed_on: Some(now),
        }
    }

    #[test]
    fn test_state_ordinal_order() {
        assert!(JobState::Created < JobState::Retry);
        assert!(JobState::Retry < JobState::Active);
        assert!(JobState::Active < JobState::Completed);
        assert!(JobState::Completed < JobState::Expired);
        assert!(JobState::Expired < JobState::Cancelled);
        assert!(JobState::Cancelled < JobState::Failed);

        assert!(JobState::Retry.is_eligible());
        assert!(!JobState::Active.is_eligible());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                json!(state.as_str())
            );
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_completion_names() {
        assert_eq!(completion_name("email"), "__state__completed__email");
        assert!(is_completion_name(&completion_name("email")));
        assert!(!is_completion_name("email"));
    }

    #[test]
    fn test_completion_envelope_uses_camel_case_keys() {
        let job = sample_job("email", JobState::Completed);
        let envelope = CompletionEnvelope::for_job(&job, Some(json!({"x": 1})));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["request"]["name"], json!("email"));
        assert_eq!(value["response"], json!({"x": 1}));
        assert_eq!(value["retryCount"], json!(0));
        assert_eq!(value["failed"], json!(false));
        assert!(value.get("completedOn").is_some());
    }

    #[test]
    fn test_failed_envelope_and_decoding() {
        let source = sample_job("email", JobState::Failed);
        let envelope = CompletionEnvelope::for_job(&source, None);
        assert!(envelope.failed);

        let mut event = sample_job(&completion_name("email"), JobState::Created);
        event.data = Some(serde_json::to_value(&envelope).unwrap());
        assert_eq!(event.completion(), Some(envelope));
        assert_eq!(source.completion(), None);
    }

    #[test]
    fn test_job_ids_conversions() {
        let id = Uuid::new_v4();
        assert_eq!(JobIds::from(id).len(), 1);
        assert!(JobIds::from(Vec::new()).is_empty());
        assert_eq!(JobIds::from(&[id, id][..]).into_vec(), vec![id, id]);
    }
}
