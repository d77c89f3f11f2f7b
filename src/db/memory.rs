//! In-memory executor for tests and local development.
//!
//! [`MemoryExecutor`] interprets the typed statements from [`crate::plans`] against
//! rows held in process, reproducing the store semantics the lifecycle depends
//! on: ordinal state comparisons, the three partial unique indices, skip-locked
//! dequeue order, the retry transition, and completion fan-out. Time comes from a
//! [`MockClock`] so tests can move past `start_after` and `expire_in` instantly.
//!
//! Each statement runs under one lock and observes a single `now`, like a
//! statement inside a PostgreSQL transaction. The clock ticks forward one
//! microsecond per statement so consecutive statements never share a timestamp.
//!
//! # Examples
//!
//! ```rust
//! use rowqueue::db::{Executor, MemoryExecutor, MockClock};
//! use rowqueue::{JobOperations, Migrator, Plans, PublishOptions, QueueManager};
//! use chrono::Duration;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> rowqueue::Result<()> {
//! let clock = MockClock::new();
//! let executor: Arc<dyn Executor> = Arc::new(MemoryExecutor::with_clock(clock.clone()));
//! let plans = Arc::new(Plans::new("rowqueue")?);
//! Migrator::new(executor.clone(), plans.clone()).install().await?;
//! let manager = QueueManager::new(executor, plans);
//!
//! let options = PublishOptions::new().with_start_after_delay(std::time::Duration::from_secs(60));
//! manager.publish("reports", None, options).await?;
//! assert!(manager.fetch("reports", None).await?.is_none());
//!
//! clock.advance(Duration::minutes(2));
//! assert!(manager.fetch("reports", None).await?.is_some());
//! # Ok(())
//! # }
//! ```

use super::{Executor, Param, Row, StatementResult};
use crate::{
    Result,
    error::RowQueueError,
    job::{CompletionEnvelope, Job, JobId, JobState, completion_name, is_completion_name},
    plans::{Command, SCHEMA_VERSION, Statement},
    schedule::{self, DEFAULT_EXPIRE_IN_SECONDS},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::{Value, json};
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Mock clock for controlling time in tests.
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Advance the mock time by the given duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }

    fn tick(&self) -> DateTime<Utc> {
        self.advance(Duration::microseconds(1));
        self.now()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct ArchivedJob {
    job: Job,
    archived_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MemoryStore {
    installed: bool,
    version: Option<String>,
    jobs: Vec<Job>,
    archive: Vec<ArchivedJob>,
    closed: bool,
}

/// Executes statements against in-process rows.
#[derive(Clone)]
pub struct MemoryExecutor {
    clock: MockClock,
    store: Arc<AsyncMutex<MemoryStore>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::with_clock(MockClock::new())
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            clock,
            store: Arc::new(AsyncMutex::new(MemoryStore::default())),
        }
    }

    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    /// Snapshot of the live job rows, in insertion order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.store.lock().await.jobs.clone()
    }

    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.store
            .lock()
            .await
            .jobs
            .iter()
            .find(|job| job.id == id)
            .cloned()
    }

    /// Snapshot of archived rows.
    pub async fn archived(&self) -> Vec<Job> {
        self.store
            .lock()
            .await
            .archive
            .iter()
            .map(|archived| archived.job.clone())
            .collect()
    }
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryExecutor")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for MemoryExecutor {
    async fn execute(&self, statement: &Statement, params: Vec<Param>) -> Result<StatementResult> {
        let mut store = self.store.lock().await;
        if store.closed {
            return Err(closed());
        }
        let now = self.clock.tick();
        store.apply(statement.command, &Params(params), now)
    }

    async fn execute_batch(&self, statements: &[Statement]) -> Result<()> {
        let mut store = self.store.lock().await;
        if store.closed {
            return Err(closed());
        }
        let now = self.clock.tick();

        // all or nothing, like the transaction the PostgreSQL executor opens
        let mut staged = store.clone();
        for statement in statements {
            staged.apply(statement.command, &Params(Vec::new()), now)?;
        }
        *store = staged;
        Ok(())
    }

    async fn close(&self) {
        self.store.lock().await.closed = true;
    }
}

fn closed() -> RowQueueError {
    RowQueueError::Store {
        message: "executor is closed".to_string(),
    }
}

/// Positional parameters addressed the way statement text does, from `$1`.
struct Params(Vec<Param>);

impl Params {
    fn get(&self, position: usize) -> Result<&Param> {
        position
            .checked_sub(1)
            .and_then(|index| self.0.get(index))
            .ok_or_else(|| RowQueueError::Store {
                message: format!("missing parameter ${}", position),
            })
    }

    fn mismatch(position: usize, expected: &str) -> RowQueueError {
        RowQueueError::Store {
            message: format!("parameter ${} is not {}", position, expected),
        }
    }

    fn uuid(&self, position: usize) -> Result<Uuid> {
        match self.get(position)? {
            Param::Uuid(value) => Ok(*value),
            _ => Err(Self::mismatch(position, "a uuid")),
        }
    }

    fn uuids(&self, position: usize) -> Result<&[Uuid]> {
        match self.get(position)? {
            Param::UuidArray(values) => Ok(values),
            _ => Err(Self::mismatch(position, "a uuid array")),
        }
    }

    fn text(&self, position: usize) -> Result<Option<String>> {
        match self.get(position)? {
            Param::Text(value) => Ok(value.clone()),
            _ => Err(Self::mismatch(position, "text")),
        }
    }

    fn int(&self, position: usize) -> Result<Option<i32>> {
        match self.get(position)? {
            Param::Int(value) => Ok(*value),
            _ => Err(Self::mismatch(position, "an integer")),
        }
    }

    fn required_int(&self, position: usize) -> Result<i32> {
        self.int(position)?
            .ok_or_else(|| Self::mismatch(position, "a non-null integer"))
    }

    fn bool(&self, position: usize) -> Result<bool> {
        match self.get(position)? {
            Param::Bool(value) => Ok(*value),
            _ => Err(Self::mismatch(position, "a boolean")),
        }
    }

    fn json(&self, position: usize) -> Result<Option<Value>> {
        match self.get(position)? {
            Param::Json(value) => Ok(value.clone()),
            _ => Err(Self::mismatch(position, "json")),
        }
    }

    fn timestamp(&self, position: usize) -> Result<Option<DateTime<Utc>>> {
        match self.get(position)? {
            Param::Timestamp(value) => Ok(*value),
            _ => Err(Self::mismatch(position, "a timestamp")),
        }
    }
}

fn job_row(job: &Job) -> Result<Row> {
    match serde_json::to_value(job)? {
        Value::Object(row) => Ok(row),
        _ => Err(RowQueueError::Store {
            message: "job did not serialize to an object".to_string(),
        }),
    }
}

fn id_row(id: JobId) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), json!(id.to_string()));
    row
}

fn id_rows(jobs: &[Job]) -> StatementResult {
    StatementResult::from_rows(jobs.iter().map(|job| id_row(job.id)).collect())
}

fn seconds(value: i32) -> Duration {
    Duration::seconds(i64::from(value))
}

/// Would inserting `new` violate the primary key or a singleton index held by `existing`?
fn violates_unique_index(existing: &Job, new: &Job) -> bool {
    if existing.id == new.id {
        return true;
    }
    if existing.name != new.name {
        return false;
    }

    match (&new.singleton_key, new.singleton_on) {
        (None, None) => false,
        (Some(key), None) => {
            existing.state < JobState::Completed
                && existing.singleton_on.is_none()
                && existing.singleton_key.as_ref() == Some(key)
        }
        (None, Some(on)) => {
            existing.state < JobState::Expired
                && existing.singleton_key.is_none()
                && existing.singleton_on == Some(on)
        }
        (Some(key), Some(on)) => {
            existing.state < JobState::Expired
                && existing.singleton_on == Some(on)
                && existing.singleton_key.as_ref() == Some(key)
        }
    }
}

/// SQL `LIKE` with `%`, `_`, and backslash escapes.
pub(crate) fn like(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_from(&value, &pattern)
}

fn like_from(value: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('%', rest)) => (0..=value.len()).any(|skip| like_from(&value[skip..], rest)),
        Some(('_', rest)) => !value.is_empty() && like_from(&value[1..], rest),
        Some(('\\', rest)) if !rest.is_empty() => {
            value.first() == Some(&rest[0]) && like_from(&value[1..], &rest[1..])
        }
        Some((c, rest)) => value.first() == Some(c) && like_from(&value[1..], rest),
    }
}

impl MemoryStore {
    fn apply(&mut self, command: Command, params: &Params, now: DateTime<Utc>) -> Result<StatementResult> {
        if !self.installed
            && !matches!(
                command,
                Command::Ddl | Command::VersionTableExists | Command::InsertVersion
            )
        {
            return Err(RowQueueError::Store {
                message: "schema is not installed".to_string(),
            });
        }

        match command {
            Command::Ddl => {
                self.installed = true;
                Ok(StatementResult::affected(0))
            }
            Command::VersionTableExists => {
                let mut row = Row::new();
                let name = if self.installed { json!("version") } else { Value::Null };
                row.insert("name".to_string(), name);
                Ok(StatementResult::from_rows(vec![row]))
            }
            Command::GetVersion => Ok(StatementResult::from_rows(
                self.version
                    .iter()
                    .map(|version| {
                        let mut row = Row::new();
                        row.insert("version".to_string(), json!(version));
                        row
                    })
                    .collect(),
            )),
            Command::InsertVersion => {
                self.version = Some(SCHEMA_VERSION.to_string());
                Ok(StatementResult::affected(1))
            }
            Command::InsertJob => self.insert_job(params, now),
            Command::FetchNextJob => self.fetch_next_job(params, now),
            Command::CompleteJobs => self.complete_jobs(params, now),
            Command::FailJobs => {
                let ids = params.uuids(1)?.to_vec();
                let response = params.json(2)?;
                self.fail_where(now, JobState::Failed, response, |job| {
                    ids.contains(&job.id) && job.state < JobState::Completed
                })
            }
            Command::Expire => self.fail_where(now, JobState::Expired, None, |job| {
                job.state == JobState::Active
                    && job
                        .started_on
                        .is_some_and(|started| started + seconds(job.expire_in_seconds) < now)
            }),
            Command::CancelJobs => {
                let ids = params.uuids(1)?;
                let mut cancelled = Vec::new();
                for job in self.jobs.iter_mut() {
                    if ids.contains(&job.id) && job.state < JobState::Completed {
                        job.state = JobState::Cancelled;
                        job.completed_on = Some(now);
                        cancelled.push(job.clone());
                    }
                }
                Ok(id_rows(&cancelled))
            }
            Command::Archive => {
                let age = seconds(params.required_int(1)?);
                let (archived, kept): (Vec<Job>, Vec<Job>) =
                    std::mem::take(&mut self.jobs).into_iter().partition(|job| {
                        job.completed_on.is_some_and(|completed| completed + age < now)
                            || (job.state == JobState::Created
                                && job.is_completion_event()
                                && job.created_on + age < now)
                    });
                self.jobs = kept;
                let count = archived.len() as u64;
                self.archive.extend(
                    archived
                        .into_iter()
                        .map(|job| ArchivedJob { job, archived_on: now }),
                );
                Ok(StatementResult::affected(count))
            }
            Command::Purge => {
                let age = seconds(params.required_int(1)?);
                let before = self.archive.len();
                self.archive.retain(|archived| archived.archived_on + age >= now);
                Ok(StatementResult::affected((before - self.archive.len()) as u64))
            }
            Command::CountStates => Ok(self.count_states()),
            Command::DeleteQueue => {
                let name = params.text(1)?;
                let before = self.jobs.len();
                self.jobs.retain(|job| Some(&job.name) != name.as_ref());
                Ok(StatementResult::affected((before - self.jobs.len()) as u64))
            }
            Command::DeleteAllQueues => {
                let count = self.jobs.len() as u64;
                self.jobs.clear();
                Ok(StatementResult::affected(count))
            }
        }
    }

    fn insert_job(&mut self, params: &Params, now: DateTime<Utc>) -> Result<StatementResult> {
        let start_after = match params.timestamp(5)? {
            Some(at) => at,
            None => now + seconds(params.int(6)?.unwrap_or(0)),
        };
        let singleton_on = match params.int(10)? {
            Some(window) => schedule::singleton_slot(
                now,
                i64::from(window),
                i64::from(params.int(11)?.unwrap_or(0)),
            ),
            None => None,
        };

        let job = Job {
            id: params.uuid(1)?,
            name: params.text(2)?.ok_or_else(|| Params::mismatch(2, "a name"))?,
            priority: params.required_int(3)?,
            data: params.json(8)?,
            state: JobState::Created,
            retry_limit: params.required_int(4)?,
            retry_count: 0,
            retry_delay: params.required_int(12)?,
            retry_backoff: params.bool(13)?,
            start_after,
            started_on: None,
            singleton_key: params.text(9)?,
            singleton_on,
            expire_in_seconds: params.required_int(7)?,
            created_on: now,
            completed_on: None,
        };

        let archived_id = self.archive.iter().any(|archived| archived.job.id == job.id);
        if archived_id || self.jobs.iter().any(|existing| violates_unique_index(existing, &job)) {
            return Ok(StatementResult::from_rows(Vec::new()));
        }

        let id = job.id;
        self.jobs.push(job);
        Ok(StatementResult::from_rows(vec![id_row(id)]))
    }

    fn fetch_next_job(&mut self, params: &Params, now: DateTime<Utc>) -> Result<StatementResult> {
        let pattern = params.text(1)?.unwrap_or_default();
        let limit = usize::try_from(params.required_int(2)?).unwrap_or(0);

        let mut eligible: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| {
                job.state.is_eligible() && job.start_after < now && like(&job.name, &pattern)
            })
            .map(|(index, _)| index)
            .collect();
        eligible.sort_by_key(|&index| {
            let job = &self.jobs[index];
            (Reverse(job.priority), job.created_on, job.id)
        });

        let mut rows = Vec::new();
        for index in eligible.into_iter().take(limit) {
            let job = &mut self.jobs[index];
            if job.state == JobState::Retry {
                job.retry_count += 1;
            }
            job.state = JobState::Active;
            job.started_on = Some(now);
            rows.push(job_row(job)?);
        }
        Ok(StatementResult::from_rows(rows))
    }

    fn complete_jobs(&mut self, params: &Params, now: DateTime<Utc>) -> Result<StatementResult> {
        let ids = params.uuids(1)?;
        let response = params.json(2)?;

        let mut completed = Vec::new();
        for job in self.jobs.iter_mut() {
            if ids.contains(&job.id) && job.state == JobState::Active {
                job.state = JobState::Completed;
                job.completed_on = Some(now);
                completed.push(job.clone());
            }
        }

        self.fan_out(completed.iter(), &response, now)?;
        Ok(id_rows(&completed))
    }

    /// Shared by fail and expire: retry when attempts remain, otherwise `terminal`.
    fn fail_where<F>(
        &mut self,
        now: DateTime<Utc>,
        terminal: JobState,
        response: Option<Value>,
        matches: F,
    ) -> Result<StatementResult>
    where
        F: Fn(&Job) -> bool,
    {
        let mut rng = rand::thread_rng();
        let mut transitioned = Vec::new();
        for job in self.jobs.iter_mut() {
            if matches(job) {
                schedule::apply_failure(job, now, terminal, rng.gen_range(0.0..1.0));
                transitioned.push(job.clone());
            }
        }

        self.fan_out(
            transitioned.iter().filter(|job| job.state == terminal),
            &response,
            now,
        )?;
        Ok(id_rows(&transitioned))
    }

    fn fan_out<'a>(
        &mut self,
        sources: impl Iterator<Item = &'a Job>,
        response: &Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for source in sources.filter(|job| !job.is_completion_event()) {
            let envelope = CompletionEnvelope::for_job(source, response.clone());
            self.jobs.push(Job {
                id: Uuid::new_v4(),
                name: completion_name(&source.name),
                priority: 0,
                data: Some(serde_json::to_value(envelope)?),
                state: JobState::Created,
                retry_limit: 0,
                retry_count: 0,
                retry_delay: 0,
                retry_backoff: false,
                start_after: now,
                started_on: None,
                singleton_key: None,
                singleton_on: None,
                expire_in_seconds: DEFAULT_EXPIRE_IN_SECONDS,
                created_on: now,
                completed_on: None,
            });
        }
        Ok(())
    }

    /// `GROUP BY ROLLUP(name), ROLLUP(state)`; `None` marks a rolled-up column.
    fn count_states(&self) -> StatementResult {
        let mut counts: BTreeMap<(Option<String>, Option<JobState>), i64> = BTreeMap::new();
        counts.insert((None, None), 0);

        for job in self.jobs.iter().filter(|job| !is_completion_name(&job.name)) {
            let name = Some(job.name.clone());
            let state = Some(job.state);
            for key in [
                (name.clone(), state),
                (name, None),
                (None, state),
                (None, None),
            ] {
                *counts.entry(key).or_insert(0) += 1;
            }
        }

        let rows = counts
            .into_iter()
            .map(|((name, state), size)| {
                let mut row = Row::new();
                row.insert("name".to_string(), json!(name));
                row.insert("state".to_string(), json!(state.map(|s| s.as_str())));
                row.insert("size".to_string(), json!(size));
                row
            })
            .collect();
        StatementResult::from_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::Plans;

    fn insert_params(id: Uuid, name: &str, singleton_key: Option<&str>, window: Option<i32>) -> Vec<Param> {
        vec![
            Param::Uuid(id),
            Param::Text(Some(name.to_string())),
            Param::Int(Some(0)),
            Param::Int(Some(0)),
            Param::Timestamp(None),
            Param::Int(None),
            Param::Int(Some(DEFAULT_EXPIRE_IN_SECONDS)),
            Param::Json(None),
            Param::Text(singleton_key.map(str::to_string)),
            Param::Int(window),
            Param::Int(Some(0)),
            Param::Int(Some(0)),
            Param::Bool(false),
        ]
    }

    async fn installed() -> (MemoryExecutor, Plans) {
        let executor = MemoryExecutor::new();
        let plans = Plans::new("rowqueue").unwrap();
        executor.execute_batch(&plans.create()).await.unwrap();
        (executor, plans)
    }

    #[test]
    fn test_like_matching() {
        assert!(like("email", "email"));
        assert!(like("email", "em%"));
        assert!(like("email", "%"));
        assert!(like("email", "e_ail"));
        assert!(!like("email", "e_il"));
        assert!(!like("emails", "email"));
        assert!(like("a_b", "a\\_b"));
        assert!(!like("axb", "a\\_b"));
        assert!(like("__state__completed__email", "__state__completed__email"));
    }

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        let start = clock.now();
        clock.advance(Duration::hours(2));
        assert_eq!((clock.now() - start).num_hours(), 2);

        let ticked = clock.tick();
        assert_eq!(ticked - start, Duration::hours(2) + Duration::microseconds(1));
    }

    #[tokio::test]
    async fn test_statements_require_installed_schema() {
        let executor = MemoryExecutor::new();
        let plans = Plans::new("rowqueue").unwrap();

        let result = executor
            .execute(&plans.insert_job, insert_params(Uuid::new_v4(), "email", None, None))
            .await;
        assert!(matches!(result, Err(RowQueueError::Store { .. })));

        let exists = executor.execute(&plans.version_table_exists, vec![]).await.unwrap();
        assert_eq!(exists.rows[0]["name"], Value::Null);
    }

    #[tokio::test]
    async fn test_singleton_key_conflict_returns_no_row() {
        let (executor, plans) = installed().await;

        let first = executor
            .execute(&plans.insert_job, insert_params(Uuid::new_v4(), "email", Some("k"), None))
            .await
            .unwrap();
        assert_eq!(first.row_count, 1);

        let second = executor
            .execute(&plans.insert_job, insert_params(Uuid::new_v4(), "email", Some("k"), None))
            .await
            .unwrap();
        assert_eq!(second.row_count, 0);

        let other_name = executor
            .execute(&plans.insert_job, insert_params(Uuid::new_v4(), "sms", Some("k"), None))
            .await
            .unwrap();
        assert_eq!(other_name.row_count, 1);
    }

    #[tokio::test]
    async fn test_missing_parameter_is_a_store_error() {
        let (executor, plans) = installed().await;
        let result = executor.execute(&plans.fetch_next_job, vec![]).await;
        assert!(matches!(result, Err(RowQueueError::Store { .. })));
    }

    #[tokio::test]
    async fn test_count_states_rollup() {
        let (executor, plans) = installed().await;
        for name in ["email", "email", "sms"] {
            executor
                .execute(&plans.insert_job, insert_params(Uuid::new_v4(), name, None, None))
                .await
                .unwrap();
        }

        let result = executor.execute(&plans.count_states, vec![]).await.unwrap();
        let size = |name: Value, state: Value| {
            result
                .rows
                .iter()
                .find(|row| row["name"] == name && row["state"] == state)
                .map(|row| row["size"].clone())
        };

        assert_eq!(size(json!("email"), json!("created")), Some(json!(2)));
        assert_eq!(size(json!("email"), Value::Null), Some(json!(2)));
        assert_eq!(size(Value::Null, json!("created")), Some(json!(3)));
        assert_eq!(size(Value::Null, Value::Null), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_close_rejects_further_statements() {
        let (executor, plans) = installed().await;
        executor.close().await;
        assert!(executor.execute(&plans.count_states, vec![]).await.is_err());
    }
}
