//! The queue manager: publish, fetch, outcome reporting, and subscriptions.
//!
//! Every operation validates its input, runs exactly one statement from
//! [`Plans`](crate::plans::Plans), and returns. Nothing about jobs is cached
//! between calls. The only in-process state is the registry of polling workers
//! started by [`JobOperations::subscribe`].
//!
//! # Examples
//!
//! ```rust
//! use rowqueue::db::{Executor, MemoryExecutor};
//! use rowqueue::{Fetched, JobOperations, Migrator, Plans, PublishOptions, QueueManager};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> rowqueue::Result<()> {
//! let executor: Arc<dyn Executor> = Arc::new(MemoryExecutor::new());
//! let plans = Arc::new(Plans::new("rowqueue")?);
//! Migrator::new(executor.clone(), plans.clone()).install().await?;
//! let manager = QueueManager::new(executor, plans);
//!
//! let id = manager
//!     .publish("email", Some(json!({"to": "user@example.com"})), PublishOptions::new())
//!     .await?
//!     .expect("no singleton options, so never deduplicated");
//!
//! if let Some(Fetched::Single(job)) = manager.fetch("email", None).await? {
//!     assert_eq!(job.id, id);
//!     job.complete(Some(json!({"sent": true}))).await?;
//! }
//!
//! // the outcome is delivered as a job on the completion topic
//! let outcome = manager.fetch_completed("email", None).await?;
//! assert!(outcome.is_some());
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    db::{Executor, Param},
    error::RowQueueError,
    events::{EventBus, QueueEvent},
    job::{COMPLETED_JOB_PREFIX, Job, JobId, JobIds, completion_name},
    options::{DEFAULT_NEW_JOB_CHECK_INTERVAL, NewJob, PublishOptions, StartAfter, SubscribeOptions},
    plans::{Plans, Statement},
    schedule::DEBOUNCE_RESLOT_ATTEMPTS,
    worker::{BatchFn, BoxFuture, ErrorFn, FetchFn, Worker},
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt, stream};
use serde_json::{Value, json};
use std::{
    any::Any, collections::HashMap, fmt, future::Future, ops::Deref, panic::AssertUnwindSafe,
    sync::Arc, time::Duration,
};
use tokio::sync::{Mutex, broadcast::Receiver};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error type handlers may return; its display text becomes the failure payload.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler resolves to: an optional response, or a failure.
pub type HandlerResult = std::result::Result<Option<Value>, HandlerError>;

pub type JobHandler = Arc<dyn Fn(ActiveJob) -> BoxFuture<HandlerResult> + Send + Sync>;

pub type BatchHandler = Arc<dyn Fn(Vec<ActiveJob>) -> BoxFuture<HandlerResult> + Send + Sync>;

/// The callback attached to a subscription. The kind must match the options:
/// [`Handler::Batch`] if and only if `batch_size` is set.
#[derive(Clone)]
pub enum Handler {
    /// Called once per job. `Ok` completes the job with the value, `Err` fails it.
    PerJob(JobHandler),
    /// Called once per fetched set. `Err` fails every job in the set; `Ok`
    /// leaves completion to the handler.
    Batch(BatchHandler),
}

impl Handler {
    pub fn per_job<F, Fut>(handler: F) -> Self
    where
        F: Fn(ActiveJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::PerJob(Arc::new(move |job: ActiveJob| -> BoxFuture<HandlerResult> {
            Box::pin(handler(job))
        }))
    }

    pub fn batch<F, Fut>(handler: F) -> Self
    where
        F: Fn(Vec<ActiveJob>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Batch(Arc::new(move |jobs: Vec<ActiveJob>| -> BoxFuture<HandlerResult> {
            Box::pin(handler(jobs))
        }))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::PerJob(_) => f.write_str("Handler::PerJob"),
            Handler::Batch(_) => f.write_str("Handler::Batch"),
        }
    }
}

/// Outcome of `complete`, `fail`, or `cancel`.
///
/// `updated < requested` means some ids were absent or not in a state the
/// statement acts on. That is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub jobs: Vec<JobId>,
    pub requested: usize,
    pub updated: usize,
}

/// A claimed job together with a route back to the manager that claimed it.
#[derive(Clone)]
pub struct ActiveJob {
    job: Job,
    manager: QueueManager,
}

impl ActiveJob {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    pub async fn complete(&self, data: Option<Value>) -> Result<CompletionResult> {
        self.manager.complete(self.job.id.into(), data).await
    }

    pub async fn fail(&self, data: Option<Value>) -> Result<CompletionResult> {
        self.manager.fail(self.job.id.into(), data).await
    }

    /// Completes on `Ok`, fails with the error message on `Err`.
    pub async fn done(&self, result: HandlerResult) -> Result<CompletionResult> {
        match result {
            Ok(data) => self.complete(data).await,
            Err(e) => self.fail(Some(error_payload(e.as_ref()))).await,
        }
    }
}

impl Deref for ActiveJob {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.job
    }
}

impl fmt::Debug for ActiveJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveJob").field("job", &self.job).finish()
    }
}

/// Result of a dequeue that claimed at least one job.
#[derive(Debug, Clone)]
pub enum Fetched {
    /// One row, when no batch size was requested.
    Single(ActiveJob),
    Batch(Vec<ActiveJob>),
}

impl Fetched {
    pub fn len(&self) -> usize {
        match self {
            Fetched::Single(_) => 1,
            Fetched::Batch(jobs) => jobs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<ActiveJob> {
        match self {
            Fetched::Single(job) => vec![job],
            Fetched::Batch(jobs) => jobs,
        }
    }
}

/// The queue operations, implemented by [`QueueManager`] and by the
/// [`JobQueue`](crate::JobQueue) facade.
#[async_trait]
pub trait JobOperations: Send + Sync {
    /// Inserts a job. `None` when a singleton index rejected it.
    async fn publish(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
    ) -> Result<Option<JobId>>;

    /// Publishes unless a job with `key` is already queued or active.
    async fn publish_once(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        key: &str,
    ) -> Result<Option<JobId>>;

    /// Publishes at most one job per `seconds` window; extras are dropped.
    async fn publish_throttled(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>>;

    /// Like throttling, but a collision moves the job to the next window.
    async fn publish_debounced(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>>;

    async fn publish_after(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        when: StartAfter,
    ) -> Result<Option<JobId>>;

    async fn fetch(&self, name: &str, batch_size: Option<usize>) -> Result<Option<Fetched>>;

    /// Fetches completion events recorded for jobs named `name`.
    async fn fetch_completed(
        &self,
        name: &str,
        batch_size: Option<usize>,
    ) -> Result<Option<Fetched>>;

    async fn subscribe(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<()>;

    /// Stops every worker polling `name`. Jobs already handed out keep running.
    async fn unsubscribe(&self, name: &str) -> Result<()>;

    async fn on_complete(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<()>;

    async fn off_complete(&self, name: &str) -> Result<()>;

    async fn complete(&self, ids: JobIds, data: Option<Value>) -> Result<CompletionResult>;

    async fn fail(&self, ids: JobIds, data: Option<Value>) -> Result<CompletionResult>;

    async fn cancel(&self, ids: JobIds) -> Result<CompletionResult>;

    async fn delete_queue(&self, name: &str) -> Result<u64>;

    async fn delete_all_queues(&self) -> Result<u64>;
}

type Subscriptions = HashMap<String, Vec<Worker<ActiveJob>>>;

#[derive(Clone)]
pub struct QueueManager {
    executor: Arc<dyn Executor>,
    plans: Arc<Plans>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    events: EventBus,
    new_job_check_interval: Duration,
}

impl QueueManager {
    pub fn new(executor: Arc<dyn Executor>, plans: Arc<Plans>) -> Self {
        Self::with_events(executor, plans, EventBus::default())
    }

    pub fn with_events(executor: Arc<dyn Executor>, plans: Arc<Plans>, events: EventBus) -> Self {
        Self {
            executor,
            plans,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            events,
            new_job_check_interval: DEFAULT_NEW_JOB_CHECK_INTERVAL,
        }
    }

    /// Poll interval for subscriptions that do not set their own.
    pub fn with_new_job_check_interval(mut self, interval: Duration) -> Self {
        self.new_job_check_interval = interval;
        self
    }

    pub fn subscribe_events(&self) -> Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Number of workers currently registered under `name`.
    pub async fn worker_count(&self, name: &str) -> usize {
        self.subscriptions
            .lock()
            .await
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Stops every subscription.
    pub async fn stop(&self) {
        let drained: Vec<(String, Vec<Worker<ActiveJob>>)> =
            self.subscriptions.lock().await.drain().collect();

        for (name, mut workers) in drained {
            for worker in workers.iter_mut() {
                worker.stop();
            }
            info!("Unsubscribed {} workers from queue {}", workers.len(), name);
        }
    }

    async fn insert(&self, job: NewJob) -> Result<Option<JobId>> {
        let mut next = Some(job);

        for _ in 0..=DEBOUNCE_RESLOT_ATTEMPTS {
            let Some(job) = next.take() else { break };

            let result = self
                .executor
                .execute(&self.plans.insert_job, job.params(Uuid::new_v4()))
                .await?;
            if let Some(id) = result.ids()?.into_iter().next() {
                debug!("Published job {} to queue {}", id, job.name);
                return Ok(Some(id));
            }

            next = job.reslot();
            match next {
                Some(_) => debug!("Singleton slot taken on queue {}, trying next slot", job.name),
                None => debug!("Publish to queue {} rejected by singleton", job.name),
            }
        }

        Ok(None)
    }

    /// A handle for worker closures and the jobs they claim. It shares the
    /// store and the event bus but not the subscription registry, so running
    /// workers never keep their own registry alive.
    fn detached(&self) -> QueueManager {
        QueueManager {
            executor: Arc::clone(&self.executor),
            plans: Arc::clone(&self.plans),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            events: self.events.clone(),
            new_job_check_interval: self.new_job_check_interval,
        }
    }

    /// Claims up to `limit` jobs; the worker's fetch path.
    async fn fetch_jobs(&self, name: &str, limit: usize) -> Result<Vec<ActiveJob>> {
        let limit = i32::try_from(limit)
            .map_err(|_| RowQueueError::validation(format!("batch_size {} is too large", limit)))?;

        let result = self
            .executor
            .execute(
                &self.plans.fetch_next_job,
                vec![Param::Text(Some(name.to_string())), Param::Int(Some(limit))],
            )
            .await?;

        Ok(result
            .into_jobs()?
            .into_iter()
            .map(|job| ActiveJob {
                job,
                manager: self.clone(),
            })
            .collect())
    }

    async fn finish(
        &self,
        statement: &Statement,
        ids: JobIds,
        data: Option<Option<Value>>,
    ) -> Result<CompletionResult> {
        let ids = validate_ids(ids)?;

        let mut params = vec![Param::UuidArray(ids.clone())];
        if let Some(data) = data {
            params.push(Param::Json(normalize_payload(data)));
        }
        let result = self.executor.execute(statement, params).await?;

        Ok(CompletionResult {
            requested: ids.len(),
            updated: result.row_count as usize,
            jobs: ids,
        })
    }

    fn build_worker(&self, name: &str, options: &SubscribeOptions, handler: Handler) -> Worker<ActiveJob> {
        let fetch_size = options.fetch_size();
        let concurrency = options.concurrency();
        let detached = self.detached();

        let fetch: FetchFn<ActiveJob> = {
            let manager = detached.clone();
            let name = name.to_string();
            Arc::new(move || -> BoxFuture<Result<Vec<ActiveJob>>> {
                let manager = manager.clone();
                let name = name.clone();
                Box::pin(async move { manager.fetch_jobs(&name, fetch_size).await })
            })
        };

        let on_batch: BatchFn<ActiveJob> = match handler {
            Handler::Batch(handler) => {
                let manager = detached.clone();
                let name = name.to_string();
                Arc::new(move |jobs: Vec<ActiveJob>| -> BoxFuture<()> {
                    let manager = manager.clone();
                    let handler = Arc::clone(&handler);
                    let name = name.clone();
                    Box::pin(async move {
                        let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
                        if let Err(e) = guarded(async move { handler(jobs).await }).await {
                            manager.report(&name, format!("Batch handler failed: {}", e));
                            let payload = error_payload(e.as_ref());
                            if let Err(e) = manager.fail(ids.into(), Some(payload)).await {
                                manager.report(&name, format!("Failed to fail batch: {}", e));
                            }
                        }
                    })
                })
            }
            Handler::PerJob(handler) => {
                let manager = detached.clone();
                let name = name.to_string();
                Arc::new(move |jobs: Vec<ActiveJob>| -> BoxFuture<()> {
                    let manager = manager.clone();
                    let handler = Arc::clone(&handler);
                    let name = name.clone();
                    Box::pin(async move {
                        stream::iter(jobs)
                            .for_each_concurrent(concurrency, |job| {
                                let manager = manager.clone();
                                let handler = Arc::clone(&handler);
                                let name = name.clone();
                                async move {
                                    let id = job.id;
                                    let result = guarded(async move { handler(job).await }).await;
                                    if let Err(e) = &result {
                                        manager.report(&name, format!("Handler failed for job {}: {}", id, e));
                                    }
                                    let outcome = match result {
                                        Ok(data) => manager.complete(id.into(), data).await,
                                        Err(e) => manager.fail(id.into(), Some(error_payload(e.as_ref()))).await,
                                    };
                                    if let Err(e) = outcome {
                                        manager.report(&name, format!("Failed to record outcome of job {}: {}", id, e));
                                    }
                                }
                            })
                            .await;
                    })
                })
            }
        };

        let on_error: ErrorFn = {
            let manager = detached;
            let name = name.to_string();
            Arc::new(move |e: RowQueueError| manager.report(&name, e.to_string()))
        };

        let interval = options.interval_or(self.new_job_check_interval);
        Worker::new(name, fetch, on_batch, on_error, interval)
    }

    fn report(&self, name: &str, message: String) {
        warn!("Queue {}: {}", name, message);
        self.events.emit(QueueEvent::error(Some(name), message));
    }

    async fn start_subscription(&self, name: &str, options: SubscribeOptions, handler: Handler) -> Result<()> {
        validate_name(name)?;
        options.validate()?;
        match (&handler, options.is_batch()) {
            (Handler::Batch(_), false) => {
                return Err(RowQueueError::validation(
                    "a batch handler requires batch_size to be set",
                ));
            }
            (Handler::PerJob(_), true) => {
                return Err(RowQueueError::validation(
                    "batch_size requires a batch handler",
                ));
            }
            _ => {}
        }

        let mut worker = self.build_worker(name, &options, handler);
        worker.start();

        let mut subscriptions = self.subscriptions.lock().await;
        let workers = subscriptions.entry(name.to_string()).or_default();
        workers.push(worker);
        info!(
            "Subscribed to queue {} (fetch size {}, {} workers)",
            name,
            options.fetch_size(),
            workers.len()
        );
        Ok(())
    }
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("schema", &self.plans.schema())
            .field("new_job_check_interval", &self.new_job_check_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobOperations for QueueManager {
    async fn publish(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
    ) -> Result<Option<JobId>> {
        validate_name(name)?;
        if name.starts_with(COMPLETED_JOB_PREFIX) {
            return Err(RowQueueError::validation(format!(
                "queue names starting with {} are reserved for completion events",
                COMPLETED_JOB_PREFIX
            )));
        }

        let job = options.normalize(name, data.filter(|data| !data.is_null()))?;
        self.insert(job).await
    }

    async fn publish_once(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        key: &str,
    ) -> Result<Option<JobId>> {
        self.publish(name, data, options.with_singleton_key(key)).await
    }

    async fn publish_throttled(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>> {
        let mut options = options
            .with_singleton_seconds(seconds)
            .with_singleton_next_slot(false);
        options.singleton_key = key.map(str::to_string);
        self.publish(name, data, options).await
    }

    async fn publish_debounced(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>> {
        let mut options = options
            .with_singleton_seconds(seconds)
            .with_singleton_next_slot(true);
        options.singleton_key = key.map(str::to_string);
        self.publish(name, data, options).await
    }

    async fn publish_after(
        &self,
        name: &str,
        data: Option<Value>,
        mut options: PublishOptions,
        when: StartAfter,
    ) -> Result<Option<JobId>> {
        options.start_after = Some(when);
        self.publish(name, data, options).await
    }

    async fn fetch(&self, name: &str, batch_size: Option<usize>) -> Result<Option<Fetched>> {
        validate_name(name)?;
        if batch_size == Some(0) {
            return Err(RowQueueError::validation("batch_size must be an integer >= 1"));
        }

        let mut jobs = self.fetch_jobs(name, batch_size.unwrap_or(1)).await?;
        Ok(match (jobs.len(), batch_size) {
            (0, _) => None,
            (1, None) => jobs.pop().map(Fetched::Single),
            _ => Some(Fetched::Batch(jobs)),
        })
    }

    async fn fetch_completed(
        &self,
        name: &str,
        batch_size: Option<usize>,
    ) -> Result<Option<Fetched>> {
        self.fetch(&completion_name(name), batch_size).await
    }

    async fn subscribe(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<()> {
        self.start_subscription(name, options, handler).await
    }

    async fn unsubscribe(&self, name: &str) -> Result<()> {
        let workers = self.subscriptions.lock().await.remove(name);

        match workers {
            Some(mut workers) => {
                for worker in workers.iter_mut() {
                    worker.stop();
                }
                info!("Unsubscribed {} workers from queue {}", workers.len(), name);
                Ok(())
            }
            None => Err(RowQueueError::Subscription {
                message: format!("No subscriptions found for queue {}", name),
            }),
        }
    }

    async fn on_complete(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<()> {
        self.start_subscription(&completion_name(name), options, handler)
            .await
    }

    async fn off_complete(&self, name: &str) -> Result<()> {
        self.unsubscribe(&completion_name(name)).await
    }

    async fn complete(&self, ids: JobIds, data: Option<Value>) -> Result<CompletionResult> {
        self.finish(&self.plans.complete_jobs, ids, Some(data)).await
    }

    async fn fail(&self, ids: JobIds, data: Option<Value>) -> Result<CompletionResult> {
        self.finish(&self.plans.fail_jobs, ids, Some(data)).await
    }

    async fn cancel(&self, ids: JobIds) -> Result<CompletionResult> {
        self.finish(&self.plans.cancel_jobs, ids, None).await
    }

    async fn delete_queue(&self, name: &str) -> Result<u64> {
        validate_name(name)?;
        let result = self
            .executor
            .execute(
                &self.plans.delete_queue,
                vec![Param::Text(Some(name.to_string()))],
            )
            .await?;
        info!("Deleted {} jobs from queue {}", result.row_count, name);
        Ok(result.row_count)
    }

    async fn delete_all_queues(&self) -> Result<u64> {
        let result = self
            .executor
            .execute(&self.plans.delete_all_queues, Vec::new())
            .await?;
        info!("Deleted all queues");
        Ok(result.row_count)
    }
}

/// Awaits a handler, turning a panic into a handler error so the job is
/// failed and the polling loop keeps running.
async fn guarded<Fut>(future: Fut) -> HandlerResult
where
    Fut: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref())).into()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RowQueueError::validation("queue name must not be empty"));
    }
    Ok(())
}

fn validate_ids(ids: JobIds) -> Result<Vec<JobId>> {
    if ids.is_empty() {
        return Err(RowQueueError::validation("at least one job id is required"));
    }
    Ok(ids.into_vec())
}

/// Shapes an outcome payload for storage: objects pass through, other values
/// are wrapped as `{"value": ..}`, and null is stored as SQL NULL.
pub fn normalize_payload(data: Option<Value>) -> Option<Value> {
    match data {
        None | Some(Value::Null) => None,
        Some(Value::Object(object)) => Some(Value::Object(object)),
        Some(other) => Some(json!({ "value": other })),
    }
}

/// Failure payload recorded for a handler error.
pub fn error_payload(error: &(dyn std::error::Error + Send + Sync)) -> Value {
    json!({ "message": error.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryExecutor;

    async fn manager() -> QueueManager {
        let executor: Arc<dyn Executor> = Arc::new(MemoryExecutor::new());
        let plans = Arc::new(Plans::new("rowqueue").unwrap());
        executor.execute_batch(&plans.create()).await.unwrap();
        QueueManager::new(executor, plans)
    }

    #[test]
    fn test_normalize_payload() {
        assert_eq!(normalize_payload(None), None);
        assert_eq!(normalize_payload(Some(Value::Null)), None);
        assert_eq!(normalize_payload(Some(json!({"x": 1}))), Some(json!({"x": 1})));
        assert_eq!(normalize_payload(Some(json!(42))), Some(json!({"value": 42})));
        assert_eq!(normalize_payload(Some(json!([1, 2]))), Some(json!({"value": [1, 2]})));
        assert_eq!(normalize_payload(Some(json!("done"))), Some(json!({"value": "done"})));
    }

    #[test]
    fn test_error_payload() {
        let error: HandlerError = "smtp timeout".into();
        assert_eq!(error_payload(error.as_ref()), json!({"message": "smtp timeout"}));
    }

    #[tokio::test]
    async fn test_publish_rejects_reserved_and_empty_names() {
        let manager = manager().await;

        let reserved = manager
            .publish(&completion_name("email"), None, PublishOptions::new())
            .await
            .unwrap_err();
        assert!(reserved.is_validation());

        let empty = manager.publish("  ", None, PublishOptions::new()).await.unwrap_err();
        assert!(empty.is_validation());
    }

    #[tokio::test]
    async fn test_fetch_shapes() {
        let manager = manager().await;
        assert!(manager.fetch("email", None).await.unwrap().is_none());

        manager.publish("email", None, PublishOptions::new()).await.unwrap();
        let single = manager.fetch("email", None).await.unwrap().unwrap();
        assert!(matches!(single, Fetched::Single(_)));

        manager.publish("email", None, PublishOptions::new()).await.unwrap();
        let batch = manager.fetch("email", Some(5)).await.unwrap().unwrap();
        assert!(matches!(batch, Fetched::Batch(ref jobs) if jobs.len() == 1));

        assert!(manager.fetch("email", Some(0)).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_outcomes_require_ids() {
        let manager = manager().await;
        let err = manager.complete(JobIds::default(), None).await.unwrap_err();
        assert!(err.is_validation());
        assert!(manager.cancel(JobIds::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_handler_kind_must_match_mode() {
        let manager = manager().await;

        let batch_without_size = manager
            .subscribe(
                "email",
                SubscribeOptions::new(),
                Handler::batch(|_jobs| async { Ok(None) }),
            )
            .await
            .unwrap_err();
        assert!(batch_without_size.is_validation());

        let per_job_with_size = manager
            .subscribe(
                "email",
                SubscribeOptions::new().with_batch_size(5),
                Handler::per_job(|_job| async { Ok(None) }),
            )
            .await
            .unwrap_err();
        assert!(per_job_with_size.is_validation());
        assert_eq!(manager.worker_count("email").await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_queue_fails() {
        let manager = manager().await;
        let err = manager.unsubscribe("nobody").await.unwrap_err();
        assert!(matches!(err, RowQueueError::Subscription { .. }));
    }

    #[tokio::test]
    async fn test_repeated_subscriptions_add_workers() {
        let manager = manager().await;
        for _ in 0..2 {
            manager
                .subscribe(
                    "email",
                    SubscribeOptions::new(),
                    Handler::per_job(|_job| async { Ok(None) }),
                )
                .await
                .unwrap();
        }
        assert_eq!(manager.worker_count("email").await, 2);

        manager.unsubscribe("email").await.unwrap();
        assert_eq!(manager.worker_count("email").await, 0);
    }
}
