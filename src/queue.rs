//! The `JobQueue` facade.
//!
//! `JobQueue` wires a store executor to a [`QueueManager`], a [`Supervisor`],
//! and a [`Migrator`] built from one [`Config`], and gates the queue operations
//! on its lifecycle: `start` installs or verifies the schema and begins
//! maintenance, while `connect` only verifies the schema, for processes that
//! publish or consume without supervising.
//!
//! # Examples
//!
//! ```rust,no_run
//! use rowqueue::{Config, Handler, JobOperations, JobQueue, PublishOptions, SubscribeOptions};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> rowqueue::Result<()> {
//! let queue = JobQueue::connect_with(Config::from_env()?).await?;
//! queue.start().await?;
//!
//! queue
//!     .publish("email", Some(json!({"to": "user@example.com"})), PublishOptions::new())
//!     .await?;
//!
//! queue
//!     .subscribe(
//!         "email",
//!         SubscribeOptions::new().with_team_concurrency(4),
//!         Handler::per_job(|job| async move {
//!             println!("sending {:?}", job.data);
//!             Ok(None)
//!         }),
//!     )
//!     .await?;
//! # queue.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    config::Config,
    db::{Executor, PgExecutor},
    error::RowQueueError,
    events::{EventBus, QueueEvent},
    job::{JobId, JobIds},
    manager::{CompletionResult, Fetched, Handler, JobOperations, QueueManager},
    migrations::Migrator,
    options::{PublishOptions, StartAfter, SubscribeOptions},
    plans::Plans,
    supervisor::{StateCounts, Supervisor},
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::{sync::broadcast::Receiver, task::JoinHandle};
use tracing::info;

#[derive(Default)]
struct Lifecycle {
    started: bool,
    ready: bool,
    // set once an owned pool has been closed
    closed: bool,
    forwarders: Vec<JoinHandle<()>>,
}

pub struct JobQueue {
    config: Config,
    executor: Arc<dyn Executor>,
    owns_executor: bool,
    manager: QueueManager,
    supervisor: Supervisor,
    migrator: Migrator,
    events: EventBus,
    lifecycle: Mutex<Lifecycle>,
}

impl JobQueue {
    /// Opens a PostgreSQL pool from `config`. The pool is closed by `stop`.
    pub async fn connect_with(config: Config) -> Result<Self> {
        config.validate()?;
        let executor = PgExecutor::connect(&config.database).await?;
        Self::build(Arc::new(executor), config, true)
    }

    /// Uses a caller-owned executor, which `stop` leaves open.
    pub fn with_executor(executor: Arc<dyn Executor>, config: Config) -> Result<Self> {
        config.validate()?;
        Self::build(executor, config, false)
    }

    /// Takes ownership of `executor`: `stop` and `disconnect` close it, and
    /// the queue cannot be started again afterwards.
    pub fn with_owned_executor(executor: Arc<dyn Executor>, config: Config) -> Result<Self> {
        config.validate()?;
        Self::build(executor, config, true)
    }

    fn build(executor: Arc<dyn Executor>, config: Config, owns_executor: bool) -> Result<Self> {
        let plans = Arc::new(Plans::new(&config.schema)?);
        let buffer_size = config.events.buffer_size;

        let manager = QueueManager::with_events(
            Arc::clone(&executor),
            Arc::clone(&plans),
            EventBus::new(buffer_size),
        )
        .with_new_job_check_interval(config.worker.new_job_check_interval);
        let supervisor = Supervisor::with_events(
            Arc::clone(&executor),
            Arc::clone(&plans),
            config.maintenance.clone(),
            EventBus::new(buffer_size),
        );
        let migrator = Migrator::new(Arc::clone(&executor), plans);

        Ok(Self {
            config,
            executor,
            owns_executor,
            manager,
            supervisor,
            migrator,
            events: EventBus::new(buffer_size),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Events from the manager and the supervisor, merged.
    pub fn subscribe_events(&self) -> Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle().ready
    }

    /// Installs or verifies the schema, then starts maintenance if enabled.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.closed {
                return Err(RowQueueError::Closed);
            }
            if lifecycle.started {
                return Err(RowQueueError::AlreadyStarted);
            }
            lifecycle.started = true;
        }

        if let Err(e) = self.migrator.install().await {
            self.lifecycle().started = false;
            return Err(e);
        }

        if self.config.maintenance.enabled {
            self.supervisor.supervise();
        }
        self.become_ready();
        info!("Queue started on schema {}", self.config.schema);
        Ok(())
    }

    /// Verifies the schema without starting maintenance.
    pub async fn connect(&self) -> Result<()> {
        {
            let lifecycle = self.lifecycle();
            if lifecycle.closed {
                return Err(RowQueueError::Closed);
            }
            if lifecycle.ready {
                return Ok(());
            }
        }
        self.migrator.check().await?;
        self.become_ready();
        info!("Queue connected to schema {}", self.config.schema);
        Ok(())
    }

    /// Stops subscriptions and maintenance, and closes the pool if it was opened here.
    pub async fn stop(&self) -> Result<()> {
        if !self.lifecycle().started {
            return Err(RowQueueError::NotStarted);
        }

        self.manager.stop().await;
        self.supervisor.stop();
        self.shut_down().await;
        self.lifecycle().started = false;
        info!("Queue stopped");
        Ok(())
    }

    /// Stops subscriptions and closes the pool if it was opened here.
    pub async fn disconnect(&self) -> Result<()> {
        self.manager.stop().await;
        self.shut_down().await;
        info!("Queue disconnected");
        Ok(())
    }

    pub async fn count_states(&self) -> Result<StateCounts> {
        self.ensure_ready()?;
        self.supervisor.count_states().await
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn become_ready(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.forwarders.is_empty() {
            lifecycle.forwarders = vec![
                self.manager.events().forward_to(&self.events),
                self.supervisor.events().forward_to(&self.events),
            ];
        }
        lifecycle.ready = true;
    }

    async fn shut_down(&self) {
        let forwarders = {
            let mut lifecycle = self.lifecycle();
            lifecycle.ready = false;
            lifecycle.closed = self.owns_executor;
            std::mem::take(&mut lifecycle.forwarders)
        };
        for forwarder in forwarders {
            forwarder.abort();
        }
        if self.owns_executor {
            self.executor.close().await;
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RowQueueError::NotReady)
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        // workers end with the manager's registry; the sweeps and forwarders need aborting
        self.supervisor.stop();
        for forwarder in self.lifecycle().forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("schema", &self.config.schema)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobOperations for JobQueue {
    async fn publish(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
    ) -> Result<Option<JobId>> {
        self.ensure_ready()?;
        self.manager.publish(name, data, options).await
    }

    async fn publish_once(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        key: &str,
    ) -> Result<Option<JobId>> {
        self.ensure_ready()?;
        self.manager.publish_once(name, data, options, key).await
    }

    async fn publish_throttled(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>> {
        self.ensure_ready()?;
        self.manager
            .publish_throttled(name, data, options, seconds, key)
            .await
    }

    async fn publish_debounced(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        seconds: u64,
        key: Option<&str>,
    ) -> Result<Option<JobId>> {
        self.ensure_ready()?;
        self.manager
            .publish_debounced(name, data, options, seconds, key)
            .await
    }

    async fn publish_after(
        &self,
        name: &str,
        data: Option<Value>,
        options: PublishOptions,
        when: StartAfter,
    ) -> Result<Option<JobId>> {
        self.ensure_ready()?;
        self.manager.publish_after(name, data, options, when).await
    }

    async fn fetch(&self, name: &str, batch_size: Option<usize>) -> Result<Option<Fetched>> {
        self.ensure_ready()?;
        self.manager.fetch(name, batch_size).await
    }

    async fn fetch_completed(
        &self,
        name: &str,
        batch_size: Option<usize>,
    ) -> Result<Option<Fetched>> {
        self.ensure_ready()?;
        self.manager.fetch_completed(name, batch_size).await
    }

    async fn subscribe(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.manager.subscribe(name, options, handler).await
    }

    async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.ensure_ready()?;
        self.manager.unsubscribe(name).await
    }

    async fn on_complete(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.manager.on_complete(name, options, handler).await
    }

    async fn off_complete(&self, name: &str) -> Result<()> {
        self.ensure_ready()?;
        self.manager.off_complete(name).await
    }

    async fn complete(&self, ids: JobIds, data: Option<Value>) -> Result<CompletionResult> {
        self.ensure_ready()?;
        self.manager.complete(ids, data).await
    }

    async fn fail(&self, ids: JobIds, data: Option<Value>) -> Result<CompletionResult> {
        self.ensure_ready()?;
        self.manager.fail(ids, data).await
    }

    async fn cancel(&self, ids: JobIds) -> Result<CompletionResult> {
        self.ensure_ready()?;
        self.manager.cancel(ids).await
    }

    async fn delete_queue(&self, name: &str) -> Result<u64> {
        self.ensure_ready()?;
        self.manager.delete_queue(name).await
    }

    async fn delete_all_queues(&self) -> Result<u64> {
        self.ensure_ready()?;
        self.manager.delete_all_queues().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryExecutor;

    fn queue(config: Config) -> JobQueue {
        JobQueue::with_executor(Arc::new(MemoryExecutor::new()), config).unwrap()
    }

    #[tokio::test]
    async fn test_operations_require_ready_queue() {
        let queue = queue(Config::new().with_maintenance(false));
        let err = queue
            .publish("email", None, PublishOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RowQueueError::NotReady));
        assert!(matches!(queue.count_states().await, Err(RowQueueError::NotReady)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let queue = queue(Config::new().with_maintenance(false));
        queue.start().await.unwrap();
        assert!(queue.is_ready());
        assert!(matches!(queue.start().await, Err(RowQueueError::AlreadyStarted)));

        queue.stop().await.unwrap();
        assert!(!queue.is_ready());
        assert!(matches!(queue.stop().await, Err(RowQueueError::NotStarted)));
    }

    #[tokio::test]
    async fn test_connect_requires_installed_schema() {
        let executor: Arc<dyn Executor> = Arc::new(MemoryExecutor::new());
        let config = Config::new().with_maintenance(false);

        let early = JobQueue::with_executor(Arc::clone(&executor), config.clone()).unwrap();
        assert!(matches!(
            early.connect().await,
            Err(RowQueueError::SchemaVersion { .. })
        ));

        let owner = JobQueue::with_executor(Arc::clone(&executor), config.clone()).unwrap();
        owner.start().await.unwrap();

        let client = JobQueue::with_executor(executor, config).unwrap();
        client.connect().await.unwrap();
        assert!(client.publish("email", None, PublishOptions::new()).await.unwrap().is_some());
        client.disconnect().await.unwrap();
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_start_runs_supervisor_when_enabled() {
        let queue = queue(Config::new());
        queue.start().await.unwrap();
        assert!(queue.supervisor().is_running());
        queue.stop().await.unwrap();
        assert!(!queue.supervisor().is_running());
    }

    #[tokio::test]
    async fn test_owned_executor_cannot_restart_after_stop() {
        let queue = JobQueue::with_owned_executor(
            Arc::new(MemoryExecutor::new()),
            Config::new().with_maintenance(false),
        )
        .unwrap();
        queue.start().await.unwrap();
        queue.stop().await.unwrap();

        assert!(matches!(queue.start().await, Err(RowQueueError::Closed)));
        assert!(matches!(queue.connect().await, Err(RowQueueError::Closed)));
        assert!(!queue.is_ready());
    }

    #[tokio::test]
    async fn test_borrowed_executor_can_restart_after_stop() {
        let queue = queue(Config::new().with_maintenance(false));
        queue.start().await.unwrap();
        queue.stop().await.unwrap();
        queue.start().await.unwrap();
        assert!(queue.is_ready());
        queue.stop().await.unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = JobQueue::with_executor(
            Arc::new(MemoryExecutor::new()),
            Config::new().with_schema("not valid"),
        );
        assert!(matches!(result, Err(RowQueueError::Config(_))));
    }
}
