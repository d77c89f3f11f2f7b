//! # Rowqueue
//!
//! A durable job queue stored in PostgreSQL rows.
//!
//! Producers publish named jobs with a JSON payload, consumers fetch them with
//! `FOR UPDATE SKIP LOCKED` so each job is handed to exactly one consumer, and
//! every outcome is reported back as a state transition. All scheduling lives in
//! the database, so any number of processes can share one queue.
//!
//! ## Features
//!
//! - **Priorities and delays**: higher priority first, then oldest; jobs can start after a time or delay
//! - **Retries**: per-job retry limit with fixed or exponential, jittered backoff
//! - **Expiry**: active jobs that outlive `expire_in` are reclaimed by the supervisor
//! - **Singletons**: deduplicate by key, or throttle and debounce by time window
//! - **Completion events**: every finished job publishes its outcome to a completion topic
//! - **Maintenance**: expired jobs are swept, finished jobs archived, old archives purged
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rowqueue::{Config, Handler, JobOperations, JobQueue, PublishOptions, SubscribeOptions};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> rowqueue::Result<()> {
//!     let config = Config::new().with_database_url("postgresql://localhost/rowqueue");
//!     let queue = JobQueue::connect_with(config).await?;
//!     queue.start().await?;
//!
//!     let options = PublishOptions::new()
//!         .with_retry_limit(3)
//!         .with_retry_delay(10)
//!         .with_retry_backoff(true)
//!         .with_expire_in(Duration::from_secs(60));
//!     queue
//!         .publish("reports", Some(json!({"month": "2024-01"})), options)
//!         .await?;
//!
//!     queue
//!         .subscribe(
//!             "reports",
//!             SubscribeOptions::new(),
//!             Handler::per_job(|job| async move {
//!                 println!("building report {:?}", job.data);
//!                 Ok(Some(json!({"rows": 120})))
//!             }),
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     queue.stop().await
//! }
//! ```
//!
//! ## Job lifecycle
//!
//! A job is `created` (or `retry` after a failure) until a consumer claims it, then
//! `active` until it is completed, failed, cancelled, or expires. A failure with
//! retries left moves it back to `retry` with a new `start_after`; otherwise it ends
//! `failed`. Each transition to a finished state inserts one completion event named
//! `__state__completed__<name>` carrying the outcome, which
//! [`JobOperations::fetch_completed`] and [`JobOperations::on_complete`] consume.
//!
//! ## Testing
//!
//! [`db::MemoryExecutor`] interprets the same statements against in-process rows
//! and a [`db::MockClock`], so queue behavior can be tested without a database.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod job;
pub mod manager;
pub mod migrations;
pub mod options;
pub mod plans;
pub mod queue;
pub mod schedule;
pub mod supervisor;
pub mod worker;

pub use config::Config;
pub use error::RowQueueError;
pub use events::{EventBus, QueueEvent};
pub use job::{CompletionEnvelope, Job, JobId, JobIds, JobState};
pub use manager::{
    ActiveJob, CompletionResult, Fetched, Handler, HandlerError, HandlerResult, JobOperations,
    QueueManager,
};
pub use migrations::Migrator;
pub use options::{PublishOptions, StartAfter, SubscribeOptions};
pub use plans::Plans;
pub use queue::JobQueue;
pub use supervisor::{QueueStateCounts, StateCounts, Supervisor};

/// Convenient type alias for Results with [`RowQueueError`] as the error type.
pub type Result<T> = std::result::Result<T, RowQueueError>;
