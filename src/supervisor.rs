//! Background maintenance: expiry, archiving, purging, and state monitoring.
//!
//! Each sweep is a single statement and can be run on demand. [`Supervisor::supervise`]
//! runs them on the cadences from [`MaintenanceConfig`] and reports every
//! outcome as a [`QueueEvent`]. A failed sweep is reported and retried on the
//! next tick.

use crate::{
    Result,
    config::MaintenanceConfig,
    db::{Executor, Param, Row},
    error::RowQueueError,
    events::{EventBus, QueueEvent},
    job::JobState,
    plans::Plans,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::broadcast::Receiver, task::JoinHandle};
use tracing::{debug, error, info};

/// Job counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStateCounts {
    pub all: i64,
    pub states: BTreeMap<JobState, i64>,
}

/// Job counts per queue and state, excluding completion events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub all: i64,
    pub states: BTreeMap<JobState, i64>,
    pub queues: BTreeMap<String, QueueStateCounts>,
}

impl StateCounts {
    /// Folds the rollup rows of the count-states statement. Null columns mark
    /// totals; every state is present with zero when it has no jobs.
    pub fn from_rows(rows: &[Row]) -> Result<Self> {
        let zeroes = || -> BTreeMap<JobState, i64> {
            JobState::ALL.iter().map(|state| (*state, 0)).collect()
        };
        let mut counts = StateCounts {
            states: zeroes(),
            ..Default::default()
        };

        for row in rows {
            let size = row.get("size").and_then(Value::as_i64).ok_or_else(|| RowQueueError::Store {
                message: "state count row has no size".to_string(),
            })?;
            let state = match row.get("state").and_then(Value::as_str) {
                Some(state) => Some(state.parse::<JobState>()?),
                None => None,
            };
            let name = row.get("name").and_then(Value::as_str);

            match (name, state) {
                (None, None) => counts.all = size,
                (None, Some(state)) => {
                    counts.states.insert(state, size);
                }
                (Some(name), state) => {
                    let queue = counts
                        .queues
                        .entry(name.to_string())
                        .or_insert_with(|| QueueStateCounts {
                            all: 0,
                            states: zeroes(),
                        });
                    match state {
                        Some(state) => {
                            queue.states.insert(state, size);
                        }
                        None => queue.all = size,
                    }
                }
            }
        }

        Ok(counts)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueStateCounts> {
        self.queues.get(name)
    }
}

#[derive(Clone)]
pub struct Supervisor {
    executor: Arc<dyn Executor>,
    plans: Arc<Plans>,
    config: MaintenanceConfig,
    events: EventBus,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Supervisor {
    pub fn new(executor: Arc<dyn Executor>, plans: Arc<Plans>, config: MaintenanceConfig) -> Self {
        Self::with_events(executor, plans, config, EventBus::default())
    }

    pub fn with_events(
        executor: Arc<dyn Executor>,
        plans: Arc<Plans>,
        config: MaintenanceConfig,
        events: EventBus,
    ) -> Self {
        Self {
            executor,
            plans,
            config,
            events,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe_events(&self) -> Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Reclaims active jobs past their `expire_in`. Returns the number reclaimed.
    pub async fn expire(&self) -> Result<u64> {
        let result = self.executor.execute(&self.plans.expire, Vec::new()).await?;
        Ok(result.row_count)
    }

    /// Moves jobs finished longer than `archive_completed_after` ago into the archive.
    pub async fn archive(&self) -> Result<u64> {
        let age = seconds_param(self.config.archive_completed_after)?;
        let result = self.executor.execute(&self.plans.archive, vec![age]).await?;
        Ok(result.row_count)
    }

    /// Deletes archived jobs older than `delete_archived_after`.
    pub async fn purge(&self) -> Result<u64> {
        let age = seconds_param(self.config.delete_archived_after)?;
        let result = self.executor.execute(&self.plans.purge, vec![age]).await?;
        Ok(result.row_count)
    }

    pub async fn count_states(&self) -> Result<StateCounts> {
        let result = self.executor.execute(&self.plans.count_states, Vec::new()).await?;
        StateCounts::from_rows(&result.rows)
    }

    /// Starts the sweep loops. Calling it again while running restarts them.
    pub fn supervise(&self) {
        self.stop();

        let mut handles = vec![
            self.every(self.config.expire_check_interval, |supervisor| async move {
                let count = supervisor.expire().await?;
                if count > 0 {
                    info!("Expired {} jobs", count);
                    supervisor.events.emit(QueueEvent::Expired { count });
                }
                Ok(())
            }),
            self.every(self.config.archive_check_interval, |supervisor| async move {
                let count = supervisor.archive().await?;
                if count > 0 {
                    info!("Archived {} jobs", count);
                    supervisor.events.emit(QueueEvent::Archived { count });
                }
                Ok(())
            }),
            self.every(self.config.delete_check_interval, |supervisor| async move {
                let count = supervisor.purge().await?;
                if count > 0 {
                    info!("Purged {} archived jobs", count);
                    supervisor.events.emit(QueueEvent::Purged { count });
                }
                Ok(())
            }),
        ];

        if let Some(interval) = self.config.monitor_state_interval {
            handles.push(self.every(interval, |supervisor| async move {
                let counts = supervisor.count_states().await?;
                debug!("Monitored {} jobs across {} queues", counts.all, counts.queues.len());
                supervisor.events.emit(QueueEvent::MonitorStates(counts));
                Ok(())
            }));
        }

        info!("Supervisor started with {} sweeps", handles.len());
        self.lock_handles().extend(handles);
    }

    /// Aborts the sweep loops. A sweep statement already sent still completes in the store.
    pub fn stop(&self) {
        let handles: Vec<_> = self.lock_handles().drain(..).collect();
        if !handles.is_empty() {
            for handle in handles {
                handle.abort();
            }
            info!("Supervisor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_handles().iter().any(|handle| !handle.is_finished())
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn every<F, Fut>(&self, interval: Duration, sweep: F) -> JoinHandle<()>
    where
        F: Fn(Supervisor) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move {
            // interval() panics on zero
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if let Err(e) = sweep(supervisor.clone()).await {
                    error!("Maintenance sweep failed: {}", e);
                    supervisor
                        .events
                        .emit(QueueEvent::error(None, format!("Maintenance sweep failed: {}", e)));
                }
            }
        })
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("schema", &self.plans.schema())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn seconds_param(age: Duration) -> Result<Param> {
    i32::try_from(age.as_secs())
        .map(|seconds| Param::Int(Some(seconds)))
        .map_err(|_| RowQueueError::Config(format!("retention of {:?} is too large", age)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(name: Option<&str>, state: Option<&str>, size: i64) -> Row {
        let mut row = Row::new();
        row.insert("name".to_string(), json!(name));
        row.insert("state".to_string(), json!(state));
        row.insert("size".to_string(), json!(size));
        row
    }

    #[test]
    fn test_state_counts_from_rollup_rows() {
        let rows = vec![
            row(Some("email"), Some("created"), 2),
            row(Some("email"), Some("failed"), 1),
            row(Some("email"), None, 3),
            row(None, Some("created"), 2),
            row(None, Some("failed"), 1),
            row(None, None, 3),
        ];
        let counts = StateCounts::from_rows(&rows).unwrap();

        assert_eq!(counts.all, 3);
        assert_eq!(counts.states[&JobState::Created], 2);
        assert_eq!(counts.states[&JobState::Active], 0);

        let email = counts.queue("email").unwrap();
        assert_eq!(email.all, 3);
        assert_eq!(email.states[&JobState::Failed], 1);
        assert_eq!(email.states[&JobState::Retry], 0);
        assert!(counts.queue("sms").is_none());
    }

    #[test]
    fn test_state_counts_rejects_unknown_state() {
        let rows = vec![row(None, Some("paused"), 1)];
        assert!(StateCounts::from_rows(&rows).is_err());
    }

    #[test]
    fn test_retention_must_fit_statement_parameter() {
        assert_eq!(
            seconds_param(Duration::from_secs(3600)).unwrap(),
            Param::Int(Some(3600))
        );
        assert!(seconds_param(Duration::from_secs(u64::MAX)).is_err());
    }
}
