use crate::{RowQueueError, Result};
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, error, info, warn};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Polls the store; an empty vector means nothing was eligible.
pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<Result<Vec<T>>> + Send + Sync>;

/// Dispatches one non-empty fetch result. Outcomes are handled inside.
pub type BatchFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<()> + Send + Sync>;

pub type ErrorFn = Arc<dyn Fn(RowQueueError) + Send + Sync>;

/// A polling loop bound to one subscription.
///
/// Each iteration fetches, dispatches whatever came back, and then waits out the
/// remainder of the interval. A stop request is honoured between iterations or
/// during the wait, so a dispatch that is already running finishes on its own.
pub struct Worker<T> {
    name: String,
    fetch: FetchFn<T>,
    on_batch: BatchFn<T>,
    on_error: ErrorFn,
    interval: Duration,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn new(
        name: impl Into<String>,
        fetch: FetchFn<T>,
        on_batch: BatchFn<T>,
        on_error: ErrorFn,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            fetch,
            on_batch,
            on_error,
            interval,
            shutdown_tx: None,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Worker for queue {} is already running", self.name);
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let name = self.name.clone();
        let fetch = Arc::clone(&self.fetch);
        let on_batch = Arc::clone(&self.on_batch);
        let on_error = Arc::clone(&self.on_error);
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            run(name, fetch, on_batch, on_error, interval, shutdown_rx).await;
        }));
    }

    /// Signals the loop to stop polling. Does not wait for in-flight dispatch.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.try_send(()).is_err() {
                debug!("Worker for queue {} had already stopped", self.name);
            }
        }
        // detach; the task exits on its own once it sees the signal
        self.handle.take();
    }
}

async fn run<T>(
    name: String,
    fetch: FetchFn<T>,
    on_batch: BatchFn<T>,
    on_error: ErrorFn,
    interval: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    info!("Worker started for queue: {}", name);

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let started = Instant::now();
        match fetch().await {
            Ok(items) if !items.is_empty() => {
                debug!("Fetched {} jobs from queue {}", items.len(), name);
                on_batch(items).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error fetching from queue {}: {}", name, e);
                on_error(e);
            }
        }

        let remaining = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep(remaining) => {}
        }
    }

    info!("Worker stopped for queue: {}", name);
}
