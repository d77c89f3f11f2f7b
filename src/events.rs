//! Outcome notifications emitted by the manager, the supervisor, and the facade.
//!
//! Each component owns an [`EventBus`] and hands out receivers through
//! `subscribe_events()`. Nothing in the lifecycle waits on a listener: events
//! emitted with no receiver attached are dropped.

use crate::supervisor::StateCounts;
use tokio::{
    sync::broadcast::{self, Receiver, Sender, error::RecvError},
    task::JoinHandle,
};
use tracing::warn;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A handler or a poll failed. Never raised to the caller of the polling loop.
    Error {
        queue: Option<String>,
        message: String,
    },
    Expired {
        count: u64,
    },
    Archived {
        count: u64,
    },
    Purged {
        count: u64,
    },
    MonitorStates(StateCounts),
}

impl QueueEvent {
    pub fn error(queue: Option<&str>, message: impl Into<String>) -> Self {
        QueueEvent::Error {
            queue: queue.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) {
        // an error here only means nobody is listening
        let _ = self.sender.send(event);
    }

    /// Relays every event from this bus into `target` until this bus closes.
    pub fn forward_to(&self, target: &EventBus) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        let target = target.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => target.emit(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event forwarder lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_listeners_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(QueueEvent::Expired { count: 1 });

        let mut receiver = bus.subscribe();
        bus.emit(QueueEvent::Archived { count: 2 });
        assert_eq!(receiver.recv().await.unwrap(), QueueEvent::Archived { count: 2 });
    }

    #[tokio::test]
    async fn test_forward_to_relays_events() {
        let source = EventBus::new(4);
        let target = EventBus::new(4);
        let mut receiver = target.subscribe();

        let forwarder = source.forward_to(&target);
        source.emit(QueueEvent::error(Some("email"), "boom"));

        assert_eq!(
            receiver.recv().await.unwrap(),
            QueueEvent::Error {
                queue: Some("email".to_string()),
                message: "boom".to_string(),
            }
        );
        forwarder.abort();
    }
}
