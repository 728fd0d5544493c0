//! Event bus carrying scheduler events to subscribers.
//!
//! The bus is an explicit service object: it is created once at startup,
//! handed to the scheduler and to whoever wants to listen, and shut down
//! explicitly. After [`EventBus::shutdown`] subscribers see the end of their
//! stream and new subscriptions are refused.

use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::{debug, info};

use capturerun_core::TaskEvent;

/// Broadcast fan-out of [`TaskEvent`]s.
pub struct EventBus {
    tx: RwLock<Option<broadcast::Sender<TaskEvent>>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Deliver an event to current subscribers. Never blocks.
    pub fn publish(&self, event: TaskEvent) {
        let guard = match self.tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = guard.as_ref() {
            // No subscribers is not an error
            if tx.send(event).is_err() {
                debug!("Event dropped, no subscribers");
            }
        }
    }

    /// Subscribe to future events; `None` once the bus is shut down.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<TaskEvent>> {
        let guard = match self.tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let guard = match self.tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().map_or(0, broadcast::Sender::receiver_count)
    }

    /// Close the bus. Subscribers drain buffered events, then see `Closed`.
    pub fn shutdown(&self) {
        let mut guard = match self.tx.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            info!("Event bus shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        let guard = match self.tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capturerun_core::{NewTask, TaskId, TaskKind, TaskState};

    fn event(id: u64) -> TaskEvent {
        TaskEvent::Added {
            task: TaskState::new(TaskId::new(id), &NewTask::new(TaskKind::Conversion, "x")),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe().unwrap();
        bus.publish(event(1));
        bus.publish(event(2));

        assert_eq!(rx.recv().await.unwrap().task().id, TaskId::new(1));
        assert_eq!(rx.recv().await.unwrap().task().id, TaskId::new(2));
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe().unwrap();
        bus.publish(event(1));
        bus.shutdown();

        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(bus.subscribe().is_none());
        assert!(bus.is_shut_down());
        // publishing after shutdown is a no-op
        bus.publish(event(2));
    }
}
