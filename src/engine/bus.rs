// src/engine/bus.rs

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::engine::LifecycleEvent;

/// Fan-out of lifecycle events to any number of subscribers.
///
/// Subscribers that dropped their receiver are pruned on the next publish.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<LifecycleEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: LifecycleEvent) {
        trace!(?event, "publishing lifecycle event");
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnitId;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let mut kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(LifecycleEvent::WatchClosed { unit: UnitId(0) });
        assert!(matches!(
            kept.try_recv(),
            Ok(LifecycleEvent::WatchClosed { unit: UnitId(0) })
        ));
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
