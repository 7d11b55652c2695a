//! Lifecycle notifications for front ends

use tokio::sync::broadcast;

use super::store::{EnvironmentInfo, EnvironmentState};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Created(EnvironmentInfo),
    Removed { agent_id: String },
    StateChanged { agent_id: String, state: EnvironmentState },
}

/// Fan-out of [`LifecycleEvent`]s; sending with no subscribers is fine
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(LifecycleEvent::Removed {
            agent_id: "a".into(),
        });

        let mut rx = bus.subscribe();
        bus.emit(LifecycleEvent::StateChanged {
            agent_id: "a".into(),
            state: EnvironmentState::Stopped,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::StateChanged {
                agent_id: "a".into(),
                state: EnvironmentState::Stopped,
            }
        );
    }
}
