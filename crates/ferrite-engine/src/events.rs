//! Node lifecycle event stream
//!
//! Observers (UI, audit log, tests) subscribe to a broadcast channel of
//! state changes. Publishing never blocks the orchestrator; events to a
//! channel with no subscribers are dropped.

use tokio::sync::broadcast;
use uuid::Uuid;

use ferrite_common::models::{PowerState, ProvisionState};

#[derive(Debug, Clone)]
pub enum NodeEvent {
    StateChanged {
        node: Uuid,
        from: ProvisionState,
        to: ProvisionState,
    },
    ProvisionFailed {
        node: Uuid,
        state: ProvisionState,
        error: String,
    },
    PowerStateChanged {
        node: Uuid,
        state: PowerState,
    },
}

pub struct EventManager {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let manager = EventManager::new();
        let mut rx = manager.subscribe();

        let node = Uuid::new_v4();
        manager.publish(NodeEvent::StateChanged {
            node,
            from: ProvisionState::Enroll,
            to: ProvisionState::Verifying,
        });

        match rx.recv().await.unwrap() {
            NodeEvent::StateChanged { node: n, from, to } => {
                assert_eq!(n, node);
                assert_eq!(from, ProvisionState::Enroll);
                assert_eq!(to, ProvisionState::Verifying);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let manager = EventManager::new();
        assert_eq!(manager.receiver_count(), 0);
        manager.publish(NodeEvent::PowerStateChanged {
            node: Uuid::new_v4(),
            state: PowerState::On,
        });
    }
}
