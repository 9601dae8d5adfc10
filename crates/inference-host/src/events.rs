//! Lifecycle notifications for telemetry subscribers.
//!
//! Publishing never blocks: a lagging subscriber loses the oldest events, and
//! publishing with no subscribers is a no-op.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::model_runtime::{ModelId, Phase, TargetKind};

const DEFAULT_CAPACITY: usize = 1024;

/// Why a ready model left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    MemoryPressure,
    Explicit,
    Corrupted,
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::MemoryPressure => "memory_pressure",
            EvictionReason::Explicit => "explicit",
            EvictionReason::Corrupted => "corrupted",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ModelLoaded {
        model_id: ModelId,
        backend: String,
        footprint_bytes: u64,
    },
    ModelEvicted {
        model_id: ModelId,
        reason: EvictionReason,
    },
    LoadFailed {
        model_id: ModelId,
        code: &'static str,
        cause: String,
    },
    PhaseDispatched {
        model_id: ModelId,
        backend: String,
        phase: Phase,
        target: TargetKind,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::ModelLoaded { .. } => "model_loaded",
            LifecycleEvent::ModelEvicted { .. } => "model_evicted",
            LifecycleEvent::LoadFailed { .. } => "load_failed",
            LifecycleEvent::PhaseDispatched { .. } => "phase_dispatched",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        trace!(event = event.name(), "Publishing lifecycle event");
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(LifecycleEvent::ModelEvicted {
            model_id: "m1".into(),
            reason: EvictionReason::Explicit,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(LifecycleEvent::ModelLoaded {
            model_id: "m1".into(),
            backend: "llama.cpp".into(),
            footprint_bytes: 10,
        });
        bus.publish(LifecycleEvent::ModelEvicted {
            model_id: "m1".into(),
            reason: EvictionReason::MemoryPressure,
        });
        assert_eq!(rx.recv().await.unwrap().name(), "model_loaded");
        assert_eq!(rx.recv().await.unwrap().name(), "model_evicted");
    }

    #[test]
    fn test_lagging_subscriber_does_not_block_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..10 {
            bus.publish(LifecycleEvent::ModelEvicted {
                model_id: "m1".into(),
                reason: EvictionReason::Explicit,
            });
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_value(LifecycleEvent::ModelEvicted {
            model_id: "m1".into(),
            reason: EvictionReason::Corrupted,
        })
        .unwrap();
        assert_eq!(json["event"], "model_evicted");
        assert_eq!(json["reason"], "corrupted");
    }
}
