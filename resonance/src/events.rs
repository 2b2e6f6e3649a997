//! Engine lifecycle events
//!
//! Pool, orchestrator and composer publish on a Tokio broadcast channel.
//! Subscribers are optional; publishing with nobody listening is fine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::ensemble::RunState;
use crate::types::{ModelId, RunId, StreamId};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Why a model left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Least recently used, to make room for another model.
    Lru,
    /// Pool shutdown.
    Shutdown,
}

/// All engine lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A model was materialized by the backend
    ModelLoaded {
        model_id: ModelId,
        load_time_ms: u64,
        memory_estimate: u64,
        timestamp: DateTime<Utc>,
    },

    /// A model was dropped from the pool
    ModelEvicted {
        model_id: ModelId,
        reason: EvictionReason,
        timestamp: DateTime<Utc>,
    },

    /// An ensemble run moved between states
    RunStateChanged {
        run_id: RunId,
        from: RunState,
        to: RunState,
        timestamp: DateTime<Utc>,
    },

    /// One stream left the run with an error
    StreamFailed {
        run_id: RunId,
        stream_id: StreamId,
        model_id: ModelId,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// One stream reached its terminal marker
    StreamFinished {
        run_id: RunId,
        stream_id: StreamId,
        model_id: ModelId,
        tokens: u64,
        timestamp: DateTime<Utc>,
    },

    /// The composer entered or left degraded mode
    DegradedModeChanged {
        degraded: bool,
        queue_depth: usize,
        frame_number: u64,
        timestamp: DateTime<Utc>,
    },

    /// A frame took longer than its budget
    FrameOverrun {
        frame_number: u64,
        elapsed_us: u64,
        budget_us: u64,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Short event name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ModelLoaded { .. } => "model_loaded",
            Self::ModelEvicted { .. } => "model_evicted",
            Self::RunStateChanged { .. } => "run_state_changed",
            Self::StreamFailed { .. } => "stream_failed",
            Self::StreamFinished { .. } => "stream_finished",
            Self::DegradedModeChanged { .. } => "degraded_mode_changed",
            Self::FrameOverrun { .. } => "frame_overrun",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ModelLoaded { timestamp, .. }
            | Self::ModelEvicted { timestamp, .. }
            | Self::RunStateChanged { timestamp, .. }
            | Self::StreamFailed { timestamp, .. }
            | Self::StreamFinished { timestamp, .. }
            | Self::DegradedModeChanged { timestamp, .. }
            | Self::FrameOverrun { timestamp, .. } => *timestamp,
        }
    }

    /// The run this event belongs to, if any
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::RunStateChanged { run_id, .. }
            | Self::StreamFailed { run_id, .. }
            | Self::StreamFinished { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast event bus
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: EngineEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            // No receivers is OK
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

    fn evicted(model: &str) -> EngineEvent {
        EngineEvent::ModelEvicted {
            model_id: ModelId::new(model),
            reason: EvictionReason::Lru,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(evicted("a"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(evicted("a"));
        bus.publish(evicted("b"));

        for expected in ["a", "b"] {
            match rx.recv().await.unwrap() {
                EngineEvent::ModelEvicted { model_id, .. } => {
                    assert_eq!(model_id.as_str(), expected)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = EngineEvent::RunStateChanged {
            run_id: RunId(2),
            from: RunState::Starting,
            to: RunState::Streaming,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_state_changed");
        assert_eq!(json["to"], "streaming");
        assert_eq!(event.run_id(), Some(RunId(2)));
        assert_eq!(evicted("x").run_id(), None);
    }
}
