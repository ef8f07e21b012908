//! Rollout event broadcasting.
//!
//! Phase changes, rollbacks, and completions are published as typed
//! events on a broadcast channel instead of re-entrant callbacks;
//! consumers (API layer, log sink) subscribe and observe without being
//! able to reach back into controller state.

use pdc_common::types::{CanaryPhase, RollbackReason, VersionId};
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_BUFFER: usize = 256;

/// A lifecycle event emitted by the controller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    Started {
        rollout: String,
        target_version: VersionId,
    },
    PhaseChanged {
        rollout: String,
        phase: CanaryPhase,
        weight: u8,
    },
    RolledBack {
        rollout: String,
        reason: RollbackReason,
    },
    Completed {
        rollout: String,
        target_version: VersionId,
    },
}

impl RolloutEvent {
    /// Name of the rollout this event belongs to.
    pub fn rollout(&self) -> &str {
        match self {
            Self::Started { rollout, .. }
            | Self::PhaseChanged { rollout, .. }
            | Self::RolledBack { rollout, .. }
            | Self::Completed { rollout, .. } => rollout,
        }
    }
}

/// Broadcast channel for rollout events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RolloutEvent>,
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER` to
    /// avoid lag/drop behavior for bursty event streams.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1).max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Delivery is best-effort: with no subscribers the
    /// event is dropped.
    pub fn emit(&self, event: RolloutEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_accessor_covers_all_variants() {
        let events = [
            RolloutEvent::Started {
                rollout: "a".into(),
                target_version: VersionId::new("v2"),
            },
            RolloutEvent::PhaseChanged {
                rollout: "a".into(),
                phase: CanaryPhase::Canary(5),
                weight: 5,
            },
            RolloutEvent::RolledBack {
                rollout: "a".into(),
                reason: RollbackReason::Manual,
            },
            RolloutEvent::Completed {
                rollout: "a".into(),
                target_version: VersionId::new("v2"),
            },
        ];
        for event in events {
            assert_eq!(event.rollout(), "a");
        }
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();

        bus.emit(RolloutEvent::PhaseChanged {
            rollout: "checkout".into(),
            phase: CanaryPhase::Canary(25),
            weight: 25,
        });

        match rx.recv().await.unwrap() {
            RolloutEvent::PhaseChanged { weight, phase, .. } => {
                assert_eq!(weight, 25);
                assert_eq!(phase, CanaryPhase::Canary(25));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(1);
        // Must not panic or error.
        bus.emit(RolloutEvent::Completed {
            rollout: "checkout".into(),
            target_version: VersionId::new("v2"),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(RolloutEvent::RolledBack {
            rollout: "checkout".into(),
            reason: RollbackReason::HighErrorRate,
        })
        .unwrap();
        assert_eq!(json["event"], "rolled_back");
        assert_eq!(json["reason"], "high_error_rate");
    }
}
