//! Team event fan-out.
//!
//! State changes are published on a broadcast channel with monotonic
//! sequence numbers. The UI (out of process scope) is a passive subscriber;
//! agents subscribe to wake from idle on `TaskUnblocked`. Emission is
//! synchronous and never blocks on slow subscribers; a lagging receiver
//! drops old events, it does not stall the sender.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::domain::models::AgentState;

/// A state change somewhere in the team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TeamEvent {
    TaskAdded { task_id: String },
    TaskClaimed { task_id: String, agent_id: String },
    TaskCompleted { task_id: String },
    TaskUnblocked { task_id: String },
    TaskFailed { task_id: String, error: String },
    AgentStateChanged { agent_id: String, state: AgentState },
    MergeCompleted { task_id: String, commit_sha: String },
    MergeFailed { task_id: String, reason: String },
}

/// An event plus its bus-assigned sequence number and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: TeamEvent,
}

/// Broadcast bus for [`TeamEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SequencedEvent>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Fire-and-forget; absence of receivers is fine.
    pub fn emit(&self, event: TeamEvent) {
        let sequenced = SequencedEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        };
        let _ = self.sender.send(sequenced);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.sender.subscribe()
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

    #[tokio::test]
    async fn test_events_arrive_with_monotonic_sequence() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(TeamEvent::TaskAdded {
            task_id: "task-1".into(),
        });
        bus.emit(TeamEvent::TaskCompleted {
            task_id: "task-1".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.sequence > first.sequence);
        assert!(matches!(first.event, TeamEvent::TaskAdded { .. }));
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(TeamEvent::MergeFailed {
            task_id: "task-9".into(),
            reason: "conflict".into(),
        });
    }
}
