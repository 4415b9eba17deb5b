//! Observability events
//!
//! The registry and router report what they do through an [`EventSink`].
//! Sinks are called after locks are released and must not block.

use meshgate_core::{AgentId, ConnectionId, ExpiryReason, TaskId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Something the control plane did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    AgentRegistered {
        agent_id: AgentId,
        connection_id: ConnectionId,
        capabilities: Vec<String>,
    },
    AgentSuperseded {
        agent_id: AgentId,
        old_connection_id: ConnectionId,
        new_connection_id: ConnectionId,
    },
    AgentUnregistered {
        agent_id: AgentId,
        connection_id: ConnectionId,
    },
    TaskSubmitted {
        task_id: TaskId,
        required_capabilities: Vec<String>,
    },
    TaskDispatched {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
        /// Time from submission (or last requeue) to delivery.
        wait_ms: u64,
    },
    DispatchFailed {
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },
    TaskRequeued {
        task_id: TaskId,
        previous_agent_id: AgentId,
        reassignments: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskFailed {
        task_id: TaskId,
        agent_id: AgentId,
        error: String,
    },
    TaskExpired {
        task_id: TaskId,
        reason: ExpiryReason,
    },
    TaskCancelled {
        task_id: TaskId,
        /// Assignee at the time of cancellation, if the task was out.
        agent_id: Option<AgentId>,
        reason: String,
    },
}

impl MeshEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            MeshEvent::AgentRegistered { .. } => "agent_registered",
            MeshEvent::AgentSuperseded { .. } => "agent_superseded",
            MeshEvent::AgentUnregistered { .. } => "agent_unregistered",
            MeshEvent::TaskSubmitted { .. } => "task_submitted",
            MeshEvent::TaskDispatched { .. } => "task_dispatched",
            MeshEvent::DispatchFailed { .. } => "dispatch_failed",
            MeshEvent::TaskRequeued { .. } => "task_requeued",
            MeshEvent::TaskCompleted { .. } => "task_completed",
            MeshEvent::TaskFailed { .. } => "task_failed",
            MeshEvent::TaskExpired { .. } => "task_expired",
            MeshEvent::TaskCancelled { .. } => "task_cancelled",
        }
    }
}

/// Receives control-plane events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MeshEvent);
}

/// Shared sink handle.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: MeshEvent) {
        match &event {
            MeshEvent::AgentRegistered {
                agent_id,
                connection_id,
                capabilities,
            } => info!(
                agent_id = %agent_id,
                connection_id = %connection_id,
                capabilities = ?capabilities,
                "Agent registered"
            ),
            MeshEvent::AgentSuperseded {
                agent_id,
                old_connection_id,
                new_connection_id,
            } => info!(
                agent_id = %agent_id,
                old_connection_id = %old_connection_id,
                new_connection_id = %new_connection_id,
                "Agent superseded by newer session"
            ),
            MeshEvent::AgentUnregistered {
                agent_id,
                connection_id,
            } => info!(agent_id = %agent_id, connection_id = %connection_id, "Agent unregistered"),
            MeshEvent::TaskSubmitted {
                task_id,
                required_capabilities,
            } => debug!(task_id = %task_id, required = ?required_capabilities, "Task submitted"),
            MeshEvent::TaskDispatched {
                task_id,
                agent_id,
                attempt,
                wait_ms,
            } => debug!(
                task_id = %task_id,
                agent_id = %agent_id,
                attempt,
                wait_ms,
                "Task dispatched"
            ),
            MeshEvent::DispatchFailed {
                task_id,
                agent_id,
                reason,
            } => warn!(task_id = %task_id, agent_id = %agent_id, reason = %reason, "Dispatch failed"),
            MeshEvent::TaskRequeued {
                task_id,
                previous_agent_id,
                reassignments,
            } => info!(
                task_id = %task_id,
                previous_agent_id = %previous_agent_id,
                reassignments,
                "Task requeued"
            ),
            MeshEvent::TaskCompleted { task_id, agent_id } => {
                debug!(task_id = %task_id, agent_id = %agent_id, "Task completed")
            }
            MeshEvent::TaskFailed {
                task_id,
                agent_id,
                error,
            } => info!(task_id = %task_id, agent_id = %agent_id, error = %error, "Task failed"),
            MeshEvent::TaskExpired { task_id, reason } => {
                warn!(task_id = %task_id, reason = %reason, "Task expired")
            }
            MeshEvent::TaskCancelled {
                task_id,
                agent_id,
                reason,
            } => info!(task_id = %task_id, agent_id = ?agent_id, reason = %reason, "Task cancelled"),
        }
    }
}

/// Fans events out to in-process subscribers over a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<MeshEvent>,
}

impl BroadcastSink {
    /// Create a sink with the given channel capacity. Slow subscribers lag.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: MeshEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

/// Forwards each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<SharedEventSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedEventSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: MeshEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let task_id = TaskId::new();
        sink.emit(MeshEvent::TaskExpired {
            task_id,
            reason: ExpiryReason::NoEligibleAgent,
        });
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type(), "task_expired");
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = BroadcastSink::new(8);
        let b = BroadcastSink::new(8);
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        let fanout = FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(a))
            .with(Arc::new(b));
        fanout.emit(MeshEvent::TaskCompleted {
            task_id: TaskId::new(),
            agent_id: AgentId::new("x"),
        });
        assert!(rx_a.recv().await.is_ok());
        assert!(rx_b.recv().await.is_ok());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let value = serde_json::to_value(MeshEvent::AgentUnregistered {
            agent_id: AgentId::new("a"),
            connection_id: ConnectionId::new(),
        })
        .expect("serialize");
        assert_eq!(value["event"], "agent_unregistered");
    }
}
