//! Task model and state machine
//!
//! ```text
//! Pending --dispatch--> Dispatched --result--> Completed
//!    |  ^                 |  |   \--failure--> Failed
//!    |  \----requeue------/  |
//!    |                       \--cancel--> Cancelled
//!    |--cancel--> Cancelled
//!    \--deadline / budget--> Expired
//! ```
//!
//! Terminal states never change.

use crate::{AgentId, CapabilitySet, TaskId, TaskTransitionError, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Dispatched,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Dispatched => "dispatched",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Expired => "expired",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Expired | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Expired)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Pending)
                | (Pending, Cancelled)
                | (Dispatched, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// Deadline passed with no capable agent connected.
    NoEligibleAgent,
    /// Assigned agents kept disconnecting until the reassignment budget ran out.
    AgentVanished,
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryReason::NoEligibleAgent => f.write_str("no eligible agent"),
            ExpiryReason::AgentVanished => f.write_str("agent vanished"),
        }
    }
}

/// What an agent reported for a dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
}

/// A request to run work somewhere in the mesh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub required_capabilities: CapabilitySet,
    #[serde(default)]
    pub payload: Value,
    /// Per-task override of the dispatch deadline, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(required_capabilities: CapabilitySet, payload: Value) -> Self {
        Self {
            required_capabilities,
            payload,
            deadline_ms: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// A tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub required_capabilities: CapabilitySet,
    pub payload: Value,
    pub state: TaskState,
    pub assigned_agent_id: Option<AgentId>,
    pub created_at: Timestamp,
    pub dispatched_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Dispatch attempts, including failed sends.
    pub attempts: u32,
    /// Requeues caused by the assignee disconnecting.
    pub reassignments: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_reason: Option<ExpiryReason>,
}

impl Task {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            task_id: TaskId::new(),
            required_capabilities: request.required_capabilities,
            payload: request.payload,
            state: TaskState::Pending,
            assigned_agent_id: None,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
            attempts: 0,
            reassignments: 0,
            deadline_ms: request.deadline_ms,
            result: None,
            error: None,
            expiry_reason: None,
        }
    }

    fn transition(&mut self, to: TaskState) -> Result<(), TaskTransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TaskTransitionError {
                task_id: self.task_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Claim the task for `agent_id`. Counts as a dispatch attempt.
    pub fn mark_dispatched(&mut self, agent_id: AgentId) -> Result<(), TaskTransitionError> {
        self.transition(TaskState::Dispatched)?;
        self.assigned_agent_id = Some(agent_id);
        self.dispatched_at = Some(Utc::now());
        self.attempts += 1;
        Ok(())
    }

    /// Undo a claim whose send failed. Not a reassignment.
    pub fn release_claim(&mut self) -> Result<(), TaskTransitionError> {
        self.transition(TaskState::Pending)?;
        self.assigned_agent_id = None;
        self.dispatched_at = None;
        Ok(())
    }

    /// Return a dispatched task to the queue after its assignee vanished.
    pub fn requeue(&mut self) -> Result<(), TaskTransitionError> {
        self.release_claim()?;
        self.reassignments += 1;
        Ok(())
    }

    /// Apply an agent-reported outcome.
    pub fn complete(&mut self, outcome: TaskOutcome) -> Result<(), TaskTransitionError> {
        match outcome {
            TaskOutcome::Completed(result) => {
                self.transition(TaskState::Completed)?;
                self.result = Some(result);
            }
            TaskOutcome::Failed(error) => {
                self.transition(TaskState::Failed)?;
                self.error = Some(error);
            }
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn expire(&mut self, reason: ExpiryReason) -> Result<(), TaskTransitionError> {
        self.transition(TaskState::Expired)?;
        self.expiry_reason = Some(reason);
        self.error = Some(reason.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Withdraw a task that has not finished. The assignee, if any, is kept
    /// so it can be told.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TaskTransitionError> {
        self.transition(TaskState::Cancelled)?;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending() -> Task {
        Task::new(TaskRequest::new(
            CapabilitySet::from_tags(["code_analysis"]).expect("valid"),
            json!({"file": "main.rs"}),
        ))
    }

    #[test]
    fn test_dispatch_then_complete() {
        let mut task = pending();
        task.mark_dispatched(AgentId::new("a")).expect("dispatch");
        assert_eq!(task.state, TaskState::Dispatched);
        assert_eq!(task.attempts, 1);
        task.complete(TaskOutcome::Completed(json!({"ok": true})))
            .expect("complete");
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_never_change() {
        let mut task = pending();
        task.mark_dispatched(AgentId::new("a")).expect("dispatch");
        task.complete(TaskOutcome::Completed(json!(1))).expect("complete");
        assert!(task.complete(TaskOutcome::Completed(json!(2))).is_err());
        assert!(task.complete(TaskOutcome::Failed("late".into())).is_err());
        assert!(task.requeue().is_err());
        assert_eq!(task.result, Some(json!(1)));
    }

    #[test]
    fn test_requeue_counts_reassignments_release_does_not() {
        let mut task = pending();
        task.mark_dispatched(AgentId::new("a")).expect("dispatch");
        task.release_claim().expect("release");
        assert_eq!(task.reassignments, 0);
        assert!(task.assigned_agent_id.is_none());

        task.mark_dispatched(AgentId::new("b")).expect("dispatch");
        task.requeue().expect("requeue");
        assert_eq!(task.reassignments, 1);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn test_expire_only_from_pending() {
        let mut task = pending();
        task.mark_dispatched(AgentId::new("a")).expect("dispatch");
        assert!(task.expire(ExpiryReason::NoEligibleAgent).is_err());
        task.requeue().expect("requeue");
        task.expire(ExpiryReason::AgentVanished).expect("expire");
        assert_eq!(task.error.as_deref(), Some("agent vanished"));
    }

    #[test]
    fn test_cancel_from_pending_or_dispatched_only() {
        let mut queued = pending();
        queued.cancel("withdrawn").expect("cancel pending");
        assert_eq!(queued.state, TaskState::Cancelled);
        assert_eq!(queued.error.as_deref(), Some("withdrawn"));
        assert!(queued.is_terminal());
        assert!(queued.mark_dispatched(AgentId::new("a")).is_err());

        let mut running = pending();
        running.mark_dispatched(AgentId::new("a")).expect("dispatch");
        running.cancel("withdrawn").expect("cancel dispatched");
        assert_eq!(running.assigned_agent_id, Some(AgentId::new("a")));
        assert!(running.complete(TaskOutcome::Completed(json!(1))).is_err());

        let mut done = pending();
        done.mark_dispatched(AgentId::new("a")).expect("dispatch");
        done.complete(TaskOutcome::Failed("boom".into())).expect("fail");
        assert!(done.cancel("too late").is_err());
        assert_eq!(done.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_task_request_parses_http_body() {
        let req: TaskRequest = serde_json::from_value(json!({
            "required_capabilities": ["security_scan"],
            "payload": {"repo": "x"},
            "deadline_ms": 500
        }))
        .expect("parse");
        assert_eq!(req.deadline(), Some(Duration::from_millis(500)));
        assert_eq!(req.required_capabilities.len(), 1);
    }

    #[test]
    fn test_expiry_reason_display() {
        assert_eq!(ExpiryReason::NoEligibleAgent.to_string(), "no eligible agent");
    }
}
