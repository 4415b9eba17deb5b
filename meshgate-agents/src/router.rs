//! Task Router
//!
//! Owns the task table and drives every task through its lifecycle. Each
//! Pending task has exactly one dispatch driver (a spawned tokio task) that
//! looks up eligible agents, claims one under the table lock, and sends
//! `task.execute` after the lock is released. Sends that fail fall through
//! to the next candidate; when none remain the driver backs off until the
//! task's deadline.

use crate::config::{DispatchConfig, SelectionPolicy};
use crate::events::{MeshEvent, SharedEventSink, TracingSink};
use crate::registry::{AgentRegistry, AgentSnapshot};
use chrono::{DateTime, Utc};
use meshgate_core::{
    AgentId, AgentLink, CapabilitySet, ConnectionId, DispatchError, ExpiryReason, Message, Task,
    TaskId, TaskOutcome, TaskRequest, TaskState,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::debug;

// ============================================================================
// TABLE
// ============================================================================

struct TaskEntry {
    task: Task,
    /// Dispatch window, reapplied on every requeue.
    window: Duration,
    deadline: Instant,
    /// When the task last became Pending.
    queued_at: Instant,
    assigned_connection: Option<ConnectionId>,
    /// Agents this task was delivered to before, tried last.
    previous_agents: BTreeSet<AgentId>,
    driver_active: bool,
    state_tx: watch::Sender<TaskState>,
}

impl TaskEntry {
    fn publish_state(&self) {
        self.state_tx.send_replace(self.task.state);
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Dispatch sequence number of each agent's most recent delivery.
    last_dispatch: HashMap<AgentId, u64>,
    in_flight: HashMap<AgentId, usize>,
    dispatch_seq: u64,
}

fn finish_flight(in_flight: &mut HashMap<AgentId, usize>, agent_id: &AgentId) {
    if let Some(count) = in_flight.get_mut(agent_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            in_flight.remove(agent_id);
        }
    }
}

/// Ordering key for candidate selection; smaller wins.
type RankKey = (bool, usize, u64, DateTime<Utc>, AgentId);

fn rank(
    policy: SelectionPolicy,
    required: &CapabilitySet,
    candidate: &AgentSnapshot,
    previous_agents: &BTreeSet<AgentId>,
    last_dispatch: &HashMap<AgentId, u64>,
    in_flight: &HashMap<AgentId, usize>,
) -> RankKey {
    let agent_id = candidate.agent_id();
    let primary = match policy {
        SelectionPolicy::SpecificityThenRecency => candidate.capabilities().extra_over(required),
        SelectionPolicy::LeastRecentlyDispatched => 0,
        SelectionPolicy::LeastOutstanding => in_flight.get(agent_id).copied().unwrap_or(0),
    };
    (
        previous_agents.contains(agent_id),
        primary,
        last_dispatch.get(agent_id).copied().unwrap_or(0),
        candidate.identity.registered_at,
        agent_id.clone(),
    )
}

/// Per-state task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
    pub cancelled: usize,
}

// ============================================================================
// ROUTER
// ============================================================================

struct Claim {
    link: Arc<dyn AgentLink>,
    agent_id: AgentId,
    connection_id: ConnectionId,
    message: Message,
    attempt: u32,
    wait: Duration,
}

enum ClaimStep {
    Claimed(Claim),
    Exhausted,
    NotPending,
}

enum Attempt {
    Delivered,
    NoEligible,
    NotPending,
}

struct RouterInner {
    registry: Arc<AgentRegistry>,
    config: DispatchConfig,
    events: SharedEventSink,
    table: Mutex<TaskTable>,
}

/// Cloneable handle to the task router.
#[derive(Clone)]
pub struct TaskRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRouter")
            .field("policy", &self.inner.config.policy)
            .field("counts", &self.counts())
            .finish()
    }
}

impl TaskRouter {
    pub fn new(registry: Arc<AgentRegistry>, config: DispatchConfig) -> Self {
        Self::with_events(registry, config, Arc::new(TracingSink))
    }

    pub fn with_events(
        registry: Arc<AgentRegistry>,
        config: DispatchConfig,
        events: SharedEventSink,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                config,
                events,
                table: Mutex::new(TaskTable::default()),
            }),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// Accept a task and start dispatching it. Must be called inside a
    /// tokio runtime.
    pub fn submit(&self, request: TaskRequest) -> TaskId {
        let window = request.deadline().unwrap_or(self.inner.config.deadline);
        let task = Task::new(request);
        let task_id = task.task_id;
        let required = task.required_capabilities.to_vec();
        let (state_tx, _) = watch::channel(TaskState::Pending);
        let now = Instant::now();

        self.inner.lock().tasks.insert(
            task_id,
            TaskEntry {
                task,
                window,
                deadline: now + window,
                queued_at: now,
                assigned_connection: None,
                previous_agents: BTreeSet::new(),
                driver_active: true,
                state_tx,
            },
        );

        self.inner.events.emit(MeshEvent::TaskSubmitted {
            task_id,
            required_capabilities: required,
        });
        self.inner.spawn_driver(task_id);
        task_id
    }

    /// Apply a result reported by `agent_id`.
    ///
    /// Returns `Ok(true)` when the outcome was applied and `Ok(false)` when
    /// it was ignored: the task is not Dispatched (late or duplicate
    /// result) or is assigned to someone else.
    pub fn on_result(
        &self,
        agent_id: &AgentId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<bool, DispatchError> {
        let event = {
            let mut guard = self.inner.lock();
            let TaskTable {
                tasks, in_flight, ..
            } = &mut *guard;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(DispatchError::TaskNotFound { task_id })?;
            if entry.task.state != TaskState::Dispatched
                || entry.task.assigned_agent_id.as_ref() != Some(agent_id)
            {
                return Ok(false);
            }
            let event = match &outcome {
                TaskOutcome::Completed(_) => MeshEvent::TaskCompleted {
                    task_id,
                    agent_id: agent_id.clone(),
                },
                TaskOutcome::Failed(error) => MeshEvent::TaskFailed {
                    task_id,
                    agent_id: agent_id.clone(),
                    error: error.clone(),
                },
            };
            if entry.task.complete(outcome).is_err() {
                return Ok(false);
            }
            entry.assigned_connection = None;
            entry.publish_state();
            finish_flight(in_flight, agent_id);
            event
        };
        self.inner.events.emit(event);
        Ok(true)
    }

    /// Withdraw a task that has not finished.
    ///
    /// A Pending task simply stops being dispatched. A Dispatched task's
    /// assignee is sent `task.cancel` on the connection it was delivered
    /// through, and any result it reports afterwards is ignored.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        reason: impl Into<String>,
    ) -> Result<Task, DispatchError> {
        let reason = reason.into();
        let (snapshot, assignee) = {
            let mut guard = self.inner.lock();
            let TaskTable {
                tasks, in_flight, ..
            } = &mut *guard;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(DispatchError::TaskNotFound { task_id })?;
            let was_dispatched = entry.task.state == TaskState::Dispatched;
            if entry.task.cancel(reason.clone()).is_err() {
                return Err(DispatchError::AlreadyFinished {
                    task_id,
                    state: entry.task.state,
                });
            }
            let connection = entry.assigned_connection.take();
            let assignee = match (was_dispatched, &entry.task.assigned_agent_id, connection) {
                (true, Some(agent_id), Some(connection_id)) => {
                    finish_flight(in_flight, agent_id);
                    Some((agent_id.clone(), connection_id))
                }
                _ => None,
            };
            entry.publish_state();
            (entry.task.clone(), assignee)
        };

        self.inner.events.emit(MeshEvent::TaskCancelled {
            task_id,
            agent_id: assignee.as_ref().map(|(agent_id, _)| agent_id.clone()),
            reason: reason.clone(),
        });
        if let Some((agent_id, connection_id)) = assignee {
            self.inner
                .notify_cancel(&agent_id, connection_id, task_id, reason)
                .await;
        }
        Ok(snapshot)
    }

    /// Requeue every task dispatched to `agent_id`, whatever the connection.
    pub fn on_agent_disconnected(&self, agent_id: &AgentId) -> usize {
        let requeued = self
            .inner
            .requeue_where(|entry| entry.task.assigned_agent_id.as_ref() == Some(agent_id));
        self.inner.forget_if_unregistered(agent_id);
        requeued
    }

    /// Requeue tasks delivered through one specific connection.
    pub fn on_session_closed(&self, agent_id: &AgentId, connection_id: ConnectionId) -> usize {
        let requeued = self.inner.requeue_where(|entry| {
            entry.assigned_connection == Some(connection_id)
                && entry.task.assigned_agent_id.as_ref() == Some(agent_id)
        });
        self.inner.forget_if_unregistered(agent_id);
        requeued
    }

    pub fn get(&self, task_id: TaskId) -> Option<Task> {
        self.inner.lock().tasks.get(&task_id).map(|e| e.task.clone())
    }

    /// All tracked tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .lock()
            .tasks
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks
    }

    /// Subscribe to state changes of one task.
    pub fn watch(&self, task_id: TaskId) -> Option<watch::Receiver<TaskState>> {
        self.inner
            .lock()
            .tasks
            .get(&task_id)
            .map(|e| e.state_tx.subscribe())
    }

    /// Wait until the task is terminal or `timeout` passes, then return its
    /// current snapshot.
    pub async fn wait_for_terminal(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<Task, DispatchError> {
        let mut rx = self
            .watch(task_id)
            .ok_or(DispatchError::TaskNotFound { task_id })?;
        // Timeout or a pruned task both fall through to the lookup below.
        let _ = time::timeout(timeout, rx.wait_for(|state| state.is_terminal())).await;
        self.get(task_id)
            .ok_or(DispatchError::TaskNotFound { task_id })
    }

    /// Drop terminal tasks that finished more than `older_than` ago.
    pub fn prune_terminal(&self, older_than: Duration) -> usize {
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let registered: HashSet<AgentId> = self
            .inner
            .registry
            .list()
            .into_iter()
            .map(|agent| agent.agent_id().clone())
            .collect();
        let mut table = self.inner.lock();
        let before = table.tasks.len();
        table.tasks.retain(|_, entry| {
            !(entry.task.is_terminal()
                && entry.task.completed_at.map_or(false, |done| done <= cutoff))
        });
        table
            .last_dispatch
            .retain(|agent_id, _| registered.contains(agent_id));
        before - table.tasks.len()
    }

    pub fn counts(&self) -> TaskCounts {
        let table = self.inner.lock();
        let mut counts = TaskCounts::default();
        for entry in table.tasks.values() {
            match entry.task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Dispatched => counts.dispatched += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Expired => counts.expired += 1,
                TaskState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Tasks currently assigned to `agent_id`.
    pub fn in_flight(&self, agent_id: &AgentId) -> usize {
        self.inner
            .lock()
            .in_flight
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }
}

impl RouterInner {
    // Lock poisoning is not propagated.
    fn lock(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_driver(self: &Arc<Self>, task_id: TaskId) {
        tokio::spawn(Arc::clone(self).drive(task_id));
    }

    async fn drive(self: Arc<Self>, task_id: TaskId) {
        let mut backoff = self.config.initial_backoff;
        loop {
            match self.dispatch_once(task_id).await {
                Attempt::Delivered | Attempt::NotPending => {
                    if self.release_driver(task_id) {
                        return;
                    }
                    // Requeued while this driver was still running.
                    backoff = self.config.initial_backoff;
                    continue;
                }
                Attempt::NoEligible => {}
            }

            let Some(deadline) = self.deadline_of(task_id) else {
                return;
            };
            let now = Instant::now();
            if now >= deadline {
                self.expire_pending(task_id, ExpiryReason::NoEligibleAgent);
                if self.release_driver(task_id) {
                    return;
                }
                continue;
            }
            debug!(task_id = %task_id, backoff_ms = backoff.as_millis() as u64, "No eligible agent, backing off");
            time::sleep_until((now + backoff).min(deadline)).await;
            backoff = self.config.next_backoff(backoff);
        }
    }

    async fn dispatch_once(&self, task_id: TaskId) -> Attempt {
        let required = {
            let table = self.lock();
            match table.tasks.get(&task_id) {
                Some(entry) if entry.task.state == TaskState::Pending => {
                    entry.task.required_capabilities.clone()
                }
                _ => return Attempt::NotPending,
            }
        };

        let candidates = self.registry.find_eligible(&required);
        let mut tried = HashSet::new();
        loop {
            let claim = match self.claim_next(task_id, &required, &candidates, &tried) {
                ClaimStep::Claimed(claim) => claim,
                ClaimStep::Exhausted => return Attempt::NoEligible,
                ClaimStep::NotPending => return Attempt::NotPending,
            };
            let Claim {
                link,
                agent_id,
                connection_id,
                message,
                attempt,
                wait,
            } = claim;

            match link.send(message).await {
                Ok(()) => {
                    self.events.emit(MeshEvent::TaskDispatched {
                        task_id,
                        agent_id,
                        attempt,
                        wait_ms: wait.as_millis().min(u64::MAX as u128) as u64,
                    });
                    return Attempt::Delivered;
                }
                Err(err) => {
                    self.release_failed(task_id, &agent_id, connection_id);
                    self.events.emit(MeshEvent::DispatchFailed {
                        task_id,
                        agent_id,
                        reason: err.to_string(),
                    });
                    tried.insert(connection_id);
                }
            }
        }
    }

    /// Pick the best untried candidate and claim the task for it.
    fn claim_next(
        &self,
        task_id: TaskId,
        required: &CapabilitySet,
        candidates: &[AgentSnapshot],
        tried: &HashSet<ConnectionId>,
    ) -> ClaimStep {
        let mut guard = self.lock();
        let TaskTable {
            tasks,
            last_dispatch,
            in_flight,
            dispatch_seq,
        } = &mut *guard;

        let Some(entry) = tasks.get_mut(&task_id) else {
            return ClaimStep::NotPending;
        };
        if entry.task.state != TaskState::Pending {
            return ClaimStep::NotPending;
        }

        let best = candidates
            .iter()
            .filter(|c| !tried.contains(&c.connection_id))
            .filter(|c| c.link.state().accepts_tasks())
            .min_by_key(|c| {
                rank(
                    self.config.policy,
                    required,
                    c,
                    &entry.previous_agents,
                    last_dispatch,
                    in_flight,
                )
            });
        let Some(best) = best else {
            return ClaimStep::Exhausted;
        };

        let agent_id = best.agent_id().clone();
        if entry.task.mark_dispatched(agent_id.clone()).is_err() {
            return ClaimStep::NotPending;
        }
        entry.assigned_connection = Some(best.connection_id);
        entry.publish_state();

        *dispatch_seq += 1;
        last_dispatch.insert(agent_id.clone(), *dispatch_seq);
        *in_flight.entry(agent_id.clone()).or_default() += 1;

        ClaimStep::Claimed(Claim {
            link: Arc::clone(&best.link),
            agent_id,
            connection_id: best.connection_id,
            message: Message::TaskExecute {
                task_id,
                content: entry.task.payload.clone(),
            },
            attempt: entry.task.attempts,
            wait: entry.queued_at.elapsed(),
        })
    }

    /// Undo a claim whose send failed, unless something else already moved
    /// the task on.
    fn release_failed(&self, task_id: TaskId, agent_id: &AgentId, connection_id: ConnectionId) {
        let mut guard = self.lock();
        let TaskTable {
            tasks, in_flight, ..
        } = &mut *guard;
        if let Some(entry) = tasks.get_mut(&task_id) {
            if entry.task.state == TaskState::Dispatched
                && entry.assigned_connection == Some(connection_id)
                && entry.task.release_claim().is_ok()
            {
                entry.assigned_connection = None;
                entry.publish_state();
                finish_flight(in_flight, agent_id);
            }
        }
    }

    /// Clear the driver flag unless the task needs driving again.
    /// Returns true when the driver should exit.
    fn release_driver(&self, task_id: TaskId) -> bool {
        let mut table = self.lock();
        match table.tasks.get_mut(&task_id) {
            Some(entry) if entry.task.state == TaskState::Pending => false,
            Some(entry) => {
                entry.driver_active = false;
                true
            }
            None => true,
        }
    }

    async fn notify_cancel(
        &self,
        agent_id: &AgentId,
        connection_id: ConnectionId,
        task_id: TaskId,
        reason: String,
    ) {
        let Some(link) = self
            .registry
            .get_session(agent_id)
            .filter(|link| link.connection_id() == connection_id)
        else {
            debug!(task_id = %task_id, agent_id = %agent_id, "Assignee gone, cancel not delivered");
            return;
        };
        if let Err(e) = link.send(Message::TaskCancel { task_id, reason }).await {
            debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "Cancel not delivered");
        }
    }

    /// Drop per-agent dispatch history once the agent has left the registry.
    fn forget_if_unregistered(&self, agent_id: &AgentId) {
        if self.registry.get(agent_id).is_none() {
            self.lock().last_dispatch.remove(agent_id);
        }
    }

    fn deadline_of(&self, task_id: TaskId) -> Option<Instant> {
        self.lock().tasks.get(&task_id).map(|e| e.deadline)
    }

    fn expire_pending(&self, task_id: TaskId, reason: ExpiryReason) {
        let expired = {
            let mut table = self.lock();
            match table.tasks.get_mut(&task_id) {
                Some(entry) => {
                    let expired = entry.task.expire(reason).is_ok();
                    if expired {
                        entry.publish_state();
                    }
                    expired
                }
                None => false,
            }
        };
        if expired {
            self.events.emit(MeshEvent::TaskExpired { task_id, reason });
        }
    }

    fn requeue_where(self: &Arc<Self>, matches: impl Fn(&TaskEntry) -> bool) -> usize {
        let mut events = Vec::new();
        let mut respawn = Vec::new();
        let mut count = 0;
        {
            let mut guard = self.lock();
            let TaskTable {
                tasks, in_flight, ..
            } = &mut *guard;
            for (task_id, entry) in tasks.iter_mut() {
                if entry.task.state != TaskState::Dispatched || !matches(entry) {
                    continue;
                }
                let Some(previous) = entry.task.assigned_agent_id.clone() else {
                    continue;
                };
                if entry.task.requeue().is_err() {
                    continue;
                }
                count += 1;
                finish_flight(in_flight, &previous);
                entry.assigned_connection = None;
                entry.previous_agents.insert(previous.clone());
                let now = Instant::now();
                entry.queued_at = now;
                entry.deadline = now + entry.window;
                events.push(MeshEvent::TaskRequeued {
                    task_id: *task_id,
                    previous_agent_id: previous,
                    reassignments: entry.task.reassignments,
                });

                if entry.task.reassignments > self.config.max_reassignments {
                    if entry.task.expire(ExpiryReason::AgentVanished).is_ok() {
                        events.push(MeshEvent::TaskExpired {
                            task_id: *task_id,
                            reason: ExpiryReason::AgentVanished,
                        });
                    }
                } else if !entry.driver_active {
                    entry.driver_active = true;
                    respawn.push(*task_id);
                }
                entry.publish_state();
            }
        }

        for event in events {
            self.events.emit(event);
        }
        for task_id in respawn {
            self.spawn_driver(task_id);
        }
        count
    }
}
