//! Agent Registry
//!
//! The authoritative map of connected agents. One `std::sync::RwLock`
//! guards both the entry map and the capability index; no I/O happens
//! while it is held. Superseded sessions are closed after the lock is
//! released.

use crate::events::{MeshEvent, SharedEventSink, TracingSink};
use chrono::{TimeZone, Utc};
use meshgate_core::{
    AgentId, AgentIdentity, AgentLink, Capability, CapabilitySet, CloseReason, ConnectionId,
    SessionState, Timestamp,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug)]
struct AgentEntry {
    identity: AgentIdentity,
    link: Arc<dyn AgentLink>,
    connection_id: ConnectionId,
    /// Unix millis, updated without the write lock.
    last_seen: AtomicI64,
}

impl AgentEntry {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            identity: self.identity.clone(),
            connection_id: self.connection_id,
            link: Arc::clone(&self.link),
            last_seen: millis_to_timestamp(self.last_seen.load(Ordering::Relaxed)),
        }
    }
}

fn millis_to_timestamp(ms: i64) -> Timestamp {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub identity: AgentIdentity,
    pub connection_id: ConnectionId,
    pub link: Arc<dyn AgentLink>,
    pub last_seen: Timestamp,
}

impl AgentSnapshot {
    pub fn agent_id(&self) -> &AgentId {
        &self.identity.agent_id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.identity.capabilities
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.identity.agent_id.clone(),
            name: self.identity.name.clone(),
            capabilities: self.identity.capabilities.to_vec(),
            connection_id: self.connection_id,
            state: self.link.state(),
            registered_at: self.identity.registered_at,
            last_seen: self.last_seen,
        }
    }
}

/// Serializable registry listing row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub name: String,
    pub capabilities: Vec<String>,
    pub connection_id: ConnectionId,
    pub state: SessionState,
    pub registered_at: Timestamp,
    pub last_seen: Timestamp,
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug, Default)]
struct RegistryInner {
    agents: HashMap<AgentId, Arc<AgentEntry>>,
    by_capability: HashMap<Capability, BTreeSet<AgentId>>,
}

impl RegistryInner {
    fn index(&mut self, agent_id: &AgentId, capabilities: &CapabilitySet) {
        for cap in capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(agent_id.clone());
        }
    }

    fn unindex(&mut self, agent_id: &AgentId, capabilities: &CapabilitySet) {
        for cap in capabilities {
            if let Some(ids) = self.by_capability.get_mut(cap) {
                ids.remove(agent_id);
                if ids.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
    }

    fn remove(&mut self, agent_id: &AgentId) -> Option<Arc<AgentEntry>> {
        let entry = self.agents.remove(agent_id)?;
        self.unindex(agent_id, &entry.identity.capabilities);
        Some(entry)
    }
}

/// Concurrently accessed map of registered agents.
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    events: SharedEventSink,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.len())
            .finish()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_events(Arc::new(TracingSink))
    }

    pub fn with_events(events: SharedEventSink) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    // Lock poisoning is not propagated.
    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `identity` bound to `link`.
    ///
    /// If another connection already holds the agent id, its entry is
    /// replaced and its session closed. Returns the superseded entry.
    /// Re-registering on the same connection just replaces the entry.
    pub fn register(
        &self,
        identity: AgentIdentity,
        link: Arc<dyn AgentLink>,
    ) -> Option<AgentSnapshot> {
        let agent_id = identity.agent_id.clone();
        let connection_id = link.connection_id();
        let capabilities = identity.capabilities.to_vec();
        let entry = Arc::new(AgentEntry {
            identity,
            link,
            connection_id,
            last_seen: AtomicI64::new(Utc::now().timestamp_millis()),
        });

        let previous = {
            let mut inner = self.write();
            let previous = inner.remove(&agent_id);
            inner.index(&agent_id, &entry.identity.capabilities);
            inner.agents.insert(agent_id.clone(), entry);
            previous
        };

        let superseded = previous
            .filter(|prev| prev.connection_id != connection_id)
            .map(|prev| prev.snapshot());

        if let Some(old) = &superseded {
            old.link.close(CloseReason::superseded());
            self.events.emit(MeshEvent::AgentSuperseded {
                agent_id: agent_id.clone(),
                old_connection_id: old.connection_id,
                new_connection_id: connection_id,
            });
        }
        self.events.emit(MeshEvent::AgentRegistered {
            agent_id,
            connection_id,
            capabilities,
        });
        superseded
    }

    /// Remove an agent regardless of which connection holds it.
    pub fn unregister(&self, agent_id: &AgentId) -> Option<AgentSnapshot> {
        let removed = self.write().remove(agent_id)?;
        self.events.emit(MeshEvent::AgentUnregistered {
            agent_id: agent_id.clone(),
            connection_id: removed.connection_id,
        });
        Some(removed.snapshot())
    }

    /// Remove the agent only if it is still bound to `connection_id`.
    ///
    /// A superseded session's teardown therefore never removes its
    /// replacement. Returns whether an entry was removed.
    pub fn unregister_session(&self, agent_id: &AgentId, connection_id: ConnectionId) -> bool {
        let removed = {
            let mut inner = self.write();
            match inner.agents.get(agent_id) {
                Some(entry) if entry.connection_id == connection_id => inner.remove(agent_id),
                _ => None,
            }
        };
        match removed {
            Some(_) => {
                self.events.emit(MeshEvent::AgentUnregistered {
                    agent_id: agent_id.clone(),
                    connection_id,
                });
                true
            }
            None => false,
        }
    }

    /// Snapshot of agents declaring `capability`.
    pub fn find_by_capability(&self, capability: &Capability) -> BTreeSet<AgentId> {
        self.read()
            .by_capability
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    /// Registered agents whose capabilities cover `required`.
    pub fn find_eligible(&self, required: &CapabilitySet) -> Vec<AgentSnapshot> {
        let inner = self.read();
        // Walk the smallest index bucket instead of every agent.
        let smallest = required
            .iter()
            .map(|cap| inner.by_capability.get(cap))
            .min_by_key(|ids| ids.map_or(0, |ids| ids.len()));

        let candidates: Vec<&Arc<AgentEntry>> = match smallest {
            Some(None) => return Vec::new(),
            Some(Some(ids)) => ids.iter().filter_map(|id| inner.agents.get(id)).collect(),
            None => inner.agents.values().collect(),
        };

        candidates
            .into_iter()
            .filter(|e| e.identity.capabilities.is_superset_of(required))
            .filter(|e| e.link.state().accepts_tasks())
            .map(|e| e.snapshot())
            .collect()
    }

    /// Session handle for a registered agent.
    pub fn get_session(&self, agent_id: &AgentId) -> Option<Arc<dyn AgentLink>> {
        self.read()
            .agents
            .get(agent_id)
            .map(|e| Arc::clone(&e.link))
    }

    /// Refresh the agent's liveness timestamp. Takes only the read lock.
    pub fn touch(&self, agent_id: &AgentId) {
        if let Some(entry) = self.read().agents.get(agent_id) {
            entry
                .last_seen
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentSnapshot> {
        self.read().agents.get(agent_id).map(|e| e.snapshot())
    }

    pub fn list(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<_> = self.read().agents.values().map(|e| e.snapshot()).collect();
        agents.sort_by(|a, b| a.identity.registered_at.cmp(&b.identity.registered_at));
        agents
    }

    pub fn len(&self) -> usize {
        self.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastSink;
    use meshgate_test_utils::{identity, MockLink};

    fn caps(tags: &[&str]) -> CapabilitySet {
        CapabilitySet::from_tags(tags).expect("valid tags")
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = AgentRegistry::new();
        let link = MockLink::registered();
        assert!(registry
            .register(identity("a", &["code_analysis"]), link.clone())
            .is_none());

        assert_eq!(registry.len(), 1);
        let found = registry.find_by_capability(&Capability::parse("code_analysis").expect("tag"));
        assert!(found.contains(&AgentId::new("a")));
        let session = registry.get_session(&AgentId::new("a")).expect("session");
        assert_eq!(session.connection_id(), link.connection_id());
    }

    #[test]
    fn test_reregistration_supersedes_and_closes_old_session() {
        let registry = AgentRegistry::new();
        let old = MockLink::registered();
        let new = MockLink::registered();
        registry.register(identity("a", &["x"]), old.clone());
        let superseded = registry
            .register(identity("a", &["y"]), new.clone())
            .expect("superseded entry");

        assert_eq!(superseded.connection_id, old.connection_id());
        assert_eq!(old.close_reasons(), vec![CloseReason::superseded()]);
        assert!(new.close_reasons().is_empty());
        assert_eq!(registry.len(), 1);
        // Index follows the newest capabilities only.
        assert!(registry.find_by_capability(&Capability::parse("x").expect("tag")).is_empty());
        assert_eq!(registry.find_by_capability(&Capability::parse("y").expect("tag")).len(), 1);
    }

    #[test]
    fn test_reregistration_on_same_connection_does_not_close() {
        let registry = AgentRegistry::new();
        let link = MockLink::registered();
        registry.register(identity("a", &["x"]), link.clone());
        assert!(registry.register(identity("a", &["x", "y"]), link.clone()).is_none());
        assert!(link.close_reasons().is_empty());
        assert_eq!(
            registry.get(&AgentId::new("a")).expect("entry").capabilities().len(),
            2
        );
    }

    #[test]
    fn test_unregister_session_ignores_superseded_connection() {
        let registry = AgentRegistry::new();
        let old = MockLink::registered();
        let new = MockLink::registered();
        registry.register(identity("a", &["x"]), old.clone());
        registry.register(identity("a", &["x"]), new.clone());

        assert!(!registry.unregister_session(&AgentId::new("a"), old.connection_id()));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister_session(&AgentId::new("a"), new.connection_id()));
        assert!(registry.is_empty());
        assert!(registry.find_by_capability(&Capability::parse("x").expect("tag")).is_empty());
    }

    #[test]
    fn test_find_eligible_requires_superset_and_registered_state() {
        let registry = AgentRegistry::new();
        let full = MockLink::registered();
        let partial = MockLink::registered();
        let draining = MockLink::registered();
        registry.register(identity("full", &["a", "b"]), full);
        registry.register(identity("partial", &["a"]), partial);
        registry.register(identity("draining", &["a", "b"]), draining.clone());
        draining.set_state(SessionState::Draining);

        let eligible: Vec<_> = registry
            .find_eligible(&caps(&["a", "b"]))
            .into_iter()
            .map(|s| s.agent_id().clone())
            .collect();
        assert_eq!(eligible, vec![AgentId::new("full")]);
        assert!(registry.find_eligible(&caps(&["missing"])).is_empty());
        assert_eq!(registry.find_eligible(&CapabilitySet::new()).len(), 2);
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let registry = AgentRegistry::new();
        registry.register(identity("a", &["x"]), MockLink::registered());
        let before = registry.get(&AgentId::new("a")).expect("entry").last_seen;
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch(&AgentId::new("a"));
        let after = registry.get(&AgentId::new("a")).expect("entry").last_seen;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        let registry = AgentRegistry::with_events(Arc::new(sink));
        registry.register(identity("a", &["x"]), MockLink::registered());
        registry.register(identity("a", &["x"]), MockLink::registered());
        registry.unregister(&AgentId::new("a"));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type());
        }
        assert_eq!(
            kinds,
            vec![
                "agent_registered",
                "agent_superseded",
                "agent_registered",
                "agent_unregistered"
            ]
        );
    }

    #[test]
    fn test_summary_serializes() {
        let registry = AgentRegistry::new();
        registry.register(identity("a", &["x"]), MockLink::registered());
        let summary = registry.list()[0].summary();
        let value = serde_json::to_value(summary).expect("serialize");
        assert_eq!(value["agent_id"], "a");
        assert_eq!(value["state"], "registered");
    }
}
