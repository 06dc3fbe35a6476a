//! Agent registry: descriptors, load and in-flight dispatch bookkeeping.
//!
//! The registry is a pure state store. It filters by capability, capacity and
//! hard constraints, never by health; health filtering belongs to the router.

use flotilla_core::agent::{AgentDescriptor, AgentSnapshot, HealthState};
use flotilla_core::ids::{AgentId, DispatchId, TaskId};
use flotilla_core::task::Constraints;
use flotilla_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// A slot held on an agent for one dispatch.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub dispatch_id: DispatchId,
    pub task_id: TaskId,
    pub agent: AgentDescriptor,
}

struct AgentEntry {
    descriptor: AgentDescriptor,
    health: HealthState,
    in_flight: HashMap<DispatchId, TaskId>,
}

impl AgentEntry {
    fn load(&self) -> u32 {
        self.in_flight.len() as u32
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            descriptor: self.descriptor.clone(),
            current_load: self.load(),
            health: self.health,
        }
    }
}

fn satisfies(descriptor: &AgentDescriptor, capability: &str, constraints: &Constraints) -> bool {
    descriptor.has_capability(capability)
        && constraints
            .required_labels
            .iter()
            .all(|(k, v)| descriptor.labels.get(k) == Some(v))
        && constraints
            .allowed_agents
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&descriptor.id))
}

fn by_weight_then_id(a: &AgentSnapshot, b: &AgentSnapshot) -> std::cmp::Ordering {
    b.descriptor
        .priority_weight
        .total_cmp(&a.descriptor.priority_weight)
        .then_with(|| a.id().cmp(b.id()))
}

/// In-memory registry of agents.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Mutex<BTreeMap<AgentId, AgentEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<AgentId, AgentEntry>> {
        self.agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        descriptor.validate()?;
        let mut agents = self.lock();
        if agents.contains_key(&descriptor.id) {
            return Err(Error::DuplicateAgent(descriptor.id.to_string()));
        }
        info!(
            agent_id = %descriptor.id,
            transport = %descriptor.transport,
            max_concurrent = descriptor.max_concurrent,
            "Agent registered"
        );
        agents.insert(
            descriptor.id.clone(),
            AgentEntry {
                descriptor,
                health: HealthState::Healthy,
                in_flight: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Remove an agent.
    ///
    /// Without `force` this fails while dispatches are in flight. With `force`
    /// the in-flight dispatches are dropped and returned to the caller.
    pub fn deregister(&self, id: &AgentId, force: bool) -> Result<Vec<(DispatchId, TaskId)>> {
        let mut agents = self.lock();
        let entry = agents
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        if !force && !entry.in_flight.is_empty() {
            return Err(Error::AgentBusy {
                id: id.to_string(),
                in_flight: entry.in_flight.len(),
            });
        }
        let entry = agents
            .remove(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        let drained: Vec<_> = entry.in_flight.into_iter().collect();
        info!(agent_id = %id, drained = drained.len(), "Agent deregistered");
        Ok(drained)
    }

    /// Agents that can take the task now, by weight then id.
    pub fn find(&self, capability: &str, constraints: &Constraints) -> Vec<AgentSnapshot> {
        let min_spare = constraints.min_spare_slots.max(1);
        let mut found: Vec<_> = self
            .lock()
            .values()
            .filter(|e| satisfies(&e.descriptor, capability, constraints))
            .map(AgentEntry::snapshot)
            .filter(|s| s.spare_slots() >= min_spare)
            .collect();
        found.sort_by(by_weight_then_id);
        found
    }

    /// Whether any registered agent satisfies capability and constraints, regardless of load.
    pub fn has_capable(&self, capability: &str, constraints: &Constraints) -> bool {
        self.lock()
            .values()
            .any(|e| satisfies(&e.descriptor, capability, constraints))
    }

    /// Select and reserve an agent in one step.
    ///
    /// `select` sees every agent matching capability and constraints, with its
    /// current load and health, and returns the chosen id. The chosen agent's
    /// load is incremented before the lock is released.
    pub fn reserve_with<F>(
        &self,
        capability: &str,
        constraints: &Constraints,
        task_id: TaskId,
        select: F,
    ) -> Result<Reservation>
    where
        F: FnOnce(&[AgentSnapshot]) -> Result<AgentId>,
    {
        let mut agents = self.lock();
        let mut candidates: Vec<_> = agents
            .values()
            .filter(|e| satisfies(&e.descriptor, capability, constraints))
            .map(AgentEntry::snapshot)
            .collect();
        candidates.sort_by(by_weight_then_id);

        let chosen = select(&candidates)?;
        let entry = agents
            .get_mut(&chosen)
            .ok_or_else(|| Error::AgentNotFound(chosen.to_string()))?;
        if entry.load() >= entry.descriptor.max_concurrent {
            return Err(Error::NoCapacity {
                capability: capability.to_string(),
            });
        }

        let dispatch_id = DispatchId::new();
        entry.in_flight.insert(dispatch_id, task_id);
        debug!(
            agent_id = %chosen,
            task_id = %task_id,
            dispatch_id = %dispatch_id,
            load = entry.load(),
            "Reserved agent slot"
        );
        Ok(Reservation {
            dispatch_id,
            task_id,
            agent: entry.descriptor.clone(),
        })
    }

    /// Give back a reservation. Returns `false` if it was already released.
    pub fn release(&self, reservation: &Reservation) -> bool {
        let mut agents = self.lock();
        let released = agents
            .get_mut(&reservation.agent.id)
            .is_some_and(|e| e.in_flight.remove(&reservation.dispatch_id).is_some());
        if released {
            debug!(
                agent_id = %reservation.agent.id,
                dispatch_id = %reservation.dispatch_id,
                "Released agent slot"
            );
        }
        released
    }

    /// Set an agent's health, returning the previous state.
    pub fn set_health(&self, id: &AgentId, health: HealthState) -> Option<HealthState> {
        self.lock()
            .get_mut(id)
            .map(|e| std::mem::replace(&mut e.health, health))
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentSnapshot> {
        self.lock().get(id).map(AgentEntry::snapshot)
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.lock().values().map(AgentEntry::snapshot).collect()
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.lock().values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
