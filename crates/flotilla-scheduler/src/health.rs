//! Agent health monitor and circuit breaker.

use crate::registry::AgentRegistry;
use flotilla_core::agent::HealthState;
use flotilla_core::events::{AgentHealthChangedPayload, Event, EventEmitter};
use flotilla_core::ids::AgentId;
use flotilla_core::ports::Prober;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Thresholds and timing for health tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Consecutive failures that take a healthy agent to degraded.
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,
    /// Further consecutive failures that take a degraded agent to unhealthy.
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    /// Consecutive successes that bring an unhealthy agent back.
    #[serde(default = "default_recover_after")]
    pub recover_after: u32,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_degrade_after() -> u32 {
    2
}

fn default_unhealthy_after() -> u32 {
    1
}

fn default_recover_after() -> u32 {
    2
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degrade_after: default_degrade_after(),
            unhealthy_after: default_unhealthy_after(),
            recover_after: default_recover_after(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl HealthPolicy {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Success,
    Failure,
}

/// Failure-count state machine for one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitBreaker {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl CircuitBreaker {
    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Apply one observation. Returns the new state if it changed.
    pub fn observe(&mut self, policy: &HealthPolicy, observation: Observation) -> Option<HealthState> {
        let degrade_at = policy.degrade_after.max(1);
        let unhealthy_at = degrade_at + policy.unhealthy_after.max(1);

        let next = match (self.state, observation) {
            (HealthState::Healthy, Observation::Success) => {
                self.consecutive_failures = 0;
                None
            }
            (HealthState::Degraded, Observation::Success) => {
                self.consecutive_failures = 0;
                Some(HealthState::Healthy)
            }
            (HealthState::Unhealthy, Observation::Success) => {
                self.consecutive_successes += 1;
                (self.consecutive_successes >= policy.recover_after.max(1)).then(|| {
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    HealthState::Healthy
                })
            }
            (HealthState::Healthy, Observation::Failure) => {
                self.consecutive_failures += 1;
                (self.consecutive_failures >= degrade_at).then_some(HealthState::Degraded)
            }
            (HealthState::Degraded, Observation::Failure) => {
                self.consecutive_failures += 1;
                (self.consecutive_failures >= unhealthy_at).then(|| {
                    self.consecutive_successes = 0;
                    HealthState::Unhealthy
                })
            }
            (HealthState::Unhealthy, Observation::Failure) => {
                self.consecutive_successes = 0;
                None
            }
        };

        if let Some(state) = next {
            self.state = state;
        }
        next
    }
}

/// Tracks a circuit breaker per agent and mirrors its state into the registry.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    policy: HealthPolicy,
    breakers: Mutex<HashMap<AgentId, CircuitBreaker>>,
    events: EventEmitter,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>, policy: HealthPolicy, events: EventEmitter) -> Self {
        Self {
            registry,
            policy,
            breakers: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AgentId, CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, id: &AgentId) -> HealthState {
        self.lock().get(id).map(|b| b.state()).unwrap_or_default()
    }

    /// Drop tracking for a deregistered agent.
    pub fn forget(&self, id: &AgentId) {
        self.lock().remove(id);
    }

    pub fn record_success(&self, id: &AgentId) {
        self.observe(id, Observation::Success, None);
    }

    pub fn record_failure(&self, id: &AgentId, reason: impl Into<String>) {
        self.observe(id, Observation::Failure, Some(reason.into()));
    }

    fn observe(&self, id: &AgentId, observation: Observation, reason: Option<String>) {
        if self.registry.get(id).is_none() {
            return;
        }

        let mut breakers = self.lock();
        let breaker = breakers.entry(id.clone()).or_default();
        let old_state = breaker.state();
        let Some(new_state) = breaker.observe(&self.policy, observation) else {
            return;
        };
        let consecutive_failures = breaker.consecutive_failures();
        // Registry update and event both happen under the breaker lock so
        // subscribers see transitions in the order the breaker applied them.
        self.registry.set_health(id, new_state);

        match new_state {
            HealthState::Healthy => info!(
                agent_id = %id,
                from = %old_state,
                "Agent recovered"
            ),
            _ => warn!(
                agent_id = %id,
                from = %old_state,
                to = %new_state,
                consecutive_failures,
                reason = reason.as_deref().unwrap_or(""),
                "Agent health changed"
            ),
        }

        self.events.emit(Event::AgentHealthChanged(AgentHealthChangedPayload {
            agent_id: id.clone(),
            old_state,
            new_state,
            consecutive_failures,
            reason,
            timestamp: chrono::Utc::now(),
        }));
        drop(breakers);
    }

    /// Probe every registered agent once, concurrently.
    pub async fn probe_all(&self, prober: &dyn Prober) {
        let agents = self.registry.descriptors();
        let timeout = self.policy.probe_timeout();

        let probes = agents.iter().map(|agent| async move {
            let result = tokio::time::timeout(timeout, prober.probe(agent)).await;
            (agent, result)
        });

        for (agent, result) in futures::future::join_all(probes).await {
            match result {
                Ok(Ok(())) => {
                    debug!(agent_id = %agent.id, "Probe succeeded");
                    self.record_success(&agent.id);
                }
                Ok(Err(e)) => {
                    debug!(agent_id = %agent.id, error = %e, "Probe failed");
                    self.record_failure(&agent.id, format!("probe failed: {}", e));
                }
                Err(_) => {
                    debug!(agent_id = %agent.id, "Probe timed out");
                    self.record_failure(
                        &agent.id,
                        format!("probe timed out after {}ms", self.policy.probe_timeout_ms),
                    );
                }
            }
        }
    }

    /// Probe on a fixed interval until shutdown.
    pub async fn run(self: Arc<Self>, prober: Arc<dyn Prober>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.policy.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.policy.probe_interval_ms,
            "Starting health monitor"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all(prober.as_ref()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flotilla_core::agent::{AgentDescriptor, Endpoint, Transport};
    use flotilla_core::{Error, Result};
    use std::collections::HashSet;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            degrade_after: 2,
            unhealthy_after: 1,
            recover_after: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_failures_degrade_then_trip() {
        let policy = policy();
        let mut breaker = CircuitBreaker::default();

        assert_eq!(breaker.observe(&policy, Observation::Failure), None);
        assert_eq!(
            breaker.observe(&policy, Observation::Failure),
            Some(HealthState::Degraded)
        );
        assert_eq!(
            breaker.observe(&policy, Observation::Failure),
            Some(HealthState::Unhealthy)
        );
        assert_eq!(breaker.observe(&policy, Observation::Failure), None);
        assert_eq!(breaker.state(), HealthState::Unhealthy);
    }

    #[test]
    fn test_single_success_heals_degraded() {
        let policy = policy();
        let mut breaker = CircuitBreaker::default();
        breaker.observe(&policy, Observation::Failure);
        breaker.observe(&policy, Observation::Failure);

        assert_eq!(
            breaker.observe(&policy, Observation::Success),
            Some(HealthState::Healthy)
        );
        // The failure count starts over.
        assert_eq!(breaker.observe(&policy, Observation::Failure), None);
    }

    #[test]
    fn test_recovery_needs_consecutive_successes() {
        let policy = policy();
        let mut breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.observe(&policy, Observation::Failure);
        }
        assert_eq!(breaker.state(), HealthState::Unhealthy);

        assert_eq!(breaker.observe(&policy, Observation::Success), None);
        // A failure while unhealthy only resets the recovery counter.
        assert_eq!(breaker.observe(&policy, Observation::Failure), None);
        assert_eq!(breaker.observe(&policy, Observation::Success), None);
        assert_eq!(
            breaker.observe(&policy, Observation::Success),
            Some(HealthState::Healthy)
        );
    }

    struct FlakyProber {
        down: HashSet<String>,
    }

    #[async_trait]
    impl Prober for FlakyProber {
        async fn probe(&self, agent: &AgentDescriptor) -> Result<()> {
            if self.down.contains(agent.id.as_str()) {
                Err(Error::Transport {
                    attempt: 1,
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn shell_agent(id: &str) -> AgentDescriptor {
        AgentDescriptor::new(
            id,
            Transport::RemoteShell,
            Endpoint::Shell {
                host: format!("{}.internal", id),
                user: "ci".to_string(),
                port: 22,
            },
        )
        .with_capability("testing")
    }

    #[tokio::test]
    async fn test_probe_failures_mark_agent_unhealthy() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(shell_agent("x")).unwrap();
        registry.register(shell_agent("y")).unwrap();

        let (events, mut rx) = EventEmitter::channel();
        let monitor = HealthMonitor::new(Arc::clone(&registry), policy(), events);
        let prober = FlakyProber {
            down: ["y".to_string()].into(),
        };

        for _ in 0..3 {
            monitor.probe_all(&prober).await;
        }

        let y = AgentId::new("y");
        assert_eq!(monitor.state(&y), HealthState::Unhealthy);
        assert_eq!(registry.get(&y).unwrap().health, HealthState::Unhealthy);
        assert_eq!(
            registry.get(&AgentId::new("x")).unwrap().health,
            HealthState::Healthy
        );

        let mut transitions = Vec::new();
        while let Ok(Event::AgentHealthChanged(p)) = rx.try_recv() {
            transitions.push((p.agent_id.to_string(), p.new_state));
        }
        assert_eq!(
            transitions,
            vec![
                ("y".to_string(), HealthState::Degraded),
                ("y".to_string(), HealthState::Unhealthy),
            ]
        );
    }

    #[tokio::test]
    async fn test_task_failures_share_the_counter() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(shell_agent("x")).unwrap();
        let monitor = HealthMonitor::new(Arc::clone(&registry), policy(), EventEmitter::disabled());
        let x = AgentId::new("x");

        monitor.record_failure(&x, "task timed out");
        monitor
            .probe_all(&FlakyProber {
                down: ["x".to_string()].into(),
            })
            .await;
        assert_eq!(monitor.state(&x), HealthState::Degraded);
    }

    #[test]
    fn test_concurrent_observations_emit_a_consistent_chain() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(shell_agent("x")).unwrap();
        let (events, mut rx) = EventEmitter::channel();
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            HealthPolicy {
                degrade_after: 1,
                unhealthy_after: 1,
                recover_after: 1,
                ..Default::default()
            },
            events,
        );
        let x = AgentId::new("x");

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let (monitor, x) = (&monitor, &x);
                scope.spawn(move || {
                    for i in 0..200 {
                        if (worker + i) % 3 == 0 {
                            monitor.record_success(x);
                        } else {
                            monitor.record_failure(x, "task failed");
                        }
                    }
                });
            }
        });

        let mut previous = HealthState::Healthy;
        let mut seen = 0;
        while let Ok(Event::AgentHealthChanged(p)) = rx.try_recv() {
            assert_eq!(p.old_state, previous, "transition {} out of order", seen);
            previous = p.new_state;
            seen += 1;
        }
        assert!(seen > 0);
        assert_eq!(previous, monitor.state(&x));
        assert_eq!(registry.get(&x).unwrap().health, previous);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_ignored() {
        let registry = Arc::new(AgentRegistry::new());
        let monitor = HealthMonitor::new(registry, policy(), EventEmitter::disabled());
        let ghost = AgentId::new("ghost");
        for _ in 0..5 {
            monitor.record_failure(&ghost, "gone");
        }
        assert_eq!(monitor.state(&ghost), HealthState::Healthy);
    }
}
