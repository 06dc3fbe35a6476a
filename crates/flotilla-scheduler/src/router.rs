//! Capacity- and health-aware task routing.

use crate::registry::{AgentRegistry, Reservation};
use flotilla_core::agent::{AgentSnapshot, HealthState};
use flotilla_core::ids::{AgentId, TaskId};
use flotilla_core::task::TaskSpec;
use flotilla_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// When a queued task may leave its preferred agents for the fallback list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Fall back as soon as every preferred agent is saturated.
    #[default]
    Immediate,
    /// Keep waiting for a preferred agent, then fall back.
    WaitForPreferred { max_wait_ms: u64 },
}

/// Routing rule for one capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Agents tried first. Empty means every capable agent is preferred.
    #[serde(default)]
    pub preferred: Vec<AgentId>,
    /// Agents tried once preferred ones are saturated. Empty means every
    /// capable agent outside `preferred`.
    #[serde(default)]
    pub fallback: Vec<AgentId>,
    #[serde(default)]
    pub min_spare_slots: u32,
    /// Permit unhealthy agents as a last resort.
    #[serde(default)]
    pub allow_unhealthy_fallback: bool,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_degraded_multiplier")]
    pub degraded_multiplier: f64,
    #[serde(default = "default_unhealthy_multiplier")]
    pub unhealthy_multiplier: f64,
    /// Rule applied to capabilities without their own entry in `rules`.
    #[serde(default)]
    pub default_rule: RoutingRule,
    #[serde(default)]
    pub rules: BTreeMap<String, RoutingRule>,
}

fn default_degraded_multiplier() -> f64 {
    0.5
}

fn default_unhealthy_multiplier() -> f64 {
    0.1
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            degraded_multiplier: default_degraded_multiplier(),
            unhealthy_multiplier: default_unhealthy_multiplier(),
            default_rule: RoutingRule::default(),
            rules: BTreeMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn rule_for(&self, capability: &str) -> &RoutingRule {
        self.rules.get(capability).unwrap_or(&self.default_rule)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("degraded_multiplier", self.degraded_multiplier),
            ("unhealthy_multiplier", self.unhealthy_multiplier),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Picks the agent for a task and reserves a slot on it.
pub struct Router {
    registry: Arc<AgentRegistry>,
    config: RouterConfig,
}

impl Router {
    pub fn new(registry: Arc<AgentRegistry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// How long a queued task waits for a preferred agent, if the rule says so.
    pub fn preferred_wait(&self, capability: &str) -> Option<Duration> {
        match self.config.rule_for(capability).fallback_policy {
            FallbackPolicy::Immediate => None,
            FallbackPolicy::WaitForPreferred { max_wait_ms } => {
                Some(Duration::from_millis(max_wait_ms))
            }
        }
    }

    fn score(&self, agent: &AgentSnapshot) -> f64 {
        let multiplier = match agent.health {
            HealthState::Healthy => 1.0,
            HealthState::Degraded => self.config.degraded_multiplier,
            HealthState::Unhealthy => self.config.unhealthy_multiplier,
        };
        agent.descriptor.priority_weight * agent.free_ratio() * multiplier
    }

    fn by_score(&self, a: &AgentSnapshot, b: &AgentSnapshot) -> Ordering {
        self.score(b)
            .total_cmp(&self.score(a))
            .then_with(|| a.current_load.cmp(&b.current_load))
            .then_with(|| a.id().cmp(b.id()))
    }

    /// Rank capable agents for `task`, best first.
    ///
    /// Tiers are preferred agents, then fallback agents (when
    /// `include_fallback` or the rule falls back immediately), then unhealthy
    /// agents when the rule allows it. Only agents with enough spare slots are
    /// ranked. Pure with respect to `candidates`.
    pub fn rank(
        &self,
        task: &TaskSpec,
        candidates: &[AgentSnapshot],
        include_fallback: bool,
    ) -> Result<Vec<AgentId>> {
        let capability = &task.capability;
        if candidates.is_empty() {
            return Err(Error::NoCapableAgent {
                capability: capability.clone(),
                reason: "no registered agent has this capability".to_string(),
            });
        }

        let rule = self.config.rule_for(capability);
        if !rule.allow_unhealthy_fallback
            && candidates.iter().all(|c| c.health == HealthState::Unhealthy)
        {
            return Err(Error::NoCapableAgent {
                capability: capability.clone(),
                reason: "all capable agents are unhealthy".to_string(),
            });
        }

        let min_spare = rule
            .min_spare_slots
            .max(task.constraints.min_spare_slots)
            .max(1);
        let is_preferred =
            |c: &AgentSnapshot| rule.preferred.is_empty() || rule.preferred.contains(c.id());
        let is_fallback = |c: &AgentSnapshot| {
            !rule.preferred.is_empty()
                && !rule.preferred.contains(c.id())
                && (rule.fallback.is_empty() || rule.fallback.contains(c.id()))
        };
        let fallback_open =
            include_fallback || rule.fallback_policy == FallbackPolicy::Immediate;

        let tier = |in_tier: &dyn Fn(&AgentSnapshot) -> bool, healthy: bool| {
            let mut tier: Vec<&AgentSnapshot> = candidates
                .iter()
                .filter(|&c| in_tier(c))
                .filter(|c| (c.health != HealthState::Unhealthy) == healthy)
                .filter(|c| c.spare_slots() >= min_spare)
                .collect();
            tier.sort_by(|a, b| self.by_score(a, b));
            tier
        };

        let mut ranked = tier(&is_preferred, true);
        if fallback_open {
            ranked.extend(tier(&is_fallback, true));
        }
        if rule.allow_unhealthy_fallback {
            let permitted = |c: &AgentSnapshot| is_preferred(c) || (fallback_open && is_fallback(c));
            ranked.extend(tier(&permitted, false));
        }

        if ranked.is_empty() {
            return Err(Error::NoCapacity {
                capability: capability.clone(),
            });
        }
        Ok(ranked.into_iter().map(|c| c.id().clone()).collect())
    }

    /// Choose and reserve an agent for `task` atomically.
    pub fn route(&self, task_id: TaskId, task: &TaskSpec, include_fallback: bool) -> Result<Reservation> {
        let reservation = self.registry.reserve_with(
            &task.capability,
            &task.constraints,
            task_id,
            |candidates| {
                self.rank(task, candidates, include_fallback)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::NoCapacity {
                        capability: task.capability.clone(),
                    })
            },
        )?;
        debug!(
            task_id = %task_id,
            agent_id = %reservation.agent.id,
            capability = %task.capability,
            "Routed task"
        );
        Ok(reservation)
    }

    pub fn release(&self, reservation: &Reservation) -> bool {
        self.registry.release(reservation)
    }
}
