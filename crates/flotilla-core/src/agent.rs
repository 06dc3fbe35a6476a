//! Agent types.

use crate::ids::AgentId;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// How the orchestrator reaches an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    HttpModel,
    RemoteShell,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::HttpModel => write!(f, "http_model"),
            Transport::RemoteShell => write!(f, "remote_shell"),
        }
    }
}

/// Network address of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Endpoint {
    Url(String),
    Shell {
        host: String,
        user: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
    },
}

fn default_ssh_port() -> u16 {
    22
}

impl Endpoint {
    /// Whether this endpoint shape can be used with the given transport.
    pub fn matches(&self, transport: Transport) -> bool {
        matches!(
            (self, transport),
            (Endpoint::Url(_), Transport::HttpModel)
                | (Endpoint::Shell { .. }, Transport::RemoteShell)
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Url(url) => write!(f, "{}", url),
            Endpoint::Shell { host, user, port } => write!(f, "{}@{}:{}", user, host, port),
        }
    }
}

/// Static description of an agent, as supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub transport: Transport,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_priority_weight")]
    pub priority_weight: f64,
    /// Free-form resource hints matched by hard routing constraints.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_priority_weight() -> f64 {
    1.0
}

impl AgentDescriptor {
    pub fn new(id: impl Into<AgentId>, transport: Transport, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            transport,
            endpoint,
            capabilities: BTreeSet::new(),
            max_concurrent: default_max_concurrent(),
            priority_weight: default_priority_weight(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_priority_weight(mut self, weight: f64) -> Self {
        self.priority_weight = weight;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Check the descriptor invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(Error::InvalidDescriptor("agent id is empty".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "{}: max_concurrent must be at least 1",
                self.id
            )));
        }
        if !(self.priority_weight.is_finite() && self.priority_weight > 0.0) {
            return Err(Error::InvalidDescriptor(format!(
                "{}: priority_weight must be positive, got {}",
                self.id, self.priority_weight
            )));
        }
        if !self.endpoint.matches(self.transport) {
            return Err(Error::InvalidDescriptor(format!(
                "{}: endpoint {} does not fit transport {}",
                self.id, self.endpoint, self.transport
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time view of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub descriptor: AgentDescriptor,
    pub current_load: u32,
    pub health: HealthState,
}

impl AgentSnapshot {
    pub fn id(&self) -> &AgentId {
        &self.descriptor.id
    }

    pub fn spare_slots(&self) -> u32 {
        self.descriptor.max_concurrent.saturating_sub(self.current_load)
    }

    /// Fraction of capacity still free, in [0, 1].
    pub fn free_ratio(&self) -> f64 {
        1.0 - f64::from(self.current_load) / f64::from(self.descriptor.max_concurrent.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_agent() -> AgentDescriptor {
        AgentDescriptor::new(
            "model-1",
            Transport::HttpModel,
            Endpoint::Url("http://localhost:9000".to_string()),
        )
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(http_agent().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let agent = http_agent().with_max_concurrent(0);
        assert!(matches!(agent.validate(), Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn test_validate_rejects_bad_weight() {
        assert!(http_agent().with_priority_weight(0.0).validate().is_err());
        assert!(http_agent().with_priority_weight(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_transport_mismatch() {
        let agent = AgentDescriptor::new(
            "shell-1",
            Transport::HttpModel,
            Endpoint::Shell {
                host: "build-01".to_string(),
                user: "ci".to_string(),
                port: 22,
            },
        );
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_free_ratio() {
        let snapshot = AgentSnapshot {
            descriptor: http_agent().with_max_concurrent(4),
            current_load: 1,
            health: HealthState::Healthy,
        };
        assert!((snapshot.free_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(snapshot.spare_slots(), 3);
    }
}
