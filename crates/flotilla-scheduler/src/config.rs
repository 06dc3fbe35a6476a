//! Scheduler configuration.

use crate::health::HealthPolicy;
use crate::router::RouterConfig;
use flotilla_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(flatten)]
    pub router: RouterConfig,
    #[serde(default)]
    pub health: HealthPolicy,
    /// How often the wait queue is re-examined when nothing else wakes it.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
}

fn default_queue_poll_interval_ms() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            health: HealthPolicy::default(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_health(mut self, health: HealthPolicy) -> Self {
        self.health = health;
        self
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        let h = &self.health;
        if h.degrade_after == 0 || h.unhealthy_after == 0 || h.recover_after == 0 {
            return Err(Error::Config(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if h.probe_interval_ms == 0 || h.probe_timeout_ms == 0 {
            return Err(Error::Config(
                "probe interval and timeout must be positive".to_string(),
            ));
        }
        if self.queue_poll_interval_ms == 0 {
            return Err(Error::Config(
                "queue_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::FallbackPolicy;

    #[test]
    fn test_yaml_defaults() {
        let config: SchedulerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.queue_poll_interval_ms, 500);
        assert_eq!(config.health.degrade_after, 2);
        assert!((config.router.degraded_multiplier - 0.5).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_routing_rules() {
        let yaml = r#"
degraded_multiplier: 0.4
rules:
  code_generation:
    preferred: [gpu-large]
    fallback: [gpu-small]
    fallback_policy:
      kind: wait_for_preferred
      max_wait_ms: 2000
health:
  recover_after: 3
"#;
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();
        let rule = config.router.rule_for("code_generation");
        assert_eq!(rule.preferred.len(), 1);
        assert_eq!(
            rule.fallback_policy,
            FallbackPolicy::WaitForPreferred { max_wait_ms: 2000 }
        );
        assert_eq!(config.health.recover_after, 3);
        assert_eq!(config.router.rule_for("testing").fallback_policy, FallbackPolicy::Immediate);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SchedulerConfig::default();
        config.router.unhealthy_multiplier = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SchedulerConfig::default();
        config.health.recover_after = 0;
        assert!(config.validate().is_err());
    }
}
