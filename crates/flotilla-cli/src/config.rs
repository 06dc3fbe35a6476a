//! Flotilla configuration file.

use anyhow::{Context, bail};
use flotilla_core::agent::AgentDescriptor;
use flotilla_nats::NatsConfig;
use flotilla_runner::ExecutionConfig;
use flotilla_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Everything needed to run an orchestrator, loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlotillaConfig {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// `pool`, `retry`, `http` and `shell` sections.
    #[serde(flatten)]
    pub execution: ExecutionConfig,
    /// Publish events to NATS when set; otherwise they are logged.
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

impl FlotillaConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.clone()) {
                bail!("duplicate agent id: {}", agent.id);
            }
            agent.validate()?;
        }

        self.scheduler.validate()?;

        let pool = &self.execution.pool;
        if pool.max_per_key == 0 {
            bail!("pool.max_per_key must be at least 1");
        }
        if pool.persist_timeout_ms == 0 {
            bail!("pool.persist_timeout_ms must be positive");
        }

        if let Some(nats) = &self.nats
            && nats.urls.is_empty()
        {
            bail!("nats.urls must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::agent::{Endpoint, Transport};
    use flotilla_runner::{Backoff, ExhaustionPolicy};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
agents:
  - id: model-large
    transport: http_model
    endpoint: "http://10.0.0.5:8000/v1/run"
    capabilities: [code_generation, review]
    max_concurrent: 4
    priority_weight: 2.0
    labels:
      gpu_memory_gb: "80"
  - id: build-01
    transport: remote_shell
    endpoint:
      host: build-01.internal
      user: ci
    capabilities: [testing]

scheduler:
  degraded_multiplier: 0.3
  rules:
    code_generation:
      preferred: [model-large]
  health:
    probe_interval_ms: 5000

pool:
  max_per_key: 2
  exhaustion_policy: block

retry:
  backoff:
    kind: fixed
    delay_ms: 250

nats:
  urls: ["nats://localhost:4222"]
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample() {
        let file = write_config(SAMPLE);
        let config = FlotillaConfig::load(file.path()).unwrap();

        assert_eq!(config.agents.len(), 2);
        let shell = &config.agents[1];
        assert_eq!(shell.transport, Transport::RemoteShell);
        assert_eq!(
            shell.endpoint,
            Endpoint::Shell {
                host: "build-01.internal".to_string(),
                user: "ci".to_string(),
                port: 22,
            }
        );
        assert_eq!(shell.max_concurrent, 1);

        assert_eq!(config.scheduler.health.probe_interval_ms, 5000);
        assert_eq!(config.execution.pool.max_per_key, 2);
        assert_eq!(config.execution.pool.exhaustion_policy, ExhaustionPolicy::Block);
        assert_eq!(config.execution.retry.backoff, Backoff::Fixed { delay_ms: 250 });
        assert_eq!(config.nats.unwrap().subject_prefix, "flotilla");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("{}");
        let config = FlotillaConfig::load(file.path()).unwrap();
        assert!(config.agents.is_empty());
        assert!(config.nats.is_none());
        assert_eq!(
            config.execution.pool.exhaustion_policy,
            ExhaustionPolicy::OpenTransient
        );
    }

    #[test]
    fn test_duplicate_agents_rejected() {
        let file = write_config(
            r#"
agents:
  - { id: a, transport: http_model, endpoint: "http://a" }
  - { id: a, transport: http_model, endpoint: "http://b" }
"#,
        );
        let err = FlotillaConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate agent id"));
    }

    #[test]
    fn test_transport_mismatch_rejected() {
        let file = write_config(
            r#"
agents:
  - { id: a, transport: remote_shell, endpoint: "http://a" }
"#,
        );
        assert!(FlotillaConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_bad_multiplier_rejected() {
        let file = write_config("scheduler:\n  unhealthy_multiplier: 0\n");
        assert!(FlotillaConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = FlotillaConfig::load(Path::new("/nonexistent/flotilla.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
