//! Command handlers.

use crate::bus::LoggingEventBus;
use crate::commands::OutputFormat;
use crate::config::FlotillaConfig;
use anyhow::{Context, bail};
use console::style;
use flotilla_core::events::{Event, EventEmitter};
use flotilla_core::ports::{EventBus, Prober};
use flotilla_core::task::{TaskSnapshot, TaskSpec, TaskStatus};
use flotilla_core::workflow::{WorkflowReport, WorkflowSpec, WorkflowStatus};
use flotilla_nats::NatsEventBus;
use flotilla_runner::ExecutionLayer;
use flotilla_scheduler::Orchestrator;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Arguments of the `task` command.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub capability: String,
    pub payload: String,
    pub priority: i32,
    pub timeout_secs: u64,
    pub retries: u32,
    pub queue: bool,
}

impl TaskRequest {
    pub fn to_spec(&self) -> TaskSpec {
        let payload = serde_json::from_str(&self.payload)
            .unwrap_or_else(|_| Value::String(self.payload.clone()));
        let spec = TaskSpec::new(&self.capability, payload)
            .with_priority(self.priority)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_max_retries(self.retries);
        if self.queue { spec.queued() } else { spec }
    }
}

/// A running orchestrator with its execution layer and event forwarding.
struct Runtime {
    orchestrator: Orchestrator,
    layer: Arc<ExecutionLayer>,
    nats: Option<NatsEventBus>,
    forwarder: JoinHandle<()>,
}

impl Runtime {
    async fn boot(config: &FlotillaConfig) -> anyhow::Result<Self> {
        let nats = match &config.nats {
            Some(nats) => Some(
                NatsEventBus::connect_with_config(nats.clone())
                    .await
                    .context("Failed to connect to NATS")?,
            ),
            None => None,
        };
        let bus: Arc<dyn EventBus> = match &nats {
            Some(nats) => Arc::new(nats.clone()),
            None => Arc::new(LoggingEventBus::new()),
        };
        let (events, forwarder) = EventEmitter::forward_to(bus);

        let layer = Arc::new(ExecutionLayer::new(config.execution.clone(), events.clone()));
        let orchestrator = Orchestrator::new(
            config.scheduler.clone(),
            layer.clone(),
            layer.clone(),
            events,
        )?;
        for agent in &config.agents {
            orchestrator
                .register_agent(agent.clone())
                .with_context(|| format!("Failed to register agent {}", agent.id))?;
        }
        orchestrator.start();

        Ok(Self {
            orchestrator,
            layer,
            nats,
            forwarder,
        })
    }

    async fn stop(self) {
        self.orchestrator.shutdown().await;
        self.layer.shutdown().await;
        drop(self.orchestrator);
        drop(self.layer);

        // The forwarder ends once every emitter is gone.
        if tokio::time::timeout(Duration::from_secs(2), self.forwarder)
            .await
            .is_err()
        {
            warn!("Event forwarder did not drain in time");
        }
        if let Some(nats) = self.nats {
            let _ = nats.shutdown().await;
        }
    }
}

/// Validate a configuration file.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let config = FlotillaConfig::load(path)?;

    println!(
        "{} Configuration {} is valid",
        style("✓").green(),
        style(path.display()).bold()
    );
    println!("  Agents: {}", config.agents.len());
    for agent in &config.agents {
        println!(
            "    - {} ({}, {} slots)",
            agent.id, agent.transport, agent.max_concurrent
        );
    }
    println!("  Routing rules: {}", config.scheduler.router.rules.len());
    match &config.nats {
        Some(nats) => println!("  Events: NATS {}", nats.urls.join(",")),
        None => println!("  Events: log"),
    }
    Ok(())
}

/// List agents, optionally probing each once.
pub async fn agents(path: &Path, probe: bool, output: OutputFormat) -> anyhow::Result<()> {
    let config = FlotillaConfig::load(path)?;

    let mut probes: Vec<Option<Result<(), String>>> = vec![None; config.agents.len()];
    if probe {
        let layer = ExecutionLayer::new(config.execution.clone(), EventEmitter::disabled());
        let timeout = config.scheduler.health.probe_timeout();
        for (slot, agent) in probes.iter_mut().zip(&config.agents) {
            let result = match tokio::time::timeout(timeout, layer.probe(agent)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };
            *slot = Some(result);
        }
        layer.shutdown().await;
    }

    match output {
        OutputFormat::Json => {
            let rows: Vec<Value> = config
                .agents
                .iter()
                .zip(&probes)
                .map(|(agent, probe)| {
                    let probe = probe.as_ref().map(|result| match result {
                        Ok(()) => json!({ "ok": true }),
                        Err(e) => json!({ "ok": false, "error": e }),
                    });
                    json!({
                        "id": agent.id,
                        "transport": agent.transport,
                        "endpoint": agent.endpoint,
                        "capabilities": agent.capabilities,
                        "max_concurrent": agent.max_concurrent,
                        "priority_weight": agent.priority_weight,
                        "probe": probe,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            if config.agents.is_empty() {
                println!("{} No agents configured", style("i").blue());
            }
            for (agent, probe) in config.agents.iter().zip(&probes) {
                let marker = match probe {
                    None => style("-").dim(),
                    Some(Ok(())) => style("✓").green(),
                    Some(Err(_)) => style("✗").red(),
                };
                let capabilities: Vec<&str> =
                    agent.capabilities.iter().map(String::as_str).collect();
                println!(
                    "{} {} {} {} [{}] slots={} weight={}",
                    marker,
                    style(&agent.id).bold(),
                    agent.transport,
                    agent.endpoint,
                    capabilities.join(", "),
                    agent.max_concurrent,
                    agent.priority_weight
                );
                if let Some(Err(e)) = probe {
                    println!("    {}", style(e).red());
                }
            }
        }
    }
    Ok(())
}

/// Run the orchestrator until Ctrl+C.
pub async fn serve(path: &Path) -> anyhow::Result<()> {
    let config = FlotillaConfig::load(path)?;
    let runtime = Runtime::boot(&config).await?;
    info!(agents = config.agents.len(), "Flotilla is serving; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    runtime.stop().await;
    Ok(())
}

/// Submit one task and wait for its outcome.
pub async fn run_task(path: &Path, request: TaskRequest, output: OutputFormat) -> anyhow::Result<()> {
    let config = FlotillaConfig::load(path)?;
    let runtime = Runtime::boot(&config).await?;

    let outcome: flotilla_core::Result<TaskSnapshot> = async {
        let id = runtime.orchestrator.submit_task(request.to_spec())?;
        runtime.orchestrator.wait_for_task(id).await
    }
    .await;
    runtime.stop().await;

    let snapshot = outcome?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Table => print!("{}", render_task(&snapshot)),
    }
    if snapshot.status != TaskStatus::Completed {
        bail!("task {} ended {}", snapshot.id, snapshot.status);
    }
    Ok(())
}

/// Run a workflow file and wait for the run to settle.
pub async fn run_workflow(path: &Path, workflow: &Path, output: OutputFormat) -> anyhow::Result<()> {
    let config = FlotillaConfig::load(path)?;
    let content = std::fs::read_to_string(workflow)
        .with_context(|| format!("Failed to read {}", workflow.display()))?;
    let spec: WorkflowSpec = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", workflow.display()))?;

    let runtime = Runtime::boot(&config).await?;
    let outcome: flotilla_core::Result<WorkflowReport> = async {
        let run_id = runtime.orchestrator.submit_workflow(spec)?;
        runtime.orchestrator.wait_for_workflow(run_id).await
    }
    .await;
    runtime.stop().await;

    let report = outcome?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print!("{}", render_report(&report)),
    }
    if report.status != WorkflowStatus::Completed {
        bail!("workflow {} ended {}", report.name, report.status);
    }
    Ok(())
}

/// Print the JSON schema of the event enum.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(Event);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn status_marker(status: TaskStatus) -> console::StyledObject<&'static str> {
    match status {
        TaskStatus::Completed => style("✓").green(),
        TaskStatus::Failed => style("✗").red(),
        TaskStatus::Cancelled => style("○").yellow(),
        _ => style("…").dim(),
    }
}

fn render_task(snapshot: &TaskSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} {}",
        status_marker(snapshot.status),
        style(snapshot.id).bold(),
        snapshot.status
    );
    if let Some(agent) = &snapshot.agent {
        let _ = writeln!(out, "  agent: {}", agent);
    }
    if let Some(output) = &snapshot.output {
        let _ = writeln!(
            out,
            "  {} after {} attempt(s), {}ms",
            output.status, output.attempts, output.duration_ms
        );
        if !output.output.is_empty() {
            let _ = writeln!(out, "{}", output.output.trim_end());
        }
    }
    if let Some(failure) = &snapshot.failure {
        let _ = writeln!(out, "  error: {}", style(&failure.message).red());
    }
    out
}

fn render_report(report: &WorkflowReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Workflow {} ({}): {}",
        style(&report.name).bold(),
        report.run_id,
        report.status
    );
    for (node, entry) in &report.nodes {
        let _ = write!(out, "  {} {} {}", status_marker(entry.status), node, entry.status);
        if report.skipped_nodes.contains(node) {
            let _ = write!(out, " (skipped)");
        }
        if let Some(failure) = &entry.failure
            && !report.skipped_nodes.contains(node)
        {
            let _ = write!(out, ": {}", failure.message);
        }
        let _ = writeln!(out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::ids::{NodeId, RunId};
    use flotilla_core::task::TaskFailure;
    use flotilla_core::workflow::NodeReport;
    use pretty_assertions::assert_eq;

    fn request(payload: &str) -> TaskRequest {
        TaskRequest {
            capability: "testing".to_string(),
            payload: payload.to_string(),
            priority: -1,
            timeout_secs: 30,
            retries: 2,
            queue: true,
        }
    }

    #[test]
    fn test_plain_payload_becomes_string() {
        let spec = request("cargo test --workspace").to_spec();
        assert_eq!(spec.payload, json!("cargo test --workspace"));
        assert_eq!(spec.priority, -1);
        assert_eq!(spec.timeout(), Duration::from_secs(30));
        assert_eq!(spec.max_retries, 2);
        assert_eq!(spec.on_saturation, flotilla_core::task::SaturationPolicy::Queue);
    }

    #[test]
    fn test_json_payload_is_parsed() {
        let spec = request(r#"{"command": "make check"}"#).to_spec();
        assert_eq!(spec.payload["command"], "make check");
    }

    #[test]
    fn test_report_marks_skipped_nodes() {
        let node = |status, failure| NodeReport {
            status,
            task_id: None,
            failure,
        };
        let report = WorkflowReport {
            run_id: RunId::new(),
            name: "release".to_string(),
            status: WorkflowStatus::Failed,
            nodes: [
                (
                    NodeId::new("build"),
                    node(
                        TaskStatus::Failed,
                        Some(TaskFailure::new(
                            flotilla_core::task::FailureKind::RemoteFailure,
                            "agent reported exit code 2",
                        )),
                    ),
                ),
                (
                    NodeId::new("deploy"),
                    node(TaskStatus::Failed, Some(TaskFailure::upstream_failed())),
                ),
            ]
            .into_iter()
            .collect(),
            failed_nodes: vec![NodeId::new("build")],
            skipped_nodes: vec![NodeId::new("deploy")],
            cancelled_nodes: vec![],
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
        };

        let rendered = render_report(&report);
        assert!(rendered.contains("exit code 2"));
        assert!(rendered.contains("deploy failed (skipped)"));
        assert!(!rendered.contains("upstream dependency failed"));
    }
}
