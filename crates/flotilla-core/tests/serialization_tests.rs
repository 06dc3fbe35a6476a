//! Serialization tests for flotilla-core types.

use chrono::Utc;
use flotilla_core::agent::*;
use flotilla_core::events::*;
use flotilla_core::ids::*;
use flotilla_core::task::*;
use flotilla_core::workflow::*;
use pretty_assertions::assert_eq;

#[test]
fn test_agent_descriptors_from_yaml() {
    let yaml = r#"
- id: codegen-a100
  transport: http_model
  endpoint: http://10.0.0.12:8000/v1/generate
  capabilities: [code_generation]
  max_concurrent: 4
  priority_weight: 2.0
  labels:
    gpu_memory_gb: "80"
- id: test-runner-1
  transport: remote_shell
  endpoint:
    host: build-01.internal
    user: ci
  capabilities: [testing, linting]
"#;

    let agents: Vec<AgentDescriptor> = serde_yaml::from_str(yaml).expect("parse");
    assert_eq!(agents.len(), 2);

    let http = &agents[0];
    assert_eq!(http.transport, Transport::HttpModel);
    assert_eq!(
        http.endpoint,
        Endpoint::Url("http://10.0.0.12:8000/v1/generate".to_string())
    );
    assert_eq!(http.labels.get("gpu_memory_gb").map(String::as_str), Some("80"));
    assert!(http.validate().is_ok());

    let shell = &agents[1];
    assert_eq!(
        shell.endpoint,
        Endpoint::Shell {
            host: "build-01.internal".to_string(),
            user: "ci".to_string(),
            port: 22,
        }
    );
    assert_eq!(shell.max_concurrent, 1);
    assert!(shell.has_capability("linting"));
    assert!(shell.validate().is_ok());
}

#[test]
fn test_task_state_event_is_type_tagged() {
    let event = Event::TaskStateChanged(TaskStateChangedPayload {
        task_id: TaskId::new(),
        run_id: None,
        node_id: None,
        agent_id: Some(AgentId::new("test-runner-1")),
        old_status: Some(TaskStatus::Running),
        new_status: TaskStatus::Failed,
        error: Some(TaskFailure {
            kind: FailureKind::Timeout,
            attempt: Some(2),
            message: "Attempt 2 timed out after 500ms".to_string(),
        }),
        timestamp: Utc::now(),
    });

    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json["type"], "task_state_changed");
    assert_eq!(json["new_status"], "failed");
    assert_eq!(json["error"]["kind"], "timeout");
    assert_eq!(json["error"]["attempt"], 2);

    let parsed: Event = serde_json::from_value(json).expect("deserialize");
    assert_eq!(parsed.subject(), event.subject());
}

#[test]
fn test_workflow_spec_from_yaml() {
    let yaml = r#"
name: release
nodes:
  - id: build
    capability: testing
    payload: "cargo build --release"
  - id: unit
    capability: testing
    depends_on: [build]
    payload: { command: "cargo test" }
    timeout_ms: 60000
  - id: notes
    capability: code_generation
    depends_on: [build]
    priority: -1
    on_saturation: queue
"#;

    let spec: WorkflowSpec = serde_yaml::from_str(yaml).expect("parse");
    assert_eq!(spec.name, "release");
    assert_eq!(spec.nodes.len(), 3);
    assert_eq!(spec.nodes[1].depends_on, vec![NodeId::new("build")]);
    assert_eq!(spec.nodes[1].task.timeout_ms, 60_000);
    assert_eq!(spec.nodes[2].task.priority, -1);
    assert_eq!(spec.nodes[2].task.on_saturation, SaturationPolicy::Queue);
    assert_eq!(spec.nodes[0].task.on_saturation, SaturationPolicy::Reject);
}

#[test]
fn test_remote_status_serialization() {
    let output = ExecutionOutput {
        output: "ok".to_string(),
        status: RemoteStatus::Http(200),
        duration_ms: 12,
        attempts: 1,
    };
    let json = serde_json::to_value(&output).expect("serialize");
    assert_eq!(json["status"]["kind"], "http");
    assert_eq!(json["status"]["code"], 200);
}
