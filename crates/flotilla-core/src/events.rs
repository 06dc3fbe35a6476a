//! Outbound events consumed by the API, metrics, and dashboard layers.

use crate::agent::{HealthState, Transport};
use crate::ids::*;
use crate::ports::{EventBus, EventStream};
use crate::task::{TaskFailure, TaskStatus};
use crate::workflow::WorkflowStatus;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// All events emitted by the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskStateChanged(TaskStateChangedPayload),
    AgentRegistered(AgentRegisteredPayload),
    AgentDeregistered(AgentDeregisteredPayload),
    AgentHealthChanged(AgentHealthChangedPayload),
    PoolExhausted(PoolExhaustedPayload),
    ConnectionEvicted(ConnectionEvictedPayload),
    WorkflowCompleted(WorkflowCompletedPayload),
}

impl Event {
    /// Returns the subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::TaskStateChanged(p) => format!("task.{}.{}", p.task_id, p.new_status),
            Event::AgentRegistered(p) => format!("agent.{}.registered", p.agent_id),
            Event::AgentDeregistered(p) => format!("agent.{}.deregistered", p.agent_id),
            Event::AgentHealthChanged(p) => format!("agent.{}.health", p.agent_id),
            Event::PoolExhausted(p) => format!("pool.{}.exhausted", p.transport),
            Event::ConnectionEvicted(p) => format!("pool.{}.evicted", p.transport),
            Event::WorkflowCompleted(p) => format!("workflow.{}.{}", p.run_id, p.status),
        }
    }
}

// === Task Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskStateChangedPayload {
    pub task_id: TaskId,
    pub run_id: Option<RunId>,
    pub node_id: Option<NodeId>,
    pub agent_id: Option<AgentId>,
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub error: Option<TaskFailure>,
    pub timestamp: DateTime<Utc>,
}

// === Agent Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentRegisteredPayload {
    pub agent_id: AgentId,
    pub transport: Transport,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentDeregisteredPayload {
    pub agent_id: AgentId,
    /// Tasks failed with "agent removed" by a forced deregistration.
    pub failed_tasks: Vec<TaskId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentHealthChangedPayload {
    pub agent_id: AgentId,
    pub old_state: HealthState,
    pub new_state: HealthState,
    pub consecutive_failures: u32,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// === Pool Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolExhaustedPayload {
    pub transport: Transport,
    pub endpoint: String,
    pub max_per_key: usize,
    /// Whether the caller fell back to an unpooled connection.
    pub opened_transient: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Expired,
    Broken,
    Errored,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionEvictedPayload {
    pub transport: Transport,
    pub endpoint: String,
    pub reason: EvictionReason,
    pub timestamp: DateTime<Utc>,
}

// === Workflow Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowCompletedPayload {
    pub run_id: RunId,
    pub name: String,
    pub status: WorkflowStatus,
    pub failed_nodes: Vec<NodeId>,
    pub skipped_nodes: Vec<NodeId>,
    pub cancelled_nodes: Vec<NodeId>,
    pub timestamp: DateTime<Utc>,
}

/// Synchronous, ordered event sink.
///
/// Events go into a single unbounded channel so that the lifecycle of one id
/// is observed in emission order. Emitting never blocks and never fails; a
/// disabled emitter drops everything.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventEmitter {
    /// Emitter plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emitter whose events are forwarded, in order, to an async event bus.
    pub fn forward_to(bus: Arc<dyn EventBus>) -> (Self, JoinHandle<()>) {
        let (emitter, mut rx) = Self::channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let subject = event.subject();
                if let Err(e) = bus.publish(event).await {
                    warn!(subject = %subject, error = %e, "Failed to publish event");
                }
            }
            debug!("Event forwarder stopped");
        });
        (emitter, handle)
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Match a subject against a NATS-style pattern (`*` one token, `>` the rest).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

/// In-process event bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let stream = futures::stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if subject_matches(&pattern, &event.subject()) => {
                        return Some((Ok(event), (rx, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let err = Error::EventBus(format!("subscriber lagged by {} events", skipped));
                        return Some((Err(err), (rx, pattern)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
