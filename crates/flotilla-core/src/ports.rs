//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and the
//! transports and event sinks plugged into it.

use crate::Result;
use crate::agent::AgentDescriptor;
use crate::events::Event;
use crate::ids::TaskId;
use crate::task::{ExecutionOutput, TaskSpec};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio::sync::{oneshot, watch};

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `task.*.failed`, `agent.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Per-dispatch signals shared between the orchestrator and a transport.
#[derive(Debug)]
pub struct DispatchContext {
    pub task_id: TaskId,
    /// Flips to `true` when the task is cancelled.
    pub cancel: watch::Receiver<bool>,
    /// Fired once, with the attempt number, when the remote side accepted work.
    pub started: Option<oneshot::Sender<u32>>,
}

impl DispatchContext {
    pub fn new(task_id: TaskId, cancel: watch::Receiver<bool>) -> Self {
        Self {
            task_id,
            cancel,
            started: None,
        }
    }

    pub fn with_started(mut self, started: oneshot::Sender<u32>) -> Self {
        self.started = Some(started);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Report that the remote side started the given attempt.
    pub fn mark_started(&mut self, attempt: u32) {
        if let Some(tx) = self.started.take() {
            let _ = tx.send(attempt);
        }
    }
}

/// Executes a task on a chosen agent, retrying transient failures internally.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        agent: &AgentDescriptor,
        task: &TaskSpec,
        ctx: DispatchContext,
    ) -> Result<ExecutionOutput>;

    /// Release any transport state held for an agent that left the registry.
    async fn forget_agent(&self, _agent: &AgentDescriptor) {}
}

/// Liveness probe for an agent, independent of task traffic.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, agent: &AgentDescriptor) -> Result<()>;
}
