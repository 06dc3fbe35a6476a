//! Transport-neutral connection traits.

use async_trait::async_trait;
use flotilla_core::agent::{AgentDescriptor, Endpoint, Transport};
use flotilla_core::ids::TaskId;
use flotilla_core::task::{RemoteStatus, TaskSpec};
use std::fmt;
use thiserror::Error;

/// Identifies a group of interchangeable connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub transport: Transport,
    pub endpoint: Endpoint,
}

impl PoolKey {
    pub fn new(transport: Transport, endpoint: Endpoint) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    pub fn for_agent(agent: &AgentDescriptor) -> Self {
        Self::new(agent.transport, agent.endpoint.clone())
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.endpoint)
    }
}

/// A failure that leaves the connection untrustworthy.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportFailure {
    pub message: String,
}

impl TransportFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What the remote side answered.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReply {
    pub output: String,
    pub status: RemoteStatus,
}

/// An open session to one agent.
#[async_trait]
pub trait Connection: Send {
    /// Run one task to completion over this connection.
    async fn execute(
        &mut self,
        task_id: TaskId,
        task: &TaskSpec,
    ) -> Result<RemoteReply, TransportFailure>;

    /// Cheap liveness check.
    async fn probe(&mut self) -> Result<(), TransportFailure>;

    /// Whether the session is known to be unusable.
    fn is_broken(&mut self) -> bool;

    /// Tear the session down.
    async fn close(self: Box<Self>);
}

/// Opens new connections for a pool key.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, key: &PoolKey) -> Result<Box<dyn Connection>, TransportFailure>;
}
