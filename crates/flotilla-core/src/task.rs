//! Task types and status transitions.

use crate::error::Error;
use crate::ids::{AgentId, NodeId, RunId, TaskId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// What to do when every capable agent is saturated at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Surface `NoCapacity` to the caller immediately.
    #[default]
    Reject,
    /// Hold the task in the wait-for-capacity queue.
    Queue,
}

/// Hard constraints a candidate agent must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Constraints {
    /// Minimum free slots an agent must have. Zero is treated as one.
    #[serde(default)]
    pub min_spare_slots: u32,
    /// Labels that must be present with exactly these values.
    #[serde(default)]
    pub required_labels: BTreeMap<String, String>,
    /// Restrict candidates to these agents when set.
    #[serde(default)]
    pub allowed_agents: Option<BTreeSet<AgentId>>,
}

/// Specification of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    pub capability: String,
    /// Lower values are more urgent.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum number of execution attempts per dispatch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_saturation: SaturationPolicy,
    #[serde(default)]
    pub constraints: Constraints,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

impl TaskSpec {
    pub fn new(capability: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            capability: capability.into(),
            priority: 0,
            payload,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            on_saturation: SaturationPolicy::default(),
            constraints: Constraints::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn queued(mut self) -> Self {
        self.on_saturation = SaturationPolicy::Queue;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Attempt budget, never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Dispatched) | (Dispatched, Running) => true,
            (Running, Completed) => true,
            // Routing and transport failures can end a task before it runs.
            (Pending | Dispatched | Running, Failed) => true,
            (Pending | Dispatched | Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoCapableAgent,
    NoCapacity,
    Transport,
    Timeout,
    RemoteFailure,
    InvalidPayload,
    AgentRemoved,
    UpstreamFailed,
    Internal,
}

/// The most specific terminal error recorded for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskFailure {
    pub kind: FailureKind,
    /// Attempt that failed, when the failure came from execution.
    pub attempt: Option<u32>,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            attempt: None,
            message: message.into(),
        }
    }

    pub fn agent_removed() -> Self {
        Self::new(FailureKind::AgentRemoved, "agent removed")
    }

    pub fn upstream_failed() -> Self {
        Self::new(FailureKind::UpstreamFailed, "upstream dependency failed")
    }
}

impl From<&Error> for TaskFailure {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::NoCapableAgent { .. } => FailureKind::NoCapableAgent,
            Error::NoCapacity { .. } => FailureKind::NoCapacity,
            Error::Transport { .. } => FailureKind::Transport,
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::InvalidPayload(_) => FailureKind::InvalidPayload,
            _ => FailureKind::Internal,
        };
        Self {
            kind,
            attempt: err.attempt(),
            message: err.to_string(),
        }
    }
}

/// Status reported by the remote side of a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum RemoteStatus {
    Exit(i32),
    Http(u16),
}

impl RemoteStatus {
    pub fn is_success(&self) -> bool {
        match self {
            RemoteStatus::Exit(code) => *code == 0,
            RemoteStatus::Http(status) => (200..300).contains(status),
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteStatus::Exit(code) => write!(f, "exit code {}", code),
            RemoteStatus::Http(status) => write!(f, "HTTP {}", status),
        }
    }
}

/// Result of one successful exchange with an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionOutput {
    /// Stdout for shell agents, response body for HTTP agents.
    pub output: String,
    pub status: RemoteStatus,
    pub duration_ms: u64,
    /// Attempt number that produced this output, starting at one.
    pub attempts: u32,
}

/// Status snapshot of a task as seen by callers of `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub agent: Option<AgentId>,
    pub run: Option<(RunId, NodeId)>,
    pub output: Option<ExecutionOutput>,
    pub failure: Option<TaskFailure>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Running));
            assert!(!terminal.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Dispatched));
        assert!(TaskStatus::Dispatched.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Dispatched));
    }

    #[test]
    fn test_failure_from_transport_error_keeps_attempt() {
        let err = Error::Transport {
            attempt: 2,
            message: "connection reset".to_string(),
        };
        let failure = TaskFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::Transport);
        assert_eq!(failure.attempt, Some(2));
        assert!(failure.message.contains("connection reset"));
    }

    #[test]
    fn test_max_attempts_floor() {
        let spec = TaskSpec::new("testing", serde_json::Value::Null).with_max_retries(0);
        assert_eq!(spec.max_attempts(), 1);
    }

    #[test]
    fn test_remote_status_success() {
        assert!(RemoteStatus::Exit(0).is_success());
        assert!(!RemoteStatus::Exit(2).is_success());
        assert!(RemoteStatus::Http(204).is_success());
        assert!(!RemoteStatus::Http(404).is_success());
    }
}
