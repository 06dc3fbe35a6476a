//! Workflow definitions and run reports.

use crate::ids::{NodeId, RunId, TaskId};
use crate::task::{TaskFailure, TaskSpec, TaskStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A dependency graph of task specifications.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowSpec {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
    #[serde(flatten)]
    pub task: TaskSpec,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, task: TaskSpec) -> Self {
        Self {
            id: id.into(),
            depends_on: vec![],
            task,
        }
    }

    pub fn after(mut self, predecessor: impl Into<NodeId>) -> Self {
        self.depends_on.push(predecessor.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Per-node view inside a workflow report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub status: TaskStatus,
    /// Set once the node has been submitted as a task.
    pub task_id: Option<TaskId>,
    pub failure: Option<TaskFailure>,
}

/// Status snapshot of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub run_id: RunId,
    pub name: String,
    pub status: WorkflowStatus,
    pub nodes: BTreeMap<NodeId, NodeReport>,
    /// Nodes that failed on their own.
    pub failed_nodes: Vec<NodeId>,
    /// Nodes failed without dispatch because an upstream node failed.
    pub skipped_nodes: Vec<NodeId>,
    pub cancelled_nodes: Vec<NodeId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
