//! Workflow run state machine.
//!
//! `WorkflowRun` holds no locks and performs no I/O. The orchestrator feeds it
//! node outcomes and acts on what it returns: nodes to submit, tasks to
//! cancel, and the terminal status once every dispatched node has settled.

use crate::dag::{DagError, WorkflowDag};
use chrono::{DateTime, Utc};
use flotilla_core::ids::{NodeId, RunId, TaskId};
use flotilla_core::task::{TaskFailure, TaskSpec, TaskStatus};
use flotilla_core::workflow::{NodeReport, WorkflowReport, WorkflowSpec, WorkflowStatus};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone)]
struct NodeState {
    status: TaskStatus,
    task_id: Option<TaskId>,
    failure: Option<TaskFailure>,
    /// Failed because an upstream node failed; never dispatched.
    skipped: bool,
}

impl NodeState {
    fn in_flight(&self) -> bool {
        self.task_id.is_some() && !self.status.is_terminal()
    }
}

#[derive(Debug)]
pub struct WorkflowRun {
    run_id: RunId,
    name: String,
    dag: WorkflowDag,
    specs: HashMap<NodeId, TaskSpec>,
    nodes: BTreeMap<NodeId, NodeState>,
    status: WorkflowStatus,
    cancel_requested: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(run_id: RunId, spec: &WorkflowSpec) -> Result<Self, DagError> {
        let dag = WorkflowDag::build(spec)?;
        let specs = spec
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.task.clone()))
            .collect();
        let nodes = spec
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeState {
                        status: TaskStatus::Pending,
                        task_id: None,
                        failure: None,
                        skipped: false,
                    },
                )
            })
            .collect();

        Ok(Self {
            run_id,
            name: spec.name.clone(),
            dag,
            specs,
            nodes,
            status: WorkflowStatus::Pending,
            cancel_requested: false,
            started_at: Utc::now(),
            completed_at: None,
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn spec(&self, node: &NodeId) -> Option<&TaskSpec> {
        self.specs.get(node)
    }

    pub fn node_status(&self, node: &NodeId) -> Option<TaskStatus> {
        self.nodes.get(node).map(|n| n.status)
    }

    /// Move to `running` and return the root nodes to submit.
    pub fn start(&mut self) -> Vec<NodeId> {
        if self.status != WorkflowStatus::Pending {
            return vec![];
        }
        self.status = WorkflowStatus::Running;
        self.ready_nodes()
    }

    /// Never-submitted nodes whose predecessors all completed.
    fn ready_nodes(&self) -> Vec<NodeId> {
        if self.status != WorkflowStatus::Running || self.cancel_requested {
            return vec![];
        }
        let completed: HashSet<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.status == TaskStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        self.nodes
            .iter()
            .filter(|(_, n)| n.status == TaskStatus::Pending && n.task_id.is_none())
            .filter(|(id, _)| self.dag.is_ready(id, &completed))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn mark_submitted(&mut self, node: &NodeId, task_id: TaskId) {
        if let Some(n) = self.nodes.get_mut(node) {
            n.task_id = Some(task_id);
        }
    }

    /// Mirror a non-terminal task status onto its node.
    pub fn set_node_status(&mut self, node: &NodeId, status: TaskStatus) {
        if let Some(n) = self.nodes.get_mut(node)
            && !n.status.is_terminal()
        {
            n.status = status;
        }
    }

    /// Record a completed node and return the nodes that became ready.
    pub fn on_node_completed(&mut self, node: &NodeId) -> Vec<NodeId> {
        match self.nodes.get_mut(node) {
            Some(n) if !n.status.is_terminal() => n.status = TaskStatus::Completed,
            _ => return vec![],
        }
        self.ready_nodes()
    }

    /// Record a failed node. Every transitive successor that was not yet
    /// dispatched is failed as skipped; the skipped nodes are returned.
    pub fn on_node_failed(&mut self, node: &NodeId, failure: TaskFailure) -> Vec<NodeId> {
        match self.nodes.get_mut(node) {
            Some(n) if !n.status.is_terminal() => {
                n.status = TaskStatus::Failed;
                n.failure = Some(failure);
            }
            _ => return vec![],
        }
        if self.status == WorkflowStatus::Running {
            self.status = WorkflowStatus::Failed;
        }

        let descendants: Vec<NodeId> = self.dag.descendants(node).into_iter().cloned().collect();
        let mut skipped = Vec::new();
        for id in descendants {
            if let Some(n) = self.nodes.get_mut(&id)
                && n.task_id.is_none()
                && !n.status.is_terminal()
            {
                n.status = TaskStatus::Failed;
                n.failure = Some(TaskFailure::upstream_failed());
                n.skipped = true;
                skipped.push(id);
            }
        }
        skipped
    }

    pub fn on_node_cancelled(&mut self, node: &NodeId) {
        if let Some(n) = self.nodes.get_mut(node)
            && !n.status.is_terminal()
        {
            n.status = TaskStatus::Cancelled;
        }
    }

    /// Request cancellation. Never-submitted nodes are cancelled on the spot;
    /// the tasks of submitted, unsettled nodes are returned for the caller to cancel.
    pub fn cancel(&mut self) -> Vec<TaskId> {
        if self.is_finished() {
            return vec![];
        }
        self.cancel_requested = true;
        let mut to_cancel = Vec::new();
        for n in self.nodes.values_mut() {
            if n.status.is_terminal() {
                continue;
            }
            match n.task_id {
                Some(task_id) => to_cancel.push(task_id),
                None => n.status = TaskStatus::Cancelled,
            }
        }
        to_cancel
    }

    /// Number of dispatched nodes that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.nodes.values().filter(|n| n.in_flight()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Settle the run if nothing is in flight. Returns the terminal status the
    /// first time the run settles, `None` otherwise.
    pub fn try_finish(&mut self) -> Option<WorkflowStatus> {
        if self.is_finished() || self.status == WorkflowStatus::Pending || self.in_flight() > 0 {
            return None;
        }

        let all_completed = self.nodes.values().all(|n| n.status == TaskStatus::Completed);
        let final_status = if self.status == WorkflowStatus::Failed {
            WorkflowStatus::Failed
        } else if self.cancel_requested {
            WorkflowStatus::Cancelled
        } else if all_completed {
            WorkflowStatus::Completed
        } else if self.ready_nodes().is_empty() {
            // A cancelled node blocks its descendants without failing the run.
            if self.nodes.values().any(|n| n.status == TaskStatus::Cancelled) {
                WorkflowStatus::Cancelled
            } else {
                WorkflowStatus::Failed
            }
        } else {
            return None;
        };

        // Nodes left behind by a failed run never start.
        for n in self.nodes.values_mut() {
            if !n.status.is_terminal() {
                n.status = TaskStatus::Cancelled;
            }
        }
        self.status = final_status;
        self.completed_at = Some(Utc::now());
        Some(final_status)
    }

    fn nodes_where(&self, pred: impl Fn(&NodeState) -> bool) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| pred(n))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn report(&self) -> WorkflowReport {
        WorkflowReport {
            run_id: self.run_id,
            name: self.name.clone(),
            status: self.status,
            nodes: self
                .nodes
                .iter()
                .map(|(id, n)| {
                    (
                        id.clone(),
                        NodeReport {
                            status: n.status,
                            task_id: n.task_id,
                            failure: n.failure.clone(),
                        },
                    )
                })
                .collect(),
            failed_nodes: self.nodes_where(|n| n.status == TaskStatus::Failed && !n.skipped),
            skipped_nodes: self.nodes_where(|n| n.skipped),
            cancelled_nodes: self.nodes_where(|n| n.status == TaskStatus::Cancelled),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}
