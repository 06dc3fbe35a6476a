//! DAG resolution for workflow nodes.

use flotilla_core::Error;
use flotilla_core::ids::NodeId;
use flotilla_core::workflow::WorkflowSpec;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in node dependencies")]
    CycleDetected,
    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("Empty workflow")]
    EmptyWorkflow,
}

impl From<DagError> for Error {
    fn from(err: DagError) -> Self {
        Error::InvalidWorkflow(err.to_string())
    }
}

/// Directed acyclic graph of workflow nodes. Edges point from a node to its dependents.
#[derive(Debug)]
pub struct WorkflowDag {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl WorkflowDag {
    /// Build and validate a DAG from a workflow definition.
    pub fn build(spec: &WorkflowSpec) -> Result<Self, DagError> {
        if spec.nodes.is_empty() {
            return Err(DagError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &spec.nodes {
            if index.contains_key(&node.id) {
                return Err(DagError::DuplicateNode(node.id.to_string()));
            }
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        for node in &spec.nodes {
            let node_idx = index[&node.id];
            for dep in &node.depends_on {
                let dep_idx = index
                    .get(dep)
                    .ok_or_else(|| DagError::UnknownDependency {
                        node: node.id.to_string(),
                        dependency: dep.to_string(),
                    })?;
                graph.add_edge(*dep_idx, node_idx, ());
            }
        }

        let dag = Self { graph, index };
        dag.topological_order()?;
        Ok(dag)
    }

    fn neighbors(&self, node: &NodeId, direction: Direction) -> Vec<&NodeId> {
        self.index
            .get(node)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes with no dependencies.
    pub fn roots(&self) -> Vec<&NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Nodes that directly depend on `node`.
    pub fn successors(&self, node: &NodeId) -> Vec<&NodeId> {
        self.neighbors(node, Direction::Outgoing)
    }

    /// Nodes `node` directly depends on.
    pub fn predecessors(&self, node: &NodeId) -> Vec<&NodeId> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Every node reachable from `node`, excluding `node` itself.
    pub fn descendants(&self, node: &NodeId) -> Vec<&NodeId> {
        let Some(&start) = self.index.get(node) else {
            return vec![];
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start
                && let Some(id) = self.graph.node_weight(idx)
            {
                found.push(id);
            }
        }
        found
    }

    pub fn topological_order(&self) -> Result<Vec<&NodeId>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .collect()
            })
            .map_err(|_| DagError::CycleDetected)
    }

    /// Whether every predecessor of `node` is in `completed`.
    pub fn is_ready(&self, node: &NodeId, completed: &HashSet<NodeId>) -> bool {
        self.predecessors(node)
            .iter()
            .all(|pred| completed.contains(*pred))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.graph.node_weights()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.index.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
