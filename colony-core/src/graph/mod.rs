//! Task graph
//!
//! A [`TaskGraph`] is the fully expanded, reachable view of a job definition,
//! optionally overlaid with the runtime state of one execution. It is the
//! input of presentation layers that render job progress.
//!
//! Nodes are keyed by task type, so a task reached from several predecessors
//! appears once. Forked sub-jobs appear as placeholder nodes keyed by their
//! fork job type; the validator rejects a fork job type that collides with a
//! declared task type.

mod builder;

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::domain::state::RequestState;
use crate::domain::task::TaskDefinition;

pub use builder::TaskGraphBuilder;

/// Color of nodes and edges nothing has run through yet
pub const IDLE_COLOR: &str = "gray";

/// One task in the graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    /// Possibly substituted by the dynamic task resolver
    pub task: TaskDefinition,
    /// State of the latest execution record, if the task ran
    pub state: Option<RequestState>,
    pub exit_code: Option<String>,
    pub color: String,
    /// The execution record has left the processing phase
    pub bold: bool,
    /// Label of the edge that first reached this node
    pub arrow_label: Option<String>,
    pub arrow_color: Option<String>,
    /// The task branches to one of several successors
    pub decision: bool,
    /// Task types of the nodes this node points at, in edge order
    pub children: Vec<String>,
    /// Options returned by task resolution
    pub options: HashMap<String, serde_json::Value>,
}

impl Node {
    pub fn new(task: TaskDefinition) -> Self {
        Self {
            task,
            state: None,
            exit_code: None,
            color: IDLE_COLOR.to_string(),
            bold: false,
            arrow_label: None,
            arrow_color: None,
            decision: false,
            children: Vec::new(),
            options: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.task.task_type
    }

    /// True once the task has left the processing phase
    pub fn is_settled(&self) -> bool {
        self.state.is_some_and(RequestState::is_terminal)
    }

    pub(crate) fn apply_state(&mut self, state: RequestState) {
        self.state = Some(state);
        self.color = state.color().to_string();
        self.bold = !state.is_processing();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    ExitCode,
    Fork,
    Await,
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub label: String,
    pub color: String,
    /// The edge was taken at runtime
    pub bold: bool,
    pub kind: EdgeKind,
}

/// Result of one graph build
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskGraph {
    root: String,
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
}

impl TaskGraph {
    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn root(&self) -> Option<&Node> {
        self.nodes.get(&self.root)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    /// Edges in traversal order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&Edge> {
        self.edges.iter().find(|edge| edge.from == from && edge.to == to)
    }

    pub fn children(&self, name: &str) -> Vec<&Node> {
        self.nodes
            .get(name)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|child| self.nodes.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Edges taken at runtime
    pub fn bold_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|edge| edge.bold)
    }
}
