//! Flow graphs.
//!
//! A [`Flow`] is an explicit DAG value: named task nodes plus dependency
//! edges, assembled through [`FlowBuilder`] and validated (unique names,
//! known dependencies, no cycles) at build time. Sub-flows nest by
//! flattening: their nodes are imported under a prefix, which keeps
//! revert ordering and persisted progress uniform across nesting levels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::error::FlowError;
use crate::task::Task;

/// One node of a flattened flow.
#[derive(Clone)]
pub struct FlowNodeSpec {
    pub name: String,
    pub task: Arc<dyn Task>,
    /// Names of nodes that must complete before this one runs.
    pub deps: Vec<String>,
}

/// A validated DAG of task nodes. The unit of atomic progress for one
/// lifecycle request.
#[derive(Clone)]
pub struct Flow {
    name: String,
    nodes: Vec<FlowNodeSpec>,
}

impl Flow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[FlowNodeSpec] {
        &self.nodes
    }

    /// Nodes that no other node depends on.
    pub fn leaves(&self) -> Vec<String> {
        let mut depended_on = HashSet::new();
        for node in &self.nodes {
            for dep in &node.deps {
                depended_on.insert(dep.as_str());
            }
        }
        self.nodes
            .iter()
            .filter(|n| !depended_on.contains(n.name.as_str()))
            .map(|n| n.name.clone())
            .collect()
    }
}

/// Assembles a [`Flow`].
pub struct FlowBuilder {
    name: String,
    nodes: Vec<FlowNodeSpec>,
}

impl FlowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: Vec::new(),
        }
    }

    /// Add a task node depending on the named predecessors.
    /// Returns the node name for later linking.
    pub fn add(&mut self, task: Arc<dyn Task>, after: &[&str]) -> String {
        let name = task.name();
        self.nodes.push(FlowNodeSpec {
            name: name.clone(),
            task,
            deps: after.iter().map(|s| s.to_string()).collect(),
        });
        name
    }

    /// Nest a sub-flow under a prefix.
    ///
    /// The sub-flow's nodes are imported as `{prefix}.{node}`; its root
    /// nodes pick up the `after` dependencies. Returns the imported leaf
    /// names so successors can join on the whole sub-flow.
    pub fn add_subflow(&mut self, prefix: &str, flow: Flow, after: &[&str]) -> Vec<String> {
        let leaves: Vec<String> = flow
            .leaves()
            .iter()
            .map(|l| format!("{prefix}.{l}"))
            .collect();

        for node in flow.nodes {
            let is_root = node.deps.is_empty();
            let mut deps: Vec<String> = node
                .deps
                .iter()
                .map(|d| format!("{prefix}.{d}"))
                .collect();
            if is_root {
                deps.extend(after.iter().map(|s| s.to_string()));
            }
            self.nodes.push(FlowNodeSpec {
                name: format!("{prefix}.{}", node.name),
                task: node.task,
                deps,
            });
        }
        leaves
    }

    /// Validate and produce the flow.
    pub fn build(self) -> Result<Flow, FlowError> {
        // Unique names.
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(FlowError::DuplicateNode(node.name.clone()));
            }
        }

        // Known dependencies, and a petgraph mirror for cycle detection.
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.name.as_str());
            index.insert(node.name.as_str(), idx);
        }
        for node in &self.nodes {
            for dep in &node.deps {
                let Some(&from) = index.get(dep.as_str()) else {
                    return Err(FlowError::UnknownDependency {
                        node: node.name.clone(),
                        dep: dep.clone(),
                    });
                };
                graph.add_edge(from, index[node.name.as_str()], ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let name = graph[cycle.node_id()].to_string();
            return Err(FlowError::Cycle(name));
        }

        Ok(Flow {
            name: self.name,
            nodes: self.nodes,
        })
    }
}
