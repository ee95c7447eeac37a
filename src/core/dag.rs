//! Dependency graph over a task list.
//!
//! Tasks refer to their dependencies by `dname`, so the graph is rebuilt
//! from a slice whenever the orchestrator needs an ordering or a closure.
//! Nodes carry the index of the task in that slice.

use crate::core::task::Task;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed, Walker};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Edges point from a dependency to the task waiting for it.
pub struct DependencyGraph {
    graph: DiGraph<usize, ()>,
    names: Vec<PathBuf>,
}

impl DependencyGraph {
    /// Build the graph. Dependencies outside `tasks` are ignored; a
    /// dependency cycle is an error.
    pub fn new(tasks: &[Task]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut names = Vec::with_capacity(tasks.len());

        let nodes: Vec<NodeIndex> = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| {
                let node = graph.add_node(i);
                let dname = task.dname();
                index.entry(dname.clone()).or_insert(node);
                names.push(dname);
                node
            })
            .collect();

        for (task, &node) in tasks.iter().zip(&nodes) {
            for dep in &task.deps {
                if let Some(&from) = index.get(dep) {
                    graph.add_edge(from, node, ());
                }
            }
        }

        let dag = Self {
            graph,
            names,
        };
        dag.submission_order()?;
        Ok(dag)
    }

    /// Task indices ordered so every task comes after its dependencies.
    pub fn submission_order(&self) -> Result<Vec<usize>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|&i| self.names[i].display().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Dependency cycle at task: {}", name))
        })?;
        Ok(sorted.into_iter().map(|node| self.graph[node]).collect())
    }

    /// The given tasks and everything that (transitively) depends on them,
    /// as sorted task indices.
    pub fn dependents(&self, roots: &[usize]) -> Vec<usize> {
        let mut found = BTreeSet::new();
        for &root in roots {
            if root >= self.graph.node_count() {
                continue;
            }
            let start = NodeIndex::new(root);
            for node in Dfs::new(&self.graph, start).iter(&self.graph) {
                found.insert(self.graph[node]);
            }
        }
        found.into_iter().collect()
    }

    /// The given tasks and everything they (transitively) depend on.
    pub fn ancestors(&self, roots: &[usize]) -> Vec<usize> {
        let reversed = Reversed(&self.graph);
        let mut found = BTreeSet::new();
        for &root in roots {
            if root >= self.graph.node_count() {
                continue;
            }
            for node in Dfs::new(reversed, NodeIndex::new(root)).iter(reversed) {
                found.insert(self.graph[node]);
            }
        }
        found.into_iter().collect()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
