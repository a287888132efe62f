//! Task graph: cycle detection, ancestor/descendant closure and waves.
//!
//! Edges run from a predecessor to its dependent. `petgraph::algo::toposort`
//! rejects cycles; depth grouping produces the waves reported by dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use super::WorkflowError;

/// Validated, acyclic view of a workflow's tasks.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl TaskGraph {
    /// Build the graph from task names (insertion order) and each task's
    /// predecessor set.
    pub fn build(
        names: &[String],
        predecessors: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::<String, ()>::new();
        let index: HashMap<String, NodeIndex> = names
            .iter()
            .map(|name| (name.clone(), graph.add_node(name.clone())))
            .collect();

        for (task, preds) in predecessors {
            let to = *index.get(task).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!("edges declared for unknown task '{task}'"))
            })?;
            for pred in preds {
                let from = *index.get(pred).ok_or_else(|| {
                    WorkflowError::UnknownDependency(format!(
                        "task '{task}' depends on unknown task '{pred}'"
                    ))
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            WorkflowError::CycleDetected(format!(
                "cycle detected involving task '{}'",
                graph[cycle.node_id()]
            ))
        })?;

        Ok(Self { graph, index, order })
    }

    /// Task names in a dependency-respecting order.
    pub fn topological_order(&self) -> Vec<String> {
        self.order.iter().map(|&n| self.graph[n].clone()).collect()
    }

    /// Direct predecessors of `task`.
    pub fn predecessors(&self, task: &str) -> BTreeSet<String> {
        self.neighbours(task, petgraph::Direction::Incoming)
    }

    /// Direct dependents of `task`.
    pub fn dependents(&self, task: &str) -> BTreeSet<String> {
        self.neighbours(task, petgraph::Direction::Outgoing)
    }

    fn neighbours(&self, task: &str, direction: petgraph::Direction) -> BTreeSet<String> {
        self.index
            .get(task)
            .map(|&n| {
                self.graph
                    .neighbors_directed(n, direction)
                    .map(|m| self.graph[m].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transitive predecessors of `task`, excluding itself.
    pub fn ancestors(&self, task: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(task) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                found.insert(self.graph[node].clone());
            }
        }
        found
    }

    /// Transitive dependents of `task`, excluding itself.
    pub fn descendants(&self, task: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(task) else {
            return BTreeSet::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].clone());
            }
        }
        found
    }

    /// Group tasks by depth; every task in a wave only depends on earlier waves.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &self.order {
            let depth = self
                .graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .map(|pred| depths.get(&pred).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(node, depth);
        }

        let Some(max_depth) = depths.values().copied().max() else {
            return Vec::new();
        };
        let mut waves = vec![Vec::new(); max_depth + 1];
        for &node in &self.order {
            waves[depths[&node]].push(self.graph[node].clone());
        }
        for wave in &mut waves {
            wave.sort();
        }
        waves
    }
}
