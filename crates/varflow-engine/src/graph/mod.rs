//! Dependency graph over scripts.
//!
//! Nodes are script paths. An edge `P -> C` labeled `v` means P produces `v`
//! and C requires it. The builder does not look for cycles; a cycle only
//! matters once the orchestrator walks it. Parallel edges are kept, both
//! between one pair (one per shared variable) and from several producers of
//! the same variable.

pub mod edge;

use std::collections::BTreeMap;

use varflow_core::types::Registry;

pub use edge::Edge;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: Vec<Edge>,
    /// Every variable's producers in registry order, consumed or not.
    producers: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph from a registry. Edge order follows registry order
    /// of the consumer, then its `requires` order, then producer order.
    pub fn build(registry: &Registry) -> Self {
        let mut edges = Vec::new();
        for consumer in registry.values() {
            for var in &consumer.requires {
                for producer in registry.values().filter(|p| p.produces_var(var)) {
                    edges.push(Edge::new(&producer.path, &consumer.path, var));
                }
            }
        }
        let mut producers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for script in registry.values() {
            for var in &script.produces {
                producers
                    .entry(var.clone())
                    .or_default()
                    .push(script.path.clone());
            }
        }
        Self {
            nodes: registry.keys().cloned().collect(),
            edges,
            producers,
        }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.iter().any(|n| n == path)
    }

    /// Edges pointing at `consumer`.
    pub fn in_edges<'a>(&'a self, consumer: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == consumer)
    }

    /// Producers that feed `variable` into `consumer`, in graph order.
    pub fn producers_for(&self, consumer: &str, variable: &str) -> Vec<String> {
        self.in_edges(consumer)
            .filter(|e| e.variable == variable)
            .map(|e| e.from.clone())
            .collect()
    }

    /// Variables with more than one producer, and their producers.
    pub fn ambiguous_variables(&self) -> BTreeMap<String, Vec<String>> {
        self.producers
            .iter()
            .filter(|(_, p)| p.len() > 1)
            .map(|(var, p)| (var.clone(), p.clone()))
            .collect()
    }
}
