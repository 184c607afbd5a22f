//! Dependency graph over materialization nodes.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use quarry_core::materialize::MaterializationNode;
use quarry_core::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Directed acyclic graph of derived tables over their sources.
///
/// Raw sources are not nodes; they are the declared leaves the graph hangs
/// from. Edges run upstream -> downstream.
#[derive(Debug)]
pub struct MaterializationGraph {
    graph: DiGraph<MaterializationNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    raw_sources: HashSet<String>,
}

impl MaterializationGraph {
    pub fn node(&self, name: &str) -> Option<&MaterializationNode> {
        self.name_to_index
            .get(name)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn nodes(&self) -> Vec<&MaterializationNode> {
        self.graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Nodes whose only inputs are raw sources.
    pub fn roots(&self) -> Vec<&MaterializationNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Upstream node names (raw sources excluded) for a node.
    pub fn upstream(&self, name: &str) -> Vec<&str> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .map(|node| node.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All node names in dependency order.
    pub fn topological_order(&self) -> Vec<&str> {
        // Acyclicity was verified at build time.
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .map(|node| node.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes reachable from the given changed raw sources and/or nodes, in
    /// dependency order. This is the cascade set for a refresh trigger.
    pub fn cascade_from(&self, changed: &[String]) -> Vec<&str> {
        let mut seeds: HashSet<NodeIndex> = HashSet::new();
        for name in changed {
            if let Some(&idx) = self.name_to_index.get(name) {
                seeds.insert(idx);
            } else {
                // A raw source: every node reading it directly is a seed.
                for idx in self.graph.node_indices() {
                    if let Some(node) = self.graph.node_weight(idx) {
                        if node.sources.iter().any(|s| s == name) {
                            seeds.insert(idx);
                        }
                    }
                }
            }
        }

        let mut reachable = seeds.clone();
        let mut stack: Vec<NodeIndex> = seeds.into_iter().collect();
        while let Some(idx) = stack.pop() {
            for next in self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
            {
                if reachable.insert(next) {
                    stack.push(next);
                }
            }
        }

        self.topological_order()
            .into_iter()
            .filter(|name| {
                self.name_to_index
                    .get(*name)
                    .is_some_and(|idx| reachable.contains(idx))
            })
            .collect()
    }

    pub fn is_raw_source(&self, name: &str) -> bool {
        self.raw_sources.contains(name)
    }
}

/// Builder validating node definitions into a graph.
pub struct GraphBuilder {
    raw_sources: HashSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            raw_sources: HashSet::new(),
        }
    }

    /// Declare a raw source table nodes may read from.
    pub fn raw_source(mut self, name: impl Into<String>) -> Self {
        self.raw_sources.insert(name.into());
        self
    }

    pub fn build(self, nodes: Vec<MaterializationNode>) -> Result<MaterializationGraph> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for node in &nodes {
            let idx = graph.add_node(node.clone());
            name_to_index.insert(node.name.clone(), idx);
        }

        for node in &nodes {
            let node_idx = name_to_index[&node.name];
            for source in &node.sources {
                if let Some(&src_idx) = name_to_index.get(source) {
                    graph.add_edge(src_idx, node_idx, ());
                } else if !self.raw_sources.contains(source) {
                    return Err(Error::UnknownSource {
                        node: node.name.clone(),
                        source_name: source.clone(),
                    });
                }
            }
        }

        toposort(&graph, None).map_err(|_| Error::CycleDetected)?;

        Ok(MaterializationGraph {
            graph,
            name_to_index,
            raw_sources: self.raw_sources,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::materialize::{AggregationDef, Measure};

    fn node(name: &str, sources: Vec<&str>) -> MaterializationNode {
        MaterializationNode::new(
            name,
            sources.iter().map(|s| s.to_string()).collect(),
            AggregationDef {
                group_by: vec!["key".to_string()],
                measures: vec![Measure::count("rows")],
            },
        )
    }

    fn tiered() -> MaterializationGraph {
        GraphBuilder::new()
            .raw_source("loans")
            .build(vec![
                node("tract_volume", vec!["loans"]),
                node("county_volume", vec!["tract_volume"]),
                node("state_volume", vec!["county_volume"]),
                node("county_denials", vec!["loans"]),
            ])
            .unwrap()
    }

    #[test]
    fn test_topological_order_respects_tiers() {
        let graph = tiered();
        let order = graph.topological_order();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("tract_volume") < pos("county_volume"));
        assert!(pos("county_volume") < pos("state_volume"));
    }

    #[test]
    fn test_cascade_from_raw_source_reaches_all_dependents() {
        let graph = tiered();
        let cascade = graph.cascade_from(&["loans".to_string()]);
        assert_eq!(cascade.len(), 4);
    }

    #[test]
    fn test_cascade_from_mid_tier_excludes_siblings() {
        let graph = tiered();
        let cascade = graph.cascade_from(&["county_volume".to_string()]);
        assert_eq!(cascade, vec!["county_volume", "state_volume"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = GraphBuilder::new()
            .build(vec![node("a", vec!["b"]), node("b", vec!["a"])])
            .unwrap_err();
        assert!(matches!(err, Error::CycleDetected));
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let err = GraphBuilder::new()
            .raw_source("loans")
            .build(vec![node("tract_volume", vec!["loanz"])])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSource { .. }));
    }

    #[test]
    fn test_roots_read_only_raw_sources() {
        let graph = tiered();
        let mut roots: Vec<&str> = graph.roots().iter().map(|n| n.name.as_str()).collect();
        roots.sort_unstable();
        assert_eq!(roots, vec!["county_denials", "tract_volume"]);
    }
}
