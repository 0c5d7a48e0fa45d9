//! Undirected working copies of the reference graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::stable_graph::{NodeIndex, StableUnGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

use super::{GraphEdge, GraphError, GraphNode, GraphResult};
use crate::model::Address;

/// A mutable, undirected graph that searches prune in place.
///
/// Backed by a stable graph so removing nodes keeps the remaining indices valid.
#[derive(Debug, Clone, Default)]
pub struct WorkGraph {
    graph: StableUnGraph<GraphNode, GraphEdge>,
    index: BTreeMap<GraphNode, NodeIndex>,
}

impl WorkGraph {
    pub fn add_node(&mut self, node: GraphNode) -> NodeIndex {
        if let Some(idx) = self.index.get(&node) {
            return *idx;
        }
        let idx = self.graph.add_node(node.clone());
        self.index.insert(node, idx);
        idx
    }

    /// Add an edge unless the pair is already connected.
    pub fn add_edge(&mut self, a: &GraphNode, b: &GraphNode, edge: GraphEdge) {
        let ia = self.add_node(a.clone());
        let ib = self.add_node(b.clone());
        if self.graph.find_edge(ia, ib).is_none() {
            self.graph.add_edge(ia, ib, edge);
        }
    }

    pub fn contains(&self, node: &GraphNode) -> bool {
        self.index.contains_key(node)
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Nodes in sorted order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.index.keys()
    }

    pub fn node_set(&self) -> BTreeSet<GraphNode> {
        self.index.keys().cloned().collect()
    }

    pub fn concepts(&self) -> BTreeSet<Address> {
        self.nodes()
            .filter_map(|n| n.as_concept().map(str::to_string))
            .collect()
    }

    pub fn datasources(&self) -> BTreeSet<String> {
        self.nodes()
            .filter_map(|n| n.as_datasource().map(str::to_string))
            .collect()
    }

    pub fn remove(&mut self, node: &GraphNode) {
        if let Some(idx) = self.index.remove(node) {
            self.graph.remove_node(idx);
        }
    }

    pub fn retain<F: Fn(&GraphNode) -> bool>(&mut self, keep: F) {
        let dropped: Vec<GraphNode> = self.nodes().filter(|n| !keep(n)).cloned().collect();
        for node in dropped {
            self.remove(&node);
        }
    }

    pub fn edge(&self, a: &GraphNode, b: &GraphNode) -> Option<GraphEdge> {
        let ia = self.index.get(a)?;
        let ib = self.index.get(b)?;
        self.graph
            .find_edge(*ia, *ib)
            .and_then(|e| self.graph.edge_weight(e))
            .copied()
    }

    pub fn remove_edge(&mut self, a: &GraphNode, b: &GraphNode) {
        if let (Some(ia), Some(ib)) = (self.index.get(a), self.index.get(b)) {
            if let Some(e) = self.graph.find_edge(*ia, *ib) {
                self.graph.remove_edge(e);
            }
        }
    }

    /// Edges as sorted node pairs.
    pub fn edges(&self) -> Vec<(GraphNode, GraphNode, GraphEdge)> {
        let mut out: Vec<(GraphNode, GraphNode, GraphEdge)> = (&self.graph)
            .edge_references()
            .map(|e| {
                let a = self.graph[e.source()].clone();
                let b = self.graph[e.target()].clone();
                if a <= b {
                    (a, b, *e.weight())
                } else {
                    (b, a, *e.weight())
                }
            })
            .collect();
        out.sort_by(|x, y| (&x.0, &x.1).cmp(&(&y.0, &y.1)));
        out
    }

    pub fn neighbors(&self, node: &GraphNode) -> BTreeSet<GraphNode> {
        match self.index.get(node) {
            Some(idx) => self
                .graph
                .neighbors(*idx)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Concepts bound on a datasource node.
    pub fn concept_neighbors(&self, datasource: &str) -> BTreeSet<Address> {
        self.neighbors(&GraphNode::datasource(datasource))
            .into_iter()
            .filter_map(|n| n.as_concept().map(str::to_string))
            .collect()
    }

    /// Datasources binding a concept node.
    pub fn datasource_neighbors(&self, address: &str) -> BTreeSet<String> {
        self.neighbors(&GraphNode::concept(address))
            .into_iter()
            .filter_map(|n| n.as_datasource().map(str::to_string))
            .collect()
    }

    pub fn remove_isolates(&mut self) {
        let isolated: Vec<GraphNode> = self
            .index
            .iter()
            .filter(|(_, idx)| self.graph.neighbors(**idx).next().is_none())
            .map(|(n, _)| n.clone())
            .collect();
        for node in isolated {
            self.remove(&node);
        }
    }

    /// Connected components, each sorted, in order of their smallest node.
    pub fn connected_components(&self) -> Vec<BTreeSet<GraphNode>> {
        let mut seen: BTreeSet<&GraphNode> = BTreeSet::new();
        let mut out = Vec::new();
        for start in self.index.keys() {
            if seen.contains(start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([start.clone()]);
            seen.insert(start);
            while let Some(node) = queue.pop_front() {
                for next in self.neighbors(&node) {
                    if let Some((key, _)) = self.index.get_key_value(&next) {
                        if seen.insert(key) {
                            queue.push_back(next);
                        }
                    }
                }
                component.insert(node);
            }
            out.push(component);
        }
        out
    }

    /// The subgraph on `nodes` with every edge between them.
    pub fn induced(&self, nodes: &BTreeSet<GraphNode>) -> WorkGraph {
        let mut out = WorkGraph::default();
        for node in nodes.iter().filter(|n| self.contains(n)) {
            out.add_node(node.clone());
        }
        for (a, b, edge) in self.edges() {
            if nodes.contains(&a) && nodes.contains(&b) {
                out.add_edge(&a, &b, edge);
            }
        }
        out
    }

    /// Approximate the Steiner tree spanning `terminals`.
    ///
    /// Grows a tree from the first terminal, repeatedly attaching the nearest
    /// remaining terminal by its shortest path. Returns the tree's nodes.
    pub fn steiner_tree(&self, terminals: &[GraphNode]) -> GraphResult<BTreeSet<GraphNode>> {
        if let Some(missing) = terminals.iter().find(|t| !self.contains(t)) {
            return Err(GraphError::NodeNotFound(missing.to_string()));
        }
        let mut tree: BTreeSet<GraphNode> = BTreeSet::new();
        let Some(first) = terminals.first() else {
            return Ok(tree);
        };
        tree.insert(first.clone());
        let mut remaining: BTreeSet<GraphNode> = terminals[1..]
            .iter()
            .filter(|t| *t != first)
            .cloned()
            .collect();
        while !remaining.is_empty() {
            let Some(path) = self.nearest(&tree, &remaining) else {
                return Err(GraphError::Disconnected(
                    remaining.iter().map(|n| n.to_string()).collect(),
                ));
            };
            for node in path {
                remaining.remove(&node);
                tree.insert(node);
            }
        }
        Ok(tree)
    }

    /// Shortest path from any node of `sources` to the closest node of `targets`.
    fn nearest(
        &self,
        sources: &BTreeSet<GraphNode>,
        targets: &BTreeSet<GraphNode>,
    ) -> Option<Vec<GraphNode>> {
        let mut previous: HashMap<GraphNode, Option<GraphNode>> = HashMap::new();
        let mut queue = VecDeque::new();
        for s in sources {
            previous.insert(s.clone(), None);
            queue.push_back(s.clone());
        }
        while let Some(node) = queue.pop_front() {
            if targets.contains(&node) && !sources.contains(&node) {
                let mut path = vec![node.clone()];
                let mut cursor = previous.get(&node).cloned().flatten();
                while let Some(p) = cursor {
                    cursor = previous.get(&p).cloned().flatten();
                    path.push(p);
                }
                path.reverse();
                return Some(path);
            }
            for next in self.neighbors(&node) {
                if !previous.contains_key(&next) {
                    previous.insert(next.clone(), Some(node.clone()));
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind() -> GraphEdge {
        GraphEdge::Binds { partial: false }
    }

    /// orders(order_id, customer_id) - customers(customer_id, name) - regions(name, region)
    fn chain() -> WorkGraph {
        let mut g = WorkGraph::default();
        for (ds, concepts) in [
            ("orders", vec!["order_id", "customer_id"]),
            ("customers", vec!["customer_id", "name"]),
            ("regions", vec!["name", "region"]),
        ] {
            for c in concepts {
                g.add_edge(&GraphNode::datasource(ds), &GraphNode::concept(c), bind());
            }
        }
        g
    }

    #[test]
    fn test_steiner_tree_bridges_intermediate_nodes() {
        let g = chain();
        let tree = g
            .steiner_tree(&[GraphNode::concept("order_id"), GraphNode::concept("region")])
            .unwrap();
        assert!(tree.contains(&GraphNode::datasource("customers")));
        assert!(tree.contains(&GraphNode::concept("customer_id")));
        assert_eq!(tree.len(), 7);
    }

    #[test]
    fn test_steiner_tree_reports_disconnected_terminals() {
        let mut g = chain();
        g.remove(&GraphNode::datasource("customers"));
        let err = g
            .steiner_tree(&[GraphNode::concept("order_id"), GraphNode::concept("region")])
            .unwrap_err();
        assert!(matches!(err, GraphError::Disconnected(_)));
    }

    #[test]
    fn test_components_and_isolates() {
        let mut g = chain();
        g.add_node(GraphNode::concept("orphan"));
        assert_eq!(g.connected_components().len(), 2);
        g.remove_isolates();
        assert_eq!(g.connected_components().len(), 1);
        g.remove(&GraphNode::datasource("customers"));
        g.remove_isolates();
        assert_eq!(g.connected_components().len(), 2);
    }

    #[test]
    fn test_induced_keeps_edges_between_chosen_nodes() {
        let g = chain();
        assert_eq!(g.edges().len(), 6);
        let nodes = BTreeSet::from([
            GraphNode::datasource("orders"),
            GraphNode::concept("order_id"),
            GraphNode::concept("customer_id"),
            GraphNode::concept("name"),
        ]);
        let sub = g.induced(&nodes);
        assert_eq!(sub.node_set(), nodes);
        assert_eq!(sub.edges().len(), 2);
        assert!(sub
            .edge(&GraphNode::datasource("orders"), &GraphNode::concept("customer_id"))
            .is_some());
    }

    #[test]
    fn test_neighbors_by_kind() {
        let g = chain();
        assert_eq!(
            g.datasource_neighbors("customer_id"),
            BTreeSet::from(["customers".to_string(), "orders".to_string()])
        );
        assert_eq!(g.concept_neighbors("regions").len(), 2);
    }
}
