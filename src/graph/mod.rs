//! Reference graph of concepts and datasources.
//!
//! Every concept and every datasource of a [`BuildEnvironment`] becomes a node.
//! Edges record how they relate:
//! - BINDS: datasource ↔ concept, one pair per column
//! - DERIVES: argument → derived concept
//! - PSEUDONYM: concept ↔ concept established by a merge
//!
//! The graph is an index for adjacency questions asked during resolution.
//! Searches run over a pruned, undirected [`WorkGraph`] copy.

mod work;

pub use work::WorkGraph;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use thiserror::Error;

use crate::model::{Address, BuildEnvironment};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node not found in reference graph: {0}")]
    NodeNotFound(String),

    #[error("Terminals are not connected: {}", .0.join(", "))]
    Disconnected(Vec<String>),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// A node of the reference graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GraphNode {
    Concept(Address),
    Datasource(String),
}

impl GraphNode {
    pub fn concept(address: &str) -> Self {
        GraphNode::Concept(address.to_string())
    }

    pub fn datasource(identifier: &str) -> Self {
        GraphNode::Datasource(identifier.to_string())
    }

    pub fn as_concept(&self) -> Option<&str> {
        match self {
            GraphNode::Concept(a) => Some(a),
            GraphNode::Datasource(_) => None,
        }
    }

    pub fn as_datasource(&self) -> Option<&str> {
        match self {
            GraphNode::Datasource(d) => Some(d),
            GraphNode::Concept(_) => None,
        }
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphNode::Concept(a) => write!(f, "c~{}", a),
            GraphNode::Datasource(d) => write!(f, "ds~{}", d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEdge {
    /// A datasource column. `partial` when the column holds a subset of values.
    Binds { partial: bool },
    Derives,
    Pseudonym,
}

/// The reference graph built from one build environment.
#[derive(Debug, Clone)]
pub struct ReferenceGraph {
    graph: DiGraph<GraphNode, GraphEdge>,
    node_index: HashMap<GraphNode, NodeIndex>,
}

impl ReferenceGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index: HashMap::new(),
        }
    }

    pub fn from_environment(env: &BuildEnvironment) -> Self {
        let mut g = Self::new();
        for concept in env.concepts.values() {
            let node = g.ensure(GraphNode::concept(&concept.address));
            for arg in concept.concept_arguments() {
                let arg = env.canonical(&arg).to_string();
                let from = g.ensure(GraphNode::Concept(arg));
                g.graph.add_edge(from, node, GraphEdge::Derives);
            }
            for pseudonym in &concept.pseudonyms {
                if env.concepts.contains_key(pseudonym) {
                    let other = g.ensure(GraphNode::concept(pseudonym));
                    g.graph.add_edge(node, other, GraphEdge::Pseudonym);
                    g.graph.add_edge(other, node, GraphEdge::Pseudonym);
                }
            }
        }
        for ds in env.datasources.values() {
            let ds_node = g.ensure(GraphNode::datasource(&ds.identifier));
            for col in &ds.columns {
                let address = env.canonical(&col.concept).to_string();
                let c_node = g.ensure(GraphNode::Concept(address));
                let edge = GraphEdge::Binds {
                    partial: col.is_partial(),
                };
                g.graph.add_edge(ds_node, c_node, edge);
                g.graph.add_edge(c_node, ds_node, edge);
            }
        }
        log::trace!(
            "built reference graph with {} nodes and {} edges",
            g.graph.node_count(),
            g.graph.edge_count()
        );
        g
    }

    fn ensure(&mut self, node: GraphNode) -> NodeIndex {
        if let Some(idx) = self.node_index.get(&node) {
            return *idx;
        }
        let idx = self.graph.add_node(node.clone());
        self.node_index.insert(node, idx);
        idx
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, node: &GraphNode) -> bool {
        self.node_index.contains_key(node)
    }

    /// Datasources with a column bound to `address`.
    pub fn datasources_for(&self, address: &str) -> GraphResult<BTreeSet<String>> {
        let idx = self.index_of(&GraphNode::concept(address))?;
        Ok(self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| matches!(e.weight(), GraphEdge::Binds { .. }))
            .filter_map(|e| self.graph[e.target()].as_datasource().map(str::to_string))
            .collect())
    }

    /// Concepts derived directly from `address`.
    pub fn dependents_of(&self, address: &str) -> GraphResult<BTreeSet<Address>> {
        let idx = self.index_of(&GraphNode::concept(address))?;
        Ok(self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| *e.weight() == GraphEdge::Derives)
            .filter_map(|e| self.graph[e.target()].as_concept().map(str::to_string))
            .collect())
    }

    fn index_of(&self, node: &GraphNode) -> GraphResult<NodeIndex> {
        self.node_index
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(node.to_string()))
    }

    /// An undirected copy holding the edges accepted by `keep`.
    ///
    /// Nodes are always copied; edges are deduplicated per unordered pair.
    pub fn work_graph<F>(&self, keep: F) -> WorkGraph
    where
        F: Fn(&GraphNode, &GraphNode, &GraphEdge) -> bool,
    {
        let mut work = WorkGraph::default();
        for idx in self.graph.node_indices() {
            work.add_node(self.graph[idx].clone());
        }
        for edge in self.graph.edge_references() {
            let a = &self.graph[edge.source()];
            let b = &self.graph[edge.target()];
            if keep(a, b, edge.weight()) {
                work.add_edge(a, b, *edge.weight());
            }
        }
        work
    }

    /// The datasource ↔ concept bindings only.
    pub fn binding_graph(&self) -> WorkGraph {
        self.work_graph(|_, _, e| matches!(e, GraphEdge::Binds { .. }))
    }
}

impl Default for ReferenceGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::model::{
        concept, Concept, DataType, Datasource, DatasourceAddress, Factory, Function, FunctionType,
        Grain,
    };

    fn env() -> BuildEnvironment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("revenue", DataType::Float, &["order_id"]))
            .unwrap();
        let doubled = Concept::derived(
            "doubled",
            crate::model::Lineage::Function(Function::new(
                FunctionType::Multiply,
                vec![concept("revenue"), crate::model::lit(2)],
            )),
            &env,
        )
        .unwrap();
        env.add_concept(doubled).unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("id", "order_id")
                .partial_column("amount", "revenue"),
        )
        .unwrap();
        Factory::new(&env, Grain::default()).build_environment().unwrap()
    }

    #[test]
    fn test_bindings_and_derivations() {
        let graph = ReferenceGraph::from_environment(&env());
        assert!(graph.contains(&GraphNode::datasource("orders")));
        assert_eq!(
            graph.datasources_for("local.order_id").unwrap(),
            BTreeSet::from(["orders".to_string()])
        );
        assert!(graph.datasources_for("local.doubled").unwrap().is_empty());
        assert!(graph
            .dependents_of("local.revenue")
            .unwrap()
            .contains("local.doubled"));
    }

    #[test]
    fn test_binding_graph_marks_partial_edges() {
        let work = ReferenceGraph::from_environment(&env()).binding_graph();
        let edge = work.edge(
            &GraphNode::datasource("orders"),
            &GraphNode::concept("local.revenue"),
        );
        assert_eq!(edge, Some(GraphEdge::Binds { partial: true }));
        assert!(work
            .edge(&GraphNode::concept("local.revenue"), &GraphNode::concept("local.doubled"))
            .is_none());
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let graph = ReferenceGraph::new();
        let err = graph.datasources_for("local.nope").unwrap_err();
        assert!(err.to_string().contains("c~local.nope"));
    }
}
