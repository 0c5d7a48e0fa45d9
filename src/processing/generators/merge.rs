//! Joins across datasources found through the reference graph.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::graph::{GraphEdge, GraphNode, WorkGraph};
use crate::model::{Address, BuildConcept, Derivation, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::StrategyNode;
use crate::processing::search::Searcher;
use crate::processing::{addresses, pseudonym_related, unique_concepts};

impl Searcher<'_> {
    /// Find a connected set of datasources covering every target and build
    /// a merge over one sub-search per datasource.
    pub(crate) fn gen_merge_node(
        &mut self,
        all_concepts: &[BuildConcept],
        depth: usize,
        accept_partial: bool,
        _conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let targets: Vec<BuildConcept> = all_concepts
            .iter()
            .filter(|c| c.derivation != Derivation::Constant)
            .cloned()
            .collect();
        if targets.len() < 2 {
            return Ok(None);
        }
        for filter_downstream in [true, false] {
            let Some(subgraphs) = self.resolve_weak_components(&targets, filter_downstream, accept_partial)? else {
                continue;
            };
            log::info!(
                "{}[GEN_MERGE_NODE] found {} subgraphs for {} (filter downstream: {})",
                padding(depth),
                subgraphs.len(),
                addresses(&targets).join(", "),
                filter_downstream
            );
            let mut parents = Vec::new();
            for concepts in &subgraphs {
                let sub_targets = self.env.concepts_for(concepts)?;
                let Some(parent) = self.search_concepts(&sub_targets, depth + 1, None, accept_partial)? else {
                    log::info!(
                        "{}[GEN_MERGE_NODE] could not source subgraph {}",
                        padding(depth),
                        concepts.join(", ")
                    );
                    return Ok(None);
                };
                parents.push(parent);
            }
            let constants: Vec<BuildConcept> = all_concepts
                .iter()
                .filter(|c| c.derivation == Derivation::Constant)
                .cloned()
                .collect();
            if !constants.is_empty() {
                parents.push(StrategyNode::constant(constants).with_depth(depth + 1));
            }
            let inputs = unique_concepts(parents.iter().flat_map(|p| p.usable_outputs()));
            let outputs: Vec<BuildConcept> = inputs
                .iter()
                .filter(|i| {
                    all_concepts
                        .iter()
                        .any(|t| t.address == i.address || pseudonym_related(t, i))
                })
                .cloned()
                .collect();
            return Ok(Some(StrategyNode::merge(inputs, outputs, parents).with_depth(depth)));
        }
        Ok(None)
    }

    /// Candidate join paths for `targets`, one concept list per datasource.
    ///
    /// Each round takes the minimal connecting subgraph, then removes the
    /// intermediate concepts it used so the next round has to find another
    /// path. Two paths with incomparable sets of intermediates make the
    /// query ambiguous.
    fn resolve_weak_components(
        &self,
        targets: &[BuildConcept],
        filter_downstream: bool,
        accept_partial: bool,
    ) -> Result<Option<Vec<Vec<Address>>>> {
        let target_set: BTreeSet<Address> = addresses(targets).into_iter().collect();
        let synonyms: BTreeSet<Address> = targets
            .iter()
            .flat_map(|t| t.pseudonyms.iter().cloned())
            .collect();
        let mut search_graph = self.graph.work_graph(|_, _, e| match e {
            GraphEdge::Binds { partial } => accept_partial || !partial,
            GraphEdge::Pseudonym => true,
            GraphEdge::Derives => false,
        });
        let mut found: Vec<WorkGraph> = Vec::new();
        let mut reduced_sets: Vec<BTreeSet<Address>> = Vec::new();
        for _ in 0..self.config.ambiguity_check_limit {
            let Some(g) = self.determine_induced_minimal_nodes(&search_graph, &target_set, filter_downstream) else {
                break;
            };
            let graph_concepts = g.concepts();
            let new: Vec<Address> = graph_concepts
                .iter()
                .filter(|c| !target_set.contains(*c))
                .cloned()
                .collect();
            reduced_sets.push(
                graph_concepts
                    .iter()
                    .filter(|c| !synonyms.contains(*c))
                    .cloned()
                    .collect(),
            );
            found.push(g);
            if new.is_empty() {
                break;
            }
            for n in &new {
                search_graph.remove(&GraphNode::concept(n));
            }
        }
        let Some(first) = found.into_iter().next() else {
            return Ok(None);
        };
        if reduced_sets.len() > 1 {
            let comparable = reduced_sets
                .iter()
                .any(|s| reduced_sets.iter().all(|o| s.is_subset(o)));
            if !comparable {
                let common: BTreeSet<Address> = reduced_sets
                    .iter()
                    .skip(1)
                    .fold(reduced_sets[0].clone(), |acc, s| acc.intersection(s).cloned().collect());
                let parents: Vec<Vec<String>> = reduced_sets
                    .iter()
                    .map(|s| s.difference(&common).cloned().collect())
                    .collect();
                return Err(Error::AmbiguousRelationshipResolution {
                    message: format!(
                        "Multiple possible join paths found for {}; add a merge or select the path concepts explicitly",
                        target_set.iter().cloned().collect::<Vec<_>>().join(", ")
                    ),
                    parents,
                });
            }
        }

        let mut subgraphs: Vec<(String, BTreeSet<Address>)> = first
            .datasources()
            .into_iter()
            .map(|ds| {
                let concepts = first.concept_neighbors(&ds);
                (ds, concepts)
            })
            .filter(|(_, c)| !c.is_empty())
            .collect();
        let snapshot = subgraphs.clone();
        subgraphs.retain(|(id, concepts)| {
            !snapshot.iter().any(|(other, other_concepts)| {
                other != id
                    && concepts.is_subset(other_concepts)
                    && (concepts != other_concepts || other < id)
            })
        });
        if subgraphs
            .iter()
            .any(|(_, concepts)| target_set.is_subset(concepts))
        {
            return Ok(None);
        }
        Ok(Some(
            subgraphs
                .into_iter()
                .map(|(_, concepts)| concepts.into_iter().collect())
                .collect(),
        ))
    }

    /// The smallest subgraph of datasources and concepts connecting every
    /// target, or `None` when they cannot be connected.
    fn determine_induced_minimal_nodes(
        &self,
        search_graph: &WorkGraph,
        targets: &BTreeSet<Address>,
        filter_downstream: bool,
    ) -> Option<WorkGraph> {
        let mut h = search_graph.clone();
        h.retain(|node| {
            let Some(address) = node.as_concept() else {
                return true;
            };
            if targets.contains(address) {
                return true;
            }
            let Some(concept) = self.env.get(address) else {
                return true;
            };
            if matches!(
                concept.derivation,
                Derivation::Constant | Derivation::Aggregate | Derivation::Filter
            ) {
                return false;
            }
            !(filter_downstream && concept.derivation != Derivation::Root)
        });
        prune_leaves(&mut h, targets);
        let terminals: Vec<GraphNode> = targets.iter().map(|a| GraphNode::concept(a)).collect();
        let tree = match h.steiner_tree(&terminals) {
            Ok(tree) => tree,
            Err(e) => {
                log::debug!("no connecting subgraph: {}", e);
                return None;
            }
        };
        let mut final_graph = h.induced(&tree);
        // Every concept needs a datasource to read it from.
        for address in final_graph.concepts() {
            if !final_graph.datasource_neighbors(&address).is_empty() {
                continue;
            }
            let node = GraphNode::concept(&address);
            let via = h.datasource_neighbors(&address).into_iter().next().or_else(|| {
                h.neighbors(&node)
                    .into_iter()
                    .filter_map(|n| n.as_concept().map(str::to_string))
                    .find_map(|p| final_graph.datasource_neighbors(&p).into_iter().next())
            });
            let ds = via?;
            let ds_node = GraphNode::datasource(&ds);
            let edge = h
                .edge(&ds_node, &node)
                .unwrap_or(GraphEdge::Binds { partial: false });
            final_graph.add_edge(&ds_node, &node, edge);
        }
        // Reinject keys shared by datasources on the path.
        let datasources = final_graph.datasources();
        for ds in &datasources {
            for c in h.concept_neighbors(ds) {
                let holders = h
                    .datasource_neighbors(&c)
                    .iter()
                    .filter(|d| datasources.contains(*d))
                    .count();
                if holders > 1 && final_graph.contains(&GraphNode::concept(&c)) {
                    let ds_node = GraphNode::datasource(ds);
                    let c_node = GraphNode::concept(&c);
                    if let Some(edge) = h.edge(&ds_node, &c_node) {
                        final_graph.add_edge(&ds_node, &c_node, edge);
                    }
                }
            }
        }
        if final_graph
            .concepts()
            .iter()
            .any(|c| final_graph.datasource_neighbors(c).is_empty())
        {
            return None;
        }
        Some(final_graph)
    }
}

/// Drop non-target nodes with at most one neighbor until none are left.
fn prune_leaves(g: &mut WorkGraph, targets: &BTreeSet<Address>) {
    loop {
        let leaves: Vec<GraphNode> = g
            .nodes()
            .filter(|n| !n.as_concept().is_some_and(|a| targets.contains(a)))
            .filter(|n| g.neighbors(n).len() <= 1)
            .cloned()
            .collect();
        if leaves.is_empty() {
            return;
        }
        for leaf in leaves {
            g.remove(&leaf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::model::{Concept, DataType, Datasource, DatasourceAddress, Factory, Grain};
    use crate::processing::SearchConfig;

    fn table(name: &str, columns: &[&str], grain: &[&str]) -> Datasource {
        columns
            .iter()
            .fold(Datasource::new(name, DatasourceAddress::table(name)), |ds, c| ds.column(c, c))
            .with_grain(grain)
    }

    fn ambiguous() -> Environment {
        let mut env = Environment::new();
        for key in ["order_id", "customer_id", "store_id", "customer_region_key", "store_region_key"] {
            env.add_concept(Concept::key(key, DataType::Integer)).unwrap();
        }
        env.add_concept(Concept::key("region_name", DataType::String)).unwrap();
        env.add_datasource(table("orders", &["order_id", "customer_id", "store_id"], &["order_id"]))
            .unwrap();
        env.add_datasource(table("customers", &["customer_id", "customer_region_key"], &["customer_id"]))
            .unwrap();
        env.add_datasource(table("stores", &["store_id", "store_region_key"], &["store_id"]))
            .unwrap();
        env.add_datasource(table(
            "regions_c",
            &["customer_region_key", "region_name"],
            &["customer_region_key"],
        ))
        .unwrap();
        env.add_datasource(table("regions_s", &["store_region_key", "region_name"], &["store_region_key"]))
            .unwrap();
        env
    }

    #[test]
    fn test_incomparable_paths_are_ambiguous() {
        let env = ambiguous();
        let built = Factory::new(&env, Grain::default()).build_environment().unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&["local.order_id".to_string(), "local.region_name".to_string()])
            .unwrap();
        let err = searcher.gen_merge_node(&targets, 0, false, None).unwrap_err();
        match err {
            Error::AmbiguousRelationshipResolution { parents, .. } => {
                assert_eq!(parents.len(), 2);
                assert!(parents.iter().any(|p| p.contains(&"local.customer_id".to_string())));
                assert!(parents.iter().any(|p| p.contains(&"local.store_id".to_string())));
            }
            other => panic!("expected ambiguity, got {other}"),
        }
    }

    #[test]
    fn test_single_path_merges() {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::key("customer_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("customer_name", DataType::String, &["customer_id"]))
            .unwrap();
        env.add_datasource(table("orders", &["order_id", "customer_id"], &["order_id"]))
            .unwrap();
        env.add_datasource(table("customers", &["customer_id", "customer_name"], &["customer_id"]))
            .unwrap();
        let built = Factory::new(&env, Grain::default()).build_environment().unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&["local.order_id".to_string(), "local.customer_name".to_string()])
            .unwrap();
        let node = searcher.gen_merge_node(&targets, 0, false, None).unwrap().unwrap();
        assert_eq!(node.parents.len(), 2);
        let resolved = node.resolve(&built).unwrap();
        assert_eq!(resolved.joins.len(), 1);
    }
}
