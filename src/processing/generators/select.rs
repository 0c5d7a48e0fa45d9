//! Direct reads from datasources.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::graph::{GraphEdge, GraphNode, WorkGraph};
use crate::model::{Address, BuildConcept, BuildDatasource, Derivation, Grain, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::StrategyNode;
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

/// Ranking of a datasource for a set of targets; lower is better.
type Score = (u8, usize, u8, usize, String);

impl Searcher<'_> {
    pub(crate) fn datasource(&self, identifier: &str) -> Option<&BuildDatasource> {
        self.env
            .datasources
            .values()
            .find(|ds| ds.identifier == identifier)
    }

    /// Read every target from one datasource, or from several datasources
    /// bound to each other through shared columns.
    pub(crate) fn gen_select_node(
        &mut self,
        targets: &[BuildConcept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let (constants, rest): (Vec<BuildConcept>, Vec<BuildConcept>) = targets
            .iter()
            .cloned()
            .partition(|c| c.derivation == Derivation::Constant);
        if rest.is_empty() {
            return Ok(Some(StrategyNode::constant(constants).with_depth(depth)));
        }
        if let Some(missing) = rest
            .iter()
            .find(|c| !self.env.materialized_concepts.contains(&c.address))
        {
            log::debug!(
                "{}[GEN_SELECT_NODE] {} is not materialized",
                padding(depth),
                missing.address
            );
            return Ok(None);
        }
        let passes: &[bool] = if accept_partial { &[false, true] } else { &[false] };
        for &partial in passes {
            if let Some(node) = self.select_from_bindings(&rest, &constants, depth, partial, conditions)? {
                return Ok(Some(node));
            }
        }
        log::debug!(
            "{}[GEN_SELECT_NODE] no datasource combination for {}",
            padding(depth),
            addresses(&rest).join(", ")
        );
        Ok(None)
    }

    fn binding_graph_for(&self, targets: &[BuildConcept], accept_partial: bool, conditions: Option<&WhereClause>) -> WorkGraph {
        let mut g = self.graph.work_graph(|a, b, e| match e {
            GraphEdge::Binds { partial: false } => true,
            GraphEdge::Binds { partial: true } => {
                accept_partial
                    || [a, b].iter().filter_map(|n| n.as_datasource()).any(|id| {
                        self.datasource(id)
                            .is_some_and(|ds| ds.non_partial_for.is_some() && ds.non_partial_for.as_ref() == conditions)
                    })
            }
            _ => false,
        });
        // Targets bound only through a pseudonym read from the pseudonym's
        // datasources.
        for t in targets {
            let node = GraphNode::concept(&t.address);
            for pseudonym in &t.pseudonyms {
                for ds in g.datasource_neighbors(pseudonym) {
                    let ds_node = GraphNode::datasource(&ds);
                    if let Some(edge) = g.edge(&ds_node, &GraphNode::concept(pseudonym)) {
                        g.add_node(node.clone());
                        g.add_edge(&ds_node, &node, edge);
                    }
                }
            }
        }
        g
    }

    fn score(&self, ds: &BuildDatasource, targets: &[BuildConcept], grain: &Grain) -> Score {
        let in_grain = ds
            .grain
            .components
            .iter()
            .filter(|c| targets.iter().any(|t| t.matches(c)))
            .count();
        (
            u8::from(ds.address.is_query()),
            ds.grain.components.len().saturating_sub(in_grain),
            u8::from(ds.grain != *grain),
            ds.columns.len(),
            ds.identifier.clone(),
        )
    }

    fn select_from_bindings(
        &mut self,
        targets: &[BuildConcept],
        constants: &[BuildConcept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let g = self.binding_graph_for(targets, accept_partial, conditions);
        let refs: Vec<&BuildConcept> = targets.iter().collect();
        let target_grain = self.env.grain_of(&refs);

        let relevant: BTreeSet<String> = targets
            .iter()
            .flat_map(|t| g.datasource_neighbors(&t.address))
            .collect();
        if relevant.is_empty() {
            return Ok(None);
        }
        let target_addresses: BTreeSet<Address> = addresses(targets).into_iter().collect();
        let covers = |ds: &str| -> BTreeSet<Address> {
            g.concept_neighbors(ds)
                .into_iter()
                .filter(|c| target_addresses.contains(c))
                .collect()
        };

        // One datasource with everything wins outright.
        let mut complete: Vec<(Score, &BuildDatasource)> = relevant
            .iter()
            .filter(|ds| covers(ds).len() == target_addresses.len())
            .filter_map(|ds| self.datasource(ds))
            .map(|ds| (self.score(ds, targets, &target_grain), ds))
            .collect();
        complete.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some((_, ds)) = complete.first() {
            let ds = (*ds).clone();
            let node = self.create_select_node(&ds, targets, constants, depth, accept_partial, conditions);
            return Ok(Some(node));
        }

        // Otherwise join relevant datasources on the columns they share.
        let mut shared: BTreeSet<Address> = BTreeSet::new();
        for c in relevant.iter().flat_map(|ds| g.concept_neighbors(ds)) {
            let holders = g
                .datasource_neighbors(&c)
                .intersection(&relevant)
                .count();
            if holders > 1 {
                shared.insert(c);
            }
        }
        let nodes: BTreeSet<GraphNode> = relevant
            .iter()
            .map(|d| GraphNode::datasource(d))
            .chain(target_addresses.iter().map(|a| GraphNode::concept(a)))
            .chain(shared.iter().map(|a| GraphNode::concept(a)))
            .collect();
        let sub = g.induced(&nodes);
        let Some(component) = sub.connected_components().into_iter().find(|comp| {
            target_addresses
                .iter()
                .all(|a| comp.contains(&GraphNode::concept(a)))
        }) else {
            return Ok(None);
        };
        let in_component: BTreeSet<Address> = component
            .iter()
            .filter_map(|n| n.as_concept().map(str::to_string))
            .collect();
        let mut chosen: Vec<(String, BTreeSet<Address>)> = component
            .iter()
            .filter_map(|n| n.as_datasource())
            .map(|ds| {
                let concepts = sub
                    .concept_neighbors(ds)
                    .into_iter()
                    .filter(|c| in_component.contains(c))
                    .collect();
                (ds.to_string(), concepts)
            })
            .collect();
        self.drop_covered_datasources(&mut chosen, targets, &target_grain);
        let covered: BTreeSet<&Address> = chosen.iter().flat_map(|(_, c)| c.iter()).collect();
        if !target_addresses.iter().all(|a| covered.contains(a)) {
            return Ok(None);
        }

        let mut parents = Vec::new();
        for (id, concepts) in &chosen {
            let Some(ds) = self.datasource(id).cloned() else {
                continue;
            };
            let wanted: Vec<BuildConcept> = concepts
                .iter()
                .filter_map(|a| {
                    targets
                        .iter()
                        .find(|t| &t.address == a)
                        .cloned()
                        .or_else(|| self.env.get(a).cloned())
                })
                .collect();
            parents.push(self.create_select_node(&ds, &wanted, &[], depth + 1, accept_partial, conditions));
        }
        if !constants.is_empty() {
            parents.push(StrategyNode::constant(constants.to_vec()).with_depth(depth + 1));
        }
        let inputs = unique_concepts(parents.iter().flat_map(|p| p.usable_outputs()));
        let outputs: Vec<BuildConcept> = targets.iter().chain(constants.iter()).cloned().collect();
        log::info!(
            "{}[GEN_SELECT_NODE] joining {} datasources for {}",
            padding(depth),
            chosen.len(),
            addresses(targets).join(", ")
        );
        Ok(Some(
            StrategyNode::merge(inputs, outputs, parents).with_depth(depth),
        ))
    }

    /// Remove datasources whose concepts another chosen datasource already
    /// holds, keeping the better scored of equal sets.
    fn drop_covered_datasources(
        &self,
        chosen: &mut Vec<(String, BTreeSet<Address>)>,
        targets: &[BuildConcept],
        grain: &Grain,
    ) {
        let score = |id: &str| self.datasource(id).map(|ds| self.score(ds, targets, grain));
        let snapshot = chosen.clone();
        chosen.retain(|(id, concepts)| {
            !snapshot.iter().any(|(other, other_concepts)| {
                if other == id || !concepts.is_subset(other_concepts) {
                    return false;
                }
                concepts != other_concepts || score(other) < score(id)
            })
        });
    }

    pub(crate) fn create_select_node(
        &self,
        ds: &BuildDatasource,
        targets: &[BuildConcept],
        constants: &[BuildConcept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&WhereClause>,
    ) -> StrategyNode {
        let partial_is_full = ds.non_partial_for.is_some() && ds.non_partial_for.as_ref() == conditions;
        let inputs: Vec<BuildConcept> = ds
            .columns
            .iter()
            .filter_map(|col| {
                targets
                    .iter()
                    .find(|t| t.matches(&col.concept))
                    .or_else(|| self.env.get(&col.concept))
                    .cloned()
            })
            .chain(constants.iter().cloned())
            .collect();
        let outputs: Vec<BuildConcept> = targets.iter().chain(constants.iter()).cloned().collect();
        let ds_partial = ds.partial_concepts();
        let ds_nullable = ds.nullable_concepts();
        let bound_as = |t: &BuildConcept, set: &BTreeSet<Address>| {
            set.contains(&t.address) || t.pseudonyms.iter().any(|p| set.contains(p))
        };
        let partial: BTreeSet<Address> = if partial_is_full {
            BTreeSet::new()
        } else {
            targets
                .iter()
                .filter(|t| bound_as(t, &ds_partial))
                .map(|t| t.address.clone())
                .collect()
        };
        let nullable: BTreeSet<Address> = targets
            .iter()
            .filter(|t| bound_as(t, &ds_nullable))
            .map(|t| t.address.clone())
            .collect();
        let mut node = StrategyNode::new(
            crate::processing::NodeKind::Select {
                datasource: ds.clone(),
            },
            inputs,
            outputs.clone(),
            Vec::new(),
        )
        .with_grain(Some(ds.grain.clone()))
        .with_conditions(ds.where_clause.as_ref().map(|w| w.conditional.clone()))
        .with_partials(partial)
        .with_nullables(nullable)
        .with_depth(depth);
        node.preexisting_conditions = if partial_is_full {
            conditions.map(|c| c.conditional.clone())
        } else {
            None
        };
        let refs: Vec<&BuildConcept> = targets.iter().collect();
        let target_grain = self.env.grain_of(&refs);
        let force_group = ds.grain.is_abstract() || !ds.grain.is_subset(&target_grain);
        log::debug!(
            "{}[GEN_SELECT_NODE] {} from {} (partial allowed: {}, group: {})",
            padding(depth),
            addresses(targets).join(", "),
            ds.identifier,
            accept_partial,
            force_group
        );
        if !force_group {
            return node;
        }
        let partial = node.partial_concepts.clone();
        let preexisting = node.preexisting_conditions.clone();
        StrategyNode::group(outputs.clone(), outputs, vec![node])
            .with_force_group(Some(true))
            .with_partials(partial)
            .with_preexisting(preexisting)
            .with_depth(depth)
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Environment;
    use crate::model::{Concept, DataType, Datasource, DatasourceAddress, Factory, Grain};
    use crate::processing::{NodeKind, SearchConfig, Searcher};

    fn environment() -> Environment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::key("customer_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("customer_name", DataType::String, &["customer_id"]))
            .unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("order_id", "order_id")
                .column("customer_id", "customer_id")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        env.add_datasource(
            Datasource::new("customers", DatasourceAddress::table("customers"))
                .column("customer_id", "customer_id")
                .column("name", "customer_name")
                .with_grain(&["customer_id"]),
        )
        .unwrap();
        env
    }

    #[test]
    fn test_single_datasource_is_preferred() {
        let env = environment();
        let built = Factory::new(&env, Grain::default()).build_environment().unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&["local.customer_id".to_string(), "local.customer_name".to_string()])
            .unwrap();
        let node = searcher.gen_select_node(&targets, 0, false, None).unwrap().unwrap();
        match &node.kind {
            NodeKind::Select { datasource } => assert_eq!(datasource.identifier, "customers"),
            other => panic!("expected a select, got {}", other.name()),
        }
    }

    #[test]
    fn test_joined_datasources_merge() {
        let env = environment();
        let built = Factory::new(&env, Grain::default()).build_environment().unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&["local.order_id".to_string(), "local.customer_name".to_string()])
            .unwrap();
        let node = searcher.gen_select_node(&targets, 0, false, None).unwrap().unwrap();
        assert!(matches!(node.kind, NodeKind::Merge { .. }));
        assert_eq!(node.parents.len(), 2);
        let resolved = node.resolve(&built).unwrap();
        assert!(resolved.has_output("local.customer_name"));
    }

    #[test]
    fn test_unmaterialized_concepts_are_skipped() {
        let mut env = environment();
        env.add_concept(Concept::key("unbound", DataType::Integer)).unwrap();
        let built = Factory::new(&env, Grain::default()).build_environment().unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built.concepts_for(&["local.unbound".to_string()]).unwrap();
        assert!(searcher.gen_select_node(&targets, 0, false, None).unwrap().is_none());
    }
}
