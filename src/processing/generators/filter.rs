//! Filtered concepts: `content ? condition`.

use crate::error::Result;
use crate::model::{Address, BuildConcept, FilterItem, Lineage, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::{NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, pseudonym_related, unique_concepts};

fn filter_item(concept: &BuildConcept) -> Option<&FilterItem> {
    match &concept.lineage {
        Some(Lineage::Filter(f)) => Some(f),
        _ => None,
    }
}

impl Searcher<'_> {
    /// When every other target shares the filter, the condition is pushed
    /// into the WHERE of this node. Otherwise the filtered value is computed
    /// row by row next to the unfiltered targets.
    pub(crate) fn gen_filter_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let Some(filter) = filter_item(concept) else {
            return Ok(None);
        };
        let mut row_parents: Vec<Address> = vec![filter.content.clone()];
        for a in filter.where_clause.row_arguments() {
            if !row_parents.contains(&a) {
                row_parents.push(a);
            }
        }
        let mut same_filter = vec![concept.clone()];
        let mut others = Vec::new();
        for o in optional {
            match filter_item(o) {
                Some(f) if f.where_clause == filter.where_clause && o.address != concept.address => {
                    if !row_parents.contains(&f.content) {
                        row_parents.push(f.content.clone());
                    }
                    same_filter.push(o.clone());
                }
                _ if pseudonym_related(o, concept) => {}
                _ => others.push(o.clone()),
            }
        }
        let parents = self.env.concepts_for(&row_parents)?;
        let where_clause = filter.where_clause.clone();

        if others.is_empty() {
            log::info!(
                "{}[GEN_FILTER_NODE] pushing {} into {}",
                padding(depth),
                where_clause,
                addresses(&same_filter).join(", ")
            );
            let Some(parent) = self.search_concepts(&parents, depth + 1, conditions, false)? else {
                return Ok(None);
            };
            let preexisting = parent.preexisting_conditions.clone();
            let outputs = unique_concepts(same_filter.iter().cloned().chain(parents.iter().cloned()));
            let mut node = StrategyNode::new(NodeKind::Filter, parents.clone(), outputs, vec![parent])
                .with_preexisting(preexisting)
                .with_conditions(Some(where_clause.conditional.clone()))
                .with_depth(depth);
            self.append_existence_check(&mut node, &where_clause, depth)?;
            let extra: Vec<Address> = parents
                .iter()
                .filter(|p| !optional.iter().any(|o| o.address == p.address))
                .map(|p| p.address.clone())
                .collect();
            node.hide_output_concepts(&extra);
            return Ok(Some(node));
        }

        // The unfiltered targets must keep their rows, so the filter becomes
        // a per-row expression instead of a WHERE.
        let with_others = unique_concepts(parents.iter().cloned().chain(others.iter().cloned()));
        log::info!(
            "{}[GEN_FILTER_NODE] evaluating {} row by row next to {}",
            padding(depth),
            concept.address,
            addresses(&others).join(", ")
        );
        let parent = match self.search_concepts(&with_others, depth + 1, conditions, false)? {
            Some(parent) => parent,
            None => match self.search_concepts(&parents, depth + 1, conditions, false)? {
                Some(parent) => parent,
                None => return Ok(None),
            },
        };
        let preexisting = parent.preexisting_conditions.clone();
        let inputs = parent.usable_outputs();
        let outputs = unique_concepts(inputs.iter().cloned().chain(same_filter.iter().cloned()));
        let mut node = StrategyNode::new(NodeKind::Filter, inputs, outputs, vec![parent])
            .with_preexisting(preexisting)
            .with_depth(depth);
        self.append_existence_check(&mut node, &where_clause, depth)?;
        let keep: Vec<&Address> = std::iter::once(&concept.address)
            .chain(optional.iter().map(|o| &o.address))
            .collect();
        let extra: Vec<Address> = node
            .usable_addresses()
            .into_iter()
            .filter(|a| !keep.contains(&a))
            .collect();
        node.hide_output_concepts(&extra);
        Ok(Some(node))
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Environment;
    use crate::model::{
        concept, lit, Concept, DataType, Datasource, DatasourceAddress, Factory, FilterItem, Grain,
        Lineage, WhereClause,
    };
    use crate::processing::{SearchConfig, Searcher};
    use crate::plan::QueryDatasource;

    fn environment() -> Environment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("status", DataType::String, &["order_id"]))
            .unwrap();
        let open = Concept::derived(
            "open_order_id",
            Lineage::Filter(FilterItem {
                content: "local.order_id".into(),
                where_clause: WhereClause::new(concept("status").eq(lit("open"))),
            }),
            &env,
        )
        .unwrap();
        env.add_concept(open).unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("order_id", "order_id")
                .column("status", "status")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        env
    }

    fn filter_node(qds: &QueryDatasource) -> Option<&QueryDatasource> {
        if qds.source_type == crate::model::SourceType::Filter {
            return Some(qds);
        }
        qds.datasources
            .iter()
            .filter_map(|d| d.as_query())
            .find_map(filter_node)
    }

    #[test]
    fn test_lone_filter_is_pushed_into_where() {
        let env = environment();
        let built = Factory::new(&env, Grain::new(["local.open_order_id".to_string()]))
            .build_environment()
            .unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built.concepts_for(&["local.open_order_id".to_string()]).unwrap();
        let resolved = searcher
            .source_query_concepts(&targets, None)
            .unwrap()
            .resolve(&built)
            .unwrap();
        let filter = filter_node(&resolved).expect("filter node");
        assert!(filter.condition.is_some());
    }

    #[test]
    fn test_filter_next_to_unfiltered_targets_keeps_rows() {
        let env = environment();
        let built = Factory::new(&env, Grain::new(["local.order_id".to_string()]))
            .build_environment()
            .unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&["local.order_id".to_string(), "local.open_order_id".to_string()])
            .unwrap();
        let resolved = searcher
            .source_query_concepts(&targets, None)
            .unwrap()
            .resolve(&built)
            .unwrap();
        let filter = filter_node(&resolved).expect("filter node");
        assert!(filter.condition.is_none());
        assert!(resolved.has_output("local.open_order_id"));
    }
}
