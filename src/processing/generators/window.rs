//! Window functions.

use crate::error::Result;
use crate::model::{Address, BuildConcept, Lineage, WhereClause, WindowItem};
use crate::processing::join::padding;
use crate::processing::nodes::{NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

fn window_item(concept: &BuildConcept) -> Option<&WindowItem> {
    match &concept.lineage {
        Some(Lineage::Window(w)) => Some(w),
        _ => None,
    }
}

/// Windows partitioned and ordered the same way can share one CTE.
fn same_frame(a: &WindowItem, b: &WindowItem) -> bool {
    a.over == b.over && a.order_by == b.order_by
}

impl Searcher<'_> {
    pub(crate) fn gen_window_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let Some(window) = window_item(concept) else {
            return Ok(None);
        };
        let mut parent_addresses: Vec<Address> = concept.concept_arguments();
        let mut outputs = vec![concept.clone()];
        for other in optional {
            let Some(other_window) = window_item(other) else {
                continue;
            };
            if other.address != concept.address && same_frame(window, other_window) {
                for a in other.concept_arguments() {
                    if !parent_addresses.contains(&a) {
                        parent_addresses.push(a);
                    }
                }
                outputs.push(other.clone());
            }
        }
        let parents = self.env.concepts_for(&parent_addresses)?;
        log::info!(
            "{}[GEN_WINDOW_NODE] {} over {}",
            padding(depth),
            addresses(&outputs).join(", "),
            addresses(&parents).join(", ")
        );
        let Some(parent) = self.search_concepts(&parents, depth + 1, conditions, false)? else {
            log::info!(
                "{}[GEN_WINDOW_NODE] could not source window parents for {}",
                padding(depth),
                concept.address
            );
            return Ok(None);
        };
        let parent_grain = parent.resolve(self.env)?.grain;
        let preexisting = parent.preexisting_conditions.clone();
        let node_outputs = unique_concepts(parents.iter().cloned().chain(outputs.iter().cloned()));
        let node = StrategyNode::new(NodeKind::Window, parents.clone(), node_outputs, vec![parent])
            .with_preexisting(preexisting)
            .with_depth(depth);

        let rest: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| !node.provides(&o.address))
            .cloned()
            .collect();
        if rest.is_empty() {
            return Ok(Some(node));
        }
        let keys = if parent_grain.is_abstract() {
            parents
        } else {
            self.env
                .concepts_for(&parent_grain.components.iter().cloned().collect::<Vec<_>>())?
        };
        let enriched = self.gen_enrichment_node(node, &keys, &rest, depth, conditions)?;
        Ok(Some(enriched))
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Environment;
    use crate::model::{
        Concept, DataType, Datasource, DatasourceAddress, Factory, Grain, Lineage, OrderItem,
        SourceType, WindowItem, WindowType,
    };
    use crate::processing::{SearchConfig, Searcher};

    #[test]
    fn test_windows_sharing_a_frame_resolve_together() {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("amount", DataType::Float, &["order_id"]))
            .unwrap();
        for (name, window_type) in [("amount_rank", WindowType::Rank), ("amount_row", WindowType::RowNumber)] {
            let lineage = Lineage::Window(WindowItem {
                window_type,
                content: "local.order_id".into(),
                over: Vec::new(),
                order_by: vec![OrderItem::desc("amount")],
                index: None,
            });
            let c = Concept::derived(name, lineage, &env).unwrap();
            env.add_concept(c).unwrap();
        }
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("order_id", "order_id")
                .column("amount", "amount")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        let built = Factory::new(
            &env,
            Grain::new(["local.order_id".to_string()]),
        )
        .build_environment()
        .unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&[
                "local.order_id".to_string(),
                "local.amount_rank".to_string(),
                "local.amount_row".to_string(),
            ])
            .unwrap();
        let node = searcher.source_query_concepts(&targets, None).unwrap();
        let resolved = node.resolve(&built).unwrap();
        assert_eq!(resolved.source_type, SourceType::Window);
        assert!(resolved.has_output("local.amount_rank"));
        assert!(resolved.has_output("local.amount_row"));
    }
}
