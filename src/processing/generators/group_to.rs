//! `group(content, keys...)`: a value reduced to the grain of its keys.

use crate::error::Result;
use crate::model::{Address, BuildConcept, Expr, Grain, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::StrategyNode;
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

impl Searcher<'_> {
    pub(crate) fn gen_group_to_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let Some(function) = concept.function() else {
            return Ok(None);
        };
        let by: Vec<Address> = function
            .arguments
            .iter()
            .skip(1)
            .flat_map(Expr::concept_arguments)
            .collect();
        let parents = self.env.concepts_for(&concept.concept_arguments())?;
        log::info!(
            "{}[GEN_GROUP_TO_NODE] {} grouped to {}",
            padding(depth),
            concept.address,
            by.join(", ")
        );
        let Some(parent) = self.search_concepts(&parents, depth + 1, conditions, false)? else {
            log::info!(
                "{}[GEN_GROUP_TO_NODE] could not source {}",
                padding(depth),
                addresses(&parents).join(", ")
            );
            return Ok(None);
        };
        let preexisting = parent.preexisting_conditions.clone();
        let outputs = unique_concepts(parents.iter().cloned().chain(std::iter::once(concept.clone())));
        let mut node = StrategyNode::group(parents.clone(), outputs, vec![parent])
            .with_grain(Some(Grain::new(by.iter().cloned())))
            .with_preexisting(preexisting)
            .with_depth(depth);
        // The grouped content is only an input.
        let content: Vec<Address> = parents
            .iter()
            .filter(|p| !by.contains(&p.address) && !optional.iter().any(|o| o.address == p.address))
            .map(|p| p.address.clone())
            .collect();
        node.remove_output_concepts(&content);
        let rest: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| !node.provides(&o.address))
            .cloned()
            .collect();
        if rest.is_empty() || by.is_empty() {
            return Ok(Some(node));
        }
        let keys = self.env.concepts_for(&by)?;
        let enriched = self.gen_enrichment_node(node, &keys, &rest, depth, conditions)?;
        Ok(Some(enriched))
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Environment;
    use crate::model::{
        concept, Concept, DataType, Datasource, DatasourceAddress, Factory, Function, FunctionType, Grain,
        Lineage, SourceType,
    };
    use crate::plan::{QueryDatasource, SourceRef};
    use crate::processing::{SearchConfig, Searcher};

    #[test]
    fn test_group_to_keys_groups_by_them() {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::key("customer_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("region", DataType::String, &["customer_id"]))
            .unwrap();
        let grouped = Concept::derived(
            "customer_region",
            Lineage::Function(Function::new(
                FunctionType::Group,
                vec![concept("region"), concept("customer_id")],
            )),
            &env,
        )
        .unwrap();
        env.add_concept(grouped).unwrap();
        env.add_datasource(
            Datasource::new("customer_orders", DatasourceAddress::table("customer_orders"))
                .column("order_id", "order_id")
                .column("customer_id", "customer_id")
                .column("region", "region")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        let built = Factory::new(&env, Grain::new(["local.customer_id".to_string()]))
            .build_environment()
            .unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&["local.customer_id".to_string(), "local.customer_region".to_string()])
            .unwrap();
        let resolved = searcher
            .source_query_concepts(&targets, None)
            .unwrap()
            .resolve(&built)
            .unwrap();
        // The group runs beneath the select that projects the targets.
        fn has_group(q: &QueryDatasource) -> bool {
            q.source_type == SourceType::Group
                || q.datasources
                    .iter()
                    .any(|d| matches!(d, SourceRef::Query(inner) if has_group(inner)))
        }
        assert!(has_group(&resolved), "{:#?}", resolved.source_type);
        assert!(resolved.has_output("local.customer_region"));
    }
}
