//! Row-level derivations computed on top of their arguments.

use crate::error::Result;
use crate::model::{Address, BuildConcept, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::StrategyNode;
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

impl Searcher<'_> {
    pub(crate) fn gen_basic_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let parent_concepts = self.env.concepts_for(&concept.concept_arguments())?;
        let equivalent: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| o.address != concept.address && o.lineage.is_some() && o.lineage == concept.lineage)
            .cloned()
            .collect();
        let non_equivalent: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| {
                !equivalent.iter().any(|e| e.address == o.address || e.pseudonyms.contains(&o.address))
            })
            .cloned()
            .collect();
        let search = unique_concepts(parent_concepts.iter().chain(non_equivalent.iter()).cloned());
        log::info!(
            "{}[GEN_BASIC_NODE] {} from {}",
            padding(depth),
            concept.address,
            addresses(&search).join(", ")
        );
        let Some(mut node) = self.search_concepts(&search, depth + 1, conditions, false)? else {
            log::info!(
                "{}[GEN_BASIC_NODE] could not source parents of {}",
                padding(depth),
                concept.address
            );
            return Ok(None);
        };
        node.add_output_concept(concept.clone());
        for e in equivalent {
            node.add_output_concept(e);
        }
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
        concept, lit, Concept, DataType, Datasource, DatasourceAddress, Factory, Function, FunctionType,
        Grain, Lineage, SourceType,
    };
    use crate::processing::{SearchConfig, Searcher};

    #[test]
    fn test_derived_value_rides_on_its_source() {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        let doubled = Concept::derived(
            "doubled",
            Lineage::Function(Function::new(
                FunctionType::Multiply,
                vec![concept("order_id"), lit(2)],
            )),
            &env,
        )
        .unwrap();
        env.add_concept(doubled).unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("order_id", "order_id")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        let built = Factory::new(&env, Grain::new(["local.order_id".to_string()]))
            .build_environment()
            .unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built.concepts_for(&["local.doubled".to_string()]).unwrap();
        let node = searcher.source_query_concepts(&targets, None).unwrap();
        let resolved = node.resolve(&built).unwrap();
        assert!(resolved.has_output("local.doubled"));
        // A bare derivation is returned at its own grain, so distinct values.
        assert_eq!(resolved.source_type, SourceType::Group);
        assert!(!resolved.has_output("local.order_id"));
    }
}
