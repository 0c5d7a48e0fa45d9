//! Aggregates.

use crate::error::Result;
use crate::model::{Address, BuildConcept, Derivation, Purpose, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::StrategyNode;
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

impl Searcher<'_> {
    /// Concepts an aggregate has to be computed from: its arguments, the
    /// keys that give property arguments their row count, and its grain.
    pub(crate) fn aggregate_parents(&self, concept: &BuildConcept) -> Result<Vec<BuildConcept>> {
        let mut wanted: Vec<Address> = concept.concept_arguments();
        for arg in concept.concept_arguments() {
            let Some(c) = self.env.get(&arg) else {
                continue;
            };
            if c.purpose == Purpose::Key || c.derivation == Derivation::Constant {
                continue;
            }
            if let Some(keys) = &c.keys {
                wanted.extend(keys.iter().cloned());
            }
        }
        if !concept.grain.is_abstract() {
            wanted.extend(concept.grain.components.iter().cloned());
        }
        let concepts = self.env.concepts_for(&wanted)?;
        Ok(unique_concepts(
            concepts
                .into_iter()
                .filter(|c| c.derivation != Derivation::Constant),
        ))
    }

    pub(crate) fn gen_group_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let mut parents = self.aggregate_parents(concept)?;
        let mut outputs = vec![concept.clone()];
        let grain_components = if concept.grain.is_abstract() {
            Vec::new()
        } else {
            self.env
                .concepts_for(&concept.grain.components.iter().cloned().collect::<Vec<_>>())?
        };
        outputs.extend(grain_components.iter().cloned());
        // Aggregates at the same grain share the grouping.
        for other in optional {
            if other.derivation == Derivation::Aggregate
                && other.grain == concept.grain
                && other.address != concept.address
            {
                parents.extend(self.aggregate_parents(other)?);
                outputs.push(other.clone());
            }
        }
        let parents = unique_concepts(parents);

        let parent = if parents.is_empty() {
            let constants: Vec<BuildConcept> = self.env.concepts_for(&concept.concept_arguments())?;
            StrategyNode::constant(constants).with_depth(depth + 1)
        } else {
            let Some(parent) = self.search_concepts(&parents, depth + 1, conditions, false)? else {
                log::info!(
                    "{}[GEN_GROUP_NODE] could not source parents {} for {}",
                    padding(depth),
                    addresses(&parents).join(", "),
                    concept.address
                );
                return Ok(None);
            };
            parent
        };
        log::info!(
            "{}[GEN_GROUP_NODE] {} over {} at {}",
            padding(depth),
            addresses(&outputs).join(", "),
            addresses(&parents).join(", "),
            concept.grain
        );
        let inputs = if parents.is_empty() {
            parent.usable_outputs()
        } else {
            parents
        };
        let preexisting = parent.preexisting_conditions.clone();
        let node = StrategyNode::group(inputs, outputs, vec![parent])
            .with_preexisting(preexisting)
            .with_depth(depth);
        let rest: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| !node.provides(&o.address))
            .cloned()
            .collect();
        if rest.is_empty() || grain_components.is_empty() {
            return Ok(Some(node));
        }
        let enriched = self.gen_enrichment_node(node, &grain_components, &rest, depth, conditions)?;
        Ok(Some(enriched))
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Environment;
    use crate::model::{
        concept, Concept, DataType, Datasource, DatasourceAddress, Factory, Function, FunctionType, Grain,
        SourceType,
    };
    use crate::plan::QueryDatasource;
    use crate::processing::{SearchConfig, Searcher};

    fn environment() -> Environment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::key("customer_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("revenue", DataType::Float, &["order_id"]))
            .unwrap();
        let sum = Function::new(FunctionType::Sum, vec![concept("revenue")]);
        let metric = Concept::metric("total_revenue", sum, &[], &env).unwrap();
        env.add_concept(metric).unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("order_id", "order_id")
                .column("customer_id", "customer_id")
                .column("revenue", "revenue")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        env
    }

    fn resolve(grain: Grain, targets: &[&str]) -> QueryDatasource {
        let env = environment();
        let built = Factory::new(&env, grain).build_environment().unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&targets.iter().map(|t| t.to_string()).collect::<Vec<_>>())
            .unwrap();
        let node = searcher.source_query_concepts(&targets, None).unwrap();
        node.resolve(&built).unwrap()
    }

    #[test]
    fn test_aggregate_groups_to_statement_grain() {
        let qds = resolve(
            Grain::new(["local.customer_id".to_string()]),
            &["local.customer_id", "local.total_revenue"],
        );
        assert_eq!(qds.source_type, SourceType::Group);
        assert_eq!(qds.grain, Grain::new(["local.customer_id".to_string()]));
    }

    #[test]
    fn test_property_arguments_keep_their_keys() {
        let qds = resolve(
            Grain::new(["local.customer_id".to_string()]),
            &["local.customer_id", "local.total_revenue"],
        );
        let parent = qds
            .datasources
            .iter()
            .find_map(|d| d.as_query())
            .expect("grouped over a parent query");
        assert!(parent.has_output("local.order_id"));
    }
}
