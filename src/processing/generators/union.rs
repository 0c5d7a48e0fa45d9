//! `union(a, b, ...)`: rows of each argument stacked.

use crate::error::Result;
use crate::model::{Address, BuildConcept, FunctionType, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::{NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

fn union_arguments(concept: &BuildConcept) -> Option<Vec<Address>> {
    let function = concept.function()?;
    if function.operator != FunctionType::Union {
        return None;
    }
    Some(
        function
            .arguments
            .iter()
            .filter_map(|a| a.as_concept().map(str::to_string))
            .collect(),
    )
}

impl Searcher<'_> {
    pub(crate) fn gen_union_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let Some(arguments) = union_arguments(concept) else {
            return Ok(None);
        };
        // Unions of the same arity become extra columns of each member.
        let mut members: Vec<(BuildConcept, Vec<Address>)> = vec![(concept.clone(), arguments.clone())];
        for o in optional {
            if o.address == concept.address {
                continue;
            }
            if let Some(args) = union_arguments(o) {
                if args.len() == arguments.len() {
                    members.push((o.clone(), args));
                }
            }
        }
        let union_concepts: Vec<BuildConcept> = members.iter().map(|(c, _)| c.clone()).collect();
        log::info!(
            "{}[GEN_UNION_NODE] {} over {} members",
            padding(depth),
            addresses(&union_concepts).join(", "),
            arguments.len()
        );
        let mut parents = Vec::with_capacity(arguments.len());
        for i in 0..arguments.len() {
            let wanted: Vec<Address> = members.iter().map(|(_, args)| args[i].clone()).collect();
            let search = unique_concepts(self.env.concepts_for(&wanted)?);
            let Some(source) = self.search_concepts(&search, depth + 1, conditions, false)? else {
                log::info!(
                    "{}[GEN_UNION_NODE] could not source member {} of {}",
                    padding(depth),
                    i,
                    concept.address
                );
                return Ok(None);
            };
            let inputs = source.usable_outputs();
            let outputs = unique_concepts(inputs.iter().cloned().chain(union_concepts.iter().cloned()));
            let mut member = StrategyNode::new(NodeKind::Basic, inputs, outputs, vec![source]).with_depth(depth + 1);
            let extra: Vec<Address> = member
                .usable_addresses()
                .into_iter()
                .filter(|a| !union_concepts.iter().any(|u| u.address == *a))
                .collect();
            member.hide_output_concepts(&extra);
            parents.push(member);
        }
        let node = StrategyNode::new(NodeKind::Union, union_concepts.clone(), union_concepts, parents)
            .with_depth(depth);
        Ok(Some(node))
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Environment;
    use crate::model::{
        concept, Concept, DataType, Datasource, DatasourceAddress, Factory, Function, FunctionType, Grain,
        Lineage, SourceType,
    };
    use crate::processing::{SearchConfig, Searcher};

    #[test]
    fn test_union_stacks_each_argument() {
        let mut env = Environment::new();
        env.add_concept(Concept::key("store_order", DataType::Integer)).unwrap();
        env.add_concept(Concept::key("web_order", DataType::Integer)).unwrap();
        let all = Concept::derived(
            "any_order",
            Lineage::Function(Function::new(
                FunctionType::Union,
                vec![concept("store_order"), concept("web_order")],
            )),
            &env,
        )
        .unwrap();
        env.add_concept(all).unwrap();
        env.add_datasource(
            Datasource::new("store_orders", DatasourceAddress::table("store_orders"))
                .column("id", "store_order")
                .with_grain(&["store_order"]),
        )
        .unwrap();
        env.add_datasource(
            Datasource::new("web_orders", DatasourceAddress::table("web_orders"))
                .column("id", "web_order")
                .with_grain(&["web_order"]),
        )
        .unwrap();
        let built = Factory::new(&env, Grain::new(["local.any_order".to_string()]))
            .build_environment()
            .unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built.concepts_for(&["local.any_order".to_string()]).unwrap();
        let node = searcher.source_query_concepts(&targets, None).unwrap();
        let resolved = node.resolve(&built).unwrap();
        let union = if resolved.source_type == SourceType::Union {
            resolved
        } else {
            resolved
                .datasources
                .iter()
                .find_map(|d| d.as_query().cloned())
                .expect("union parent")
        };
        assert_eq!(union.source_type, SourceType::Union);
        assert_eq!(union.datasources.len(), 2);
    }
}
