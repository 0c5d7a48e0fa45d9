//! `recurse_edge(parent, child)`: walk a self-referencing edge list to
//! the root of each child.

use crate::error::Result;
use crate::model::{BuildConcept, FunctionType, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::{NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

impl Searcher<'_> {
    pub(crate) fn gen_recursive_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let Some(function) = concept.function().filter(|f| f.operator == FunctionType::RecurseEdge) else {
            return Ok(None);
        };
        let edge = function.concept_arguments();
        let [parent_address, child_address] = edge.as_slice() else {
            return Ok(None);
        };
        let edge_concepts = self
            .env
            .concepts_for(&[parent_address.clone(), child_address.clone()])?;
        log::info!(
            "{}[GEN_RECURSIVE_NODE] {} walking {}",
            padding(depth),
            concept.address,
            addresses(&edge_concepts).join(" -> ")
        );
        // The walk needs every edge, so outer conditions apply afterwards.
        let Some(source) = self.search_concepts(&edge_concepts, depth + 1, None, false)? else {
            return Ok(None);
        };
        let outputs = unique_concepts(
            std::iter::once(concept.clone()).chain(edge_concepts.iter().cloned()),
        );
        let node = StrategyNode::new(NodeKind::Recursive, edge_concepts.clone(), outputs, vec![source])
            .with_depth(depth);
        let rest: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| !node.provides(&o.address))
            .cloned()
            .collect();
        if rest.is_empty() {
            return Ok(Some(node));
        }
        let child = self.env.concepts_for(std::slice::from_ref(child_address))?;
        let enriched = self.gen_enrichment_node(node, &child, &rest, depth, conditions)?;
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
    use crate::processing::{SearchConfig, Searcher};

    #[test]
    fn test_recursive_edge_resolves_to_walk() {
        let mut env = Environment::new();
        env.add_concept(Concept::key("node_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("parent_id", DataType::Integer, &["node_id"]))
            .unwrap();
        let root = Concept::derived(
            "root_id",
            Lineage::Function(Function::new(
                FunctionType::RecurseEdge,
                vec![concept("parent_id"), concept("node_id")],
            )),
            &env,
        )
        .unwrap();
        env.add_concept(root).unwrap();
        env.add_datasource(
            Datasource::new("tree", DatasourceAddress::table("tree"))
                .column("id", "node_id")
                .nullable_column("parent", "parent_id")
                .with_grain(&["node_id"]),
        )
        .unwrap();
        let built = Factory::new(&env, Grain::new(["local.node_id".to_string()]))
            .build_environment()
            .unwrap();
        let mut searcher = Searcher::new(&env, &built, SearchConfig::default());
        let targets = built
            .concepts_for(&["local.node_id".to_string(), "local.root_id".to_string()])
            .unwrap();
        let resolved = searcher
            .source_query_concepts(&targets, None)
            .unwrap()
            .resolve(&built)
            .unwrap();
        let walk = if resolved.source_type == SourceType::Recursive {
            resolved
        } else {
            resolved
                .datasources
                .iter()
                .find_map(|d| d.as_query().filter(|q| q.source_type == SourceType::Recursive).cloned())
                .expect("recursive parent")
        };
        assert!(walk.has_output("local.root_id"));
        assert!(walk.has_output("local.node_id"));
    }
}
