//! Array expansion.

use crate::error::Result;
use crate::model::{BuildConcept, Derivation, Granularity, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::{NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

impl Searcher<'_> {
    pub(crate) fn gen_unnest_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let arguments = self.env.concepts_for(&concept.concept_arguments())?;
        // Other unnests and single-row values are resolved elsewhere.
        let carried: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| o.derivation != Derivation::Unnest && o.granularity != Granularity::SingleRow)
            .cloned()
            .collect();
        let search = unique_concepts(arguments.iter().cloned().chain(carried.iter().cloned()));
        log::info!(
            "{}[GEN_UNNEST_NODE] {} from {}",
            padding(depth),
            concept.address,
            addresses(&search).join(", ")
        );
        let parent = if search.iter().all(|c| c.derivation == Derivation::Constant) {
            StrategyNode::constant(search.clone()).with_depth(depth + 1)
        } else {
            match self.search_concepts(&search, depth + 1, conditions, false)? {
                Some(parent) => parent,
                None => {
                    log::info!(
                        "{}[GEN_UNNEST_NODE] could not source arguments of {}",
                        padding(depth),
                        concept.address
                    );
                    return Ok(None);
                }
            }
        };
        let preexisting = parent.preexisting_conditions.clone();
        let inputs = parent.usable_outputs();
        let outputs = unique_concepts(inputs.iter().cloned().chain(std::iter::once(concept.clone())));
        let mut node = StrategyNode::new(
            NodeKind::Unnest {
                concept: concept.clone(),
            },
            inputs,
            outputs,
            vec![parent],
        )
        .with_preexisting(preexisting)
        .with_depth(depth);
        let extra: Vec<String> = arguments
            .iter()
            .filter(|a| !optional.iter().any(|o| o.address == a.address))
            .map(|a| a.address.clone())
            .collect();
        node.hide_output_concepts(&extra);
        Ok(Some(node))
    }
}
