//! Constants need no source.

use crate::error::Result;
use crate::model::{BuildConcept, Derivation, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::StrategyNode;
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

impl Searcher<'_> {
    pub(crate) fn gen_constant_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        _conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let outputs = unique_concepts(
            std::iter::once(concept.clone()).chain(
                optional
                    .iter()
                    .filter(|o| o.derivation == Derivation::Constant)
                    .cloned(),
            ),
        );
        log::info!(
            "{}[GEN_CONSTANT_NODE] {}",
            padding(depth),
            addresses(&outputs).join(", ")
        );
        Ok(Some(StrategyNode::constant(outputs).with_depth(depth)))
    }
}
