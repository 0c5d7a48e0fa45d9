//! Attaching extra targets to an already built node through its keys.

use crate::error::Result;
use crate::model::{BuildConcept, Granularity, JoinType, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::{NodeJoin, NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

use super::{missing_from, shared_preexisting};

impl Searcher<'_> {
    /// Left join the `optional` targets `base` lacks onto it by `join_keys`.
    ///
    /// Returns `base` unchanged when there is nothing to add or the extras
    /// cannot be sourced; the search keeps looking for them elsewhere.
    pub(crate) fn gen_enrichment_node(
        &mut self,
        base: StrategyNode,
        join_keys: &[BuildConcept],
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<StrategyNode> {
        let missing: Vec<BuildConcept> = missing_from(&base, optional)
            .into_iter()
            .filter(|m| m.granularity != Granularity::SingleRow)
            .collect();
        if missing.is_empty() {
            return Ok(base);
        }
        let keys: Vec<BuildConcept> = join_keys
            .iter()
            .filter(|k| base.provides(&k.address))
            .cloned()
            .collect();
        if keys.is_empty() {
            log::debug!(
                "{}[GEN_ENRICHMENT_NODE] no join keys on {} for {}",
                padding(depth),
                base,
                addresses(&missing).join(", ")
            );
            return Ok(base);
        }
        let search = unique_concepts(keys.iter().chain(missing.iter()).cloned());
        let Some(enrich) = self.search_concepts(&search, depth + 1, conditions, false)? else {
            log::info!(
                "{}[GEN_ENRICHMENT_NODE] could not source {} by {}",
                padding(depth),
                addresses(&missing).join(", "),
                addresses(&keys).join(", ")
            );
            return Ok(base);
        };
        log::info!(
            "{}[GEN_ENRICHMENT_NODE] enriching {} with {} on {}",
            padding(depth),
            base,
            addresses(&missing).join(", "),
            addresses(&keys).join(", ")
        );
        let mut parents = vec![base, enrich];
        let join = match NodeJoin::new(0, 1, addresses(&keys), JoinType::LeftOuter, &parents, true) {
            Ok(join) => join,
            Err(e) => {
                log::debug!("{}[GEN_ENRICHMENT_NODE] {}", padding(depth), e);
                return Ok(parents.swap_remove(0));
            }
        };
        let inputs = unique_concepts(parents.iter().flat_map(|p| p.usable_outputs()));
        let preexisting = shared_preexisting(&parents);
        let mut node = StrategyNode::new(
            NodeKind::Merge {
                node_joins: Some(vec![join]),
            },
            inputs.clone(),
            inputs,
            parents,
        )
        .with_depth(depth);
        node.preexisting_conditions = preexisting;
        Ok(node)
    }
}
