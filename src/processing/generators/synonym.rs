//! Retrying a root search with merged synonyms swapped in.

use itertools::Itertools;

use crate::error::Result;
use crate::model::{BuildConcept, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::StrategyNode;
use crate::processing::search::Searcher;
use crate::processing::addresses;

const MAX_SYNONYM_COMBINATIONS: usize = 64;

impl Searcher<'_> {
    pub(crate) fn gen_synonym_node(
        &mut self,
        targets: &[BuildConcept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        if !self.history.start_synonyms(targets) {
            return Ok(None);
        }
        let options: Vec<Vec<BuildConcept>> = targets
            .iter()
            .map(|t| {
                std::iter::once(t.clone())
                    .chain(t.pseudonyms.iter().filter_map(|p| self.env.get(p).cloned()))
                    .collect()
            })
            .collect();
        if options.iter().all(|o| o.len() == 1) {
            return Ok(None);
        }
        let base = addresses(targets);
        for combination in options
            .into_iter()
            .multi_cartesian_product()
            .take(MAX_SYNONYM_COMBINATIONS)
        {
            if addresses(&combination) == base {
                continue;
            }
            log::info!(
                "{}[GEN_SYNONYM_NODE] trying {}",
                padding(depth),
                addresses(&combination).join(", ")
            );
            if let Some(node) = self.search_concepts(&combination, depth + 1, conditions, accept_partial)? {
                return Ok(Some(node));
            }
        }
        log::info!(
            "{}[GEN_SYNONYM_NODE] no synonym set resolves {}",
            padding(depth),
            base.join(", ")
        );
        Ok(None)
    }
}
