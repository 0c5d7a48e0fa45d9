//! Named sub-selects exposed as concepts.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::{Address, BuildConcept, Lineage, RowsetItem, WhereClause};
use crate::processing::join::{concept_to_relevant_joins, padding};
use crate::processing::nodes::{NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

fn rowset_item(concept: &BuildConcept) -> Option<&RowsetItem> {
    match &concept.lineage {
        Some(Lineage::Rowset(r)) => Some(r),
        _ => None,
    }
}

impl Searcher<'_> {
    pub(crate) fn gen_rowset_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let Some(item) = rowset_item(concept) else {
            return Ok(None);
        };
        let rowset = &item.rowset;
        log::info!(
            "{}[GEN_ROWSET_NODE] planning rowset {} for {}",
            padding(depth),
            rowset.name,
            concept.address
        );
        let inner = self.plan_select(&rowset.select)?;
        let inner_outputs: Vec<BuildConcept> = inner
            .output_concepts
            .iter()
            .filter(|c| !inner.hidden_concepts.contains(&c.address))
            .cloned()
            .collect();
        let filtered = rowset.select.where_clause.is_some();
        let base = StrategyNode::resolved(inner).with_depth(depth + 1);

        let members: Vec<BuildConcept> = std::iter::once(concept)
            .chain(optional.iter())
            .filter(|o| rowset_item(o).is_some_and(|r| r.rowset.name == rowset.name))
            .filter(|o| {
                rowset_item(o).is_some_and(|r| inner_outputs.iter().any(|i| i.address == r.content))
            })
            .cloned()
            .collect();
        let members = unique_concepts(members);
        let outputs = unique_concepts(members.iter().cloned().chain(inner_outputs.iter().cloned()));
        let mut node = StrategyNode::new(NodeKind::Rowset, inner_outputs.clone(), outputs, vec![base])
            .with_depth(depth);
        // A filtered rowset covers only part of each content concept.
        if filtered {
            node.add_partial_concepts(inner_outputs.iter().map(|c| c.address.clone()));
        }
        let wanted: BTreeSet<&Address> = members
            .iter()
            .map(|m| &m.address)
            .chain(optional.iter().map(|o| &o.address))
            .collect();
        let extra: Vec<Address> = inner_outputs
            .iter()
            .filter(|c| !wanted.contains(&c.address))
            .map(|c| c.address.clone())
            .collect();
        node.hide_output_concepts(&extra);

        let rest: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| !node.provides(&o.address))
            .cloned()
            .collect();
        if rest.is_empty() {
            return Ok(Some(node));
        }
        log::info!(
            "{}[GEN_ROWSET_NODE] enriching rowset {} with {}",
            padding(depth),
            rowset.name,
            addresses(&rest).join(", ")
        );
        let keys = concept_to_relevant_joins(&node.usable_outputs());
        let enriched = self.gen_enrichment_node(node, &keys, &rest, depth, conditions)?;
        Ok(Some(enriched))
    }
}
