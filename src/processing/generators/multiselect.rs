//! Several selects full-joined on their aligned outputs.

use crate::error::Result;
use crate::model::concept::address_with_namespace;
use crate::model::{Address, BuildConcept, Grain, JoinType, Lineage, MultiSelectLineage, WhereClause};
use crate::processing::join::padding;
use crate::processing::nodes::{NodeJoin, NodeKind, StrategyNode};
use crate::processing::search::Searcher;
use crate::processing::{addresses, unique_concepts};

fn multiselect(concept: &BuildConcept) -> Option<&MultiSelectLineage> {
    match &concept.lineage {
        Some(Lineage::MultiSelect(m)) => Some(m),
        _ => None,
    }
}

impl Searcher<'_> {
    pub(crate) fn gen_multiselect_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        let Some(lineage) = multiselect(concept) else {
            return Ok(None);
        };
        let aligned_addresses: Vec<Address> = lineage.align.iter().map(|a| lineage.align_address(a)).collect();
        let aligned = self.env.concepts_for(&aligned_addresses)?;
        log::info!(
            "{}[GEN_MULTISELECT_NODE] {} selects aligned on {}",
            padding(depth),
            lineage.selects.len(),
            aligned_addresses.join(", ")
        );

        let mut parents = Vec::with_capacity(lineage.selects.len());
        for select in &lineage.selects {
            let inner = self.plan_select(select)?;
            let inner_outputs: Vec<BuildConcept> = inner
                .output_concepts
                .iter()
                .filter(|c| !inner.hidden_concepts.contains(&c.address))
                .cloned()
                .collect();
            let mut outputs = inner_outputs.clone();
            for item in &lineage.align {
                if item.concepts.iter().any(|c| inner_outputs.iter().any(|i| i.address == *c)) {
                    outputs.extend(self.env.get(&lineage.align_address(item)).cloned());
                }
            }
            for selected in &select.selection {
                if lineage.find_alignment(selected).is_some() {
                    continue;
                }
                let mapped = address_with_namespace(selected, &lineage.namespace);
                outputs.extend(self.env.get(&mapped).cloned());
            }
            let resolved = StrategyNode::resolved(inner).with_depth(depth + 2);
            let mut member = StrategyNode::new(
                NodeKind::Basic,
                inner_outputs.clone(),
                unique_concepts(outputs),
                vec![resolved],
            )
            .with_depth(depth + 1);
            member.hide_output_concepts(&addresses(&inner_outputs));
            parents.push(member);
        }

        let mut node_joins = Vec::new();
        for right in 1..parents.len() {
            node_joins.push(NodeJoin::new(
                0,
                right,
                aligned_addresses.clone(),
                JoinType::Full,
                &parents,
                true,
            )?);
        }
        let outputs = unique_concepts(parents.iter().flat_map(|p| p.usable_outputs()));
        let mut node = StrategyNode::new(
            NodeKind::Merge {
                node_joins: Some(node_joins),
            },
            outputs.clone(),
            outputs,
            parents,
        )
        .with_grain(Some(Grain::new(aligned_addresses.iter().cloned())))
        .with_depth(depth);
        if let Some(where_clause) = &lineage.where_clause {
            node.add_condition(where_clause.conditional.clone());
        }
        node.set_ordering(lineage.order_by.clone());
        node.limit = lineage.limit;

        let rest: Vec<BuildConcept> = optional
            .iter()
            .filter(|o| !node.provides(&o.address))
            .cloned()
            .collect();
        if rest.is_empty() || aligned.is_empty() {
            return Ok(Some(node));
        }
        let enriched = self.gen_enrichment_node(node, &aligned, &rest, depth, conditions)?;
        Ok(Some(enriched))
    }
}
