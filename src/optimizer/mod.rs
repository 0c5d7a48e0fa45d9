//! CTE rewrite rules.
//!
//! Lowering produces one CTE per resolved node. The rules here remove the
//! layers that add nothing: columns nobody reads, table reads with a single
//! consumer, filters that can sit inside the aggregate reading them, and
//! constants that can be written as literals. Every rule is optional; with
//! all of them disabled the SQL is longer but returns the same rows.
//!
//! Rules run in a fixed order, repeatedly, until a pass changes nothing or
//! the pass limit is reached. The last CTE in the list is the query root and
//! keeps its shape.

mod hide_unused;
mod inline_aggregate_filter;
mod inline_constant;
mod inline_datasource;
mod predicate_pushdown;

use std::collections::BTreeSet;

pub use hide_unused::HideUnusedConcepts;
pub use inline_aggregate_filter::InlineAggregateFilter;
pub use inline_constant::InlineConstant;
pub use inline_datasource::InlineDatasource;
pub use predicate_pushdown::PredicatePushdown;

use crate::config::OptimizationSettings;
use crate::error::Result;
use crate::plan::{Cte, CteKind, Join};

/// A rewrite over the whole CTE list. Returns whether anything changed.
pub trait OptimizationRule {
    fn name(&self) -> &'static str;

    fn optimize(&self, ctes: &mut Vec<Cte>) -> Result<bool>;
}

/// The enabled rules, in application order.
pub fn rules_for(settings: &OptimizationSettings) -> Vec<Box<dyn OptimizationRule>> {
    let mut rules: Vec<Box<dyn OptimizationRule>> = Vec::new();
    if !settings.enabled {
        return rules;
    }
    if settings.constant_inlining {
        rules.push(Box::new(InlineConstant));
    }
    if settings.predicate_pushdown {
        rules.push(Box::new(PredicatePushdown));
    }
    if settings.inline_aggregate_filter {
        rules.push(Box::new(InlineAggregateFilter));
    }
    if settings.inline_datasource {
        rules.push(Box::new(InlineDatasource));
    }
    if settings.hide_unused_concepts {
        rules.push(Box::new(HideUnusedConcepts));
    }
    rules
}

/// Run the enabled rules to a fixpoint, then drop CTEs the root no longer
/// reaches.
pub fn optimize_ctes(mut ctes: Vec<Cte>, settings: &OptimizationSettings) -> Result<Vec<Cte>> {
    let rules = rules_for(settings);
    if rules.is_empty() {
        return Ok(ctes);
    }
    for pass in 0..settings.max_passes.max(1) {
        let mut changed = false;
        for rule in &rules {
            if rule.optimize(&mut ctes)? {
                log::debug!("[OPTIMIZER] pass {} applied {}", pass, rule.name());
                changed = true;
                prune_unreachable(&mut ctes);
            }
        }
        if !changed {
            log::debug!("[OPTIMIZER] fixpoint after {} passes", pass + 1);
            break;
        }
    }
    prune_unreachable(&mut ctes);
    Ok(ctes)
}

/// Every CTE that reads from `name`, including union members.
pub(crate) fn consumers<'a>(ctes: &'a [Cte], name: &str) -> Vec<&'a Cte> {
    let mut out = Vec::new();
    fn visit<'a>(cte: &'a Cte, name: &str, out: &mut Vec<&'a Cte>) {
        if cte.parent_ctes.iter().any(|p| p == name) {
            out.push(cte);
        }
        if let CteKind::Union { internal } = &cte.kind {
            for child in internal {
                visit(child, name, out);
            }
        }
    }
    for cte in ctes {
        visit(cte, name, &mut out);
    }
    out
}

/// Index of the single top-level consumer of `name`, if there is exactly
/// one and no union member reads it too.
pub(crate) fn sole_consumer(ctes: &[Cte], name: &str) -> Option<usize> {
    let all = consumers(ctes, name);
    if all.len() != 1 {
        return None;
    }
    ctes.iter().position(|c| c.parent_ctes.iter().any(|p| p == name))
}

fn prune_unreachable(ctes: &mut Vec<Cte>) {
    let Some(root) = ctes.last() else {
        return;
    };
    let mut reachable: BTreeSet<String> = BTreeSet::new();
    let mut queue: Vec<&Cte> = vec![root];
    let by_name = |name: &str| ctes.iter().find(|c| c.name == name);
    while let Some(cte) = queue.pop() {
        if !reachable.insert(cte.name.clone()) {
            continue;
        }
        let mut parents: Vec<&str> = cte.parent_ctes.iter().map(String::as_str).collect();
        for join in &cte.joins {
            if let Join::Cte(j) = join {
                parents.extend(
                    std::iter::once(j.right_cte.as_str())
                        .chain(j.left_cte.as_deref())
                        .filter(|p| !j.inlined_ctes.contains_key(*p)),
                );
            }
        }
        if let CteKind::Union { internal } = &cte.kind {
            for child in internal {
                parents.extend(child.parent_ctes.iter().map(String::as_str));
            }
        }
        for p in parents {
            if let Some(parent) = by_name(p) {
                queue.push(parent);
            }
        }
    }
    let before = ctes.len();
    ctes.retain(|c| reachable.contains(&c.name));
    if ctes.len() != before {
        log::trace!("[OPTIMIZER] pruned {} unreachable CTEs", before - ctes.len());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Hand-built CTEs for rule tests.

    use std::collections::{BTreeMap, BTreeSet};

    use crate::model::{
        BuildConcept, BuildDatasource, ColumnAlias, ColumnAssignment, DataType, DatasourceAddress,
        Derivation, Grain, Granularity, Purpose, SourceType,
    };
    use crate::plan::{Cte, CteKind, QueryDatasource, SourceRef};

    pub fn concept(address: &str) -> BuildConcept {
        BuildConcept {
            address: address.to_string(),
            name: address.trim_start_matches("local.").to_string(),
            namespace: "local".into(),
            datatype: DataType::Integer,
            purpose: Purpose::Key,
            lineage: None,
            keys: None,
            grain: Grain::new([address]),
            modifiers: BTreeSet::new(),
            pseudonyms: BTreeSet::new(),
            derivation: Derivation::Root,
            granularity: Granularity::MultiRow,
            is_aggregate: false,
        }
    }

    pub fn table(name: &str, columns: &[&str]) -> BuildDatasource {
        BuildDatasource {
            name: name.into(),
            namespace: "local".into(),
            identifier: name.into(),
            columns: columns
                .iter()
                .map(|c| ColumnAssignment {
                    alias: ColumnAlias::Name(c.trim_start_matches("local.").into()),
                    concept: c.to_string(),
                    modifiers: BTreeSet::new(),
                })
                .collect(),
            address: DatasourceAddress::table(name),
            grain: Grain::new([columns[0]]),
            where_clause: None,
            non_partial_for: None,
        }
    }

    /// A CTE reading every column of `ds` directly.
    pub fn select_cte(name: &str, ds: BuildDatasource) -> Cte {
        let outputs: Vec<BuildConcept> = ds.columns.iter().map(|c| concept(&c.concept)).collect();
        let mut source = QueryDatasource::new(SourceType::DirectSelect, ds.grain.clone());
        source.output_concepts = outputs.clone();
        source.input_concepts = outputs.clone();
        source.datasources = vec![SourceRef::Datasource(ds.clone())];
        let id = ds.safe_identifier();
        Cte {
            name: name.into(),
            kind: CteKind::Standard,
            source_map: outputs.iter().map(|c| (c.address.clone(), vec![id.clone()])).collect(),
            source,
            output_columns: outputs,
            existence_source_map: BTreeMap::new(),
            grain: ds.grain.clone(),
            group_to_grain: false,
            parent_ctes: Vec::new(),
            joins: Vec::new(),
            condition: None,
            partial_concepts: BTreeSet::new(),
            nullable_concepts: BTreeSet::new(),
            join_derived_concepts: Vec::new(),
            hidden_concepts: BTreeSet::new(),
            order_by: None,
            limit: None,
            base_override: None,
        }
    }

    /// A CTE reading `outputs` from parent CTE `parent`.
    pub fn child_cte(name: &str, parent: &Cte, outputs: &[&str]) -> Cte {
        let outputs: Vec<BuildConcept> = outputs.iter().map(|c| concept(c)).collect();
        let mut source = QueryDatasource::new(SourceType::Select, parent.grain.clone());
        source.output_concepts = outputs.clone();
        source.input_concepts = outputs.clone();
        source.datasources = vec![SourceRef::Query(Box::new(parent.source.clone()))];
        Cte {
            name: name.into(),
            kind: CteKind::Standard,
            source_map: outputs
                .iter()
                .map(|c| (c.address.clone(), vec![parent.name.clone()]))
                .collect(),
            source,
            output_columns: outputs,
            existence_source_map: BTreeMap::new(),
            grain: parent.grain.clone(),
            group_to_grain: false,
            parent_ctes: vec![parent.name.clone()],
            joins: Vec::new(),
            condition: None,
            partial_concepts: BTreeSet::new(),
            nullable_concepts: BTreeSet::new(),
            join_derived_concepts: Vec::new(),
            hidden_concepts: BTreeSet::new(),
            order_by: None,
            limit: None,
            base_override: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn settings() -> OptimizationSettings {
        OptimizationSettings::default()
    }

    #[test]
    fn test_disabled_optimizer_returns_input() {
        let parent = select_cte("orders", table("orders", &["local.order_id"]));
        let child = child_cte("final", &parent, &["local.order_id"]);
        let mut s = settings();
        s.enabled = false;
        let out = optimize_ctes(vec![parent, child], &s).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_unreachable_ctes_are_pruned() {
        let parent = select_cte("orders", table("orders", &["local.order_id"]));
        let stray = select_cte("stray", table("stray", &["local.other"]));
        let child = child_cte("final", &parent, &["local.order_id"]);
        let mut s = settings();
        s.inline_datasource = false;
        let out = optimize_ctes(vec![stray, parent, child], &s).unwrap();
        let names: Vec<&str> = out.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "final"]);
    }

    #[test]
    fn test_consumers_include_union_members() {
        let parent = select_cte("orders", table("orders", &["local.order_id"]));
        let member = child_cte("member", &parent, &["local.order_id"]);
        let mut union = child_cte("union", &parent, &["local.order_id"]);
        union.parent_ctes.clear();
        union.kind = CteKind::Union {
            internal: vec![member],
        };
        let ctes = vec![parent, union];
        assert_eq!(consumers(&ctes, "orders").len(), 1);
        assert_eq!(sole_consumer(&ctes, "orders"), None);
    }
}
