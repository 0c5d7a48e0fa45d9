use super::{sole_consumer, OptimizationRule};
use crate::error::Result;
use crate::model::{Address, Expr, SourceType};
use crate::plan::{Cte, CteKind};

/// Fold a single-table filter into the aggregate that is its only reader.
///
/// Filtered concepts the filter CTE computed row by row are computed inside
/// the aggregate instead, so `sum(x ? cond)` renders as
/// `SUM(CASE WHEN cond THEN x END)` over the table. A WHERE on the filter
/// CTE moves into the aggregate's WHERE.
pub struct InlineAggregateFilter;

/// Outputs `cte` computes itself, when every one of their arguments is a
/// stored column of its table. `None` when some output cannot be rebuilt.
fn locally_computed(cte: &Cte) -> Option<Vec<Address>> {
    let ds = cte.root_datasource()?;
    let stored = |a: &str| ds.columns.iter().any(|c| c.concept == a);
    let mut out = Vec::new();
    for c in &cte.output_columns {
        if cte.source_map.get(&c.address).is_some_and(|s| !s.is_empty()) {
            continue;
        }
        let args = c.concept_arguments();
        if args.is_empty() || !args.iter().all(|a| stored(a)) {
            return None;
        }
        out.push(c.address.clone());
    }
    Some(out)
}

fn is_single_table_filter(cte: &Cte) -> bool {
    let Some(ds) = cte.root_datasource() else {
        return false;
    };
    let filtering = cte.source.source_type == SourceType::Filter
        || (cte.source.source_type == SourceType::DirectSelect && cte.condition.is_some());
    filtering
        && ds.can_be_inlined()
        && cte.kind == CteKind::Standard
        && !cte.group_to_grain
        && cte.joins.is_empty()
        && cte.parent_ctes.is_empty()
        && cte.limit.is_none()
        && cte.order_by.is_none()
}

impl OptimizationRule for InlineAggregateFilter {
    fn name(&self) -> &'static str {
        "InlineAggregateFilter"
    }

    fn optimize(&self, ctes: &mut Vec<Cte>) -> Result<bool> {
        let mut changed = false;
        for idx in 0..ctes.len() {
            let child = &ctes[idx];
            if child.kind != CteKind::Standard
                || !child.group_to_grain
                || child.parent_ctes.len() != 1
                || !child.joins.is_empty()
                || !child.existence_source_map.is_empty()
            {
                continue;
            }
            let parent_name = child.parent_ctes[0].clone();
            let Some(parent_idx) = ctes.iter().position(|c| c.name == parent_name) else {
                continue;
            };
            let parent = &ctes[parent_idx];
            if !is_single_table_filter(parent) || sole_consumer(ctes, &parent_name) != Some(idx) {
                continue;
            }
            let Some(local) = locally_computed(parent) else {
                continue;
            };
            let Some(ds) = parent.root_datasource().cloned() else {
                continue;
            };
            let parent = parent.clone();
            let ds_id = ds.safe_identifier();
            let child = &mut ctes[idx];
            if !child.inline_parent_datasource(&parent, true) {
                continue;
            }
            let mut inputs: Vec<Address> = Vec::new();
            for address in &local {
                child.source_map.insert(address.clone(), Vec::new());
                if let Some(concept) = parent.output_columns.iter().find(|c| c.address == *address) {
                    inputs.extend(concept.concept_arguments());
                }
            }
            if let Some(condition) = &parent.condition {
                inputs.extend(condition.concept_arguments());
            }
            // Inputs of the folded computations now read straight from the
            // table, whatever the child mapped them to before.
            for arg in inputs {
                let stored = ds.columns.iter().any(|c| c.concept == arg);
                if child.source.concept(&arg).is_none() {
                    if let Some(input) = parent.source.concept(&arg) {
                        child.source.input_concepts.push(input.clone());
                    }
                }
                if stored {
                    child.source_map.insert(arg, vec![ds_id.clone()]);
                } else {
                    child.source_map.entry(arg).or_insert_with(|| vec![ds_id.clone()]);
                }
            }
            if let Some(condition) = &parent.condition {
                child.condition = Expr::conjoin(
                    std::iter::once(condition.clone()).chain(child.condition.take()),
                );
            }
            log::debug!(
                "[OPTIMIZER] folded filter {} into aggregate {}",
                parent.name,
                child.name
            );
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{concept as concept_ref, lit, FilterItem, Lineage, WhereClause};
    use crate::optimizer::test_support::*;

    #[test]
    fn test_filter_folds_into_aggregate() {
        let mut parent = select_cte(
            "orders",
            table("orders", &["local.order_id", "local.amount", "local.status"]),
        );
        let mut filtered = concept("local.open_amount");
        filtered.derivation = crate::model::Derivation::Filter;
        filtered.lineage = Some(Lineage::Filter(FilterItem {
            content: "local.amount".into(),
            where_clause: WhereClause::new(concept_ref("status").eq(lit("open"))),
        }));
        parent.output_columns.push(filtered.clone());
        parent.source_map.insert(filtered.address.clone(), Vec::new());
        parent.source.source_type = SourceType::Filter;
        let mut child = child_cte("totals", &parent, &["local.order_id", "local.open_amount"]);
        child.group_to_grain = true;
        let mut ctes = vec![parent, child];
        assert!(InlineAggregateFilter.optimize(&mut ctes).unwrap());
        let child = &ctes[1];
        assert!(child.parent_ctes.is_empty());
        assert!(child.source_map["local.open_amount"].is_empty());
        assert_eq!(child.source_map["local.status"], vec!["orders".to_string()]);
    }

    #[test]
    fn test_filter_inputs_are_repointed_at_the_table() {
        let mut parent = select_cte(
            "big",
            table("orders", &["local.customer_id", "local.amount"]),
        );
        let mut filtered = concept("local.big_amount");
        filtered.derivation = crate::model::Derivation::Filter;
        filtered.lineage = Some(Lineage::Filter(FilterItem {
            content: "local.amount".into(),
            where_clause: WhereClause::new(concept_ref("amount").gt(lit(15))),
        }));
        parent.output_columns.push(filtered.clone());
        parent.source_map.insert(filtered.address.clone(), Vec::new());
        parent.source.source_type = SourceType::Filter;
        let mut child = child_cte("totals", &parent, &["local.customer_id", "local.big_amount"]);
        child.group_to_grain = true;
        // The aggregate only saw the filtered value, not its input column.
        child.source_map.insert("local.amount".into(), Vec::new());
        let mut ctes = vec![parent, child];
        assert!(InlineAggregateFilter.optimize(&mut ctes).unwrap());
        let child = &ctes[1];
        assert_eq!(child.source_map["local.amount"], vec!["orders".to_string()]);
        assert!(child.source.concept("local.amount").is_some());
        assert_eq!(child.source_map["local.customer_id"], vec!["orders".to_string()]);
        assert!(child.source_map["local.big_amount"].is_empty());
    }

    #[test]
    fn test_shared_filter_is_kept() {
        let mut parent = select_cte("orders", table("orders", &["local.order_id"]));
        parent.condition = Some(concept_ref("order_id").gt(lit(2)));
        let mut a = child_cte("a", &parent, &["local.order_id"]);
        a.group_to_grain = true;
        let b = child_cte("b", &parent, &["local.order_id"]);
        let mut ctes = vec![parent, a, b];
        assert!(!InlineAggregateFilter.optimize(&mut ctes).unwrap());
    }
}
