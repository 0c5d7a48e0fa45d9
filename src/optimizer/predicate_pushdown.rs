use super::{sole_consumer, OptimizationRule};
use crate::error::Result;
use crate::model::{Derivation, Expr, JoinType, SourceType};
use crate::plan::{cte_lookup, Cte, CteKind, Join};

/// Move WHERE conjuncts that only read one parent into that parent.
///
/// A conjunct moves when every row argument comes from the same parent CTE,
/// none of them is an aggregate or window value, and the parent has no other
/// reader. Parents that group, rank or limit keep their rows as they are,
/// and so do parents on the optional side of an outer join.
pub struct PredicatePushdown;

fn accepts_pushdown(parent: &Cte) -> bool {
    parent.kind == CteKind::Standard
        && !parent.group_to_grain
        && parent.limit.is_none()
        && parent.source.source_type != SourceType::Window
        && !parent.output_columns.iter().any(|c| {
            matches!(c.derivation, Derivation::Window | Derivation::Aggregate)
                && parent.source_map.get(&c.address).map_or(true, Vec::is_empty)
        })
}

fn joins_allow(child: &Cte, parent: &str) -> bool {
    child.joins.iter().all(|join| match join {
        Join::Cte(j) => match j.join_type {
            JoinType::Inner => true,
            JoinType::LeftOuter => j.right_cte != parent,
            _ => false,
        },
        Join::Unnest(_) => true,
    })
}

impl OptimizationRule for PredicatePushdown {
    fn name(&self) -> &'static str {
        "PredicatePushdown"
    }

    fn optimize(&self, ctes: &mut Vec<Cte>) -> Result<bool> {
        let mut moves: Vec<(usize, usize, Expr)> = Vec::new();
        {
            let lookup = cte_lookup(ctes);
            for (idx, child) in ctes.iter().enumerate() {
                let Some(condition) = &child.condition else {
                    continue;
                };
                if child.kind != CteKind::Standard {
                    continue;
                }
                for conjunct in condition.decompose() {
                    if !conjunct.existence_arguments().is_empty() {
                        continue;
                    }
                    let args = conjunct.row_arguments();
                    if args.is_empty() {
                        continue;
                    }
                    let scalar = args.iter().all(|a| {
                        child.get_concept(a, &lookup).is_some_and(|c| {
                            !c.is_aggregate
                                && !matches!(c.derivation, Derivation::Aggregate | Derivation::Window)
                        })
                    });
                    if !scalar {
                        continue;
                    }
                    let mut sources = args.iter().map(|a| match child.source_map.get(a) {
                        Some(s) if s.len() == 1 => Some(s[0].clone()),
                        _ => None,
                    });
                    let Some(Some(source)) = sources.next() else {
                        continue;
                    };
                    if !sources.all(|s| s.as_deref() == Some(source.as_str())) {
                        continue;
                    }
                    if !child.parent_ctes.contains(&source) || !joins_allow(child, &source) {
                        continue;
                    }
                    let Some(parent_idx) = ctes.iter().position(|c| c.name == source) else {
                        continue;
                    };
                    let parent = &ctes[parent_idx];
                    if !accepts_pushdown(parent)
                        || sole_consumer(ctes, &parent.name) != Some(idx)
                        || !args.iter().all(|a| parent.source_map.contains_key(a))
                    {
                        continue;
                    }
                    moves.push((idx, parent_idx, conjunct));
                }
            }
        }
        let changed = !moves.is_empty();
        for (child_idx, parent_idx, conjunct) in moves {
            log::debug!(
                "[OPTIMIZER] pushing {} from {} into {}",
                conjunct,
                ctes[child_idx].name,
                ctes[parent_idx].name
            );
            let parent = &mut ctes[parent_idx];
            parent.condition =
                Expr::conjoin(parent.condition.take().into_iter().chain([conjunct.clone()]));
            let child = &mut ctes[child_idx];
            if let Some(condition) = child.condition.take() {
                child.condition =
                    Expr::conjoin(condition.decompose().into_iter().filter(|c| *c != conjunct));
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{concept, lit};
    use crate::optimizer::test_support::{child_cte, select_cte, table};

    #[test]
    fn test_conjunct_moves_into_parent() {
        let parent = select_cte("orders", table("orders", &["local.order_id", "local.amount"]));
        let mut child = child_cte("final", &parent, &["local.order_id", "local.amount"]);
        child.condition = Some(concept("amount").gt(lit(10)));
        let mut ctes = vec![parent, child];
        assert!(PredicatePushdown.optimize(&mut ctes).unwrap());
        assert!(ctes[1].condition.is_none());
        assert_eq!(ctes[0].condition, Some(concept("amount").gt(lit(10))));
        assert!(!PredicatePushdown.optimize(&mut ctes).unwrap());
    }

    #[test]
    fn test_aggregate_conjunct_stays() {
        let parent = select_cte("orders", table("orders", &["local.order_id", "local.total"]));
        let mut child = child_cte("final", &parent, &["local.order_id", "local.total"]);
        child.output_columns[1].derivation = Derivation::Aggregate;
        child.output_columns[1].is_aggregate = true;
        child.source.output_concepts = child.output_columns.clone();
        let mut ctes = vec![parent, child];
        ctes[0].output_columns[1].derivation = Derivation::Aggregate;
        ctes[0].output_columns[1].is_aggregate = true;
        ctes[1].condition = Some(concept("total").gt(lit(10)));
        assert!(!PredicatePushdown.optimize(&mut ctes).unwrap());
        assert!(ctes[1].condition.is_some());
    }

    #[test]
    fn test_limited_parent_keeps_rows() {
        let mut parent = select_cte("orders", table("orders", &["local.order_id"]));
        parent.limit = Some(5);
        let mut child = child_cte("final", &parent, &["local.order_id"]);
        child.condition = Some(concept("order_id").gt(lit(2)));
        let mut ctes = vec![parent, child];
        assert!(!PredicatePushdown.optimize(&mut ctes).unwrap());
    }
}
