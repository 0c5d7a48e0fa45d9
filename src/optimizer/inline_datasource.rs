use super::{sole_consumer, OptimizationRule};
use crate::error::Result;
use crate::plan::{Cte, CteKind};

/// Read a table directly in its only consumer instead of through a CTE
/// that just selects columns from it.
pub struct InlineDatasource;

/// A CTE that selects stored columns from one table and nothing else.
pub(crate) fn is_plain_table_read(cte: &Cte) -> bool {
    let Some(ds) = cte.root_datasource() else {
        return false;
    };
    ds.can_be_inlined()
        && cte.kind == CteKind::Standard
        && cte.condition.is_none()
        && !cte.group_to_grain
        && cte.joins.is_empty()
        && cte.parent_ctes.is_empty()
        && cte.limit.is_none()
        && cte.order_by.is_none()
        && cte
            .output_columns
            .iter()
            .all(|c| cte.source_map.get(&c.address).is_some_and(|s| !s.is_empty()))
}

impl OptimizationRule for InlineDatasource {
    fn name(&self) -> &'static str {
        "InlineDatasource"
    }

    fn optimize(&self, ctes: &mut Vec<Cte>) -> Result<bool> {
        let root = ctes.len().saturating_sub(1);
        let mut changed = false;
        for idx in 0..ctes.len() {
            if idx == root || !is_plain_table_read(&ctes[idx]) {
                continue;
            }
            let name = ctes[idx].name.clone();
            let Some(consumer) = sole_consumer(ctes, &name) else {
                continue;
            };
            let target = &ctes[consumer];
            if target.kind != CteKind::Standard
                || target.existence_source_map.values().any(|v| v.contains(&name))
            {
                continue;
            }
            let parent = ctes[idx].clone();
            if ctes[consumer].inline_parent_datasource(&parent, false) {
                log::debug!("[OPTIMIZER] inlined {} into {}", name, ctes[consumer].name);
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::test_support::*;
    use crate::plan::BaseTable;

    #[test]
    fn test_single_consumer_reads_table_directly() {
        let parent = select_cte("posts", table("posts", &["local.post_id", "local.user_id"]));
        let child = child_cte("final", &parent, &["local.user_id"]);
        let mut ctes = vec![parent, child];
        assert!(InlineDatasource.optimize(&mut ctes).unwrap());
        let child = &ctes[1];
        assert!(child.parent_ctes.is_empty());
        assert!(matches!(child.base(), BaseTable::Table { ref location, .. } if location == "posts"));
        assert_eq!(child.source_map["local.user_id"], vec!["posts".to_string()]);
    }

    #[test]
    fn test_filtered_tables_stay_wrapped() {
        let mut parent = select_cte("posts", table("posts", &["local.post_id"]));
        parent.condition = Some(crate::model::concept("post_id").gt(crate::model::lit(1)));
        let child = child_cte("final", &parent, &["local.post_id"]);
        let mut ctes = vec![parent, child];
        assert!(!InlineDatasource.optimize(&mut ctes).unwrap());
    }

    #[test]
    fn test_shared_tables_stay_wrapped() {
        let parent = select_cte("posts", table("posts", &["local.post_id"]));
        let a = child_cte("a", &parent, &["local.post_id"]);
        let b = child_cte("b", &parent, &["local.post_id"]);
        let mut ctes = vec![parent, a, b];
        assert!(!InlineDatasource.optimize(&mut ctes).unwrap());
    }
}
