use std::collections::{BTreeMap, BTreeSet};

use super::{consumers, OptimizationRule};
use crate::error::Result;
use crate::model::Address;
use crate::plan::{cte_lookup, Cte, CteLookup, Join};

/// Hide output columns that no consumer reads.
///
/// A CTE always keeps at least one visible column.
pub struct HideUnusedConcepts;

/// Addresses `consumer` reads from the CTE named `parent`.
pub(crate) fn used_from(consumer: &Cte, parent: &str, lookup: &CteLookup<'_>) -> BTreeSet<Address> {
    let mut used = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut queue: Vec<Address> = consumer.output_addresses();
    if let Some(condition) = &consumer.condition {
        queue.extend(condition.concept_arguments());
    }
    if let Some(order) = &consumer.order_by {
        queue.extend(order.concept_arguments());
    }
    while let Some(address) = queue.pop() {
        if !seen.insert(address.clone()) {
            continue;
        }
        match consumer.source_map.get(&address) {
            Some(sources) if !sources.is_empty() => {
                if sources.iter().any(|s| s == parent) {
                    used.insert(address);
                }
            }
            _ => {
                if let Some(c) = consumer.get_concept(&address, lookup) {
                    queue.extend(c.concept_arguments());
                }
            }
        }
    }
    for (address, sources) in &consumer.existence_source_map {
        if sources.iter().any(|s| s == parent) {
            used.insert(address.clone());
        }
    }
    for join in &consumer.joins {
        let Join::Cte(j) = join else {
            continue;
        };
        for pair in &j.joinkey_pairs {
            if pair.cte == parent {
                used.insert(pair.left.clone());
            }
            if j.right_cte == parent {
                used.insert(pair.right.clone());
            }
        }
    }
    used
}

impl OptimizationRule for HideUnusedConcepts {
    fn name(&self) -> &'static str {
        "HideUnusedConcepts"
    }

    fn optimize(&self, ctes: &mut Vec<Cte>) -> Result<bool> {
        let root = ctes.len().saturating_sub(1);
        let mut to_hide: BTreeMap<usize, Vec<Address>> = BTreeMap::new();
        {
            let lookup = cte_lookup(ctes);
            for (idx, cte) in ctes.iter().enumerate() {
                if idx == root {
                    continue;
                }
                let readers = consumers(ctes, &cte.name);
                if readers.is_empty() {
                    continue;
                }
                let used: BTreeSet<Address> = readers
                    .iter()
                    .flat_map(|r| used_from(r, &cte.name, &lookup))
                    .collect();
                let visible = cte.visible_outputs();
                let mut unused: Vec<Address> = visible
                    .iter()
                    .filter(|c| !used.contains(&c.address))
                    .map(|c| c.address.clone())
                    .collect();
                if unused.len() == visible.len() {
                    unused.remove(0);
                }
                if !unused.is_empty() {
                    to_hide.insert(idx, unused);
                }
            }
        }
        let changed = !to_hide.is_empty();
        for (idx, addresses) in to_hide {
            log::trace!(
                "[OPTIMIZER] hiding {} on {}",
                addresses.join(", "),
                ctes[idx].name
            );
            ctes[idx].hidden_concepts.extend(addresses);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::test_support::*;

    #[test]
    fn test_unread_columns_are_hidden() {
        let parent = select_cte(
            "orders",
            table("orders", &["local.order_id", "local.customer_id", "local.amount"]),
        );
        let child = child_cte("final", &parent, &["local.order_id"]);
        let mut ctes = vec![parent, child];
        assert!(HideUnusedConcepts.optimize(&mut ctes).unwrap());
        assert_eq!(
            ctes[0].hidden_concepts,
            BTreeSet::from(["local.amount".to_string(), "local.customer_id".to_string()])
        );
        assert!(!HideUnusedConcepts.optimize(&mut ctes).unwrap());
    }

    #[test]
    fn test_one_column_stays_visible() {
        let parent = select_cte("orders", table("orders", &["local.order_id", "local.amount"]));
        let mut child = child_cte("final", &parent, &["local.other"]);
        child.source_map.clear();
        let mut ctes = vec![parent, child];
        assert!(HideUnusedConcepts.optimize(&mut ctes).unwrap());
        assert_eq!(ctes[0].visible_outputs().len(), 1);
    }

    #[test]
    fn test_root_is_untouched() {
        let parent = select_cte("orders", table("orders", &["local.order_id", "local.amount"]));
        let mut ctes = vec![parent];
        assert!(!HideUnusedConcepts.optimize(&mut ctes).unwrap());
        assert!(ctes[0].hidden_concepts.is_empty());
    }
}
