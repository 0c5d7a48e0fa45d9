//! Node generators, one per derivation.
//!
//! Each generator receives the concept to resolve, the other targets it may
//! carry along, the search depth and the conditions it is allowed to push
//! down. It returns `None` when it cannot produce the concept; the search
//! then retries with partial sources before giving up.

mod basic;
mod constant;
mod enrichment;
mod filter;
mod group;
mod group_to;
mod merge;
mod multiselect;
mod recursive;
mod rowset;
mod select;
mod synonym;
mod union;
mod unnest;
mod window;

use super::nodes::StrategyNode;
use crate::model::{BuildConcept, Expr};

/// Targets in `optional` that `node` does not already provide.
pub(crate) fn missing_from(node: &StrategyNode, optional: &[BuildConcept]) -> Vec<BuildConcept> {
    optional
        .iter()
        .filter(|o| !node.provides(&o.address))
        .cloned()
        .collect()
}

/// The preexisting conditions shared by every parent, if they agree.
pub(crate) fn shared_preexisting(parents: &[StrategyNode]) -> Option<Expr> {
    let first = parents.first()?.preexisting_conditions.clone()?;
    parents
        .iter()
        .all(|p| p.preexisting_conditions.as_ref() == Some(&first))
        .then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{concept, lit};
    use crate::processing::nodes::StrategyNode;

    #[test]
    fn test_shared_preexisting_requires_agreement() {
        let cond = concept("a").eq(lit(1));
        let a = StrategyNode::constant(vec![]).with_preexisting(Some(cond.clone()));
        let b = StrategyNode::constant(vec![]).with_preexisting(Some(cond.clone()));
        assert_eq!(shared_preexisting(&[a.clone(), b]), Some(cond));
        let c = StrategyNode::constant(vec![]);
        assert_eq!(shared_preexisting(&[a, c]), None);
    }
}
