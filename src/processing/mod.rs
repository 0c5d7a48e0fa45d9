//! Concept resolution.
//!
//! A [`Searcher`] turns a list of target concepts into a tree of
//! [`StrategyNode`]s. Each node knows how to resolve into a
//! [`QueryDatasource`](crate::plan::QueryDatasource), which the planner then
//! lowers to CTEs.
//!
//! The search works one concept at a time. It picks the most derived target
//! first, asks the generator for that derivation to produce a node that also
//! carries as many of the other targets as it can, and stops once the nodes
//! it has collected cover every target and share join keys. Anything left
//! over is retried with partial sources allowed before the search gives up.

mod generators;
mod history;
mod join;
mod nodes;
mod search;

pub use history::History;
pub use join::{find_nullable_concepts, get_node_joins, is_scalar_condition, padding};
pub use nodes::{resolve_concept_map, NodeJoin, NodeKind, StrategyNode};
pub use search::{QueryTarget, SearchConfig, Searcher, ValidationResult};

use crate::model::{Address, BuildConcept};

/// Deduplicate by address, keeping the first occurrence.
pub(crate) fn unique_concepts<I>(concepts: I) -> Vec<BuildConcept>
where
    I: IntoIterator<Item = BuildConcept>,
{
    let mut out: Vec<BuildConcept> = Vec::new();
    for c in concepts {
        if !out.iter().any(|o| o.address == c.address) {
            out.push(c);
        }
    }
    out
}

pub(crate) fn addresses(concepts: &[BuildConcept]) -> Vec<Address> {
    concepts.iter().map(|c| c.address.clone()).collect()
}

/// Whether `a` and `b` name the same value through a merge.
pub(crate) fn pseudonym_related(a: &BuildConcept, b: &BuildConcept) -> bool {
    a.pseudonyms.contains(&b.address) || b.pseudonyms.contains(&a.address)
}
