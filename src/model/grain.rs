//! Grain algebra.
//!
//! A grain is the set of key concepts at which a row is uniquely defined. Two
//! grains compare equal when their components match; an attached filter is
//! carried along for join compatibility but does not affect equality.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

use super::concept::Address;
use super::enums::Purpose;
use super::expr::WhereClause;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grain {
    pub components: BTreeSet<Address>,
    #[serde(default)]
    pub where_clause: Option<WhereClause>,
}

impl PartialEq for Grain {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for Grain {}

impl Grain {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Address>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            where_clause: None,
        }
    }

    pub fn with_where(mut self, where_clause: Option<WhereClause>) -> Self {
        self.where_clause = where_clause;
        self
    }

    /// An abstract grain yields a single row.
    pub fn is_abstract(&self) -> bool {
        self.components.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.components.contains(address)
    }

    pub fn union(&self, other: &Grain) -> Grain {
        let where_clause = match (&self.where_clause, &other.where_clause) {
            (Some(a), Some(b)) => Some(a.and(b)),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        Grain {
            components: self.components.union(&other.components).cloned().collect(),
            where_clause,
        }
    }

    pub fn intersection(&self, other: &Grain) -> Grain {
        Grain::new(self.components.intersection(&other.components).cloned())
    }

    pub fn difference(&self, other: &Grain) -> Grain {
        Grain::new(self.components.difference(&other.components).cloned())
    }

    pub fn is_subset(&self, other: &Grain) -> bool {
        self.components.is_subset(&other.components)
    }

    pub fn is_disjoint(&self, other: &Grain) -> bool {
        self.components.is_disjoint(&other.components)
    }

    /// Compute a grain from a set of concepts, dropping those whose values are
    /// determined by the others.
    pub fn from_concepts<'a, C, F>(concepts: &[&'a C], lookup: F) -> Grain
    where
        C: GrainSource,
        F: Fn(&str) -> Option<&'a C>,
    {
        let others: BTreeSet<&str> = concepts.iter().map(|c| c.address()).collect();
        let mut components = BTreeSet::new();
        for c in concepts {
            if concept_is_relevant(*c, &others, &lookup, 0) {
                components.insert(c.address().to_string());
            }
        }
        Grain {
            components,
            where_clause: None,
        }
    }

    /// Rewrite component addresses, e.g. after a merge or a namespace change.
    pub fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        self.components = self
            .components
            .iter()
            .map(|c| f(c).unwrap_or_else(|| c.clone()))
            .collect();
        if let Some(w) = self.where_clause.as_mut() {
            w.rewrite_addresses(f);
        }
    }
}

impl Add for Grain {
    type Output = Grain;

    fn add(self, other: Grain) -> Grain {
        self.union(&other)
    }
}

impl<'a> Add<&'a Grain> for &'a Grain {
    type Output = Grain;

    fn add(self, other: &'a Grain) -> Grain {
        self.union(other)
    }
}

impl fmt::Display for Grain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_abstract() {
            return write!(f, "Grain<Abstract>");
        }
        let parts: Vec<&str> = self.components.iter().map(String::as_str).collect();
        write!(f, "Grain<{}>", parts.join(","))?;
        if let Some(w) = &self.where_clause {
            write!(f, "|{}", w)?;
        }
        Ok(())
    }
}

/// The facts about a concept that grain computation needs.
///
/// Implemented by both authoring and build concepts so the same relevance
/// rules apply when a statement grain is computed and when a query is planned.
pub trait GrainSource {
    fn address(&self) -> &str;
    fn purpose(&self) -> Purpose;
    fn keys(&self) -> Option<&BTreeSet<Address>>;
    fn grain(&self) -> &Grain;
    /// An aggregate without an explicit `by`.
    fn is_unbound_aggregate(&self) -> bool;
    fn is_aggregate(&self) -> bool;
    fn is_basic(&self) -> bool;
    fn is_single_row(&self) -> bool;
    fn argument_addresses(&self) -> Vec<Address>;
}

const MAX_RELEVANCE_DEPTH: usize = 32;

/// Whether a concept contributes to the grain of a row containing `others`.
pub fn concept_is_relevant<'a, C, F>(
    concept: &C,
    others: &BTreeSet<&str>,
    lookup: &F,
    depth: usize,
) -> bool
where
    C: GrainSource + 'a,
    F: Fn(&str) -> Option<&'a C>,
{
    if concept.is_unbound_aggregate() {
        return false;
    }
    let covered = |keys: &BTreeSet<Address>| keys.iter().all(|k| others.contains(k.as_str()));
    match concept.purpose() {
        Purpose::Property | Purpose::Metric => {
            if let Some(keys) = concept.keys() {
                if !keys.is_empty() && covered(keys) {
                    return false;
                }
            }
        }
        Purpose::Key => {
            if let Some(keys) = concept.keys() {
                if !keys.is_empty()
                    && keys
                        .iter()
                        .all(|k| others.contains(k.as_str()) && k != concept.address())
                {
                    return false;
                }
            }
        }
        _ => {}
    }
    if concept.purpose() == Purpose::Metric && covered(&concept.grain().components) {
        return false;
    }
    if concept.is_basic() && depth < MAX_RELEVANCE_DEPTH {
        return concept
            .argument_addresses()
            .iter()
            .filter(|a| !others.contains(a.as_str()))
            .filter_map(|a| lookup(a))
            .any(|arg| concept_is_relevant(arg, others, lookup, depth + 1));
    }
    !concept.is_single_row()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_commutes() {
        let a = Grain::new(["local.a", "local.b"]);
        let b = Grain::new(["local.c"]);
        assert_eq!(&a + &b, &b + &a);
        assert_eq!((&a + &b).components.len(), 3);
    }

    #[test]
    fn test_equality_ignores_where() {
        use crate::model::expr::{concept, lit};
        let a = Grain::new(["local.a"]);
        let b = Grain::new(["local.a"]).with_where(Some(WhereClause::new(concept("a").eq(lit(1)))));
        assert_eq!(a, b);
    }

    #[test]
    fn test_union_combines_where_clauses() {
        use crate::model::expr::{concept, lit};
        let wa = WhereClause::new(concept("a").eq(lit(1)));
        let wb = WhereClause::new(concept("b").eq(lit(2)));
        let a = Grain::new(["local.a"]).with_where(Some(wa.clone()));
        let b = Grain::new(["local.b"]).with_where(Some(wb.clone()));
        let merged = a + b;
        assert_eq!(merged.where_clause, Some(wa.and(&wb)));
    }

    #[test]
    fn test_set_operations() {
        let a = Grain::new(["local.a", "local.b"]);
        let b = Grain::new(["local.b"]);
        assert!(b.is_subset(&a));
        assert_eq!(a.difference(&b), Grain::new(["local.a"]));
        assert_eq!(a.intersection(&b), b);
        assert!(Grain::new(["local.x"]).is_disjoint(&a));
        assert!(Grain::default().is_abstract());
    }
}
