//! Memoization of searches within one query.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use super::nodes::StrategyNode;
use crate::model::{BuildConcept, WhereClause};

/// Results of earlier searches, keyed by the ordered target list, the
/// partial flag and the conditions.
#[derive(Debug, Default)]
pub struct History {
    history: HashMap<String, Option<StrategyNode>>,
    started: HashSet<String>,
    synonyms: HashSet<String>,
    select_history: HashMap<String, Option<StrategyNode>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(concepts: &[BuildConcept], accept_partial: bool, conditions: Option<&WhereClause>) -> String {
        let mut key = concepts.iter().map(|c| c.address.as_str()).join("-");
        key.push_str(if accept_partial { "|partial" } else { "|full" });
        if let Some(c) = conditions {
            key.push('|');
            key.push_str(&c.to_string());
        }
        key
    }

    /// A cached result, if this search ran before. `Some(None)` records a
    /// search that found nothing.
    pub fn get_history(
        &self,
        concepts: &[BuildConcept],
        accept_partial: bool,
        conditions: Option<&WhereClause>,
    ) -> Option<Option<StrategyNode>> {
        self.history
            .get(&Self::key(concepts, accept_partial, conditions))
            .cloned()
    }

    pub fn search_to_history(
        &mut self,
        concepts: &[BuildConcept],
        accept_partial: bool,
        output: Option<StrategyNode>,
        conditions: Option<&WhereClause>,
    ) {
        self.history
            .insert(Self::key(concepts, accept_partial, conditions), output);
    }

    pub fn log_start(&mut self, concepts: &[BuildConcept], accept_partial: bool, conditions: Option<&WhereClause>) {
        self.started.insert(Self::key(concepts, accept_partial, conditions));
    }

    /// Whether a search is already in flight further up the stack.
    pub fn check_started(&self, concepts: &[BuildConcept], accept_partial: bool, conditions: Option<&WhereClause>) -> bool {
        self.started.contains(&Self::key(concepts, accept_partial, conditions))
    }

    /// Mark a synonym expansion of `concepts` as running. Returns false when
    /// one already is.
    pub fn start_synonyms(&mut self, concepts: &[BuildConcept]) -> bool {
        let key = concepts.iter().map(|c| c.address.as_str()).sorted().join("-");
        self.synonyms.insert(key)
    }

    pub fn get_select(
        &self,
        concepts: &[BuildConcept],
        accept_partial: bool,
        conditions: Option<&WhereClause>,
    ) -> Option<Option<StrategyNode>> {
        self.select_history
            .get(&Self::key(concepts, accept_partial, conditions))
            .cloned()
    }

    pub fn select_to_history(
        &mut self,
        concepts: &[BuildConcept],
        accept_partial: bool,
        output: Option<StrategyNode>,
        conditions: Option<&WhereClause>,
    ) {
        self.select_history
            .insert(Self::key(concepts, accept_partial, conditions), output);
    }
}
