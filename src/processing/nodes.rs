//! Strategy nodes.
//!
//! The search builds a tree of [`StrategyNode`]s. A node owns its parents,
//! names the concepts it consumes and produces, and resolves into a
//! [`QueryDatasource`]. Resolution is memoized per node; every mutator drops
//! the memo.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use itertools::Itertools;
use once_cell::unsync::OnceCell;

use super::join::{find_nullable_concepts, get_node_joins, is_scalar_condition};
use super::unique_concepts;
use crate::error::{Error, Result};
use crate::model::{
    Address, BuildConcept, BuildDatasource, BuildEnvironment, DatasourceAddress, Derivation, Expr,
    Grain, JoinType, OrderBy, SourceType,
};
use crate::plan::{
    BaseJoin, ConceptPair, QueryDatasource, QueryJoin, SourceMap, SourceRef, UnnestJoin,
    CONSTANT_DATASET,
};

/// What a node does with its parents.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Read directly from a datasource.
    Select { datasource: BuildDatasource },
    /// Single-row values with no source.
    Constant,
    Group,
    /// Join the parents, by explicit joins when given.
    Merge { node_joins: Option<Vec<NodeJoin>> },
    Filter,
    Window,
    Unnest { concept: BuildConcept },
    Union,
    Recursive,
    Rowset,
    Basic,
    /// A plan resolved against another build environment.
    Resolved(Box<QueryDatasource>),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Select { .. } => "Select",
            NodeKind::Constant => "Constant",
            NodeKind::Group => "Group",
            NodeKind::Merge { .. } => "Merge",
            NodeKind::Filter => "Filter",
            NodeKind::Window => "Window",
            NodeKind::Unnest { .. } => "Unnest",
            NodeKind::Union => "Union",
            NodeKind::Recursive => "Recursive",
            NodeKind::Rowset => "Rowset",
            NodeKind::Basic => "Basic",
            NodeKind::Resolved(_) => "Resolved",
        }
    }
}

/// An explicit join between two parents of a merge node, by parent index.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeJoin {
    pub left: usize,
    pub right: usize,
    pub concepts: Vec<Address>,
    pub join_type: JoinType,
}

impl NodeJoin {
    /// Check the join keys against both parents.
    ///
    /// With `filter_to_mutual`, keys missing on either side are dropped
    /// instead of rejected.
    pub fn new(
        left: usize,
        right: usize,
        concepts: Vec<Address>,
        join_type: JoinType,
        parents: &[StrategyNode],
        filter_to_mutual: bool,
    ) -> Result<NodeJoin> {
        if left == right {
            return Err(Error::syntax("Cannot join a node to itself"));
        }
        let (l, r) = match (parents.get(left), parents.get(right)) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(Error::syntax("Join references a missing parent")),
        };
        let mut kept = Vec::new();
        for c in concepts {
            let shared = l.provides(&c) && r.provides(&c);
            if shared {
                kept.push(c);
            } else if !filter_to_mutual {
                return Err(Error::syntax(format!(
                    "Join concept {} is not present on both {} and {}",
                    c, l, r
                )));
            }
        }
        if kept.is_empty() {
            let all_constant = |n: &StrategyNode| {
                n.output_concepts
                    .iter()
                    .all(|c| c.derivation == Derivation::Constant)
            };
            if !all_constant(l) && !all_constant(r) {
                return Err(Error::syntax(format!(
                    "No mutual join keys found between {} and {}",
                    l, r
                )));
            }
        }
        Ok(NodeJoin {
            left,
            right,
            concepts: kept,
            join_type,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StrategyNode {
    pub kind: NodeKind,
    pub input_concepts: Vec<BuildConcept>,
    pub output_concepts: Vec<BuildConcept>,
    pub parents: Vec<StrategyNode>,
    pub partial_concepts: BTreeSet<Address>,
    pub nullable_concepts: BTreeSet<Address>,
    pub hidden_concepts: BTreeSet<Address>,
    /// Concepts only checked for membership, never joined on.
    pub existence_concepts: Vec<BuildConcept>,
    pub virtual_output_concepts: BTreeSet<Address>,
    pub conditions: Option<Expr>,
    /// Conditions already applied somewhere beneath this node.
    pub preexisting_conditions: Option<Expr>,
    pub grain: Option<Grain>,
    pub whole_grain: bool,
    pub force_group: Option<bool>,
    pub ordering: Option<OrderBy>,
    pub limit: Option<u64>,
    pub depth: usize,
    cache: OnceCell<QueryDatasource>,
}

impl PartialEq for StrategyNode {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.input_concepts == other.input_concepts
            && self.output_concepts == other.output_concepts
            && self.parents == other.parents
            && self.conditions == other.conditions
            && self.hidden_concepts == other.hidden_concepts
    }
}

impl StrategyNode {
    pub fn new(
        kind: NodeKind,
        input_concepts: Vec<BuildConcept>,
        output_concepts: Vec<BuildConcept>,
        parents: Vec<StrategyNode>,
    ) -> Self {
        let input_concepts = unique_concepts(input_concepts);
        let output_concepts = unique_concepts(output_concepts);
        let partial_concepts = partials_from_parents(&output_concepts, &parents);
        let nullable_concepts = nullables_from_parents(&output_concepts, &parents);
        Self {
            kind,
            input_concepts,
            output_concepts,
            parents,
            partial_concepts,
            nullable_concepts,
            hidden_concepts: BTreeSet::new(),
            existence_concepts: Vec::new(),
            virtual_output_concepts: BTreeSet::new(),
            conditions: None,
            preexisting_conditions: None,
            grain: None,
            whole_grain: false,
            force_group: None,
            ordering: None,
            limit: None,
            depth: 0,
            cache: OnceCell::new(),
        }
    }

    pub fn merge(
        input_concepts: Vec<BuildConcept>,
        output_concepts: Vec<BuildConcept>,
        parents: Vec<StrategyNode>,
    ) -> Self {
        Self::new(
            NodeKind::Merge { node_joins: None },
            input_concepts,
            output_concepts,
            parents,
        )
    }

    pub fn group(
        input_concepts: Vec<BuildConcept>,
        output_concepts: Vec<BuildConcept>,
        parents: Vec<StrategyNode>,
    ) -> Self {
        Self::new(NodeKind::Group, input_concepts, output_concepts, parents)
    }

    pub fn constant(output_concepts: Vec<BuildConcept>) -> Self {
        Self::new(
            NodeKind::Constant,
            output_concepts.clone(),
            output_concepts,
            Vec::new(),
        )
    }

    /// Wrap a datasource resolved elsewhere.
    pub fn resolved(qds: QueryDatasource) -> Self {
        let outputs = qds.output_concepts.clone();
        let mut node = Self::new(
            NodeKind::Resolved(Box::new(qds.clone())),
            qds.input_concepts.clone(),
            outputs,
            Vec::new(),
        );
        node.partial_concepts = qds.partial_concepts.clone();
        node.nullable_concepts = qds.nullable_concepts.clone();
        node.hidden_concepts = qds.hidden_concepts.clone();
        node.preexisting_conditions = qds.condition.clone();
        node.grain = Some(qds.grain.clone());
        node
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_grain(mut self, grain: Option<Grain>) -> Self {
        self.grain = grain;
        self.invalidate();
        self
    }

    pub fn with_force_group(mut self, force: Option<bool>) -> Self {
        self.force_group = force;
        self.invalidate();
        self
    }

    pub fn with_partials(mut self, partial: BTreeSet<Address>) -> Self {
        self.partial_concepts = partial;
        self.invalidate();
        self
    }

    pub fn with_nullables(mut self, nullable: BTreeSet<Address>) -> Self {
        self.nullable_concepts = nullable;
        self.invalidate();
        self
    }

    /// Set the conditions this node applies. They count as preexisting for
    /// anything above.
    pub fn with_conditions(mut self, conditions: Option<Expr>) -> Self {
        self.conditions = conditions;
        self.preexisting_conditions = combine(self.conditions.clone(), self.preexisting_conditions.take());
        self.invalidate();
        self
    }

    pub fn with_preexisting(mut self, preexisting: Option<Expr>) -> Self {
        self.preexisting_conditions = combine(self.conditions.clone(), preexisting);
        self.invalidate();
        self
    }

    fn invalidate(&mut self) {
        self.cache = OnceCell::new();
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    pub fn add_parents(&mut self, parents: Vec<StrategyNode>) {
        self.parents.extend(parents);
        self.invalidate();
    }

    pub fn add_condition(&mut self, condition: Expr) {
        if self.conditions.as_ref() == Some(&condition) {
            return;
        }
        self.conditions = Some(match self.conditions.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self.preexisting_conditions = self.conditions.clone();
        self.invalidate();
    }

    pub fn add_output_concepts(&mut self, concepts: Vec<BuildConcept>) {
        for c in concepts {
            self.hidden_concepts.remove(&c.address);
            if !self.has_output(&c.address) {
                self.output_concepts.push(c);
            }
        }
        self.invalidate();
    }

    pub fn add_output_concept(&mut self, concept: BuildConcept) {
        self.add_output_concepts(vec![concept]);
    }

    pub fn set_output_concepts(&mut self, concepts: Vec<BuildConcept>) {
        self.output_concepts = unique_concepts(concepts);
        let outputs: BTreeSet<Address> = self.output_addresses().into_iter().collect();
        self.hidden_concepts.retain(|h| outputs.contains(h));
        self.invalidate();
    }

    pub fn hide_output_concepts(&mut self, addresses: &[Address]) {
        for a in addresses {
            if self.has_output(a) {
                self.hidden_concepts.insert(a.clone());
            }
        }
        self.invalidate();
    }

    pub fn unhide_output_concepts(&mut self, addresses: &[Address]) {
        for a in addresses {
            self.hidden_concepts.remove(a);
        }
        self.invalidate();
    }

    pub fn remove_output_concepts(&mut self, addresses: &[Address]) {
        self.output_concepts.retain(|c| !addresses.contains(&c.address));
        for a in addresses {
            self.hidden_concepts.remove(a);
        }
        self.invalidate();
    }

    pub fn add_existence_concepts(&mut self, concepts: Vec<BuildConcept>) {
        for c in concepts {
            if !self.existence_concepts.iter().any(|e| e.address == c.address) {
                self.existence_concepts.push(c);
            }
        }
        self.invalidate();
    }

    pub fn add_partial_concepts(&mut self, addresses: impl IntoIterator<Item = Address>) {
        self.partial_concepts.extend(addresses);
        self.invalidate();
    }

    pub fn set_hidden(&mut self, hidden: BTreeSet<Address>) {
        self.hidden_concepts = hidden;
        self.invalidate();
    }

    pub fn set_ordering(&mut self, ordering: Option<OrderBy>) {
        self.ordering = ordering;
        self.invalidate();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn has_output(&self, address: &str) -> bool {
        self.output_concepts.iter().any(|c| c.address == address)
    }

    pub fn output_addresses(&self) -> Vec<Address> {
        self.output_concepts.iter().map(|c| c.address.clone()).collect()
    }

    pub fn usable_outputs(&self) -> Vec<BuildConcept> {
        self.output_concepts
            .iter()
            .filter(|c| !self.hidden_concepts.contains(&c.address))
            .cloned()
            .collect()
    }

    pub fn usable_addresses(&self) -> Vec<Address> {
        self.usable_outputs().into_iter().map(|c| c.address).collect()
    }

    /// Whether a usable output supplies `address`, directly or by pseudonym.
    pub fn provides(&self, address: &str) -> bool {
        self.output_concepts
            .iter()
            .filter(|c| !self.hidden_concepts.contains(&c.address))
            .any(|c| c.matches(address))
    }

    fn lookup_concept(&self, address: &str, env: &BuildEnvironment) -> Option<BuildConcept> {
        self.output_concepts
            .iter()
            .chain(self.input_concepts.iter())
            .find(|c| c.address == address)
            .or_else(|| env.get(address))
            .cloned()
    }

    fn grain_for(&self, env: &BuildEnvironment) -> Grain {
        if let Some(g) = &self.grain {
            return g.clone();
        }
        let outputs: Vec<&BuildConcept> = self.output_concepts.iter().collect();
        Grain::from_concepts(&outputs, |a| {
            self.output_concepts
                .iter()
                .find(|c| c.address == a)
                .or_else(|| env.get(a))
        })
    }

    /// Every input must be a usable output of some parent.
    fn validate_inputs(&self) -> Result<()> {
        if self.parents.is_empty() {
            return Ok(());
        }
        for c in &self.input_concepts {
            let found = self
                .parents
                .iter()
                .any(|p| p.provides(&c.address) || c.pseudonyms.iter().any(|ps| p.provides(ps)));
            if !found {
                return Err(Error::syntax(format!(
                    "Invalid input concept {} for {} node; parents output {}",
                    c.address,
                    self.kind.name(),
                    self.parents
                        .iter()
                        .flat_map(|p| p.usable_addresses())
                        .unique()
                        .join(", ")
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    pub fn resolve(&self, env: &BuildEnvironment) -> Result<QueryDatasource> {
        if let Some(hit) = self.cache.get() {
            return Ok(hit.clone());
        }
        let resolved = self.resolve_uncached(env)?;
        let _ = self.cache.set(resolved.clone());
        Ok(resolved)
    }

    fn resolve_uncached(&self, env: &BuildEnvironment) -> Result<QueryDatasource> {
        let mut qds = match &self.kind {
            NodeKind::Resolved(q) => return Ok((**q).clone()),
            NodeKind::Select { datasource } => self.resolve_select(datasource)?,
            NodeKind::Constant if self.parents.is_empty() => self.resolve_constant(),
            NodeKind::Constant => self.resolve_base(env, SourceType::Constant)?,
            NodeKind::Group => self.resolve_group(env)?,
            NodeKind::Merge { node_joins } => self.resolve_merge(env, node_joins.as_deref())?,
            NodeKind::Filter => self.resolve_base(env, SourceType::Filter)?,
            NodeKind::Window => self.resolve_base(env, SourceType::Window)?,
            NodeKind::Rowset => self.resolve_base(env, SourceType::Rowset)?,
            NodeKind::Basic => self.resolve_base(env, SourceType::Select)?,
            NodeKind::Union => self.resolve_base(env, SourceType::Union)?,
            NodeKind::Recursive => self.resolve_base(env, SourceType::Recursive)?,
            NodeKind::Unnest { concept } => {
                let mut qds = self.resolve_base(env, SourceType::Unnest)?;
                qds.joins.push(QueryJoin::Unnest(UnnestJoin::new(concept.clone())));
                qds.source_map.insert(concept.address.clone(), BTreeSet::new());
                qds.join_derived_concepts = vec![concept.address.clone()];
                qds
            }
        };
        if self.limit.is_some() {
            qds.limit = self.limit;
        }
        if self.ordering.is_some() {
            qds.ordering = self.ordering.clone();
        }
        log::trace!("resolved {} into {}", self, qds);
        Ok(qds)
    }

    /// Split parents into those supplying rows and those only used for
    /// existence checks.
    fn split_parents(&self, resolved: Vec<QueryDatasource>) -> (Vec<QueryDatasource>, Vec<QueryDatasource>) {
        if self.existence_concepts.is_empty() {
            return (resolved, Vec::new());
        }
        let existence: BTreeSet<&str> = self
            .existence_concepts
            .iter()
            .map(|c| c.address.as_str())
            .collect();
        resolved.into_iter().partition(|q| {
            !q.output_concepts
                .iter()
                .filter(|c| !q.hidden_concepts.contains(&c.address))
                .all(|c| existence.contains(c.address.as_str()))
        })
    }

    fn existence_map(&self, existence_parents: &[QueryDatasource]) -> SourceMap {
        let mut map = SourceMap::new();
        for c in &self.existence_concepts {
            let sources: BTreeSet<String> = existence_parents
                .iter()
                .filter(|p| p.has_output(&c.address))
                .map(QueryDatasource::identifier)
                .collect();
            if !sources.is_empty() {
                map.insert(c.address.clone(), sources);
            }
        }
        map
    }

    fn resolve_parents(&self, env: &BuildEnvironment) -> Result<Vec<QueryDatasource>> {
        self.parents.iter().map(|p| p.resolve(env)).collect()
    }

    fn resolve_constant(&self) -> QueryDatasource {
        let mut qds = QueryDatasource::new(SourceType::Constant, Grain::default());
        for c in &self.output_concepts {
            qds.source_map.insert(c.address.clone(), BTreeSet::new());
        }
        qds.input_concepts = self.input_concepts.clone();
        qds.output_concepts = self.output_concepts.clone();
        qds.datasources = vec![SourceRef::Datasource(constant_datasource())];
        qds.condition = self.conditions.clone();
        qds.hidden_concepts = self.hidden_concepts.clone();
        qds
    }

    fn resolve_select(&self, ds: &BuildDatasource) -> Result<QueryDatasource> {
        let grain = if self.force_group == Some(false) {
            ds.grain.clone()
        } else {
            self.grain.clone().unwrap_or_else(|| ds.grain.clone())
        };
        let mut qds = QueryDatasource::new(SourceType::DirectSelect, grain);
        let bound = |c: &BuildConcept| {
            ds.columns
                .iter()
                .any(|col| col.concept == c.address || c.pseudonyms.contains(&col.concept))
        };
        for c in self.input_concepts.iter().chain(self.output_concepts.iter()) {
            if qds.source_map.contains_key(&c.address) {
                continue;
            }
            if bound(c) {
                qds.source_map
                    .insert(c.address.clone(), BTreeSet::from([ds.identifier.clone()]));
            } else if !c.derivation.is_root_like() || c.derivation == Derivation::Constant {
                qds.source_map.insert(c.address.clone(), BTreeSet::new());
            } else {
                return Err(Error::syntax(format!(
                    "Datasource {} does not bind {}",
                    ds.identifier, c.address
                )));
            }
        }
        let outputs: BTreeSet<Address> = self.output_addresses().into_iter().collect();
        qds.input_concepts = self.input_concepts.clone();
        qds.output_concepts = self.output_concepts.clone();
        qds.datasources = vec![SourceRef::Datasource(ds.clone())];
        qds.partial_concepts = self.partial_concepts.clone();
        qds.nullable_concepts = self
            .nullable_concepts
            .iter()
            .cloned()
            .chain(ds.nullable_concepts().into_iter().filter(|n| outputs.contains(n)))
            .collect();
        qds.hidden_concepts = self.hidden_concepts.clone();
        qds.condition = self.conditions.clone();
        qds.force_group = self.force_group;
        Ok(qds)
    }

    fn resolve_base(&self, env: &BuildEnvironment, source_type: SourceType) -> Result<QueryDatasource> {
        self.validate_inputs()?;
        let (parents, existence) = self.split_parents(self.resolve_parents(env)?);
        let inherited = self.inherited_addresses();
        let source_map = resolve_concept_map(&parents, &self.output_concepts, &inherited, &BTreeSet::new());
        let mut qds = QueryDatasource::new(source_type, self.grain_for(env));
        qds.input_concepts = self.input_concepts.clone();
        qds.output_concepts = self.output_concepts.clone();
        qds.source_map = source_map;
        qds.existence_source_map = self.existence_map(&existence);
        qds.datasources = parents
            .into_iter()
            .chain(existence)
            .map(|p| SourceRef::Query(Box::new(p)))
            .collect();
        qds.partial_concepts = self.partial_concepts.clone();
        qds.nullable_concepts = self.nullable_concepts.clone();
        qds.hidden_concepts = self.hidden_concepts.clone();
        qds.condition = self.conditions.clone();
        qds.force_group = self.force_group;
        Ok(qds)
    }

    fn inherited_addresses(&self) -> Vec<Address> {
        self.input_concepts.iter().map(|c| c.address.clone()).collect()
    }

    fn resolve_group(&self, env: &BuildEnvironment) -> Result<QueryDatasource> {
        self.validate_inputs()?;
        let (parents, existence) = self.split_parents(self.resolve_parents(env)?);
        let target_grain = self.grain_for(env);
        let required = self.force_group == Some(true) || group_required_for(env, &target_grain, &parents);
        if !required
            && parents.len() == 1
            && existence.is_empty()
            && self.conditions.is_none()
            && same_outputs(&parents[0], &self.output_concepts)
        {
            log::debug!("{} group not required, returning parent", self);
            let mut base = parents.into_iter().next().ok_or_else(|| Error::syntax("group without parent"))?;
            base.hidden_concepts.extend(self.hidden_concepts.iter().cloned());
            base.partial_concepts.extend(self.partial_concepts.iter().cloned());
            return Ok(base);
        }
        let source_type = if required { SourceType::Group } else { SourceType::Select };
        // Aggregate conditions apply after grouping, in a wrapper, so the
        // grouped side has to carry their arguments.
        let wrap_condition = match &self.conditions {
            Some(condition) => required && !is_scalar_condition(condition, env),
            None => false,
        };
        let mut targets = self.output_concepts.clone();
        if wrap_condition {
            for a in self.conditions.iter().flat_map(|c| c.row_arguments()) {
                if !targets.iter().any(|t| t.address == a) {
                    if let Some(c) = self.lookup_concept(&a, env) {
                        targets.push(c);
                    }
                }
            }
        }
        let inherited = self.inherited_addresses();
        let source_map = resolve_concept_map(&parents, &targets, &inherited, &BTreeSet::new());
        let outputs: BTreeSet<Address> = self.output_addresses().into_iter().collect();
        let nullable: BTreeSet<Address> = find_nullable_concepts(&source_map, &parents, &[])
            .into_iter()
            .filter(|n| outputs.contains(n))
            .chain(self.nullable_concepts.iter().cloned())
            .collect();
        let mut base = QueryDatasource::new(source_type, target_grain.clone());
        base.input_concepts = self.input_concepts.clone();
        base.output_concepts = targets;
        base.source_map = source_map;
        base.existence_source_map = self.existence_map(&existence);
        base.datasources = parents
            .into_iter()
            .chain(existence)
            .map(|p| SourceRef::Query(Box::new(p)))
            .collect();
        base.partial_concepts = self.partial_concepts.clone();
        base.nullable_concepts = nullable;
        base.hidden_concepts = self.hidden_concepts.clone();
        base.force_group = if required { Some(true) } else { self.force_group };
        let Some(condition) = &self.conditions else {
            return Ok(base);
        };
        if wrap_condition {
            base.hidden_concepts.clear();
            let inner_outputs = base.output_addresses();
            let source_map = resolve_concept_map(
                std::slice::from_ref(&base),
                &self.output_concepts,
                &inner_outputs,
                &BTreeSet::new(),
            );
            let mut outer = QueryDatasource::new(SourceType::Select, target_grain);
            outer.input_concepts = base.output_concepts.clone();
            outer.output_concepts = self.output_concepts.clone();
            outer.source_map = source_map;
            outer.partial_concepts = self.partial_concepts.clone();
            outer.nullable_concepts = base.nullable_concepts.clone();
            outer.hidden_concepts = self.hidden_concepts.clone();
            outer.condition = Some(condition.clone());
            outer.datasources = vec![SourceRef::Query(Box::new(base))];
            return Ok(outer);
        }
        base.condition = Some(condition.clone());
        Ok(base)
    }

    fn resolve_merge(&self, env: &BuildEnvironment, node_joins: Option<&[NodeJoin]>) -> Result<QueryDatasource> {
        self.validate_inputs()?;
        let resolved = self.resolve_parents(env)?;
        // Parents resolving to the same datasource collapse into one.
        let mut merged: Vec<QueryDatasource> = Vec::new();
        let mut index_map: Vec<usize> = Vec::with_capacity(resolved.len());
        for q in resolved {
            let id = q.identifier();
            match merged.iter().position(|m| m.identifier() == id) {
                Some(pos) => {
                    let existing = merged.remove(pos);
                    merged.insert(pos, existing.merge(q)?);
                    index_map.push(pos);
                }
                None => {
                    index_map.push(merged.len());
                    merged.push(q);
                }
            }
        }
        let (parents, existence) = self.split_parents(merged);
        let existence_map = self.existence_map(&existence);
        let grain = self.grain_for(env);
        let outputs: BTreeSet<Address> = self.output_addresses().into_iter().collect();

        if parents.len() == 1 && existence.is_empty() && self.conditions.is_none() {
            let mut only = parents.into_iter().next().ok_or_else(|| Error::syntax("merge without parents"))?;
            let parent_outputs: BTreeSet<Address> = only.output_addresses().into_iter().collect();
            if outputs.is_subset(&parent_outputs) {
                log::debug!("{} has a single parent covering its outputs, returning it", self);
                let extra: Vec<Address> = parent_outputs.difference(&outputs).cloned().collect();
                only.hidden_concepts.extend(extra);
                only.hidden_concepts.extend(self.hidden_concepts.iter().cloned());
                only.hidden_concepts.retain(|h| !outputs.contains(h) || self.hidden_concepts.contains(h));
                return Ok(only);
            }
            return self.finish_merge(vec![only], Vec::new(), &BTreeSet::new(), existence_map, grain);
        }

        let pregrain = parents
            .iter()
            .fold(Grain::default(), |acc, p| acc.union(&p.grain));
        let sources: Vec<SourceRef> = parents
            .iter()
            .map(|p| SourceRef::Query(Box::new(p.clone())))
            .collect();
        let lookup = |a: &str| self.lookup_concept(a, env);
        let joins: Vec<BaseJoin> = if pregrain.is_abstract() {
            // Every parent is single-row: cross join them.
            sources
                .iter()
                .skip(1)
                .map(|r| BaseJoin::new(Some(&sources[0]), r, JoinType::Full, Vec::new(), &sources, &lookup))
                .collect::<Result<_>>()?
        } else if let Some(node_joins) = node_joins {
            let mut out = Vec::new();
            for nj in node_joins {
                let (Some(&l), Some(&r)) = (index_map.get(nj.left), index_map.get(nj.right)) else {
                    return Err(Error::syntax("Join references a missing parent"));
                };
                let (left, right) = (&sources[l], &sources[r]);
                let pairs = nj
                    .concepts
                    .iter()
                    .map(|c| ConceptPair {
                        left: instantiated_on(c, &parents[l], &lookup),
                        right: instantiated_on(c, &parents[r], &lookup),
                        existing_datasource: left.identifier(),
                    })
                    .collect();
                out.push(BaseJoin::new(Some(left), right, nj.join_type, pairs, &sources, &lookup)?);
            }
            out
        } else {
            get_node_joins(&parents, &lookup)?
        };
        let full_join_concepts: BTreeSet<Address> = joins
            .iter()
            .filter(|j| j.join_type == JoinType::Full)
            .flat_map(|j| j.concept_pairs.iter().flat_map(|p| [p.left.clone(), p.right.clone()]))
            .collect();
        self.finish_merge(parents, joins, &full_join_concepts, existence_map, grain)
            .map(|mut q| {
                q.datasources.extend(existence.into_iter().map(|e| SourceRef::Query(Box::new(e))));
                q
            })
    }

    fn finish_merge(
        &self,
        parents: Vec<QueryDatasource>,
        joins: Vec<BaseJoin>,
        full_join_concepts: &BTreeSet<Address>,
        existence_source_map: SourceMap,
        grain: Grain,
    ) -> Result<QueryDatasource> {
        let inherited = self.inherited_addresses();
        let source_map = resolve_concept_map(&parents, &self.output_concepts, &inherited, full_join_concepts);
        let outputs: BTreeSet<Address> = self.output_addresses().into_iter().collect();
        let nullable: BTreeSet<Address> = find_nullable_concepts(&source_map, &parents, &joins)
            .into_iter()
            .filter(|n| outputs.contains(n))
            .chain(self.nullable_concepts.iter().cloned())
            .collect();
        let force_group = match self.force_group {
            Some(f) => Some(f),
            None if self.whole_grain => Some(false),
            None => None,
        };
        let mut qds = QueryDatasource::new(SourceType::Merge, grain);
        qds.input_concepts = self.input_concepts.clone();
        qds.output_concepts = self.output_concepts.clone();
        qds.source_map = source_map;
        qds.existence_source_map = existence_source_map;
        qds.datasources = parents.into_iter().map(|p| SourceRef::Query(Box::new(p))).collect();
        qds.joins = joins.into_iter().map(QueryJoin::Base).collect();
        qds.partial_concepts = self.partial_concepts.clone();
        qds.nullable_concepts = nullable;
        qds.hidden_concepts = self.hidden_concepts.clone();
        qds.condition = self.conditions.clone();
        qds.force_group = force_group;
        Ok(qds)
    }
}

impl fmt::Display for StrategyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: Vec<&str> = self
            .output_concepts
            .iter()
            .take(5)
            .map(|c| c.address.as_str())
            .collect();
        let more = self.output_concepts.len().saturating_sub(5);
        if more > 0 {
            write!(f, "{}<{}... {} more>", self.kind.name(), shown.join(","), more)
        } else {
            write!(f, "{}<{}>", self.kind.name(), shown.join(","))
        }
    }
}

fn combine(conditions: Option<Expr>, preexisting: Option<Expr>) -> Option<Expr> {
    match (conditions, preexisting) {
        (Some(c), Some(p)) if c == p => Some(c),
        (Some(c), Some(p)) => Some(c.and(p)),
        (c, p) => c.or(p),
    }
}

fn partials_from_parents(outputs: &[BuildConcept], parents: &[StrategyNode]) -> BTreeSet<Address> {
    outputs
        .iter()
        .filter(|c| {
            let holders: Vec<&StrategyNode> = parents.iter().filter(|p| p.has_output(&c.address)).collect();
            !holders.is_empty() && holders.iter().all(|p| p.partial_concepts.contains(&c.address))
        })
        .map(|c| c.address.clone())
        .collect()
}

fn nullables_from_parents(outputs: &[BuildConcept], parents: &[StrategyNode]) -> BTreeSet<Address> {
    outputs
        .iter()
        .filter(|c| parents.iter().any(|p| p.nullable_concepts.contains(&c.address)))
        .map(|c| c.address.clone())
        .collect()
}

fn same_outputs(parent: &QueryDatasource, outputs: &[BuildConcept]) -> bool {
    let a: BTreeSet<&str> = parent.output_concepts.iter().map(|c| c.address.as_str()).collect();
    let b: BTreeSet<&str> = outputs.iter().map(|c| c.address.as_str()).collect();
    a == b
}

/// Whether grouping parents at `target` changes their row count.
pub(crate) fn group_required_for(env: &BuildEnvironment, target: &Grain, parents: &[QueryDatasource]) -> bool {
    let combined = parents
        .iter()
        .fold(Grain::default(), |acc, p| acc.union(&p.grain));
    if combined.is_abstract() {
        return false;
    }
    let reduced = env.grain_of_addresses(&combined.components.iter().cloned().collect::<Vec<_>>());
    if reduced.is_subset(target) {
        return false;
    }
    // Unique properties of keys already in the target do not fan out.
    !reduced.difference(target).components.iter().all(|a| {
        env.get(a).is_some_and(|c| {
            c.purpose == crate::model::Purpose::UniqueProperty
                && c.keys
                    .as_ref()
                    .is_some_and(|k| !k.is_empty() && k.iter().all(|k| target.contains(k)))
        })
    })
}

/// The address `concept` is carried under on `node`, following pseudonyms.
pub(crate) fn instantiated_on(
    concept: &str,
    node: &QueryDatasource,
    lookup: &dyn Fn(&str) -> Option<BuildConcept>,
) -> Address {
    if node.has_output(concept) {
        return concept.to_string();
    }
    let pseudonyms = lookup(concept).map(|c| c.pseudonyms).unwrap_or_default();
    node.output_concepts
        .iter()
        .find(|o| o.pseudonyms.contains(concept) || pseudonyms.contains(&o.address))
        .map(|o| o.address.clone())
        .unwrap_or_else(|| concept.to_string())
}

pub(crate) fn constant_datasource() -> BuildDatasource {
    BuildDatasource {
        name: CONSTANT_DATASET.to_string(),
        namespace: crate::model::DEFAULT_NAMESPACE.to_string(),
        identifier: CONSTANT_DATASET.to_string(),
        columns: Vec::new(),
        address: DatasourceAddress::table(CONSTANT_DATASET),
        grain: Grain::default(),
        where_clause: None,
        non_partial_for: None,
    }
}

/// Map each target concept to the sources that supply it.
///
/// A concept supplied in full by a parent maps to the first such parent,
/// or to every parent when it is a full-join key. Inherited concepts with
/// only partial sources take the first partial source. Targets that are
/// not inherited are computed at this level and map to an empty set,
/// unless a pseudonym is already sourced.
pub fn resolve_concept_map(
    inputs: &[QueryDatasource],
    targets: &[BuildConcept],
    inherited: &[Address],
    full_joins: &BTreeSet<Address>,
) -> SourceMap {
    let mut map: SourceMap = BTreeMap::new();
    for input in inputs {
        let id = input.identifier();
        for c in &input.output_concepts {
            if input.hidden_concepts.contains(&c.address) || input.partial_concepts.contains(&c.address) {
                continue;
            }
            if full_joins.contains(&c.address) || !map.contains_key(&c.address) {
                map.entry(c.address.clone()).or_default().insert(id.clone());
            }
        }
    }
    for input in inputs {
        let id = input.identifier();
        for c in &input.output_concepts {
            if !inherited.contains(&c.address) || input.hidden_concepts.contains(&c.address) {
                continue;
            }
            let entry = map.entry(c.address.clone()).or_default();
            if entry.is_empty() {
                entry.insert(id.clone());
            }
        }
    }
    for target in targets {
        if inherited.contains(&target.address) {
            continue;
        }
        if map.get(&target.address).is_some_and(|s| !s.is_empty()) {
            continue;
        }
        let via = target
            .pseudonyms
            .iter()
            .find_map(|p| map.get(p).filter(|s| !s.is_empty()).cloned());
        map.insert(target.address.clone(), via.unwrap_or_default());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Granularity, Purpose};

    fn key(address: &str) -> BuildConcept {
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

    fn datasource(id: &str, columns: &[&str]) -> BuildDatasource {
        let mut ds = constant_datasource();
        ds.name = id.into();
        ds.identifier = id.into();
        ds.address = DatasourceAddress::table(id);
        ds.columns = columns
            .iter()
            .map(|c| crate::model::ColumnAssignment {
                alias: crate::model::ColumnAlias::Name(c.trim_start_matches("local.").into()),
                concept: c.to_string(),
                modifiers: BTreeSet::new(),
            })
            .collect();
        ds.grain = Grain::new([columns[0]]);
        ds
    }

    fn select(id: &str, columns: &[&str]) -> StrategyNode {
        let ds = datasource(id, columns);
        let concepts: Vec<BuildConcept> = columns.iter().map(|c| key(c)).collect();
        StrategyNode::new(
            NodeKind::Select { datasource: ds.clone() },
            concepts.clone(),
            concepts,
            Vec::new(),
        )
        .with_grain(Some(ds.grain))
    }

    #[test]
    fn test_partials_require_every_holder_to_be_partial() {
        let a = select("a", &["local.x", "local.y"]).with_partials(BTreeSet::from(["local.y".to_string()]));
        let b = select("b", &["local.x"]);
        let merged = StrategyNode::merge(vec![key("local.x"), key("local.y")], vec![key("local.x"), key("local.y")], vec![a, b]);
        assert_eq!(merged.partial_concepts, BTreeSet::from(["local.y".to_string()]));
    }

    #[test]
    fn test_mutators_drop_cached_resolution() {
        let env = BuildEnvironment::default();
        let mut node = select("orders", &["local.order_id", "local.customer_id"]);
        let first = node.resolve(&env).unwrap();
        assert!(first.hidden_concepts.is_empty());
        node.hide_output_concepts(&["local.customer_id".to_string()]);
        let second = node.resolve(&env).unwrap();
        assert!(second.hidden_concepts.contains("local.customer_id"));
    }

    #[test]
    fn test_unmapped_targets_compute_locally() {
        let parent = select("orders", &["local.order_id"]).resolve(&BuildEnvironment::default()).unwrap();
        let mut derived = key("local.doubled");
        derived.derivation = Derivation::Basic;
        let map = resolve_concept_map(
            &[parent.clone()],
            &[key("local.order_id"), derived],
            &["local.order_id".to_string()],
            &BTreeSet::new(),
        );
        assert_eq!(map["local.order_id"], BTreeSet::from([parent.identifier()]));
        assert!(map["local.doubled"].is_empty());
    }

    #[test]
    fn test_single_parent_merge_returns_parent() {
        let env = BuildEnvironment::default();
        let parent = select("orders", &["local.order_id", "local.customer_id"]);
        let expected = parent.resolve(&env).unwrap().identifier();
        let merge = StrategyNode::merge(vec![key("local.order_id")], vec![key("local.order_id")], vec![parent]);
        let resolved = merge.resolve(&env).unwrap();
        assert_eq!(resolved.identifier(), expected);
        assert!(resolved.hidden_concepts.contains("local.customer_id"));
    }

    #[test]
    fn test_node_join_requires_mutual_keys() {
        let parents = vec![select("a", &["local.x"]), select("b", &["local.y"])];
        let err = NodeJoin::new(0, 1, vec!["local.x".into()], JoinType::Full, &parents, false).unwrap_err();
        assert!(err.to_string().contains("local.x"));
        let err = NodeJoin::new(0, 1, vec!["local.x".into()], JoinType::Full, &parents, true).unwrap_err();
        assert!(err.to_string().contains("No mutual join keys"));
        assert!(NodeJoin::new(0, 0, Vec::new(), JoinType::Full, &parents, true).is_err());
    }
}
