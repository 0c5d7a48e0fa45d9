//! Statement-bound model.
//!
//! Authoring concepts do not know the grain of the statement they are used
//! in. An aggregate without `by` only gets its grouping once the statement
//! grain is computed. The [`Factory`] performs that binding: it walks an
//! [`Environment`] at a given grain and produces a [`BuildEnvironment`] of
//! [`BuildConcept`]s and [`BuildDatasource`]s that the planner works on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sha2::{Digest, Sha256};

use super::concept::{split_address, Address, Concept, ConceptLookup, Scoped};
use super::datasource::{ColumnAlias, ColumnAssignment, Datasource, DatasourceAddress};
use super::enums::{Derivation, FunctionType, Granularity, Modifier, Purpose};
use super::expr::{Expr, WhereClause};
use super::grain::{Grain, GrainSource};
use super::lineage::{AggregateWrapper, Function, Lineage, SelectLineage};
use super::statement::SelectStatement;
use super::types::DataType;
use crate::environment::Environment;
use crate::error::{Error, Result};

// ============================================================================
// BuildConcept
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BuildConcept {
    pub address: Address,
    pub name: String,
    pub namespace: String,
    pub datatype: DataType,
    pub purpose: Purpose,
    /// Lineage with every aggregate bound to an explicit `by`.
    pub lineage: Option<Lineage>,
    pub keys: Option<BTreeSet<Address>>,
    pub grain: Grain,
    pub modifiers: BTreeSet<Modifier>,
    pub pseudonyms: BTreeSet<Address>,
    pub derivation: Derivation,
    pub granularity: Granularity,
    pub is_aggregate: bool,
}

impl BuildConcept {
    pub fn concept_arguments(&self) -> Vec<Address> {
        self.lineage
            .as_ref()
            .map(Lineage::concept_arguments)
            .unwrap_or_default()
    }

    pub fn safe_address(&self) -> String {
        super::concept::safe_address(&self.address)
    }

    pub fn with_grain(&self, grain: Grain) -> BuildConcept {
        BuildConcept {
            grain,
            ..self.clone()
        }
    }

    /// The grain this concept has when read on its own.
    pub fn with_default_grain(&self) -> BuildConcept {
        let grain = match self.purpose {
            Purpose::Key => Grain::new([self.address.clone()]),
            Purpose::Property | Purpose::UniqueProperty => match &self.keys {
                Some(keys) if !keys.is_empty() => Grain::new(keys.iter().cloned()),
                _ => Grain::new(self.concept_arguments()),
            },
            Purpose::Metric => Grain::default(),
            Purpose::Constant if self.derivation != Derivation::Constant => {
                Grain::new([self.address.clone()])
            }
            _ => self.grain.clone(),
        };
        self.with_grain(grain)
    }

    /// Whether `address` names this concept, directly or as a pseudonym.
    pub fn matches(&self, address: &str) -> bool {
        self.address == address || self.pseudonyms.contains(address)
    }

    pub fn is_nullable(&self) -> bool {
        self.modifiers.contains(&Modifier::Nullable)
    }

    /// The function at the root of the lineage.
    pub fn function(&self) -> Option<&Function> {
        self.lineage.as_ref().and_then(Lineage::function)
    }

    pub fn aggregate_by(&self) -> Option<&[Address]> {
        match &self.lineage {
            Some(Lineage::Aggregate(a)) => Some(&a.by),
            _ => None,
        }
    }
}

impl GrainSource for BuildConcept {
    fn address(&self) -> &str {
        &self.address
    }

    fn purpose(&self) -> Purpose {
        self.purpose
    }

    fn keys(&self) -> Option<&BTreeSet<Address>> {
        self.keys.as_ref()
    }

    fn grain(&self) -> &Grain {
        &self.grain
    }

    fn is_unbound_aggregate(&self) -> bool {
        self.is_aggregate && self.aggregate_by().map_or(true, |b| b.is_empty())
    }

    fn is_aggregate(&self) -> bool {
        self.is_aggregate
    }

    fn is_basic(&self) -> bool {
        self.derivation == Derivation::Basic
    }

    fn is_single_row(&self) -> bool {
        self.granularity == Granularity::SingleRow
    }

    fn argument_addresses(&self) -> Vec<Address> {
        self.concept_arguments()
    }
}

impl fmt::Display for BuildConcept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.grain)
    }
}

// ============================================================================
// BuildDatasource
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BuildDatasource {
    pub name: String,
    pub namespace: String,
    pub identifier: String,
    pub columns: Vec<ColumnAssignment>,
    pub address: DatasourceAddress,
    pub grain: Grain,
    pub where_clause: Option<WhereClause>,
    pub non_partial_for: Option<WhereClause>,
}

impl BuildDatasource {
    pub fn output_concepts(&self) -> Vec<Address> {
        self.columns.iter().map(|c| c.concept.clone()).collect()
    }

    /// Concepts this datasource holds every value of.
    pub fn full_concepts(&self) -> Vec<Address> {
        self.columns
            .iter()
            .filter(|c| !c.is_partial())
            .map(|c| c.concept.clone())
            .collect()
    }

    pub fn partial_concepts(&self) -> BTreeSet<Address> {
        self.columns
            .iter()
            .filter(|c| c.is_partial())
            .map(|c| c.concept.clone())
            .collect()
    }

    pub fn nullable_concepts(&self) -> BTreeSet<Address> {
        self.columns
            .iter()
            .filter(|c| c.is_nullable())
            .map(|c| c.concept.clone())
            .collect()
    }

    pub fn alias_for(&self, address: &str) -> Option<&ColumnAlias> {
        self.columns
            .iter()
            .find(|c| c.concept == address)
            .map(|c| &c.alias)
    }

    /// Query-backed sources must stay wrapped in their own CTE.
    pub fn can_be_inlined(&self) -> bool {
        !self.address.is_query()
    }

    pub fn safe_identifier(&self) -> String {
        self.identifier.replace('.', "_")
    }
}

// ============================================================================
// BuildEnvironment
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct BuildEnvironment {
    pub namespace: String,
    pub concepts: BTreeMap<Address, BuildConcept>,
    pub datasources: BTreeMap<String, BuildDatasource>,
    /// Merged-away addresses, pointing at the concept that replaced them.
    pub aliases: BTreeMap<Address, Address>,
    /// Concepts bound on at least one datasource.
    pub materialized_concepts: BTreeSet<Address>,
    /// At least one datasource binds every value of these concepts.
    pub non_partial_materialized: BTreeSet<Address>,
}

impl BuildEnvironment {
    pub fn get(&self, address: &str) -> Option<&BuildConcept> {
        self.concepts.get(address).or_else(|| {
            self.aliases
                .get(address)
                .and_then(|target| self.concepts.get(target))
        })
    }

    pub fn concept(&self, address: &str) -> Result<&BuildConcept> {
        self.get(address)
            .ok_or_else(|| Error::undefined(address, suggest(address, self.concepts.keys())))
    }

    pub fn concepts_for(&self, addresses: &[Address]) -> Result<Vec<BuildConcept>> {
        addresses.iter().map(|a| self.concept(a).cloned()).collect()
    }

    /// The address a lookup of `address` resolves to.
    pub fn canonical<'a>(&'a self, address: &'a str) -> &'a str {
        self.aliases.get(address).map(String::as_str).unwrap_or(address)
    }

    pub fn gen_concept_list_caches(&mut self) {
        let mut materialized = BTreeSet::new();
        let mut full = BTreeSet::new();
        for ds in self.datasources.values() {
            for col in &ds.columns {
                materialized.insert(col.concept.clone());
                if !col.is_partial() {
                    full.insert(col.concept.clone());
                }
            }
        }
        let mut with_pseudonyms = materialized.clone();
        for c in self.concepts.values() {
            if c.pseudonyms.iter().any(|p| materialized.contains(p)) {
                with_pseudonyms.insert(c.address.clone());
            }
        }
        self.materialized_concepts = with_pseudonyms;
        self.non_partial_materialized = full;
    }

    pub fn grain_of(&self, concepts: &[&BuildConcept]) -> Grain {
        Grain::from_concepts(concepts, |a| self.get(a))
    }

    pub fn grain_of_addresses(&self, addresses: &[Address]) -> Grain {
        let concepts: Vec<&BuildConcept> = addresses.iter().filter_map(|a| self.get(a)).collect();
        self.grain_of(&concepts)
    }
}

/// Near matches for a missing address, by edit distance on the bare name.
pub fn suggest<'a>(address: &str, candidates: impl Iterator<Item = &'a Address>) -> Vec<String> {
    let strip = |a: &str| a.strip_prefix("local.").unwrap_or(a).to_string();
    let needle = strip(address);
    let max = (needle.chars().count() / 3).max(1);
    let mut scored: Vec<(usize, String)> = candidates
        .map(|c| (edit_distance(&needle, &strip(c)), c.clone()))
        .filter(|(d, _)| *d <= max)
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, c)| c).collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for j in 1..=b.len() {
            let cost = usize::from(ca != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ============================================================================
// Factory
// ============================================================================

/// Binds authoring concepts to a statement grain.
pub struct Factory<'a> {
    environment: &'a Environment,
    local: BTreeMap<Address, Concept>,
    grain: Grain,
    cache: BTreeMap<Address, BuildConcept>,
    /// Concepts whose build is in progress, outermost first, with the grain
    /// they are built at. Nested selects build at their own grain.
    visiting: Vec<(Address, Grain)>,
}

impl<'a> Factory<'a> {
    pub fn new(environment: &'a Environment, grain: Grain) -> Self {
        Self {
            environment,
            local: BTreeMap::new(),
            grain,
            cache: BTreeMap::new(),
            visiting: Vec::new(),
        }
    }

    /// Layer concepts declared inside a statement over the environment.
    pub fn with_local_concepts(mut self, concepts: &[Concept]) -> Self {
        for c in concepts {
            self.local.insert(c.address.clone(), c.clone());
        }
        self
    }

    fn lookup(&self) -> Scoped<'_, Environment> {
        Scoped {
            local: &self.local,
            parent: self.environment,
        }
    }

    fn authoring(&self, address: &str) -> Result<Concept> {
        let scoped = self.lookup();
        let concept = scoped.require(address)?.clone();
        if concept.unresolved.is_empty() {
            return Ok(concept);
        }
        let lineage = concept
            .lineage
            .clone()
            .ok_or_else(|| Error::syntax(format!("concept {} has no lineage to bind", address)))?;
        let strict = Strict(&scoped);
        let mut bound = Concept::derived(&concept.address, lineage, &strict)?;
        bound.modifiers.extend(concept.modifiers.iter().copied());
        bound.pseudonyms = concept.pseudonyms.clone();
        Ok(bound)
    }

    /// Build one concept at this factory's grain.
    pub fn build_concept(&mut self, address: &str) -> Result<BuildConcept> {
        if let Some(hit) = self.cache.get(address) {
            return Ok(hit.clone());
        }
        if let Some(start) = self
            .visiting
            .iter()
            .position(|(a, g)| a == address && *g == self.grain)
        {
            let cycle: Vec<&str> = self.visiting[start..]
                .iter()
                .map(|(a, _)| a.as_str())
                .chain(std::iter::once(address))
                .collect();
            return Err(Error::syntax(format!("circular lineage: {}", cycle.join(" -> "))));
        }
        self.visiting.push((address.to_string(), self.grain.clone()));
        let result = self.build_uncached(address);
        self.visiting.pop();
        let built = result?;
        self.cache.insert(address.to_string(), built.clone());
        if built.address != address {
            self.cache.insert(built.address.clone(), built.clone());
        }
        Ok(built)
    }

    fn build_uncached(&mut self, address: &str) -> Result<BuildConcept> {
        let base = self.authoring(address)?;
        let (lineage, grain, keys) = self.select_grain_and_keys(&base, &mut Vec::new())?;
        let lineage = match lineage {
            Some(Lineage::Function(f)) if f.operator == FunctionType::Group => {
                Some(Lineage::Function(self.bind_group_target(f)?))
            }
            other => other,
        };
        match &lineage {
            // Nested selects bind their own aggregates; building them at this
            // grain would group them by the outputs they produce.
            Some(Lineage::MultiSelect(multi)) => {
                for select in &multi.selects {
                    self.check_nested_select(select)?;
                }
            }
            Some(Lineage::Rowset(item)) => self.check_nested_select(&item.rowset.select)?,
            _ => {
                for arg in lineage.iter().flat_map(Lineage::concept_arguments) {
                    if arg == base.address {
                        return Err(Error::syntax(format!("concept {} references itself", arg)));
                    }
                    self.build_concept(&arg)?;
                }
            }
        }
        let is_aggregate = lineage.as_ref().is_some_and(Lineage::is_aggregate);
        let arguments = lineage
            .as_ref()
            .map(Lineage::concept_arguments)
            .unwrap_or_default();
        let granularity = match base.derivation {
            Derivation::Constant => Granularity::SingleRow,
            Derivation::Aggregate if grain.is_abstract() => Granularity::SingleRow,
            Derivation::Aggregate => Granularity::MultiRow,
            Derivation::Basic | Derivation::Filter | Derivation::Window
                if !arguments.is_empty()
                    && arguments.iter().all(|a| {
                        self.cache
                            .get(a)
                            .is_some_and(|c| c.granularity == Granularity::SingleRow)
                    }) =>
            {
                Granularity::SingleRow
            }
            _ => base.granularity,
        };
        let pseudonyms = base
            .pseudonyms
            .iter()
            .filter(|p| **p != base.address)
            .cloned()
            .collect();
        Ok(BuildConcept {
            address: base.address.clone(),
            name: base.name.clone(),
            namespace: base.namespace.clone(),
            datatype: base.datatype.clone(),
            purpose: base.purpose,
            lineage,
            keys,
            grain,
            modifiers: base.modifiers.clone(),
            pseudonyms,
            derivation: base.derivation,
            granularity,
            is_aggregate,
        })
    }

    /// Build the arguments of a nested select at that select's own grain.
    fn check_nested_select(&self, select: &SelectLineage) -> Result<()> {
        let grain = SelectStatement::from(select).grain(&self.lookup())?;
        let mut nested = Factory {
            environment: self.environment,
            local: self.local.clone(),
            grain,
            cache: BTreeMap::new(),
            visiting: self.visiting.clone(),
        };
        for arg in select.concept_arguments() {
            nested.build_concept(&arg)?;
        }
        Ok(())
    }

    /// Bind an unbound aggregate to the statement grain.
    ///
    /// `trail` holds the basic derivations walked so far when collecting the
    /// keys of parent concepts.
    fn select_grain_and_keys(
        &self,
        base: &Concept,
        trail: &mut Vec<Address>,
    ) -> Result<(Option<Lineage>, Grain, Option<BTreeSet<Address>>)> {
        let final_grain = if base.grain.components.is_empty() {
            self.grain.clone()
        } else {
            base.grain.clone()
        };
        match &base.lineage {
            Some(Lineage::Aggregate(agg)) if agg.by.is_empty() => {
                if self.grain.is_abstract() {
                    return Ok((base.lineage.clone(), Grain::default(), base.keys.clone()));
                }
                let by: Vec<Address> = self.grain.components.iter().cloned().collect();
                let keys = by.iter().cloned().collect();
                Ok((
                    Some(Lineage::Aggregate(AggregateWrapper {
                        function: agg.function.clone(),
                        by,
                    })),
                    self.grain.clone().with_where(None),
                    Some(keys),
                ))
            }
            Some(lineage) if base.derivation == Derivation::Basic => {
                if let Some(start) = trail.iter().position(|a| *a == base.address) {
                    let mut cycle = trail[start..].to_vec();
                    cycle.push(base.address.clone());
                    return Err(Error::syntax(format!("circular lineage: {}", cycle.join(" -> "))));
                }
                trail.push(base.address.clone());
                let mut pkeys = BTreeSet::new();
                for arg in lineage.concept_arguments() {
                    let parent = self.authoring(&arg)?;
                    let (_, _, parent_keys) = self.select_grain_and_keys(&parent, trail)?;
                    match parent_keys {
                        Some(k) if !k.is_empty() => pkeys.extend(k),
                        _ if parent.derivation != Derivation::Constant => {
                            pkeys.insert(parent.address.clone());
                        }
                        _ => {}
                    }
                }
                trail.pop();
                let scoped = self.lookup();
                let parents: Vec<&Concept> = pkeys.iter().filter_map(|k| scoped.lookup(k)).collect();
                let grain = Grain::from_concepts(&parents, |a| scoped.lookup(a));
                Ok((base.lineage.clone(), grain, Some(pkeys)))
            }
            _ => Ok((base.lineage.clone(), final_grain, base.keys.clone())),
        }
    }

    /// `group(metric, keys...)` over an unbound aggregate computes the
    /// aggregate at the group keys, through a virtual concept.
    fn bind_group_target(&mut self, mut function: Function) -> Result<Function> {
        let Some(target) = function.arguments.first().and_then(Expr::as_concept) else {
            return Ok(function);
        };
        let content = self.authoring(target)?;
        let by: Vec<Address> = function.arguments[1..]
            .iter()
            .flat_map(Expr::concept_arguments)
            .collect();
        let Some(Lineage::Aggregate(agg)) = &content.lineage else {
            return Ok(function);
        };
        if !agg.by.is_empty() {
            return Ok(function);
        }
        let virtual_address = virtual_address(&content.address, &by);
        if !self.cache.contains_key(&virtual_address) {
            let scoped = self.lookup();
            let by_concepts: Vec<&Concept> = by.iter().filter_map(|b| scoped.lookup(b)).collect();
            let grain = Grain::from_concepts(&by_concepts, |a| scoped.lookup(a));
            for b in &by {
                self.build_concept(b)?;
            }
            for a in agg.function.concept_arguments() {
                self.build_concept(&a)?;
            }
            let (namespace, name) = split_address(&virtual_address);
            let virt = BuildConcept {
                address: virtual_address.clone(),
                name: name.to_string(),
                namespace: namespace.to_string(),
                datatype: content.datatype.clone(),
                purpose: Purpose::Metric,
                lineage: Some(Lineage::Aggregate(AggregateWrapper {
                    function: agg.function.clone(),
                    by: by.clone(),
                })),
                keys: Some(by.iter().cloned().collect()),
                granularity: if grain.is_abstract() {
                    Granularity::SingleRow
                } else {
                    Granularity::MultiRow
                },
                grain,
                modifiers: content.modifiers.clone(),
                pseudonyms: BTreeSet::new(),
                derivation: Derivation::Aggregate,
                is_aggregate: true,
            };
            self.cache.insert(virtual_address.clone(), virt);
        }
        function.arguments[0] = Expr::Concept(virtual_address);
        Ok(function)
    }

    pub fn build_datasource(&mut self, datasource: &Datasource) -> Result<BuildDatasource> {
        for col in &datasource.columns {
            self.build_concept(&col.concept)?;
        }
        let scoped = self.lookup();
        let grain = datasource.resolved_grain(&scoped);
        Ok(BuildDatasource {
            name: datasource.name.clone(),
            namespace: datasource.namespace.clone(),
            identifier: datasource.identifier(),
            columns: datasource.columns.clone(),
            address: datasource.address.clone(),
            grain,
            where_clause: datasource.where_clause.clone(),
            non_partial_for: datasource.non_partial_for.clone(),
        })
    }

    /// Build every concept and datasource of the environment.
    pub fn build_environment(mut self) -> Result<BuildEnvironment> {
        let env = self.environment;
        let mut out = BuildEnvironment {
            namespace: env.namespace.clone(),
            ..Default::default()
        };
        let local: Vec<Address> = self.local.keys().cloned().collect();
        for address in local {
            self.build_concept(&address)?;
        }
        for (address, concept) in env.concepts.iter() {
            if !concept.unresolved.is_empty() && !env.fail_on_missing {
                // Left for late binding; only fails if actually used.
                if self.build_concept(address).is_err() {
                    continue;
                }
            }
            let built = self.build_concept(address)?;
            if built.address != *address {
                out.aliases.insert(address.clone(), built.address.clone());
            }
        }
        for (source, _) in env.alias_origin.iter() {
            if let Some(target) = env.concepts.get(source) {
                out.aliases.insert(source.clone(), target.address.clone());
            }
        }
        for (key, ds) in env.datasources.iter() {
            let built = self.build_datasource(ds)?;
            out.datasources.insert(key.clone(), built);
        }
        for (address, concept) in std::mem::take(&mut self.cache) {
            if concept.address == address {
                out.concepts.insert(address, concept);
            } else {
                out.aliases.entry(address).or_insert(concept.address);
            }
        }
        let aliases = &out.aliases;
        let mut canonical = |a: &str| aliases.get(a).cloned();
        for ds in out.datasources.values_mut() {
            for col in ds.columns.iter_mut() {
                if let Some(target) = canonical(&col.concept) {
                    col.concept = target;
                }
            }
            ds.grain.rewrite_addresses(&mut canonical);
            if let Some(w) = ds.where_clause.as_mut() {
                w.rewrite_addresses(&mut canonical);
            }
            if let Some(w) = ds.non_partial_for.as_mut() {
                w.rewrite_addresses(&mut canonical);
            }
        }
        out.gen_concept_list_caches();
        Ok(out)
    }
}

fn virtual_address(content: &str, by: &[Address]) -> Address {
    let mut hasher = Sha256::new();
    for b in by {
        hasher.update(b.as_bytes());
        hasher.update(b"|");
    }
    let digest = hasher.finalize();
    let short: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    let (namespace, name) = split_address(content);
    format!("{}._virt_agg_{}_{}", namespace, name, short)
}

/// A lookup that never defers missing references.
struct Strict<'a, L: ConceptLookup + ?Sized>(&'a L);

impl<L: ConceptLookup + ?Sized> ConceptLookup for Strict<'_, L> {
    fn lookup(&self, address: &str) -> Option<&Concept> {
        self.0.lookup(address)
    }

    fn suggestions(&self, address: &str) -> Vec<String> {
        self.0.suggestions(address)
    }
}
