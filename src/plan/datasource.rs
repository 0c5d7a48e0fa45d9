//! Resolved query datasources.
//!
//! A [`QueryDatasource`] is what a strategy node resolves to: a set of input
//! sources, the joins between them, and the map of which source supplies each
//! concept. Sources are referenced by identifier so the tree can be merged
//! and lowered without shared mutable pointers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use itertools::Itertools;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{
    Address, BuildConcept, BuildDatasource, Expr, Grain, JoinType, OrderBy, SourceType,
};

/// Name of the single-row source every constant is read from.
pub const CONSTANT_DATASET: &str = "grainql_constant_dataset";

/// Source map: concept address to the identifiers of the sources supplying it.
///
/// An empty set means the concept is computed at this level.
pub type SourceMap = BTreeMap<Address, BTreeSet<String>>;

/// One input of a query datasource.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRef {
    Datasource(BuildDatasource),
    Query(Box<QueryDatasource>),
}

impl SourceRef {
    pub fn identifier(&self) -> String {
        match self {
            SourceRef::Datasource(ds) => ds.identifier.clone(),
            SourceRef::Query(q) => q.identifier(),
        }
    }

    pub fn safe_identifier(&self) -> String {
        self.identifier().replace('.', "_")
    }

    pub fn output_addresses(&self) -> Vec<Address> {
        match self {
            SourceRef::Datasource(ds) => ds.output_concepts(),
            SourceRef::Query(q) => q.output_addresses(),
        }
    }

    /// Outputs that can be read by a consumer.
    pub fn usable_outputs(&self) -> Vec<Address> {
        match self {
            SourceRef::Datasource(ds) => ds.output_concepts(),
            SourceRef::Query(q) => q
                .output_addresses()
                .into_iter()
                .filter(|a| !q.hidden_concepts.contains(a))
                .collect(),
        }
    }

    pub fn partial_concepts(&self) -> BTreeSet<Address> {
        match self {
            SourceRef::Datasource(ds) => ds.partial_concepts(),
            SourceRef::Query(q) => q.partial_concepts.clone(),
        }
    }

    pub fn nullable_concepts(&self) -> BTreeSet<Address> {
        match self {
            SourceRef::Datasource(ds) => ds.nullable_concepts(),
            SourceRef::Query(q) => q.nullable_concepts.clone(),
        }
    }

    /// Usable outputs that hold every value of their concept.
    pub fn full_concepts(&self) -> Vec<Address> {
        let partial = self.partial_concepts();
        self.usable_outputs()
            .into_iter()
            .filter(|a| !partial.contains(a))
            .collect()
    }

    pub fn grain(&self) -> &Grain {
        match self {
            SourceRef::Datasource(ds) => &ds.grain,
            SourceRef::Query(q) => &q.grain,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, SourceRef::Datasource(ds) if ds.name == CONSTANT_DATASET)
    }

    pub fn as_datasource(&self) -> Option<&BuildDatasource> {
        match self {
            SourceRef::Datasource(ds) => Some(ds),
            SourceRef::Query(_) => None,
        }
    }

    pub fn as_query(&self) -> Option<&QueryDatasource> {
        match self {
            SourceRef::Query(q) => Some(q),
            SourceRef::Datasource(_) => None,
        }
    }
}

// ============================================================================
// Joins
// ============================================================================

/// Join keys between an existing source and the right side of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptPair {
    pub left: Address,
    pub right: Address,
    /// Identifier of the source the left concept is read from.
    pub existing_datasource: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaseJoin {
    pub left_datasource: Option<String>,
    pub right_datasource: String,
    pub join_type: JoinType,
    pub concept_pairs: Vec<ConceptPair>,
}

impl BaseJoin {
    /// Build a join, checking that every key exists on both sides.
    ///
    /// With no mutual keys the join degrades to `1=1` when one side is all
    /// single-row or all at an abstract grain.
    pub fn new(
        left: Option<&SourceRef>,
        right: &SourceRef,
        join_type: JoinType,
        concept_pairs: Vec<ConceptPair>,
        sources: &[SourceRef],
        lookup: &dyn Fn(&str) -> Option<BuildConcept>,
    ) -> Result<BaseJoin> {
        let right_id = right.identifier();
        if let Some(left) = left {
            if left.identifier() == right_id {
                return Err(Error::syntax(format!(
                    "Cannot join a datasource to itself, joining {}",
                    right_id
                )));
            }
        }
        for pair in &concept_pairs {
            let existing = sources
                .iter()
                .find(|s| s.identifier() == pair.existing_datasource)
                .ok_or_else(|| {
                    Error::syntax(format!(
                        "Join source {} is not an input of the join",
                        pair.existing_datasource
                    ))
                })?;
            if !binds(existing, &pair.left, lookup) {
                return Err(Error::syntax(format!(
                    "Join concept {} is not present on {}",
                    pair.left, pair.existing_datasource
                )));
            }
            if !binds(right, &pair.right, lookup) {
                return Err(Error::syntax(format!(
                    "Join concept {} is not present on {}",
                    pair.right, right_id
                )));
            }
        }
        if concept_pairs.is_empty() {
            let one_sided = |s: &SourceRef| {
                s.grain().is_abstract()
                    || s.output_addresses().iter().all(|a| {
                        lookup(a).is_some_and(|c| {
                            c.granularity == crate::model::Granularity::SingleRow
                        })
                    })
            };
            let trivially_joinable = one_sided(right) || left.is_some_and(one_sided);
            if !trivially_joinable && left.is_some() {
                return Err(Error::syntax(format!(
                    "No mutual join keys found between {} and {}",
                    left.map(SourceRef::identifier).unwrap_or_default(),
                    right_id
                )));
            }
        }
        Ok(BaseJoin {
            left_datasource: left.map(SourceRef::identifier),
            right_datasource: right_id,
            join_type,
            concept_pairs,
        })
    }
}

fn binds(source: &SourceRef, address: &str, lookup: &dyn Fn(&str) -> Option<BuildConcept>) -> bool {
    let outputs = source.output_addresses();
    if outputs.iter().any(|o| o == address) {
        return true;
    }
    lookup(address).is_some_and(|c| c.pseudonyms.iter().any(|p| outputs.contains(p)))
}

impl fmt::Display for BaseJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .concept_pairs
            .iter()
            .map(|p| format!("{}={}", p.left, p.right))
            .join(",");
        write!(
            f,
            "{:?} join {} on {}",
            self.join_type, self.right_datasource, keys
        )
    }
}

/// A lateral unnest of a list concept.
#[derive(Debug, Clone, PartialEq)]
pub struct UnnestJoin {
    pub concept: BuildConcept,
    pub alias: String,
}

impl UnnestJoin {
    pub fn new(concept: BuildConcept) -> Self {
        let alias = format!("unnest_{}", concept.safe_address());
        Self { concept, alias }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryJoin {
    Base(BaseJoin),
    Unnest(UnnestJoin),
}

// ============================================================================
// QueryDatasource
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct QueryDatasource {
    pub input_concepts: Vec<BuildConcept>,
    pub output_concepts: Vec<BuildConcept>,
    pub datasources: Vec<SourceRef>,
    pub source_type: SourceType,
    pub source_map: SourceMap,
    /// Sources used only for existence subselects.
    pub existence_source_map: SourceMap,
    pub grain: Grain,
    pub joins: Vec<QueryJoin>,
    pub condition: Option<Expr>,
    pub partial_concepts: BTreeSet<Address>,
    pub nullable_concepts: BTreeSet<Address>,
    pub hidden_concepts: BTreeSet<Address>,
    pub join_derived_concepts: Vec<Address>,
    pub force_group: Option<bool>,
    pub limit: Option<u64>,
    pub ordering: Option<OrderBy>,
}

impl QueryDatasource {
    pub fn new(source_type: SourceType, grain: Grain) -> Self {
        Self {
            input_concepts: Vec::new(),
            output_concepts: Vec::new(),
            datasources: Vec::new(),
            source_type,
            source_map: SourceMap::new(),
            existence_source_map: SourceMap::new(),
            grain,
            joins: Vec::new(),
            condition: None,
            partial_concepts: BTreeSet::new(),
            nullable_concepts: BTreeSet::new(),
            hidden_concepts: BTreeSet::new(),
            join_derived_concepts: Vec::new(),
            force_group: None,
            limit: None,
            ordering: None,
        }
    }

    /// Wrap a physical datasource so it can be lowered to its own CTE.
    pub fn from_datasource(ds: &BuildDatasource, concepts: Vec<BuildConcept>) -> Self {
        let mut qds = QueryDatasource::new(SourceType::DirectSelect, ds.grain.clone());
        for c in &concepts {
            qds.source_map
                .insert(c.address.clone(), BTreeSet::from([ds.identifier.clone()]));
        }
        qds.input_concepts = concepts.clone();
        qds.output_concepts = concepts;
        qds.partial_concepts = ds.partial_concepts();
        qds.nullable_concepts = ds.nullable_concepts();
        qds.datasources = vec![SourceRef::Datasource(ds.clone())];
        qds
    }

    pub fn output_addresses(&self) -> Vec<Address> {
        self.output_concepts.iter().map(|c| c.address.clone()).collect()
    }

    pub fn input_addresses(&self) -> Vec<Address> {
        self.input_concepts.iter().map(|c| c.address.clone()).collect()
    }

    pub fn has_output(&self, address: &str) -> bool {
        self.output_concepts.iter().any(|c| c.address == address)
    }

    /// A concept carried by this datasource, by address.
    pub fn concept(&self, address: &str) -> Option<&BuildConcept> {
        self.output_concepts
            .iter()
            .chain(self.input_concepts.iter())
            .find(|c| c.address == address)
    }

    /// Identifier derived from inputs, grain and condition.
    pub fn identifier(&self) -> String {
        let base = self.datasources.iter().map(SourceRef::identifier).join("_join_");
        let grain = if self.grain.is_abstract() {
            "_at_abstract".to_string()
        } else {
            format!(
                "_at_{}",
                self.grain.components.iter().map(|c| c.replace('.', "_")).join("_")
            )
        };
        let filter = match &self.condition {
            Some(c) => format!("_filtered_by_{}", short_hash(&c.to_string())),
            None => String::new(),
        };
        format!("{}{}{}", base, grain, filter)
    }

    pub fn safe_identifier(&self) -> String {
        self.identifier().replace('.', "_")
    }

    pub fn group_required(&self) -> bool {
        if let Some(force) = self.force_group {
            return force;
        }
        matches!(self.source_type, SourceType::Group)
    }

    /// Every input and output must be supplied by the source map.
    pub fn validate(&self) -> Result<()> {
        for c in self.input_concepts.iter().chain(self.output_concepts.iter()) {
            let found = self.source_map.contains_key(&c.address)
                || c.pseudonyms.iter().any(|p| self.source_map.contains_key(p));
            if !found {
                return Err(Error::syntax(format!(
                    "Missing source map entry for {} on {}; have {}",
                    c.address,
                    self.identifier(),
                    self.source_map.keys().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Combine two resolutions of the same shape.
    pub fn merge(self, other: QueryDatasource) -> Result<QueryDatasource> {
        if self == other {
            return Ok(self);
        }
        if self.grain != other.grain {
            return Err(Error::syntax(format!(
                "Cannot merge datasources with different grains: {} and {}",
                self.grain, other.grain
            )));
        }
        if self.group_required() != other.group_required()
            || self.force_group != other.force_group
        {
            return Err(Error::syntax(format!(
                "Cannot merge datasources with different grouping: {} and {}",
                self.identifier(),
                other.identifier()
            )));
        }
        if self.join_derived_concepts != other.join_derived_concepts {
            return Err(Error::syntax(
                "Cannot merge datasources with different join derived concepts",
            ));
        }
        let mut merged = self;
        for source in other.datasources {
            let id = source.identifier();
            match merged.datasources.iter().position(|d| d.identifier() == id) {
                Some(pos) => {
                    let existing = merged.datasources.remove(pos);
                    let combined = match (existing, source) {
                        (SourceRef::Query(a), SourceRef::Query(b)) => {
                            SourceRef::Query(Box::new(a.merge(*b)?))
                        }
                        (existing, _) => existing,
                    };
                    merged.datasources.insert(pos, combined);
                }
                None => merged.datasources.push(source),
            }
        }
        union_maps(&mut merged.source_map, other.source_map);
        union_maps(&mut merged.existence_source_map, other.existence_source_map);
        extend_unique(&mut merged.input_concepts, other.input_concepts);
        extend_unique(&mut merged.output_concepts, other.output_concepts);
        merged.hidden_concepts = merged
            .hidden_concepts
            .intersection(&other.hidden_concepts)
            .cloned()
            .collect();
        merged.partial_concepts.extend(other.partial_concepts);
        merged.nullable_concepts.extend(other.nullable_concepts);
        for join in other.joins {
            if !merged.joins.contains(&join) {
                merged.joins.push(join);
            }
        }
        merged.condition = match (merged.condition.take(), other.condition) {
            (Some(a), Some(b)) if a == b => Some(a),
            (Some(a), Some(b)) => Some(a.and(b)),
            (a, b) => a.or(b),
        };
        Ok(merged)
    }
}

fn union_maps(target: &mut SourceMap, other: SourceMap) {
    for (k, v) in other {
        target.entry(k).or_default().extend(v);
    }
}

pub(crate) fn extend_unique(target: &mut Vec<BuildConcept>, other: Vec<BuildConcept>) {
    for c in other {
        if !target.iter().any(|t| t.address == c.address) {
            target.push(c);
        }
    }
}

pub(crate) fn short_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

impl fmt::Display for QueryDatasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<{}>",
            self.identifier(),
            self.output_concepts.iter().map(|c| c.address.as_str()).join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{concept, lit, DataType, Derivation, Granularity, Purpose};

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

    fn qds(id: &str, outputs: &[&str]) -> QueryDatasource {
        let ds = BuildDatasource {
            name: id.into(),
            namespace: "local".into(),
            identifier: id.into(),
            columns: Vec::new(),
            address: crate::model::DatasourceAddress::table(id),
            grain: Grain::new(["local.a"]),
            where_clause: None,
            non_partial_for: None,
        };
        let concepts: Vec<BuildConcept> = outputs.iter().map(|o| key(o)).collect();
        QueryDatasource::from_datasource(&ds, concepts)
    }

    #[test]
    fn test_identifier_includes_grain_and_filter() {
        let mut q = qds("orders", &["local.a"]);
        assert_eq!(q.identifier(), "orders_at_local_a");
        q.condition = Some(concept("a").eq(lit(1)));
        assert!(q.identifier().starts_with("orders_at_local_a_filtered_by_"));
        assert_eq!(q.identifier(), q.clone().identifier());
    }

    #[test]
    fn test_merge_unions_outputs_and_intersects_hidden() {
        let mut a = qds("orders", &["local.a", "local.b"]);
        a.hidden_concepts.insert("local.b".into());
        let mut b = qds("orders", &["local.a", "local.c"]);
        b.hidden_concepts.insert("local.c".into());
        let merged = a.merge(b).unwrap();
        assert_eq!(merged.output_addresses(), vec!["local.a", "local.b", "local.c"]);
        assert!(merged.hidden_concepts.is_empty());
        assert_eq!(merged.datasources.len(), 1);
    }

    #[test]
    fn test_merge_rejects_grain_mismatch() {
        let a = qds("orders", &["local.a"]);
        let mut b = qds("orders", &["local.a", "local.b"]);
        b.grain = Grain::new(["local.b"]);
        assert!(a.merge(b).is_err());
    }

    #[test]
    fn test_validate_requires_source_map_entries() {
        let mut q = qds("orders", &["local.a"]);
        assert!(q.validate().is_ok());
        q.output_concepts.push(key("local.z"));
        let err = q.validate().unwrap_err();
        assert!(err.to_string().contains("local.z"));
    }

    #[test]
    fn test_self_join_is_rejected() {
        let q = SourceRef::Query(Box::new(qds("orders", &["local.a"])));
        let err = BaseJoin::new(Some(&q), &q, JoinType::Inner, Vec::new(), &[], &|_| None)
            .unwrap_err();
        assert!(err.to_string().contains("Cannot join a datasource to itself"));
    }
}
