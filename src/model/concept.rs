//! Authoring-time concepts.
//!
//! A concept is a named, namespaced business attribute. Its derivation,
//! granularity, keys and grain are computed once by the smart constructors
//! below from its lineage and the concepts that lineage references; callers
//! never assign them by hand.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::enums::{Derivation, FunctionType, Granularity, Modifier, Purpose, WindowType};
use super::expr::{Expr, WhereClause};
use super::grain::{Grain, GrainSource};
use super::lineage::{AggregateWrapper, FilterItem, Function, Lineage, WindowItem};
use super::types::{DataType, Literal};
use crate::error::{Error, Result};

/// A globally unique `namespace.name` identifier.
pub type Address = String;

pub const DEFAULT_NAMESPACE: &str = "local";

/// Qualify a bare name into the default namespace. Dotted names pass through.
pub fn qualify(name: &str) -> Address {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}.{}", DEFAULT_NAMESPACE, name)
    }
}

/// Split an address into `(namespace, name)` on the last dot.
pub fn split_address(address: &str) -> (&str, &str) {
    match address.rsplit_once('.') {
        Some((ns, name)) => (ns, name),
        None => (DEFAULT_NAMESPACE, address),
    }
}

/// Move an address under `namespace`. The default namespace is replaced
/// rather than nested.
pub fn address_with_namespace(address: &str, namespace: &str) -> Address {
    match address.split_once('.') {
        Some((DEFAULT_NAMESPACE, rest)) => format!("{}.{}", namespace, rest),
        _ => format!("{}.{}", namespace, address),
    }
}

/// An identifier safe to use as a SQL column alias.
pub fn safe_address(address: &str) -> String {
    match address.strip_prefix("local.") {
        Some(rest) => rest.replace('.', "_"),
        None => address.replace('.', "_"),
    }
}

/// Read access to concepts by address.
pub trait ConceptLookup {
    fn lookup(&self, address: &str) -> Option<&Concept>;

    /// Near matches for an unknown address, best first.
    fn suggestions(&self, _address: &str) -> Vec<String> {
        Vec::new()
    }

    /// When false, references to missing concepts are recorded and bound later.
    fn fail_on_missing(&self) -> bool {
        true
    }

    fn require(&self, address: &str) -> Result<&Concept> {
        self.lookup(address)
            .ok_or_else(|| Error::undefined(address, self.suggestions(address)))
    }
}

impl ConceptLookup for BTreeMap<Address, Concept> {
    fn lookup(&self, address: &str) -> Option<&Concept> {
        self.get(address)
    }
}

impl ConceptLookup for HashMap<Address, Concept> {
    fn lookup(&self, address: &str) -> Option<&Concept> {
        self.get(address)
    }
}

/// Layer locally declared concepts over another lookup.
pub struct Scoped<'a, L: ConceptLookup + ?Sized> {
    pub local: &'a BTreeMap<Address, Concept>,
    pub parent: &'a L,
}

impl<L: ConceptLookup + ?Sized> ConceptLookup for Scoped<'_, L> {
    fn lookup(&self, address: &str) -> Option<&Concept> {
        self.local
            .get(address)
            .or_else(|| self.parent.lookup(address))
    }

    fn suggestions(&self, address: &str) -> Vec<String> {
        self.parent.suggestions(address)
    }

    fn fail_on_missing(&self) -> bool {
        self.parent.fail_on_missing()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub namespace: String,
    pub address: Address,
    pub datatype: DataType,
    pub purpose: Purpose,
    #[serde(default)]
    pub lineage: Option<Lineage>,
    /// Concepts this one is functionally dependent on.
    #[serde(default)]
    pub keys: Option<BTreeSet<Address>>,
    #[serde(default)]
    pub grain: Grain,
    #[serde(default)]
    pub modifiers: BTreeSet<Modifier>,
    /// Addresses known to be equivalent through a merge.
    #[serde(default)]
    pub pseudonyms: BTreeSet<Address>,
    pub derivation: Derivation,
    pub granularity: Granularity,
    #[serde(default)]
    pub description: Option<String>,
    /// References not yet bound when the concept was declared.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unresolved: BTreeSet<Address>,
}

impl Concept {
    fn base(address: &str, datatype: DataType, purpose: Purpose) -> Self {
        let address = qualify(address);
        let (namespace, name) = split_address(&address);
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            address: address.clone(),
            datatype,
            purpose,
            lineage: None,
            keys: None,
            grain: Grain::default(),
            modifiers: BTreeSet::new(),
            pseudonyms: BTreeSet::new(),
            derivation: Derivation::Root,
            granularity: Granularity::MultiRow,
            description: None,
            unresolved: BTreeSet::new(),
        }
    }

    // ========================================================================
    // Smart constructors
    // ========================================================================

    /// A root key. Its grain is itself.
    pub fn key(name: &str, datatype: DataType) -> Self {
        let mut c = Self::base(name, datatype, Purpose::Key);
        c.grain = Grain::new([c.address.clone()]);
        c
    }

    /// A root property of the given keys.
    pub fn property(name: &str, datatype: DataType, keys: &[&str]) -> Self {
        let mut c = Self::base(name, datatype, Purpose::Property);
        let keys: BTreeSet<Address> = keys.iter().map(|k| qualify(k)).collect();
        c.grain = Grain::new(keys.iter().cloned());
        c.keys = Some(keys);
        c
    }

    /// A property that is unique per key value.
    pub fn unique_property(name: &str, datatype: DataType, keys: &[&str]) -> Self {
        let mut c = Self::property(name, datatype, keys);
        c.purpose = Purpose::UniqueProperty;
        c
    }

    /// A literal constant. Single-row and safe to cross join.
    pub fn constant(name: &str, value: impl Into<Literal>) -> Self {
        let value = value.into();
        let datatype = value.datatype();
        let mut c = Self::base(name, datatype.clone(), Purpose::Constant);
        c.lineage = Some(Lineage::Function(
            Function::new(FunctionType::Constant, vec![Expr::Literal(value)])
                .with_output_datatype(datatype),
        ));
        c.derivation = Derivation::Constant;
        c.granularity = Granularity::SingleRow;
        c
    }

    /// An aggregate metric, optionally bound to an explicit grain with `by`.
    pub fn metric<L: ConceptLookup + ?Sized>(
        name: &str,
        function: Function,
        by: &[&str],
        lookup: &L,
    ) -> Result<Self> {
        let by = by.iter().map(|b| qualify(b)).collect();
        Self::derived(name, Lineage::Aggregate(AggregateWrapper { function, by }), lookup)
    }

    /// A concept derived through any lineage.
    pub fn derived<L: ConceptLookup + ?Sized>(
        name: &str,
        lineage: Lineage,
        lookup: &L,
    ) -> Result<Self> {
        let lineage = match lineage {
            Lineage::Function(f) if f.operator.is_aggregate() => {
                Lineage::Aggregate(AggregateWrapper {
                    function: f,
                    by: Vec::new(),
                })
            }
            other => other,
        };
        let address = qualify(name);
        if lineage.concept_arguments().iter().any(|a| *a == address) {
            return Err(Error::syntax(format!(
                "concept {} cannot reference itself; use a new name when deriving it",
                address
            )));
        }
        let mut unresolved = BTreeSet::new();
        for arg in lineage.concept_arguments() {
            if lookup.lookup(&arg).is_none() {
                if lookup.fail_on_missing() {
                    return Err(Error::undefined(arg.clone(), lookup.suggestions(&arg)));
                }
                unresolved.insert(arg);
            }
        }
        if !unresolved.is_empty() {
            let mut c = Self::base(&address, DataType::Unknown, Purpose::Property);
            c.derivation = Derivation::Basic;
            c.lineage = Some(lineage);
            c.unresolved = unresolved;
            return Ok(c);
        }
        let mut c = match &lineage {
            Lineage::Function(f) => function_to_concept(&address, f, lookup)?,
            Lineage::Aggregate(a) => aggregate_to_concept(&address, a, lookup)?,
            Lineage::Window(w) => window_to_concept(&address, w, lookup)?,
            Lineage::Filter(f) => filter_to_concept(&address, f, lookup)?,
            Lineage::Rowset(r) => {
                let content = lookup.require(&r.content)?;
                let mut c = Self::base(&address, content.datatype.clone(), content.purpose);
                c.keys = content.keys.clone();
                c.grain = content.grain.clone();
                c.derivation = Derivation::Rowset;
                c.granularity = content.granularity;
                c
            }
            Lineage::MultiSelect(m) => {
                let dt = m
                    .find_alignment(&address)
                    .and_then(|a| a.concepts.first())
                    .and_then(|c| lookup.lookup(c))
                    .map(|c| c.datatype.clone())
                    .unwrap_or_default();
                let mut c = Self::base(&address, dt, Purpose::Key);
                c.derivation = Derivation::Multiselect;
                c
            }
        };
        c.lineage = Some(lineage);
        Ok(c)
    }

    pub fn with_purpose(mut self, purpose: Purpose) -> Self {
        if purpose == Purpose::Key {
            self.grain = Grain::new([self.address.clone()]);
        }
        self.purpose = purpose;
        self
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.insert(modifier);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_grain(mut self, grain: Grain) -> Self {
        self.grain = grain;
        self
    }

    // ========================================================================
    // Rewrites
    // ========================================================================

    /// Rewrite every referenced address, including this concept's own.
    pub fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        if let Some(new) = f(&self.address) {
            self.set_address(&new);
        }
        if let Some(lineage) = self.lineage.as_mut() {
            lineage.rewrite_addresses(f);
        }
        if let Some(keys) = self.keys.as_mut() {
            *keys = keys.iter().map(|k| f(k).unwrap_or_else(|| k.clone())).collect();
        }
        self.grain.rewrite_addresses(f);
        self.pseudonyms = self
            .pseudonyms
            .iter()
            .map(|p| f(p).unwrap_or_else(|| p.clone()))
            .collect();
        self.unresolved = self
            .unresolved
            .iter()
            .map(|p| f(p).unwrap_or_else(|| p.clone()))
            .collect();
    }

    fn set_address(&mut self, address: &str) {
        let (ns, name) = split_address(address);
        self.namespace = ns.to_string();
        self.name = name.to_string();
        self.address = address.to_string();
    }

    /// A copy moved under `namespace`, with every reference moved with it.
    pub fn with_namespace(&self, namespace: &str) -> Concept {
        let mut c = self.clone();
        c.rewrite_addresses(&mut |a| Some(address_with_namespace(a, namespace)));
        c
    }

    /// A copy with references to `source` pointed at `target`.
    pub fn with_merge(&self, source: &str, target: &str) -> Concept {
        let mut c = self.clone();
        if c.address == source {
            return c;
        }
        c.rewrite_addresses(&mut |a| (a == source).then(|| target.to_string()));
        c
    }

    // ========================================================================
    // Classification
    // ========================================================================

    pub fn is_aggregate(&self) -> bool {
        self.derivation == Derivation::Aggregate
    }

    /// The `by` list of an aggregate, if it has one.
    pub fn aggregate_by(&self) -> Option<&[Address]> {
        match &self.lineage {
            Some(Lineage::Aggregate(a)) if !a.by.is_empty() => Some(&a.by),
            _ => None,
        }
    }

    pub fn concept_arguments(&self) -> Vec<Address> {
        self.lineage
            .as_ref()
            .map(Lineage::concept_arguments)
            .unwrap_or_default()
    }

    pub fn is_nullable(&self) -> bool {
        self.modifiers.contains(&Modifier::Nullable)
    }

    pub fn is_hidden(&self) -> bool {
        self.modifiers.contains(&Modifier::Hidden)
    }

    pub fn safe_address(&self) -> String {
        safe_address(&self.address)
    }
}

impl GrainSource for Concept {
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
        self.is_aggregate() && self.aggregate_by().is_none()
    }

    fn is_aggregate(&self) -> bool {
        Concept::is_aggregate(self)
    }

    fn is_basic(&self) -> bool {
        self.derivation == Derivation::Basic
    }

    fn is_single_row(&self) -> bool {
        self.granularity == Granularity::SingleRow || self.derivation == Derivation::Constant
    }

    fn argument_addresses(&self) -> Vec<Address> {
        self.concept_arguments()
    }
}

impl fmt::Display for Concept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.grain)
    }
}

// ============================================================================
// Lineage to concept
// ============================================================================

fn upstream_modifiers(concepts: &[&Concept]) -> BTreeSet<Modifier> {
    concepts
        .iter()
        .flat_map(|c| c.modifiers.iter().copied())
        .filter(|m| *m == Modifier::Nullable)
        .collect()
}

fn resolve_all<'a, L: ConceptLookup + ?Sized>(
    addresses: &[Address],
    lookup: &'a L,
) -> Result<Vec<&'a Concept>> {
    addresses.iter().map(|a| lookup.require(a)).collect()
}

fn grain_of<L: ConceptLookup + ?Sized>(concepts: &[&Concept], lookup: &L) -> Grain {
    Grain::from_concepts(concepts, |a| lookup.lookup(a))
}

fn function_to_concept<L: ConceptLookup + ?Sized>(
    address: &str,
    function: &Function,
    lookup: &L,
) -> Result<Concept> {
    if function.operator == FunctionType::Group {
        return group_to_concept(address, function, lookup);
    }
    validate_comparisons_in(&function.arguments, lookup)?;
    let args = resolve_all(&function.concept_arguments(), lookup)?;
    let pkeys: Vec<&Concept> = args
        .iter()
        .copied()
        .filter(|c| c.derivation != Derivation::Constant && !c.is_unbound_aggregate())
        .collect();

    let mut keys = BTreeSet::new();
    for p in &pkeys {
        match &p.keys {
            Some(k) if !k.is_empty() => keys.extend(k.iter().cloned()),
            _ => {
                keys.insert(p.address.clone());
            }
        }
    }
    let grain = if function.operator.is_one_to_many() {
        Grain::default()
    } else {
        pkeys.iter().fold(Grain::default(), |acc, p| acc.union(&p.grain))
    };
    let purpose = if pkeys.is_empty() {
        Purpose::Constant
    } else {
        function.output_purpose
    };
    let (derivation, granularity) = match function.operator {
        FunctionType::Union => (Derivation::Union, Granularity::MultiRow),
        FunctionType::Unnest => (Derivation::Unnest, Granularity::MultiRow),
        FunctionType::RecurseEdge => (Derivation::Recursive, Granularity::MultiRow),
        op if op.is_single_row() => (Derivation::Constant, Granularity::SingleRow),
        _ if args.iter().all(|a| a.derivation == Derivation::Constant) => {
            (Derivation::Constant, Granularity::SingleRow)
        }
        _ => (Derivation::Basic, Granularity::MultiRow),
    };

    let mut c = Concept::base(address, infer_datatype(function, lookup), purpose);
    c.keys = Some(keys);
    c.grain = if purpose == Purpose::Key {
        Grain::new([c.address.clone()])
    } else {
        grain
    };
    c.modifiers = upstream_modifiers(&pkeys);
    c.derivation = derivation;
    c.granularity = granularity;
    Ok(c)
}

/// `group(content, k1, k2...)`: the content at the grain of the listed keys.
fn group_to_concept<L: ConceptLookup + ?Sized>(
    address: &str,
    function: &Function,
    lookup: &L,
) -> Result<Concept> {
    let target = function
        .arguments
        .first()
        .and_then(Expr::as_concept)
        .ok_or_else(|| Error::syntax("group requires a concept as its first argument"))?;
    let content = lookup.require(target)?;
    let by: Vec<Address> = function.arguments[1..]
        .iter()
        .flat_map(Expr::concept_arguments)
        .collect();
    let by_concepts = resolve_all(&by, lookup)?;
    let mut c = Concept::base(
        address,
        content.datatype.clone(),
        if content.is_aggregate() {
            Purpose::Metric
        } else {
            function.output_purpose
        },
    );
    c.keys = Some(by.iter().cloned().collect());
    c.grain = grain_of(&by_concepts, lookup);
    c.derivation = Derivation::GroupTo;
    c.modifiers = upstream_modifiers(&[content]);
    Ok(c)
}

fn aggregate_to_concept<L: ConceptLookup + ?Sized>(
    address: &str,
    wrapper: &AggregateWrapper,
    lookup: &L,
) -> Result<Concept> {
    validate_comparisons_in(&wrapper.function.arguments, lookup)?;
    let args = resolve_all(&wrapper.function.concept_arguments(), lookup)?;
    let by = resolve_all(&wrapper.by, lookup)?;
    let mut c = Concept::base(address, infer_datatype(&wrapper.function, lookup), Purpose::Metric);
    c.keys = if by.is_empty() {
        None
    } else {
        Some(wrapper.by.iter().cloned().collect())
    };
    c.grain = if by.is_empty() {
        Grain::default()
    } else {
        grain_of(&by, lookup)
    };
    c.modifiers = upstream_modifiers(&args);
    c.derivation = Derivation::Aggregate;
    c.granularity = Granularity::MultiRow;
    Ok(c)
}

fn window_to_concept<L: ConceptLookup + ?Sized>(
    address: &str,
    window: &WindowItem,
    lookup: &L,
) -> Result<Concept> {
    let content = lookup.require(&window.content)?;
    let over = resolve_all(&window.over, lookup)?;
    let order: Vec<Address> = window.order_by.iter().map(|o| o.concept.clone()).collect();
    let order = resolve_all(&order, lookup)?;

    let (purpose, keys) = if content.purpose == Purpose::Metric {
        (Purpose::Metric, Some(BTreeSet::from([content.address.clone()])))
    } else {
        let mut parts: Vec<&Concept> = vec![content];
        parts.extend(over.iter().copied());
        (Purpose::Property, Some(grain_of(&parts, lookup).components))
    };
    let mut grain_parts: Vec<&Concept> = over.clone();
    grain_parts.push(content);
    grain_parts.extend(order.iter().copied());

    let datatype = match window.window_type {
        WindowType::RowNumber
        | WindowType::Rank
        | WindowType::DenseRank
        | WindowType::Count => DataType::Integer,
        WindowType::Avg => DataType::Float,
        _ => content.datatype.clone(),
    };
    let mut c = Concept::base(address, datatype, purpose);
    c.keys = keys;
    c.grain = grain_of(&grain_parts, lookup);
    c.modifiers = upstream_modifiers(&[content]);
    c.derivation = Derivation::Window;
    c.granularity = content.granularity;
    Ok(c)
}

fn filter_to_concept<L: ConceptLookup + ?Sized>(
    address: &str,
    filter: &FilterItem,
    lookup: &L,
) -> Result<Concept> {
    let content = lookup.require(&filter.content)?;
    resolve_all(&filter.where_clause.concept_arguments(), lookup)?;
    validate_comparisons(&filter.where_clause.conditional, lookup)?;
    let is_property = content.purpose == Purpose::Property;
    let mut c = Concept::base(address, content.datatype.clone(), Purpose::Property);
    c.keys = if is_property {
        content.keys.clone()
    } else {
        Some(BTreeSet::from([content.address.clone()]))
    };
    c.grain = if is_property {
        content.grain.clone()
    } else {
        Grain::default()
    };
    c.modifiers = upstream_modifiers(&[content]);
    c.derivation = Derivation::Filter;
    c.granularity = content.granularity;
    Ok(c)
}

// ============================================================================
// Types
// ============================================================================

/// The datatype an expression evaluates to.
pub fn expr_datatype<L: ConceptLookup + ?Sized>(expr: &Expr, lookup: &L) -> DataType {
    match expr {
        Expr::Concept(a) => lookup.lookup(a).map(|c| c.datatype.clone()).unwrap_or_default(),
        Expr::Literal(l) => l.datatype(),
        Expr::Function(f) => infer_datatype(f, lookup),
        Expr::Comparison(_) | Expr::Conditional(_) => DataType::Bool,
        Expr::Parenthetical(inner) | Expr::CaseElse(inner) => expr_datatype(inner, lookup),
        Expr::CaseWhen(cw) => expr_datatype(&cw.expr, lookup),
        Expr::List(items) => DataType::list(
            items
                .first()
                .map(|i| expr_datatype(i, lookup))
                .unwrap_or_default(),
        ),
        Expr::Type(dt) => dt.clone(),
    }
}

fn infer_datatype<L: ConceptLookup + ?Sized>(function: &Function, lookup: &L) -> DataType {
    if function.output_datatype != DataType::Unknown {
        return function.output_datatype.clone();
    }
    let first = || {
        function
            .arguments
            .first()
            .map(|a| expr_datatype(a, lookup))
            .unwrap_or_default()
    };
    match function.operator {
        FunctionType::Count | FunctionType::CountDistinct | FunctionType::Length => {
            DataType::Integer
        }
        FunctionType::Year | FunctionType::Month | FunctionType::Day => DataType::Integer,
        FunctionType::Avg | FunctionType::Divide => DataType::Float,
        FunctionType::Upper | FunctionType::Lower | FunctionType::Concat => DataType::String,
        FunctionType::IsNull => DataType::Bool,
        FunctionType::CurrentDate => DataType::Date,
        FunctionType::CurrentDatetime => DataType::Datetime,
        FunctionType::ArrayAgg => DataType::list(first()),
        FunctionType::Unnest => first().element_type(),
        FunctionType::Cast => function
            .arguments
            .get(1)
            .map(|a| expr_datatype(a, lookup))
            .unwrap_or_default(),
        FunctionType::Case => function
            .arguments
            .iter()
            .map(|a| expr_datatype(a, lookup))
            .find(|d| *d != DataType::Unknown)
            .unwrap_or_default(),
        _ => first(),
    }
}

fn validate_comparisons_in<L: ConceptLookup + ?Sized>(args: &[Expr], lookup: &L) -> Result<()> {
    for a in args {
        validate_comparisons(a, lookup)?;
    }
    Ok(())
}

/// Reject comparisons between types that cannot be compared.
pub fn validate_comparisons<L: ConceptLookup + ?Sized>(expr: &Expr, lookup: &L) -> Result<()> {
    match expr {
        Expr::Comparison(c) => {
            validate_comparisons(&c.left, lookup)?;
            validate_comparisons(&c.right, lookup)?;
            if matches!(c.left, Expr::Literal(Literal::Null))
                || matches!(c.right, Expr::Literal(Literal::Null))
            {
                return Ok(());
            }
            let left = expr_datatype(&c.left, lookup);
            let right = expr_datatype(&c.right, lookup);
            if !left.is_comparable_with(&right) {
                return Err(Error::syntax(format!(
                    "cannot compare {} ({}) with {} ({})",
                    c.left, left, c.right, right
                )));
            }
            Ok(())
        }
        Expr::Conditional(c) => {
            validate_comparisons(&c.left, lookup)?;
            validate_comparisons(&c.right, lookup)
        }
        Expr::Parenthetical(inner) => validate_comparisons(inner, lookup),
        Expr::Function(f) => validate_comparisons_in(&f.arguments, lookup),
        Expr::CaseWhen(cw) => validate_comparisons(&cw.comparison, lookup),
        _ => Ok(()),
    }
}

/// Validate a where clause against the concepts it references.
pub fn validate_where<L: ConceptLookup + ?Sized>(clause: &WhereClause, lookup: &L) -> Result<()> {
    for a in clause.concept_arguments() {
        lookup.require(&a)?;
    }
    validate_comparisons(&clause.conditional, lookup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::expr::{concept, lit};

    fn orders() -> BTreeMap<Address, Concept> {
        let mut env = BTreeMap::new();
        for c in [
            Concept::key("order_id", DataType::Integer),
            Concept::key("customer_id", DataType::Integer),
            Concept::property("revenue", DataType::Float, &["order_id"]),
            Concept::property("status", DataType::String, &["order_id"]),
            Concept::constant("one", 1i64),
        ] {
            env.insert(c.address.clone(), c);
        }
        env
    }

    #[test]
    fn test_address_helpers() {
        assert_eq!(qualify("x"), "local.x");
        assert_eq!(qualify("db.x"), "db.x");
        assert_eq!(address_with_namespace("local.x", "db"), "db.x");
        assert_eq!(address_with_namespace("other.x", "db"), "db.other.x");
        assert_eq!(safe_address("local.x"), "x");
        assert_eq!(safe_address("db.other.x"), "db_other_x");
    }

    #[test]
    fn test_key_grain_is_self() {
        let k = Concept::key("order_id", DataType::Integer);
        assert_eq!(k.grain, Grain::new(["local.order_id"]));
        assert_eq!(k.derivation, Derivation::Root);
    }

    #[test]
    fn test_unbound_aggregate_is_abstract() {
        let env = orders();
        let m = Concept::metric(
            "total_revenue",
            Function::new(FunctionType::Sum, vec![concept("revenue")]),
            &[],
            &env,
        )
        .unwrap();
        assert_eq!(m.purpose, Purpose::Metric);
        assert_eq!(m.derivation, Derivation::Aggregate);
        assert!(m.grain.is_abstract());
        assert_eq!(m.datatype, DataType::Float);
    }

    #[test]
    fn test_bound_aggregate_takes_by_grain() {
        let env = orders();
        let m = Concept::metric(
            "orders_per_customer",
            Function::new(FunctionType::Count, vec![concept("order_id")]),
            &["customer_id"],
            &env,
        )
        .unwrap();
        assert_eq!(m.grain, Grain::new(["local.customer_id"]));
        assert_eq!(m.aggregate_by().map(|b| b.len()), Some(1));
    }

    #[test]
    fn test_basic_function_inherits_keys() {
        let env = orders();
        let c = Concept::derived(
            "double_revenue",
            Lineage::Function(Function::new(
                FunctionType::Multiply,
                vec![concept("revenue"), lit(2)],
            )),
            &env,
        )
        .unwrap();
        assert_eq!(c.derivation, Derivation::Basic);
        assert_eq!(c.keys, Some(BTreeSet::from(["local.order_id".to_string()])));
        assert_eq!(c.grain, Grain::new(["local.order_id"]));
    }

    #[test]
    fn test_function_of_constants_is_constant() {
        let env = orders();
        let c = Concept::derived(
            "two",
            Lineage::Function(Function::new(FunctionType::Add, vec![concept("one"), lit(1)])),
            &env,
        )
        .unwrap();
        assert_eq!(c.derivation, Derivation::Constant);
        assert_eq!(c.granularity, Granularity::SingleRow);
    }

    #[test]
    fn test_filter_of_key_uses_key_as_keys() {
        let env = orders();
        let f = Concept::derived(
            "open_order_id",
            Lineage::Filter(FilterItem {
                content: "local.order_id".into(),
                where_clause: WhereClause::new(concept("status").eq(lit("open"))),
            }),
            &env,
        )
        .unwrap();
        assert_eq!(f.purpose, Purpose::Property);
        assert_eq!(f.derivation, Derivation::Filter);
        assert_eq!(f.keys, Some(BTreeSet::from(["local.order_id".to_string()])));
        assert!(f.grain.is_abstract());
    }

    #[test]
    fn test_self_reference_rejected() {
        let env = orders();
        let err = Concept::derived(
            "revenue",
            Lineage::Function(Function::new(FunctionType::Add, vec![concept("revenue"), lit(1)])),
            &env,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot reference itself"));
    }

    #[test]
    fn test_missing_argument_suggests_nothing_without_environment() {
        let env = orders();
        let err = Concept::derived(
            "bad",
            Lineage::Function(Function::new(FunctionType::Upper, vec![concept("nope")])),
            &env,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UndefinedConcept { .. }));
    }

    #[test]
    fn test_incompatible_comparison_rejected() {
        let env = orders();
        let err = Concept::derived(
            "weird",
            Lineage::Filter(FilterItem {
                content: "local.order_id".into(),
                where_clause: WhereClause::new(concept("status").eq(lit(true))),
            }),
            &env,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot compare"));
    }

    #[test]
    fn test_with_namespace_moves_references() {
        let env = orders();
        let c = Concept::derived(
            "double_revenue",
            Lineage::Function(Function::new(
                FunctionType::Multiply,
                vec![concept("revenue"), lit(2)],
            )),
            &env,
        )
        .unwrap();
        let moved = c.with_namespace("sales");
        assert_eq!(moved.address, "sales.double_revenue");
        assert_eq!(moved.concept_arguments(), vec!["sales.revenue"]);
        assert_eq!(moved.grain, Grain::new(["sales.order_id"]));
    }

    #[test]
    fn test_window_over_property() {
        let env = orders();
        let w = Concept::derived(
            "revenue_rank",
            Lineage::Window(WindowItem {
                window_type: WindowType::Rank,
                content: "local.order_id".into(),
                over: vec!["local.customer_id".into()],
                order_by: vec![crate::model::expr::OrderItem::desc("revenue")],
                index: None,
            }),
            &env,
        )
        .unwrap();
        assert_eq!(w.datatype, DataType::Integer);
        assert_eq!(w.derivation, Derivation::Window);
        assert!(w.grain.contains("local.order_id"));
    }
}
