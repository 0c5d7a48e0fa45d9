//! Common table expressions, the unit the renderer emits.
//!
//! CTEs reference their parents by name. A compiled query owns a flat,
//! dependency-ordered list of them and looks parents up through a
//! [`CteLookup`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;

use super::datasource::{extend_unique, QueryDatasource, SourceRef};
use crate::error::{Error, Result};
use crate::model::{
    Address, BuildConcept, BuildDatasource, ColumnAlias, Derivation, Expr, FunctionType, Grain,
    JoinType, Lineage, Literal, OrderBy, Purpose,
};

pub type CteLookup<'a> = HashMap<&'a str, &'a Cte>;

/// Index a CTE list, including the members of union CTEs.
pub fn cte_lookup(ctes: &[Cte]) -> CteLookup<'_> {
    let mut out = HashMap::new();
    fn add<'a>(out: &mut CteLookup<'a>, cte: &'a Cte) {
        out.insert(cte.name.as_str(), cte);
        if let CteKind::Union { internal } = &cte.kind {
            for child in internal {
                add(out, child);
            }
        }
    }
    for cte in ctes {
        add(&mut out, cte);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CteConceptPair {
    pub left: Address,
    pub right: Address,
    /// The CTE the left concept is read from.
    pub cte: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CteJoin {
    pub left_cte: Option<String>,
    pub right_cte: String,
    pub join_type: JoinType,
    pub joinkey_pairs: Vec<CteConceptPair>,
    /// Parent CTEs replaced by their underlying table.
    pub inlined_ctes: BTreeMap<String, BaseTable>,
}

impl CteJoin {
    /// What the right side reads: the inlined table, or the CTE itself.
    pub fn right_table(&self) -> BaseTable {
        self.inlined_ctes
            .get(&self.right_cte)
            .cloned()
            .unwrap_or_else(|| BaseTable::Cte(self.right_cte.clone()))
    }

    /// The alias a pair's left side is read through.
    pub fn alias_for(&self, cte: &str) -> String {
        self.inlined_ctes
            .get(cte)
            .map(|b| b.alias().to_string())
            .unwrap_or_else(|| cte.to_string())
    }

    pub fn references(&self, name: &str) -> bool {
        self.right_cte == name
            || self.left_cte.as_deref() == Some(name)
            || self.joinkey_pairs.iter().any(|p| p.cte == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstantiatedUnnestJoin {
    pub concept: BuildConcept,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Join {
    Cte(CteJoin),
    Unnest(InstantiatedUnnestJoin),
}

impl std::fmt::Display for Join {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Join::Cte(j) => write!(
                f,
                "{:?} {} on {}",
                j.join_type,
                j.right_cte,
                j.joinkey_pairs
                    .iter()
                    .map(|p| format!("{}.{}={}", p.cte, p.left, p.right))
                    .join(",")
            ),
            Join::Unnest(u) => write!(f, "unnest {}", u.alias),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CteKind {
    Standard,
    /// Members rendered in sequence joined by `UNION ALL`.
    Union { internal: Vec<Cte> },
    /// A `WITH RECURSIVE` edge walk over its single parent.
    Recursive,
}

/// What a CTE selects from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseTable {
    Table { location: String, alias: String, quoted: bool },
    Subquery { sql: String, alias: String },
    Cte(String),
}

impl BaseTable {
    pub fn alias(&self) -> &str {
        match self {
            BaseTable::Table { alias, .. } | BaseTable::Subquery { alias, .. } => alias,
            BaseTable::Cte(name) => name,
        }
    }

    pub fn for_datasource(ds: &BuildDatasource) -> BaseTable {
        if ds.address.is_query() {
            BaseTable::Subquery {
                sql: ds.address.location.clone(),
                alias: ds.safe_identifier(),
            }
        } else {
            BaseTable::Table {
                location: ds.address.location.clone(),
                alias: ds.safe_identifier(),
                quoted: ds.address.quoted,
            }
        }
    }
}

/// How a concept is read inside a CTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    /// A named column of the given source alias.
    Column { source: String, column: String },
    /// A raw SQL expression bound on a datasource.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub kind: CteKind,
    pub source: QueryDatasource,
    pub output_columns: Vec<BuildConcept>,
    /// Concept address to the names of the parents supplying it.
    pub source_map: BTreeMap<Address, Vec<String>>,
    pub existence_source_map: BTreeMap<Address, Vec<String>>,
    pub grain: Grain,
    pub group_to_grain: bool,
    pub parent_ctes: Vec<String>,
    pub joins: Vec<Join>,
    pub condition: Option<Expr>,
    pub partial_concepts: BTreeSet<Address>,
    pub nullable_concepts: BTreeSet<Address>,
    pub join_derived_concepts: Vec<Address>,
    pub hidden_concepts: BTreeSet<Address>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
    pub base_override: Option<BaseTable>,
}

impl Cte {
    pub fn output_addresses(&self) -> Vec<Address> {
        self.output_columns.iter().map(|c| c.address.clone()).collect()
    }

    pub fn has_output(&self, address: &str) -> bool {
        self.output_columns.iter().any(|c| c.address == address)
    }

    pub fn visible_outputs(&self) -> Vec<&BuildConcept> {
        self.output_columns
            .iter()
            .filter(|c| !self.hidden_concepts.contains(&c.address))
            .collect()
    }

    /// Selects straight from one physical datasource.
    pub fn root_datasource(&self) -> Option<&BuildDatasource> {
        match self.source.datasources.as_slice() {
            [SourceRef::Datasource(ds)] if !self.source.datasources[0].is_constant() => Some(ds),
            _ => None,
        }
    }

    pub fn is_union(&self) -> bool {
        matches!(self.kind, CteKind::Union { .. })
    }

    pub fn is_recursive(&self) -> bool {
        matches!(self.kind, CteKind::Recursive)
    }

    pub fn base(&self) -> BaseTable {
        if let Some(b) = &self.base_override {
            return b.clone();
        }
        if let Some(ds) = self.root_datasource() {
            return BaseTable::for_datasource(ds);
        }
        match self.parent_ctes.first() {
            Some(parent) => BaseTable::Cte(parent.clone()),
            None => BaseTable::Cte(self.name.clone()),
        }
    }

    pub fn base_alias(&self) -> String {
        self.base().alias().to_string()
    }

    pub fn safe_identifier(&self) -> &str {
        &self.name
    }

    /// A concept visible from this CTE, by address.
    pub fn get_concept(&self, address: &str, lookup: &CteLookup<'_>) -> Option<BuildConcept> {
        for parent in &self.parent_ctes {
            if let Some(p) = lookup.get(parent.as_str()) {
                if let Some(c) = p.output_columns.iter().find(|c| c.address == address) {
                    return Some(c.clone());
                }
            }
        }
        if let CteKind::Union { internal } = &self.kind {
            for child in internal {
                if let Some(c) = child.output_columns.iter().find(|c| c.address == address) {
                    return Some(c.clone());
                }
            }
        }
        self.source
            .concept(address)
            .or_else(|| self.output_columns.iter().find(|c| c.address == address))
            .cloned()
    }

    /// How `concept` is read from `source` (or the first source holding it).
    pub fn get_alias(
        &self,
        concept: &BuildConcept,
        source: Option<&str>,
        lookup: &CteLookup<'_>,
    ) -> Option<ColumnRef> {
        for parent in &self.parent_ctes {
            if source.is_some_and(|s| s != parent) {
                continue;
            }
            if let Some(p) = lookup.get(parent.as_str()) {
                if p.has_output(&concept.address) {
                    return Some(ColumnRef::Column {
                        source: parent.clone(),
                        column: concept.safe_address(),
                    });
                }
            }
        }
        for ds in &self.source.datasources {
            let id = ds.safe_identifier();
            if source.is_some_and(|s| s != id) {
                continue;
            }
            match ds {
                SourceRef::Datasource(raw) => {
                    let column = raw.columns.iter().find(|c| {
                        c.concept == concept.address || concept.pseudonyms.contains(&c.concept)
                    });
                    if let Some(col) = column {
                        return Some(match &col.alias {
                            ColumnAlias::Name(n) => ColumnRef::Column {
                                source: raw.safe_identifier(),
                                column: n.clone(),
                            },
                            ColumnAlias::Raw(sql) => ColumnRef::Raw(sql.clone()),
                        });
                    }
                }
                SourceRef::Query(q) => {
                    if q.has_output(&concept.address) {
                        return Some(ColumnRef::Column {
                            source: id,
                            column: concept.safe_address(),
                        });
                    }
                }
            }
        }
        None
    }

    /// Whether a FROM clause is needed at all.
    pub fn render_from_clause(&self) -> bool {
        if self
            .output_columns
            .iter()
            .all(|c| c.derivation == Derivation::Constant)
            && self.parent_ctes.is_empty()
            && !self.group_to_grain
        {
            return false;
        }
        if !self.source_map.values().any(|v| !v.is_empty()) {
            return false;
        }
        !(self.source.datasources.len() == 1 && self.source.datasources[0].is_constant())
    }

    /// Output columns that belong in the GROUP BY.
    pub fn group_concepts(&self, resolve: &dyn Fn(&str) -> Option<BuildConcept>) -> Vec<BuildConcept> {
        if !self.group_to_grain {
            return Vec::new();
        }
        let mut out: Vec<BuildConcept> = Vec::new();
        for c in &self.output_columns {
            if !self.is_not_in_group(c, resolve, 0) && !out.iter().any(|o| o.address == c.address) {
                out.push(c.clone());
            }
        }
        out
    }

    fn is_not_in_group(
        &self,
        c: &BuildConcept,
        resolve: &dyn Fn(&str) -> Option<BuildConcept>,
        depth: usize,
    ) -> bool {
        if self.source_map.get(&c.address).is_some_and(|v| !v.is_empty()) {
            return false;
        }
        if depth > 32 {
            return false;
        }
        match (&c.derivation, &c.lineage) {
            (Derivation::Rowset, Some(Lineage::Rowset(r))) => resolve(&r.content)
                .is_some_and(|inner| self.is_not_in_group(&inner, resolve, depth + 1)),
            (Derivation::Constant, _) => true,
            _ if c.purpose == Purpose::Metric => true,
            (Derivation::Basic, Some(lineage)) => {
                let args = lineage.concept_arguments();
                if args.iter().all(|a| {
                    resolve(a).is_some_and(|arg| self.is_not_in_group(&arg, resolve, depth + 1))
                }) {
                    return true;
                }
                if lineage.operator() == Some(FunctionType::Group) {
                    return args.first().and_then(|a| resolve(a)).is_some_and(|arg| {
                        self.is_not_in_group(&arg, resolve, depth + 1)
                    });
                }
                false
            }
            _ => false,
        }
    }

    /// Replace a constant concept with its literal value.
    pub fn inline_constant(&mut self, concept: &BuildConcept) -> bool {
        if concept.derivation != Derivation::Constant {
            return false;
        }
        let Some(Lineage::Function(f)) = &concept.lineage else {
            return false;
        };
        if f.operator != FunctionType::Constant {
            return false;
        }
        let Some(Expr::Literal(value)) = f.arguments.first() else {
            return false;
        };
        let removed: Vec<String> = self.source_map.remove(&concept.address).unwrap_or_default();
        if let Some(condition) = self.condition.as_mut() {
            inline_literal(condition, &concept.address, value);
        }
        for removed_cte in removed {
            let still_required = self.source_map.values().any(|v| v.contains(&removed_cte));
            if still_required {
                continue;
            }
            self.joins.retain(|j| match j {
                Join::Cte(j) => !j.references(&removed_cte),
                Join::Unnest(_) => true,
            });
            self.parent_ctes.retain(|p| *p != removed_cte);
            if self.base_override == Some(BaseTable::Cte(removed_cte.clone())) {
                self.base_override = self.parent_ctes.first().cloned().map(BaseTable::Cte);
            }
        }
        true
    }

    /// Select from the parent's table directly instead of through its CTE.
    pub fn inline_parent_datasource(&mut self, parent: &Cte, force_group: bool) -> bool {
        let Some(ds) = parent.root_datasource() else {
            return false;
        };
        let ds_id = ds.safe_identifier();
        if self
            .source
            .datasources
            .iter()
            .any(|d| d.safe_identifier() == ds_id)
        {
            return false;
        }
        let parent_source_id = parent.source.safe_identifier();
        let was_base = self.base() == BaseTable::Cte(parent.name.clone());
        self.source
            .datasources
            .retain(|d| d.safe_identifier() != parent_source_id);
        self.source
            .datasources
            .insert(0, SourceRef::Datasource(ds.clone()));
        if was_base {
            self.base_override = Some(BaseTable::for_datasource(ds));
        }
        for join in self.joins.iter_mut() {
            if let Join::Cte(j) = join {
                if j.references(&parent.name) {
                    j.inlined_ctes
                        .insert(parent.name.clone(), BaseTable::for_datasource(ds));
                }
            }
        }
        for sources in self.source_map.values_mut() {
            for s in sources.iter_mut() {
                if *s == parent.name {
                    *s = ds_id.clone();
                }
            }
        }
        self.parent_ctes.retain(|p| *p != parent.name);
        if force_group {
            self.group_to_grain = true;
        }
        true
    }

    /// Combine with a CTE of the same name built by another branch.
    pub fn merge(&mut self, other: Cte) -> Result<()> {
        if self.is_union() != other.is_union() {
            return Err(Error::syntax(format!("Cannot merge union CTE {}", self.name)));
        }
        if self.grain != other.grain {
            return Err(Error::syntax(format!(
                "Cannot merge CTEs {} with different grains {} and {}",
                self.name, self.grain, other.grain
            )));
        }
        if self.condition != other.condition {
            return Err(Error::syntax(format!(
                "Cannot merge CTEs {} with different conditions",
                self.name
            )));
        }
        self.hidden_concepts = self
            .hidden_concepts
            .intersection(&other.hidden_concepts)
            .cloned()
            .collect();
        self.partial_concepts.extend(other.partial_concepts);
        self.nullable_concepts.extend(other.nullable_concepts);
        for p in other.parent_ctes {
            if !self.parent_ctes.contains(&p) {
                self.parent_ctes.push(p);
            }
        }
        for (k, v) in other.source_map {
            self.source_map.insert(k, v);
        }
        for (k, v) in other.existence_source_map {
            self.existence_source_map.insert(k, v);
        }
        extend_unique(&mut self.output_columns, other.output_columns);
        for j in other.joins {
            if !self.joins.contains(&j) {
                self.joins.push(j);
            }
        }
        for a in other.join_derived_concepts {
            if !self.join_derived_concepts.contains(&a) {
                self.join_derived_concepts.push(a);
            }
        }
        for (k, v) in other.source.source_map {
            self.source.source_map.entry(k).or_default().extend(v);
        }
        extend_unique(&mut self.source.output_concepts, other.source.output_concepts);
        Ok(())
    }

    /// Planner summary rendered above the CTE when comments are enabled.
    pub fn comment(&self) -> String {
        let mut out = format!(
            "Target: {}. Group: {}. Source: {}.",
            self.grain, self.group_to_grain, self.source.source_type
        );
        if !self.parent_ctes.is_empty() {
            out.push_str(&format!(" References: {}.", self.parent_ctes.join(", ")));
        }
        if !self.joins.is_empty() {
            out.push_str(&format!(
                "\n-- Joins: {}.",
                self.joins.iter().map(|j| j.to_string()).join(", ")
            ));
        }
        if !self.partial_concepts.is_empty() {
            out.push_str(&format!(
                "\n-- Partials: {}.",
                self.partial_concepts.iter().join(", ")
            ));
        }
        out.push_str(&format!(
            "\n-- Output: {}.",
            self.output_columns.iter().map(|c| c.address.as_str()).join(", ")
        ));
        if !self.hidden_concepts.is_empty() {
            out.push_str(&format!("\n-- Hidden: {}.", self.hidden_concepts.iter().join(", ")));
        }
        out
    }
}

fn inline_literal(expr: &mut Expr, address: &str, value: &Literal) {
    match expr {
        Expr::Concept(a) if a == address => *expr = Expr::Literal(value.clone()),
        Expr::Concept(_) | Expr::Literal(_) | Expr::Type(_) => {}
        Expr::Function(f) => {
            for arg in f.arguments.iter_mut() {
                inline_literal(arg, address, value);
            }
        }
        Expr::Comparison(c) => {
            inline_literal(&mut c.left, address, value);
            inline_literal(&mut c.right, address, value);
        }
        Expr::Conditional(c) => {
            inline_literal(&mut c.left, address, value);
            inline_literal(&mut c.right, address, value);
        }
        Expr::Parenthetical(inner) | Expr::CaseElse(inner) => inline_literal(inner, address, value),
        Expr::CaseWhen(cw) => {
            inline_literal(&mut cw.comparison, address, value);
            inline_literal(&mut cw.expr, address, value);
        }
        Expr::List(items) => {
            for item in items.iter_mut() {
                inline_literal(item, address, value);
            }
        }
    }
}

/// Merge CTEs sharing a name, keeping first-seen order.
pub fn merge_ctes(ctes: Vec<Cte>) -> Result<Vec<Cte>> {
    let mut out: Vec<Cte> = Vec::new();
    for cte in ctes {
        match out.iter_mut().find(|c| c.name == cte.name) {
            Some(existing) => existing.merge(cte)?,
            None => out.push(cte),
        }
    }
    Ok(out)
}
