//! Statements a model script is made of.
//!
//! `Statement` is a closed sum type. Consumers dispatch with a single `match`,
//! so adding a statement kind is a compile error until every consumer handles
//! it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::concept::{qualify, Address, Concept, ConceptLookup, Scoped};
use super::datasource::Datasource;
use super::enums::Modifier;
use super::expr::{Expr, OrderBy, OrderItem, WhereClause};
use super::grain::Grain;
use super::lineage::{AlignItem, MultiSelectLineage, SelectLineage};
use crate::environment::Environment;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Statement {
    Select(SelectStatement),
    Persist(PersistStatement),
    MultiSelect(MultiSelectStatement),
    Show(ShowStatement),
    ConceptDeclaration(ConceptDeclarationStatement),
    Datasource(DatasourceStatement),
    Import(ImportStatement),
    RawSql(RawSqlStatement),
    Merge(MergeStatement),
    Copy(CopyStatement),
    Chart(ChartStatement),
    RowsetDerivation(RowsetDerivationStatement),
    Validate(ValidateStatement),
}

// ============================================================================
// Select
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub concept: Address,
    #[serde(default)]
    pub modifiers: BTreeSet<Modifier>,
}

impl SelectItem {
    pub fn is_hidden(&self) -> bool {
        self.modifiers.contains(&Modifier::Hidden)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectStatement {
    pub selection: Vec<SelectItem>,
    /// Concepts declared inline in the select list.
    #[serde(default)]
    pub local_concepts: Vec<Concept>,
    #[serde(default)]
    pub where_clause: Option<WhereClause>,
    #[serde(default)]
    pub having_clause: Option<WhereClause>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl SelectStatement {
    pub fn new(selection: &[&str]) -> Self {
        Self {
            selection: selection
                .iter()
                .map(|s| SelectItem {
                    concept: qualify(s),
                    modifiers: BTreeSet::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Declare a concept inside the select and project it, unless it is
    /// already projected.
    pub fn derive(mut self, concept: Concept) -> Self {
        if !self.selection.iter().any(|s| s.concept == concept.address) {
            self.selection.push(SelectItem {
                concept: concept.address.clone(),
                modifiers: BTreeSet::new(),
            });
        }
        self.local_concepts.push(concept);
        self
    }

    /// Project a concept without exposing it in the final output.
    pub fn hidden(mut self, name: &str) -> Self {
        let address = qualify(name);
        match self.selection.iter_mut().find(|s| s.concept == address) {
            Some(item) => {
                item.modifiers.insert(Modifier::Hidden);
            }
            None => self.selection.push(SelectItem {
                concept: address,
                modifiers: BTreeSet::from([Modifier::Hidden]),
            }),
        }
        self
    }

    pub fn with_where(mut self, condition: Expr) -> Self {
        self.where_clause = Some(WhereClause::new(condition));
        self
    }

    pub fn having(mut self, condition: Expr) -> Self {
        self.having_clause = Some(WhereClause::new(condition));
        self
    }

    pub fn order_by(mut self, items: Vec<OrderItem>) -> Self {
        self.order_by = Some(OrderBy::new(items));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn output_components(&self) -> Vec<Address> {
        self.selection.iter().map(|s| s.concept.clone()).collect()
    }

    pub fn hidden_components(&self) -> BTreeSet<Address> {
        self.selection
            .iter()
            .filter(|s| s.is_hidden())
            .map(|s| s.concept.clone())
            .collect()
    }

    pub fn locally_derived(&self) -> BTreeSet<Address> {
        self.local_concepts.iter().map(|c| c.address.clone()).collect()
    }

    pub fn local_map(&self) -> BTreeMap<Address, Concept> {
        self.local_concepts
            .iter()
            .map(|c| (c.address.clone(), c.clone()))
            .collect()
    }

    /// The grain of the projected concepts, carrying the where clause.
    pub fn grain<L: ConceptLookup + ?Sized>(&self, lookup: &L) -> Result<Grain> {
        let local = self.local_map();
        let scoped = Scoped {
            local: &local,
            parent: lookup,
        };
        let mut targets = Vec::new();
        for address in self.output_components() {
            targets.push(scoped.require(&address)?);
        }
        Ok(Grain::from_concepts(&targets, |a| scoped.lookup(a)).with_where(self.where_clause.clone()))
    }

    /// Reject clause usage that cannot be compiled.
    pub fn validate<L: ConceptLookup + ?Sized>(&self, lookup: &L) -> Result<()> {
        let local = self.local_map();
        let scoped = Scoped {
            local: &local,
            parent: lookup,
        };
        let mut seen = BTreeSet::new();
        for address in self.output_components() {
            scoped.require(&address)?;
            if !seen.insert(address.clone()) {
                return Err(Error::syntax(format!(
                    "concept {} is selected more than once",
                    address
                )));
            }
        }
        let derived = self.locally_derived();
        let outputs = self.output_components();
        if let Some(w) = &self.where_clause {
            super::concept::validate_where(w, &scoped)?;
            for a in w.concept_arguments() {
                let c = scoped.require(&a)?;
                if c.is_aggregate() && derived.contains(&a) {
                    return Err(Error::syntax(format!(
                        "cannot reference an aggregate derived in the select ({}) in the same statement where clause; move it to the HAVING clause instead",
                        a
                    )));
                }
            }
        }
        if let Some(h) = &self.having_clause {
            super::concept::validate_where(h, &scoped)?;
            for a in h.concept_arguments() {
                if !outputs.contains(&a) {
                    return Err(Error::syntax(format!(
                        "cannot reference a column ({}) that is not in the select projection in the HAVING clause; move it to WHERE",
                        a
                    )));
                }
            }
        }
        if let Some(o) = &self.order_by {
            for a in o.concept_arguments() {
                if !outputs.contains(&a) {
                    return Err(Error::syntax(format!(
                        "cannot order by column {} that is not in the output projection",
                        a
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn as_lineage(&self) -> SelectLineage {
        SelectLineage {
            selection: self.output_components(),
            where_clause: self.where_clause.clone(),
            having_clause: self.having_clause.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            local_concepts: self.locally_derived().into_iter().collect(),
        }
    }
}

/// A nested select as a standalone statement. Its local concepts are already
/// registered with the environment, so none are carried over.
impl From<&SelectLineage> for SelectStatement {
    fn from(select: &SelectLineage) -> Self {
        SelectStatement {
            selection: select
                .selection
                .iter()
                .map(|a| SelectItem {
                    concept: a.clone(),
                    modifiers: BTreeSet::new(),
                })
                .collect(),
            local_concepts: Vec::new(),
            where_clause: select.where_clause.clone(),
            having_clause: select.having_clause.clone(),
            order_by: select.order_by.clone(),
            limit: select.limit,
        }
    }
}

// ============================================================================
// Other statements
// ============================================================================

/// Materialize a select into a datasource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistStatement {
    pub datasource: Datasource,
    pub select: SelectStatement,
}

/// Several selects aligned on shared concepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiSelectStatement {
    pub selects: Vec<SelectStatement>,
    pub align: Vec<AlignItem>,
    pub namespace: String,
    #[serde(default)]
    pub where_clause: Option<WhereClause>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl MultiSelectStatement {
    pub fn new(namespace: &str, selects: Vec<SelectStatement>) -> Self {
        Self {
            selects,
            align: Vec::new(),
            namespace: namespace.to_string(),
            where_clause: None,
            order_by: None,
            limit: None,
        }
    }

    /// Align one concept from each select under `alias`.
    pub fn align(mut self, alias: &str, concepts: &[&str]) -> Self {
        self.align.push(AlignItem {
            alias: alias.to_string(),
            concepts: concepts.iter().map(|c| qualify(c)).collect(),
        });
        self
    }

    pub fn order_by(mut self, items: Vec<OrderItem>) -> Self {
        self.order_by = Some(OrderBy::new(items));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn as_lineage(&self) -> MultiSelectLineage {
        MultiSelectLineage {
            selects: self.selects.iter().map(SelectStatement::as_lineage).collect(),
            align: self.align.clone(),
            namespace: self.namespace.clone(),
            where_clause: self.where_clause.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
        }
    }

    /// Addresses of the aligned outputs.
    pub fn align_addresses(&self) -> Vec<Address> {
        self.align
            .iter()
            .map(|a| format!("{}.{}", self.namespace, a.alias))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowContent {
    Select(Box<SelectStatement>),
    Persist(Box<PersistStatement>),
    Concepts,
    Datasources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowStatement {
    pub content: ShowContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptDeclarationStatement {
    pub concept: Concept,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceStatement {
    pub datasource: Datasource,
}

/// Bring another environment in under `alias`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportStatement {
    pub alias: String,
    #[serde(default)]
    pub path: Option<String>,
    pub environment: Box<Environment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSqlStatement {
    pub text: String,
}

/// Merge each source concept into the target at the same position.
///
/// With `wildcard` set, every concept under the source namespace merges into
/// the concept of the same name under the target namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeStatement {
    pub sources: Vec<Address>,
    pub targets: Vec<Address>,
    #[serde(default)]
    pub wildcard: Option<(String, String)>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

impl MergeStatement {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            sources: vec![qualify(source)],
            targets: vec![qualify(target)],
            wildcard: None,
            modifiers: Vec::new(),
        }
    }

    pub fn namespaces(source: &str, target: &str) -> Self {
        Self {
            sources: Vec::new(),
            targets: Vec::new(),
            wildcard: Some((source.to_string(), target.to_string())),
            modifiers: Vec::new(),
        }
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyTarget {
    Csv,
}

/// Export the results of a select to a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyStatement {
    pub target: String,
    pub target_type: CopyTarget,
    pub select: SelectStatement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartStatement {
    pub select: SelectStatement,
    #[serde(default)]
    pub x: Option<Address>,
    #[serde(default)]
    pub y: Option<Address>,
}

/// `rowset name <- select ...`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsetDerivationStatement {
    pub name: String,
    pub select: SelectStatement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateStatement {
    /// Datasource names to validate. Empty means all.
    #[serde(default)]
    pub scope: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::enums::FunctionType;
    use crate::model::expr::{concept, lit};
    use crate::model::lineage::Function;
    use crate::model::types::DataType;

    fn env() -> BTreeMap<Address, Concept> {
        let mut env = BTreeMap::new();
        for c in [
            Concept::key("order_id", DataType::Integer),
            Concept::key("customer_id", DataType::Integer),
            Concept::property("revenue", DataType::Float, &["order_id"]),
            Concept::property("customer_name", DataType::String, &["customer_id"]),
        ] {
            env.insert(c.address.clone(), c);
        }
        env
    }

    #[test]
    fn test_grain_drops_properties_of_selected_keys() {
        let env = env();
        let select = SelectStatement::new(&["order_id", "revenue", "customer_name"]);
        let grain = select.grain(&env).unwrap();
        assert_eq!(grain, Grain::new(["local.customer_name", "local.order_id"]));
    }

    #[test]
    fn test_aggregate_in_where_is_rejected() {
        let env = env();
        let total = Concept::metric(
            "total",
            Function::new(FunctionType::Sum, vec![concept("revenue")]),
            &[],
            &env,
        )
        .unwrap();
        let select = SelectStatement::new(&["customer_id"])
            .derive(total)
            .with_where(concept("total").gt(lit(10)));
        let err = select.validate(&env).unwrap_err();
        assert!(err.to_string().contains("HAVING"));
    }

    #[test]
    fn test_having_outside_projection_is_rejected() {
        let env = env();
        let select = SelectStatement::new(&["customer_id"]).having(concept("revenue").gt(lit(10)));
        let err = select.validate(&env).unwrap_err();
        assert!(err.to_string().contains("move it to WHERE"));
    }

    #[test]
    fn test_hidden_marks_existing_item() {
        let select = SelectStatement::new(&["order_id", "revenue"]).hidden("revenue");
        assert_eq!(select.selection.len(), 2);
        assert_eq!(
            select.hidden_components(),
            BTreeSet::from(["local.revenue".to_string()])
        );
    }

    #[test]
    fn test_derive_does_not_duplicate_projection() {
        let env = env();
        let total = Concept::metric(
            "order_total",
            Function::new(FunctionType::Sum, vec![concept("revenue")]),
            &["order_id"],
            &env,
        )
        .unwrap();
        let select = SelectStatement::new(&["order_id", "order_total"]).derive(total);
        assert_eq!(
            select.output_components(),
            vec!["local.order_id".to_string(), "local.order_total".to_string()]
        );
        assert_eq!(select.local_concepts.len(), 1);
    }

    #[test]
    fn test_repeated_selection_is_rejected() {
        let env = env();
        let select = SelectStatement::new(&["order_id", "revenue", "order_id"]);
        let err = select.validate(&env).unwrap_err();
        assert!(err.to_string().contains("local.order_id is selected more than once"));
    }

    #[test]
    fn test_statement_json_tag() {
        let stmt = Statement::RawSql(RawSqlStatement {
            text: "select 1".into(),
        });
        let json = serde_json::to_string(&stmt).unwrap();
        assert!(json.contains("\"type\":\"raw_sql\""));
    }
}
