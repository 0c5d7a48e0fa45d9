//! Physical and virtual table bindings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::concept::{address_with_namespace, qualify, Address, ConceptLookup, DEFAULT_NAMESPACE};
use super::enums::{AddressKind, Modifier};
use super::expr::WhereClause;
use super::grain::Grain;
use super::concept::Concept;

/// How a concept is read from a datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnAlias {
    /// A column name in the source.
    Name(String),
    /// A raw SQL expression evaluated against the source.
    Raw(String),
}

impl ColumnAlias {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            ColumnAlias::Name(n) => Some(n),
            ColumnAlias::Raw(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnAssignment {
    pub alias: ColumnAlias,
    pub concept: Address,
    #[serde(default)]
    pub modifiers: BTreeSet<Modifier>,
}

impl ColumnAssignment {
    pub fn is_partial(&self) -> bool {
        self.modifiers.contains(&Modifier::Partial)
    }

    pub fn is_nullable(&self) -> bool {
        self.modifiers.contains(&Modifier::Nullable)
    }
}

/// Where the rows come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceAddress {
    /// A table name, a file path or a query body depending on `kind`.
    pub location: String,
    #[serde(default)]
    pub kind: AddressKind,
    #[serde(default)]
    pub quoted: bool,
}

impl DatasourceAddress {
    pub fn table(location: &str) -> Self {
        Self {
            location: location.to_string(),
            kind: AddressKind::Table,
            quoted: false,
        }
    }

    pub fn query(sql: &str) -> Self {
        Self {
            location: sql.to_string(),
            kind: AddressKind::Query,
            quoted: false,
        }
    }

    pub fn is_query(&self) -> bool {
        self.kind.is_query()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasource {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub columns: Vec<ColumnAssignment>,
    pub address: DatasourceAddress,
    /// Declared grain. When absent the grain is taken from the key columns.
    #[serde(default)]
    pub grain: Option<Grain>,
    #[serde(default)]
    pub where_clause: Option<WhereClause>,
    /// Under this condition, partial columns are complete.
    #[serde(default)]
    pub non_partial_for: Option<WhereClause>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl Datasource {
    pub fn new(name: &str, address: DatasourceAddress) -> Self {
        Self {
            name: name.to_string(),
            namespace: default_namespace(),
            columns: Vec::new(),
            address,
            grain: None,
            where_clause: None,
            non_partial_for: None,
        }
    }

    /// Bind a source column to a concept.
    pub fn column(self, alias: &str, concept: &str) -> Self {
        self.column_with(ColumnAlias::Name(alias.to_string()), concept, &[])
    }

    /// Bind a source column that only holds a subset of the concept's values.
    pub fn partial_column(self, alias: &str, concept: &str) -> Self {
        self.column_with(ColumnAlias::Name(alias.to_string()), concept, &[Modifier::Partial])
    }

    pub fn nullable_column(self, alias: &str, concept: &str) -> Self {
        self.column_with(ColumnAlias::Name(alias.to_string()), concept, &[Modifier::Nullable])
    }

    /// Bind a raw SQL expression to a concept.
    pub fn raw_column(self, sql: &str, concept: &str) -> Self {
        self.column_with(ColumnAlias::Raw(sql.to_string()), concept, &[])
    }

    pub fn column_with(mut self, alias: ColumnAlias, concept: &str, modifiers: &[Modifier]) -> Self {
        self.columns.push(ColumnAssignment {
            alias,
            concept: qualify(concept),
            modifiers: modifiers.iter().copied().collect(),
        });
        self
    }

    pub fn with_grain(mut self, components: &[&str]) -> Self {
        self.grain = Some(Grain::new(components.iter().map(|c| qualify(c))));
        self
    }

    pub fn with_where(mut self, where_clause: WhereClause) -> Self {
        self.where_clause = Some(where_clause);
        self
    }

    pub fn with_non_partial_for(mut self, where_clause: WhereClause) -> Self {
        self.non_partial_for = Some(where_clause);
        self
    }

    /// Unique name of the datasource in its environment.
    pub fn identifier(&self) -> String {
        if self.namespace == DEFAULT_NAMESPACE || self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.namespace.replace('.', "_"), self.name)
        }
    }

    pub fn output_concepts(&self) -> impl Iterator<Item = &Address> {
        self.columns.iter().map(|c| &c.concept)
    }

    pub fn column_for(&self, address: &str) -> Option<&ColumnAssignment> {
        self.columns.iter().find(|c| c.concept == address)
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

    /// The declared grain, or the grain of the key columns.
    pub fn resolved_grain<L: ConceptLookup + ?Sized>(&self, lookup: &L) -> Grain {
        if let Some(g) = &self.grain {
            return g.clone();
        }
        let concepts: Vec<&Concept> = self
            .columns
            .iter()
            .filter(|c| !c.is_partial())
            .filter_map(|c| lookup.lookup(&c.concept))
            .collect();
        Grain::from_concepts(&concepts, |a| lookup.lookup(a))
    }

    pub fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        for col in self.columns.iter_mut() {
            if let Some(new) = f(&col.concept) {
                col.concept = new;
            }
        }
        if let Some(g) = self.grain.as_mut() {
            g.rewrite_addresses(f);
        }
        if let Some(w) = self.where_clause.as_mut() {
            w.rewrite_addresses(f);
        }
        if let Some(w) = self.non_partial_for.as_mut() {
            w.rewrite_addresses(f);
        }
    }

    /// A copy moved under `namespace`, with column bindings moved with it.
    pub fn with_namespace(&self, namespace: &str) -> Datasource {
        let mut ds = self.clone();
        ds.namespace = if self.namespace == DEFAULT_NAMESPACE {
            namespace.to_string()
        } else {
            format!("{}.{}", namespace, self.namespace)
        };
        ds.rewrite_addresses(&mut |a| Some(address_with_namespace(a, namespace)));
        ds
    }

    /// Merge a concept: columns bound to `source` now bind to `target`.
    ///
    /// A datasource that already binds `target` keeps that column and drops
    /// the duplicate.
    pub fn merge_concept(&mut self, source: &str, target: &str, modifiers: &[Modifier]) {
        let has_target = self.columns.iter().any(|c| c.concept == target);
        if has_target {
            self.columns.retain(|c| c.concept != source);
        } else {
            for col in self.columns.iter_mut().filter(|c| c.concept == source) {
                col.concept = target.to_string();
                col.modifiers.extend(modifiers.iter().copied());
            }
        }
        if let Some(g) = self.grain.as_mut() {
            g.rewrite_addresses(&mut |a| (a == source).then(|| target.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::DataType;
    use std::collections::BTreeMap;

    fn orders_ds() -> Datasource {
        Datasource::new("orders", DatasourceAddress::table("orders"))
            .column("id", "order_id")
            .column("customer", "customer_id")
            .column("amount", "revenue")
    }

    #[test]
    fn test_grain_defaults_to_key_columns() {
        let mut env = BTreeMap::new();
        for c in [
            Concept::key("order_id", DataType::Integer),
            Concept::key("customer_id", DataType::Integer),
            Concept::property("revenue", DataType::Float, &["order_id"]),
        ] {
            env.insert(c.address.clone(), c);
        }
        let grain = orders_ds().resolved_grain(&env);
        assert_eq!(grain, Grain::new(["local.customer_id", "local.order_id"]));

        let declared = orders_ds().with_grain(&["order_id"]).resolved_grain(&env);
        assert_eq!(declared, Grain::new(["local.order_id"]));
    }

    #[test]
    fn test_identifier_uses_namespace() {
        let ds = orders_ds().with_namespace("sales");
        assert_eq!(ds.identifier(), "sales_orders");
        assert!(ds.column_for("sales.order_id").is_some());
        assert_eq!(orders_ds().identifier(), "orders");
    }

    #[test]
    fn test_merge_concept_rewrites_column() {
        let mut ds = orders_ds();
        ds.merge_concept("local.customer_id", "local.client_id", &[Modifier::Partial]);
        let col = ds.column_for("local.client_id").unwrap();
        assert!(col.is_partial());
        assert!(ds.column_for("local.customer_id").is_none());
    }
}
