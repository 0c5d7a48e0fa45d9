//! How a derived concept is produced from other concepts.

use serde::{Deserialize, Serialize};

use super::concept::Address;
use super::enums::{FunctionType, Purpose, WindowType};
use super::expr::{Expr, OrderBy, OrderItem, WhereClause};
use super::types::DataType;

/// A function applied to concept references and literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub operator: FunctionType,
    pub arguments: Vec<Expr>,
    #[serde(default)]
    pub output_datatype: DataType,
    #[serde(default = "default_purpose")]
    pub output_purpose: Purpose,
}

fn default_purpose() -> Purpose {
    Purpose::Property
}

impl Function {
    pub fn new(operator: FunctionType, arguments: Vec<Expr>) -> Self {
        let output_purpose = if operator.is_aggregate() {
            Purpose::Metric
        } else if operator.is_single_row() {
            Purpose::Constant
        } else {
            Purpose::Property
        };
        Self {
            operator,
            arguments,
            output_datatype: DataType::Unknown,
            output_purpose,
        }
    }

    pub fn with_output_datatype(mut self, datatype: DataType) -> Self {
        self.output_datatype = datatype;
        self
    }

    pub fn concept_arguments(&self) -> Vec<Address> {
        collect_all(&self.arguments, Expr::concept_arguments)
    }

    pub fn row_arguments(&self) -> Vec<Address> {
        collect_all(&self.arguments, Expr::row_arguments)
    }

    fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        for arg in self.arguments.iter_mut() {
            arg.rewrite_addresses(f);
        }
    }
}

fn collect_all(exprs: &[Expr], f: fn(&Expr) -> Vec<Address>) -> Vec<Address> {
    let mut out: Vec<Address> = Vec::new();
    for e in exprs {
        for a in f(e) {
            if !out.contains(&a) {
                out.push(a);
            }
        }
    }
    out
}

/// An aggregate bound to an explicit grain with `by`.
///
/// An empty `by` means the aggregate takes the grain of whatever statement
/// selects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateWrapper {
    pub function: Function,
    #[serde(default)]
    pub by: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowItem {
    pub window_type: WindowType,
    pub content: Address,
    #[serde(default)]
    pub over: Vec<Address>,
    #[serde(default)]
    pub order_by: Vec<OrderItem>,
    /// Offset for lag/lead.
    #[serde(default)]
    pub index: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterItem {
    pub content: Address,
    pub where_clause: WhereClause,
}

/// The body of a named sub-select: `rowset name <- select ...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectLineage {
    pub selection: Vec<Address>,
    #[serde(default)]
    pub where_clause: Option<WhereClause>,
    #[serde(default)]
    pub having_clause: Option<WhereClause>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
    /// Concepts declared inside the select.
    #[serde(default)]
    pub local_concepts: Vec<Address>,
}

impl SelectLineage {
    pub fn concept_arguments(&self) -> Vec<Address> {
        let mut out = self.selection.clone();
        let extra = self
            .where_clause
            .iter()
            .chain(self.having_clause.iter())
            .flat_map(|w| w.concept_arguments())
            .chain(self.order_by.iter().flat_map(|o| o.concept_arguments()));
        for a in extra {
            if !out.contains(&a) {
                out.push(a);
            }
        }
        out
    }

    fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        rewrite_list(&mut self.selection, f);
        rewrite_list(&mut self.local_concepts, f);
        if let Some(w) = self.where_clause.as_mut() {
            w.rewrite_addresses(f);
        }
        if let Some(h) = self.having_clause.as_mut() {
            h.rewrite_addresses(f);
        }
        if let Some(o) = self.order_by.as_mut() {
            for item in o.items.iter_mut() {
                if let Some(new) = f(&item.concept) {
                    item.concept = new;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetLineage {
    pub name: String,
    pub select: SelectLineage,
}

/// A concept exposed by a rowset, copying `content` as computed inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetItem {
    pub content: Address,
    pub rowset: Box<RowsetLineage>,
}

/// One aligned output of a multiselect, coalesced across its member selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignItem {
    pub alias: String,
    /// One concept per member select, in select order.
    pub concepts: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSelectLineage {
    pub selects: Vec<SelectLineage>,
    pub align: Vec<AlignItem>,
    pub namespace: String,
    #[serde(default)]
    pub where_clause: Option<WhereClause>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl MultiSelectLineage {
    pub fn align_address(&self, item: &AlignItem) -> Address {
        format!("{}.{}", self.namespace, item.alias)
    }

    /// The align item that lists `address` as one of its members.
    pub fn find_alignment(&self, address: &str) -> Option<&AlignItem> {
        self.align
            .iter()
            .find(|a| a.concepts.iter().any(|c| c == address))
    }

    pub fn concept_arguments(&self) -> Vec<Address> {
        let mut out: Vec<Address> = Vec::new();
        for select in &self.selects {
            for a in select.concept_arguments() {
                if !out.contains(&a) {
                    out.push(a);
                }
            }
        }
        out
    }
}

/// The derivation attached to a concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lineage {
    Function(Function),
    Aggregate(AggregateWrapper),
    Window(WindowItem),
    Filter(FilterItem),
    Rowset(RowsetItem),
    MultiSelect(MultiSelectLineage),
}

impl Lineage {
    pub fn concept_arguments(&self) -> Vec<Address> {
        match self {
            Lineage::Function(f) => f.concept_arguments(),
            Lineage::Aggregate(a) => {
                let mut out = a.function.concept_arguments();
                for b in &a.by {
                    if !out.contains(b) {
                        out.push(b.clone());
                    }
                }
                out
            }
            Lineage::Window(w) => {
                let mut out = vec![w.content.clone()];
                for a in w
                    .over
                    .iter()
                    .chain(w.order_by.iter().map(|o| &o.concept))
                {
                    if !out.contains(a) {
                        out.push(a.clone());
                    }
                }
                out
            }
            Lineage::Filter(f) => {
                let mut out = vec![f.content.clone()];
                for a in f.where_clause.concept_arguments() {
                    if !out.contains(&a) {
                        out.push(a);
                    }
                }
                out
            }
            Lineage::Rowset(r) => vec![r.content.clone()],
            Lineage::MultiSelect(m) => m.concept_arguments(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        match self {
            Lineage::Function(f) => f.operator.is_aggregate(),
            Lineage::Aggregate(a) => a.function.operator.is_aggregate(),
            _ => false,
        }
    }

    /// The function at the root of the lineage, if any.
    pub fn function(&self) -> Option<&Function> {
        match self {
            Lineage::Function(f) => Some(f),
            Lineage::Aggregate(a) => Some(&a.function),
            _ => None,
        }
    }

    pub fn operator(&self) -> Option<FunctionType> {
        self.function().map(|f| f.operator)
    }

    pub fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        match self {
            Lineage::Function(func) => func.rewrite_addresses(f),
            Lineage::Aggregate(agg) => {
                agg.function.rewrite_addresses(f);
                rewrite_list(&mut agg.by, f);
            }
            Lineage::Window(w) => {
                rewrite_one(&mut w.content, f);
                rewrite_list(&mut w.over, f);
                for item in w.order_by.iter_mut() {
                    rewrite_one(&mut item.concept, f);
                }
            }
            Lineage::Filter(filter) => {
                rewrite_one(&mut filter.content, f);
                filter.where_clause.rewrite_addresses(f);
            }
            Lineage::Rowset(r) => {
                rewrite_one(&mut r.content, f);
                r.rowset.select.rewrite_addresses(f);
            }
            Lineage::MultiSelect(m) => {
                for s in m.selects.iter_mut() {
                    s.rewrite_addresses(f);
                }
                for a in m.align.iter_mut() {
                    rewrite_list(&mut a.concepts, f);
                }
                if let Some(w) = m.where_clause.as_mut() {
                    w.rewrite_addresses(f);
                }
            }
        }
    }
}

fn rewrite_one(address: &mut Address, f: &mut dyn FnMut(&str) -> Option<Address>) {
    if let Some(new) = f(address) {
        *address = new;
    }
}

fn rewrite_list(addresses: &mut [Address], f: &mut dyn FnMut(&str) -> Option<Address>) {
    for a in addresses.iter_mut() {
        rewrite_one(a, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::expr::{concept, lit};

    #[test]
    fn test_aggregate_arguments_include_by() {
        let lineage = Lineage::Aggregate(AggregateWrapper {
            function: Function::new(FunctionType::Count, vec![concept("post_id")]),
            by: vec!["local.user_id".into()],
        });
        assert_eq!(
            lineage.concept_arguments(),
            vec!["local.post_id", "local.user_id"]
        );
        assert!(lineage.is_aggregate());
    }

    #[test]
    fn test_filter_arguments() {
        let lineage = Lineage::Filter(FilterItem {
            content: "local.order_id".into(),
            where_clause: WhereClause::new(concept("status").eq(lit("open"))),
        });
        assert_eq!(
            lineage.concept_arguments(),
            vec!["local.order_id", "local.status"]
        );
    }

    #[test]
    fn test_function_default_purpose() {
        assert_eq!(
            Function::new(FunctionType::Sum, vec![]).output_purpose,
            Purpose::Metric
        );
        assert_eq!(
            Function::new(FunctionType::Constant, vec![lit(1)]).output_purpose,
            Purpose::Constant
        );
    }
}
