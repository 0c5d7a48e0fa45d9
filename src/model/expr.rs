//! Expression trees used in lineage, filters and conditions.
//!
//! Concept references inside an expression are stored by address. They are
//! resolved against an environment when the expression is planned or rendered,
//! so merging or namespacing a concept rewrites addresses rather than nested
//! concept copies.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::concept::{qualify, Address};
use super::enums::{BooleanOperator, ComparisonOperator, Ordering};
use super::lineage::Function;
use super::types::{DataType, Literal};

/// A scalar or boolean expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Concept(Address),
    Literal(Literal),
    Function(Box<Function>),
    Comparison(Box<Comparison>),
    Conditional(Box<Conditional>),
    Parenthetical(Box<Expr>),
    CaseWhen(Box<CaseWhen>),
    CaseElse(Box<Expr>),
    List(Vec<Expr>),
    /// A type operand, used as the second argument of a cast.
    Type(DataType),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub left: Expr,
    pub right: Expr,
    pub operator: ComparisonOperator,
}

impl Comparison {
    pub fn new(left: Expr, operator: ComparisonOperator, right: Expr) -> Self {
        Self {
            left,
            right,
            operator,
        }
    }

    /// A membership test against another concept, resolved as a subselect.
    pub fn is_subselect(&self) -> bool {
        self.operator.is_membership() && matches!(self.right, Expr::Concept(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    pub left: Expr,
    pub right: Expr,
    pub operator: BooleanOperator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseWhen {
    pub comparison: Expr,
    pub expr: Expr,
}

// ============================================================================
// Constructors
// ============================================================================

/// Reference a concept by name or address.
pub fn concept(name: &str) -> Expr {
    Expr::Concept(qualify(name))
}

/// Alias of [`concept`], reading like a column reference.
pub fn col(name: &str) -> Expr {
    concept(name)
}

pub fn lit(value: impl Into<Literal>) -> Expr {
    Expr::Literal(value.into())
}

pub fn null() -> Expr {
    Expr::Literal(Literal::Null)
}

impl Expr {
    pub fn compare(self, operator: ComparisonOperator, other: Expr) -> Expr {
        Expr::Comparison(Box::new(Comparison::new(self, operator, other)))
    }

    pub fn eq(self, other: Expr) -> Expr {
        self.compare(ComparisonOperator::Eq, other)
    }

    pub fn ne(self, other: Expr) -> Expr {
        self.compare(ComparisonOperator::Ne, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        self.compare(ComparisonOperator::Gt, other)
    }

    pub fn gte(self, other: Expr) -> Expr {
        self.compare(ComparisonOperator::Gte, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        self.compare(ComparisonOperator::Lt, other)
    }

    pub fn lte(self, other: Expr) -> Expr {
        self.compare(ComparisonOperator::Lte, other)
    }

    pub fn is_in(self, other: Expr) -> Expr {
        self.compare(ComparisonOperator::In, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::Conditional(Box::new(Conditional {
            left: self,
            right: other,
            operator: BooleanOperator::And,
        }))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Conditional(Box::new(Conditional {
            left: self,
            right: other,
            operator: BooleanOperator::Or,
        }))
    }

    pub fn paren(self) -> Expr {
        Expr::Parenthetical(Box::new(self))
    }

    pub fn as_concept(&self) -> Option<&str> {
        match self {
            Expr::Concept(address) => Some(address),
            _ => None,
        }
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Every concept address referenced, in first-seen order.
    pub fn concept_arguments(&self) -> Vec<Address> {
        let mut out = Vec::new();
        self.collect(&mut out, true);
        out
    }

    /// Concepts that must be present on the same row to evaluate this expression.
    pub fn row_arguments(&self) -> Vec<Address> {
        let mut out = Vec::new();
        self.collect(&mut out, false);
        out
    }

    /// Concept groups that are checked for existence in a separate subselect.
    pub fn existence_arguments(&self) -> Vec<Vec<Address>> {
        let mut out = Vec::new();
        self.collect_existence(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<Address>, include_subselects: bool) {
        match self {
            Expr::Concept(address) => {
                if !out.contains(address) {
                    out.push(address.clone());
                }
            }
            Expr::Literal(_) | Expr::Type(_) => {}
            Expr::Function(f) => {
                for arg in &f.arguments {
                    arg.collect(out, include_subselects);
                }
            }
            Expr::Comparison(c) => {
                c.left.collect(out, include_subselects);
                if include_subselects || !c.is_subselect() {
                    c.right.collect(out, include_subselects);
                }
            }
            Expr::Conditional(c) => {
                c.left.collect(out, include_subselects);
                c.right.collect(out, include_subselects);
            }
            Expr::Parenthetical(inner) | Expr::CaseElse(inner) => {
                inner.collect(out, include_subselects)
            }
            Expr::CaseWhen(cw) => {
                cw.comparison.collect(out, include_subselects);
                cw.expr.collect(out, include_subselects);
            }
            Expr::List(items) => {
                for item in items {
                    item.collect(out, include_subselects);
                }
            }
        }
    }

    fn collect_existence(&self, out: &mut Vec<Vec<Address>>) {
        match self {
            Expr::Comparison(c) => {
                if c.is_subselect() {
                    let args = c.right.concept_arguments();
                    if !out.contains(&args) {
                        out.push(args);
                    }
                }
            }
            Expr::Conditional(c) => {
                c.left.collect_existence(out);
                c.right.collect_existence(out);
            }
            Expr::Parenthetical(inner) => inner.collect_existence(out),
            _ => {}
        }
    }

    /// Rewrite concept addresses in place. `f` returns the replacement, if any.
    pub fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        match self {
            Expr::Concept(address) => {
                if let Some(new) = f(address) {
                    *address = new;
                }
            }
            Expr::Literal(_) | Expr::Type(_) => {}
            Expr::Function(func) => {
                for arg in func.arguments.iter_mut() {
                    arg.rewrite_addresses(f);
                }
            }
            Expr::Comparison(c) => {
                c.left.rewrite_addresses(f);
                c.right.rewrite_addresses(f);
            }
            Expr::Conditional(c) => {
                c.left.rewrite_addresses(f);
                c.right.rewrite_addresses(f);
            }
            Expr::Parenthetical(inner) | Expr::CaseElse(inner) => inner.rewrite_addresses(f),
            Expr::CaseWhen(cw) => {
                cw.comparison.rewrite_addresses(f);
                cw.expr.rewrite_addresses(f);
            }
            Expr::List(items) => {
                for item in items.iter_mut() {
                    item.rewrite_addresses(f);
                }
            }
        }
    }

    /// Split a condition into its top level AND components.
    pub fn decompose(&self) -> Vec<Expr> {
        match self {
            Expr::Conditional(c) if c.operator == BooleanOperator::And => {
                let mut out = c.left.decompose();
                out.extend(c.right.decompose());
                out
            }
            other => vec![other.clone()],
        }
    }

    /// Join conditions with AND. Returns `None` for an empty input.
    pub fn conjoin(parts: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        parts.into_iter().reduce(|acc, next| acc.and(next))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Concept(address) => write!(f, "{}", address),
            Expr::Literal(l) => write!(f, "{}", l),
            Expr::Function(func) => {
                write!(f, "{:?}(", func.operator)?;
                for (i, arg) in func.arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Comparison(c) => write!(f, "{} {} {}", c.left, c.operator, c.right),
            Expr::Conditional(c) => write!(f, "{} {} {}", c.left, c.operator, c.right),
            Expr::Parenthetical(inner) => write!(f, "({})", inner),
            Expr::CaseWhen(cw) => write!(f, "WHEN {} THEN {}", cw.comparison, cw.expr),
            Expr::CaseElse(inner) => write!(f, "ELSE {}", inner),
            Expr::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Expr::Type(dt) => write!(f, "{}", dt),
        }
    }
}

// ============================================================================
// Clauses
// ============================================================================

/// A filter attached to a select, a filter concept or a datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub conditional: Expr,
}

impl WhereClause {
    pub fn new(conditional: Expr) -> Self {
        Self { conditional }
    }

    pub fn concept_arguments(&self) -> Vec<Address> {
        self.conditional.concept_arguments()
    }

    pub fn row_arguments(&self) -> Vec<Address> {
        self.conditional.row_arguments()
    }

    pub fn existence_arguments(&self) -> Vec<Vec<Address>> {
        self.conditional.existence_arguments()
    }

    /// Combine with another clause. Identical clauses are not duplicated.
    pub fn and(&self, other: &WhereClause) -> WhereClause {
        if self == other {
            return self.clone();
        }
        WhereClause::new(self.conditional.clone().and(other.conditional.clone()))
    }

    pub fn rewrite_addresses(&mut self, f: &mut dyn FnMut(&str) -> Option<Address>) {
        self.conditional.rewrite_addresses(f)
    }
}

impl fmt::Display for WhereClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.conditional)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub concept: Address,
    pub order: Ordering,
}

impl OrderItem {
    pub fn asc(name: &str) -> Self {
        Self {
            concept: qualify(name),
            order: Ordering::Asc,
        }
    }

    pub fn desc(name: &str) -> Self {
        Self {
            concept: qualify(name),
            order: Ordering::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderBy {
    pub items: Vec<OrderItem>,
}

impl OrderBy {
    pub fn new(items: Vec<OrderItem>) -> Self {
        Self { items }
    }

    pub fn concept_arguments(&self) -> Vec<Address> {
        self.items.iter().map(|i| i.concept.clone()).collect()
    }
}
