//! Closed vocabularies shared by the concept model, the planner and the renderer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What role a concept plays in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Key,
    Property,
    UniqueProperty,
    Metric,
    Constant,
    Rowset,
    Auto,
}

/// How a concept's value is produced. Computed from lineage, never declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    Root,
    Constant,
    Basic,
    Aggregate,
    Window,
    Filter,
    Unnest,
    Union,
    Rowset,
    Multiselect,
    GroupTo,
    Recursive,
}

impl Derivation {
    /// Derivations that can be read straight off a datasource column.
    pub fn is_root_like(&self) -> bool {
        matches!(self, Derivation::Root | Derivation::Constant)
    }
}

impl fmt::Display for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Derivation::Root => "root",
            Derivation::Constant => "constant",
            Derivation::Basic => "basic",
            Derivation::Aggregate => "aggregate",
            Derivation::Window => "window",
            Derivation::Filter => "filter",
            Derivation::Unnest => "unnest",
            Derivation::Union => "union",
            Derivation::Rowset => "rowset",
            Derivation::Multiselect => "multiselect",
            Derivation::GroupTo => "group_to",
            Derivation::Recursive => "recursive",
        };
        write!(f, "{}", s)
    }
}

/// Whether a concept yields one row regardless of context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    SingleRow,
    MultiRow,
}

/// Column and concept modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    /// The column holds only a subset of the concept's values.
    Partial,
    Nullable,
    Hidden,
    Optional,
}

// ============================================================================
// Functions
// ============================================================================

/// Every function a concept lineage can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    // aggregates
    Count,
    CountDistinct,
    Sum,
    Avg,
    Max,
    Min,
    Any,
    ArrayAgg,

    // arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,

    // scalar
    Alias,
    Constant,
    Coalesce,
    Concat,
    Upper,
    Lower,
    Length,
    Abs,
    Round,
    Cast,
    Case,
    IsNull,
    Year,
    Month,
    Day,

    // single row
    CurrentDate,
    CurrentDatetime,

    // row generating / structural
    Unnest,
    Union,
    Group,
    RecurseEdge,
}

impl FunctionType {
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            FunctionType::Count
                | FunctionType::CountDistinct
                | FunctionType::Sum
                | FunctionType::Avg
                | FunctionType::Max
                | FunctionType::Min
                | FunctionType::Any
                | FunctionType::ArrayAgg
        )
    }

    /// Functions whose output is one row no matter the input.
    pub fn is_single_row(&self) -> bool {
        matches!(
            self,
            FunctionType::Constant | FunctionType::CurrentDate | FunctionType::CurrentDatetime
        )
    }

    /// Functions that may produce more rows than they consume.
    pub fn is_one_to_many(&self) -> bool {
        matches!(
            self,
            FunctionType::Unnest | FunctionType::Union | FunctionType::RecurseEdge
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            FunctionType::Add
                | FunctionType::Subtract
                | FunctionType::Multiply
                | FunctionType::Divide
                | FunctionType::Mod
        )
    }
}

/// Window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    RowNumber,
    Rank,
    DenseRank,
    Lag,
    Lead,
    Sum,
    Count,
    Avg,
    Max,
    Min,
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    In,
    NotIn,
    Is,
    IsNot,
    Like,
}

impl ComparisonOperator {
    pub fn is_membership(&self) -> bool {
        matches!(self, ComparisonOperator::In | ComparisonOperator::NotIn)
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::Ne => "!=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Lte => "<=",
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::In => "in",
            ComparisonOperator::NotIn => "not in",
            ComparisonOperator::Is => "is",
            ComparisonOperator::IsNot => "is not",
            ComparisonOperator::Like => "like",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanOperator {
    And,
    Or,
}

impl fmt::Display for BooleanOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BooleanOperator::And => write!(f, "and"),
            BooleanOperator::Or => write!(f, "or"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ordering {
    Asc,
    Desc,
    AscNullsFirst,
    AscNullsLast,
    DescNullsFirst,
    DescNullsLast,
}

impl Ordering {
    pub fn is_descending(&self) -> bool {
        matches!(
            self,
            Ordering::Desc | Ordering::DescNullsFirst | Ordering::DescNullsLast
        )
    }
}

// ============================================================================
// Planning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    Full,
    Cross,
}

impl JoinType {
    pub fn is_outer(&self) -> bool {
        matches!(
            self,
            JoinType::LeftOuter | JoinType::RightOuter | JoinType::Full
        )
    }
}

/// The operation a resolved datasource performs over its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Select,
    DirectSelect,
    Filter,
    Group,
    Window,
    Constant,
    Union,
    Recursive,
    Merge,
    Basic,
    Unnest,
    Rowset,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceType::Select => "select",
            SourceType::DirectSelect => "direct_select",
            SourceType::Filter => "filter",
            SourceType::Group => "group",
            SourceType::Window => "window",
            SourceType::Constant => "constant",
            SourceType::Union => "union",
            SourceType::Recursive => "recursive",
            SourceType::Merge => "merge",
            SourceType::Basic => "basic",
            SourceType::Unnest => "unnest",
            SourceType::Rowset => "rowset",
        };
        write!(f, "{}", s)
    }
}

/// Where a datasource's rows physically come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    #[default]
    Table,
    Csv,
    Tsv,
    Parquet,
    Query,
    Sql,
    PythonScript,
}

impl AddressKind {
    /// Relative cost of reading from this kind of source. Lower is preferred.
    pub fn materialization_cost(&self) -> u8 {
        match self {
            AddressKind::Table => 0,
            AddressKind::Csv | AddressKind::Tsv | AddressKind::Parquet => 1,
            AddressKind::Query | AddressKind::Sql => 2,
            AddressKind::PythonScript => 3,
        }
    }

    /// Sources rendered as a parenthesized subquery rather than a table name.
    pub fn is_query(&self) -> bool {
        matches!(self, AddressKind::Query | AddressKind::Sql)
    }
}
