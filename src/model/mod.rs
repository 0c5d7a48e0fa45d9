//! Concept model: concepts, grains, datasources and statements.
//!
//! Authoring types (`Concept`, `Datasource`, statements) are what a model
//! author builds. The `build` module binds them to a statement grain for
//! planning.

pub mod build;
pub mod concept;
pub mod datasource;
pub mod enums;
pub mod expr;
pub mod grain;
pub mod lineage;
pub mod statement;
pub mod types;

pub use build::{BuildConcept, BuildDatasource, BuildEnvironment, Factory};
pub use concept::{Address, Concept, ConceptLookup, DEFAULT_NAMESPACE};
pub use datasource::{ColumnAlias, ColumnAssignment, Datasource, DatasourceAddress};
pub use enums::{
    AddressKind, BooleanOperator, ComparisonOperator, Derivation, FunctionType, Granularity,
    JoinType, Modifier, Ordering, Purpose, SourceType, WindowType,
};
pub use expr::{col, concept, lit, null, Comparison, Conditional, Expr, OrderBy, OrderItem, WhereClause};
pub use grain::Grain;
pub use lineage::{
    AggregateWrapper, AlignItem, FilterItem, Function, Lineage, MultiSelectLineage, RowsetItem,
    RowsetLineage, SelectLineage, WindowItem,
};
pub use statement::{
    ConceptDeclarationStatement, CopyStatement, CopyTarget, ChartStatement, DatasourceStatement,
    ImportStatement, MergeStatement, MultiSelectStatement, PersistStatement, RawSqlStatement,
    RowsetDerivationStatement, SelectItem, SelectStatement, ShowContent, ShowStatement, Statement,
    ValidateStatement,
};
pub use types::{DataType, Literal};
