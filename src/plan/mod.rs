//! Query plans: resolved datasources and the CTEs they lower to.

pub mod cte;
pub mod datasource;
pub mod lower;

pub use cte::{
    cte_lookup, merge_ctes, BaseTable, ColumnRef, Cte, CteConceptPair, CteJoin, CteKind,
    CteLookup, InstantiatedUnnestJoin, Join,
};
pub use datasource::{
    BaseJoin, ConceptPair, QueryDatasource, QueryJoin, SourceMap, SourceRef, UnnestJoin,
    CONSTANT_DATASET,
};
pub use lower::{Lowering, NamePool};
