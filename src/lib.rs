//! # grainql
//!
//! A semantic query compiler: queries name concepts, and the compiler finds
//! the datasources, joins and aggregations needed to produce them at the
//! requested grain, then renders a CTE chain in one of several SQL dialects.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Environment (concepts, datasources, merges)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [model::build]
//! ┌─────────────────────────────────────────────────────────┐
//! │     BuildEnvironment (concepts bound to the grain)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [processing: search + join resolution]
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Strategy node tree                       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [plan + optimizer]
//! ┌─────────────────────────────────────────────────────────┐
//! │                  CTE plan (rewritten)                    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [sql]
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Dialect SQL                           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The library only emits through the `log` facade; installing a logger is
//! left to the caller.

pub mod cache;
pub mod compile;
pub mod config;
pub mod environment;
pub mod error;
pub mod graph;
pub mod model;
pub mod optimizer;
pub mod plan;
pub mod processing;
pub mod sql;
pub mod validation;

pub use compile::{compile_select, compile_statement, compile_statements};
pub use config::{CompilerConfig, Settings};
pub use environment::Environment;
pub use error::{Error, Result};
pub use sql::Dialect;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::compile::{
        compile_select, compile_statement, compile_statements, process_statement,
        render_statement, ProcessedStatement,
    };
    pub use crate::config::{CompilerConfig, OptimizationSettings, Settings};
    pub use crate::environment::Environment;
    pub use crate::error::{Error, Result};
    pub use crate::model::{
        concept, lit, null, Concept, ConceptLookup, DataType, Datasource, DatasourceAddress,
        Function, FunctionType, Grain, Lineage, Modifier, OrderBy, OrderItem, Purpose,
        SelectStatement, Statement, WhereClause,
    };
    pub use crate::sql::{Dialect, SqlDialect};
}
