//! DuckDB SQL dialect.
//!
//! DuckDB is PostgreSQL-compatible with extensions:
//! - ANSI identifier quoting (`"`)
//! - `[a, b]` list literals
//! - `UNNEST` table functions with column aliases

use super::helpers;
use super::SqlDialect;
use crate::model::DataType;

/// DuckDB SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    // Uses default emit_limit_offset (LIMIT ... OFFSET ...)

    fn emit_data_type(&self, dt: &DataType) -> String {
        match dt {
            DataType::Float => "DOUBLE".into(),
            DataType::List(inner) => format!("{}[]", self.emit_data_type(inner)),
            other => helpers::emit_data_type_ansi(other),
        }
    }
}
