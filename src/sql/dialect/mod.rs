//! SQL dialect definitions and formatting rules.
//!
//! Each dialect implements [`SqlDialect`] to handle its syntax:
//!
//! - Identifier quoting: `"` (Postgres/DuckDB/Snowflake/SQLite), `` ` `` (BigQuery), `[]` (T-SQL)
//! - Pagination: LIMIT/OFFSET vs OFFSET FETCH
//! - Boolean literals: true/false vs 1/0
//! - Array literals and the unnest join
//! - Date part extraction
//!
//! | Feature | DuckDB | Postgres | BigQuery | Snowflake | T-SQL | SQLite |
//! |---------|--------|----------|----------|-----------|-------|--------|
//! | WITH RECURSIVE | ✓ | ✓ | ✓ | ✓ | no keyword | ✓ |
//! | FULL OUTER JOIN | ✓ | ✓ | ✓ | ✓ | ✓ | 3.39+ |
//! | NULLS FIRST/LAST | ✓ | ✓ | ✓ | ✓ | ❌ | 3.30+ |
//! | UNNEST | ✓ | ✓ | ✓ | FLATTEN | ❌ | json_each |

mod bigquery;
mod duckdb;
pub mod helpers;
mod postgres;
mod snowflake;
mod sqlite;
mod tsql;

pub use bigquery::BigQuery;
pub use duckdb::DuckDb;
pub use postgres::Postgres;
pub use snowflake::Snowflake;
pub use sqlite::Sqlite;
pub use tsql::TSql;

use serde::{Deserialize, Serialize};

use super::token::TokenStream;
use crate::model::DataType;

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// The default implementations follow ANSI SQL where possible.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Identifier and Literal Quoting
    // =========================================================================

    fn quote_identifier(&self, ident: &str) -> String;

    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    fn format_bool(&self, b: bool) -> &'static str;

    // =========================================================================
    // Pagination
    // =========================================================================

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_standard(limit, offset)
    }

    /// T-SQL requires ORDER BY when using OFFSET FETCH.
    fn requires_order_by_for_offset(&self) -> bool {
        false
    }

    // =========================================================================
    // Operators and Clauses
    // =========================================================================

    fn concat_operator(&self) -> &'static str {
        "||"
    }

    /// T-SQL omits the RECURSIVE keyword.
    fn emit_recursive_keyword(&self) -> bool {
        true
    }

    fn supports_full_outer_join(&self) -> bool {
        true
    }

    fn supports_nulls_ordering(&self) -> bool {
        true
    }

    /// Remap a function name for this dialect, matched case-insensitively.
    fn remap_function(&self, name: &str) -> Option<&'static str> {
        let _ = name;
        None
    }

    // =========================================================================
    // Types and Values
    // =========================================================================

    /// Type name used in CAST.
    fn emit_data_type(&self, dt: &DataType) -> String {
        helpers::emit_data_type_ansi(dt)
    }

    /// `YEAR`, `MONTH` or `DAY` of a date expression.
    fn emit_date_part(&self, part: &str, input: TokenStream) -> TokenStream {
        helpers::emit_date_part_extract(part, input)
    }

    fn emit_array(&self, items: Vec<TokenStream>) -> TokenStream {
        helpers::emit_list("[", items, "]")
    }

    // =========================================================================
    // Unnest
    // =========================================================================

    /// The table factor expanding an array into one row per element, or
    /// `None` when the dialect cannot expand arrays.
    fn emit_unnest_source(&self, input: TokenStream, alias: &str, column: &str) -> Option<TokenStream> {
        Some(helpers::emit_unnest_table_alias(
            input,
            self.quote_identifier(alias),
            self.quote_identifier(column),
        ))
    }

    /// Table qualifier and column of an unnested element.
    fn unnest_value(&self, alias: &str, column: &str) -> (Option<String>, String) {
        (Some(alias.to_string()), column.to_string())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Statement prefix materializing a query into `target`, or `None` when
    /// the dialect has no `CREATE TABLE ... AS`.
    fn emit_create_table_as(&self, target: &str) -> Option<String> {
        Some(format!("CREATE OR REPLACE TABLE {} AS", target))
    }
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    DuckDb,
    Postgres,
    BigQuery,
    Snowflake,
    TSql,
    Sqlite,
}

impl Dialect {
    pub const ALL: [Dialect; 6] = [
        Dialect::DuckDb,
        Dialect::Postgres,
        Dialect::BigQuery,
        Dialect::Snowflake,
        Dialect::TSql,
        Dialect::Sqlite,
    ];

    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::DuckDb => &DuckDb,
            Dialect::Postgres => &Postgres,
            Dialect::BigQuery => &BigQuery,
            Dialect::Snowflake => &Snowflake,
            Dialect::TSql => &TSql,
            Dialect::Sqlite => &Sqlite,
        }
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        self.dialect().quote_string(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        self.dialect().format_bool(b)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        self.dialect().emit_limit_offset(limit, offset)
    }

    fn requires_order_by_for_offset(&self) -> bool {
        self.dialect().requires_order_by_for_offset()
    }

    fn concat_operator(&self) -> &'static str {
        self.dialect().concat_operator()
    }

    fn emit_recursive_keyword(&self) -> bool {
        self.dialect().emit_recursive_keyword()
    }

    fn supports_full_outer_join(&self) -> bool {
        self.dialect().supports_full_outer_join()
    }

    fn supports_nulls_ordering(&self) -> bool {
        self.dialect().supports_nulls_ordering()
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        self.dialect().remap_function(name)
    }

    fn emit_data_type(&self, dt: &DataType) -> String {
        self.dialect().emit_data_type(dt)
    }

    fn emit_date_part(&self, part: &str, input: TokenStream) -> TokenStream {
        self.dialect().emit_date_part(part, input)
    }

    fn emit_array(&self, items: Vec<TokenStream>) -> TokenStream {
        self.dialect().emit_array(items)
    }

    fn emit_unnest_source(&self, input: TokenStream, alias: &str, column: &str) -> Option<TokenStream> {
        self.dialect().emit_unnest_source(input, alias, column)
    }

    fn unnest_value(&self, alias: &str, column: &str) -> (Option<String>, String) {
        self.dialect().unnest_value(alias, column)
    }

    fn emit_create_table_as(&self, target: &str) -> Option<String> {
        self.dialect().emit_create_table_as(target)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        Dialect::ALL
            .into_iter()
            .find(|d| d.name() == lowered)
            .ok_or_else(|| {
                format!(
                    "unknown dialect '{}', expected one of: {}",
                    s,
                    Dialect::ALL.map(|d| d.name()).join(", ")
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::token::Token;

    fn raw(s: &str) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::Raw(s.into()));
        ts
    }

    #[test]
    fn test_dialect_display_round_trips() {
        for d in Dialect::ALL {
            assert_eq!(d.to_string().parse::<Dialect>().unwrap(), d);
        }
        assert_eq!(Dialect::TSql.to_string(), "tsql");
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_dialect_serde_names() {
        assert_eq!(serde_json::to_string(&Dialect::BigQuery).unwrap(), "\"bigquery\"");
        let d: Dialect = serde_json::from_str("\"sqlite\"").unwrap();
        assert_eq!(d, Dialect::Sqlite);
    }

    #[test]
    fn test_quote_identifier_escaping() {
        assert_eq!(Dialect::DuckDb.quote_identifier("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(Dialect::TSql.quote_identifier("weird]name"), "[weird]]name]");
        assert_eq!(Dialect::BigQuery.quote_identifier("weird`name"), "`weird``name`");
    }

    #[test]
    fn test_format_bool() {
        assert_eq!(Dialect::DuckDb.format_bool(true), "true");
        assert_eq!(Dialect::Sqlite.format_bool(false), "false");
        assert_eq!(Dialect::TSql.format_bool(true), "1");
    }

    #[test]
    fn test_array_literals() {
        let items = vec![raw("1"), raw("2")];
        assert_eq!(Dialect::DuckDb.emit_array(items.clone()).serialize(Dialect::DuckDb), "[1, 2]");
        assert_eq!(
            Dialect::Postgres.emit_array(items.clone()).serialize(Dialect::Postgres),
            "ARRAY[1, 2]"
        );
        assert_eq!(
            Dialect::Sqlite.emit_array(items).serialize(Dialect::Sqlite),
            "json_array(1, 2)"
        );
    }

    #[test]
    fn test_unnest_sources() {
        let duck = Dialect::DuckDb.emit_unnest_source(raw("x"), "u", "v").unwrap();
        assert_eq!(duck.serialize(Dialect::DuckDb), "UNNEST(x) AS \"u\"(\"v\")");
        let sqlite = Dialect::Sqlite.emit_unnest_source(raw("x"), "u", "v").unwrap();
        assert_eq!(sqlite.serialize(Dialect::Sqlite), "json_each(x) AS \"u\"");
        assert_eq!(Dialect::Sqlite.unnest_value("u", "v"), (Some("u".into()), "value".into()));
        assert_eq!(Dialect::BigQuery.unnest_value("u", "v"), (None, "v".into()));
        assert!(Dialect::TSql.emit_unnest_source(raw("x"), "u", "v").is_none());
    }

    #[test]
    fn test_date_parts() {
        assert_eq!(
            Dialect::Postgres.emit_date_part("year", raw("d")).serialize(Dialect::Postgres),
            "EXTRACT(YEAR FROM d)"
        );
        assert_eq!(
            Dialect::Sqlite.emit_date_part("month", raw("d")).serialize(Dialect::Sqlite),
            "CAST(strftime('%m', d) AS INTEGER)"
        );
        assert_eq!(
            Dialect::TSql.emit_date_part("day", raw("d")).serialize(Dialect::TSql),
            "DATEPART(day, d)"
        );
    }

    #[test]
    fn test_cast_types() {
        let num = DataType::Numeric { precision: 12, scale: 2 };
        assert_eq!(Dialect::Postgres.emit_data_type(&num), "NUMERIC(12, 2)");
        assert_eq!(Dialect::Snowflake.emit_data_type(&num), "NUMBER(12, 2)");
        assert_eq!(Dialect::BigQuery.emit_data_type(&DataType::Integer), "INT64");
        assert_eq!(Dialect::Sqlite.emit_data_type(&DataType::Float), "REAL");
        assert_eq!(Dialect::TSql.emit_data_type(&DataType::Bool), "BIT");
        assert_eq!(Dialect::DuckDb.emit_data_type(&DataType::Float), "DOUBLE");
    }
}
