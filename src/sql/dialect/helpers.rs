//! Shared building blocks for dialect implementations.

use crate::model::DataType;
use crate::sql::token::{Keyword, Token, TokenStream};

// =============================================================================
// Identifier Quoting
// =============================================================================

/// Double quotes (ANSI). Used by Postgres, DuckDB, Snowflake and SQLite.
pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Backticks. Used by BigQuery.
pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Square brackets. Used by T-SQL.
pub fn quote_bracket(ident: &str) -> String {
    format!("[{}]", ident.replace(']', "]]"))
}

// =============================================================================
// String Quoting
// =============================================================================

pub fn quote_string_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// N prefix for Unicode strings (T-SQL).
pub fn quote_string_unicode(s: &str) -> String {
    format!("N'{}'", s.replace('\'', "''"))
}

// =============================================================================
// Boolean Formatting
// =============================================================================

pub fn format_bool_literal(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

pub fn format_bool_numeric(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// `LIMIT n OFFSET m`.
pub fn emit_limit_offset_standard(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    let mut ts = TokenStream::new();
    if let Some(lim) = limit {
        ts.kw(Keyword::Limit).space().push(Token::LitInt(lim as i64));
    }
    if let Some(off) = offset {
        if limit.is_some() {
            ts.space();
        }
        ts.kw(Keyword::Offset).space().push(Token::LitInt(off as i64));
    }
    ts
}

/// `OFFSET m ROWS FETCH NEXT n ROWS ONLY`. Requires an ORDER BY.
pub fn emit_limit_offset_tsql(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.kw(Keyword::Offset)
        .space()
        .push(Token::LitInt(offset.unwrap_or(0) as i64))
        .space()
        .kw(Keyword::Rows);
    if let Some(lim) = limit {
        ts.space()
            .kw(Keyword::Fetch)
            .space()
            .kw(Keyword::Next)
            .space()
            .push(Token::LitInt(lim as i64))
            .space()
            .kw(Keyword::Rows)
            .space()
            .kw(Keyword::Only);
    }
    ts
}

// =============================================================================
// Function Remapping
// =============================================================================

pub fn remap_function_tsql(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "LENGTH" => Some("LEN"),
        "SUBSTR" => Some("SUBSTRING"),
        "NOW" => Some("GETDATE"),
        "NVL" | "IFNULL" => Some("ISNULL"),
        "ANY_VALUE" => Some("MAX"),
        _ => None,
    }
}

pub fn remap_function_bigquery(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "LENGTH" => Some("CHAR_LENGTH"),
        "NVL" | "ISNULL" => Some("IFNULL"),
        _ => None,
    }
}

pub fn remap_function_snowflake(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "IFNULL" | "ISNULL" => Some("NVL"),
        _ => None,
    }
}

pub fn remap_function_sqlite(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NVL" | "ISNULL" => Some("IFNULL"),
        "SUBSTRING" => Some("SUBSTR"),
        "ANY_VALUE" => Some("MAX"),
        "ARRAY_AGG" => Some("JSON_GROUP_ARRAY"),
        _ => None,
    }
}

// =============================================================================
// Data Type Emission
// =============================================================================

/// Postgres-style type names. Used by Postgres and DuckDB.
pub fn emit_data_type_ansi(dt: &DataType) -> String {
    match dt {
        DataType::String | DataType::Unknown => "TEXT".into(),
        DataType::Integer => "INTEGER".into(),
        DataType::BigInt => "BIGINT".into(),
        DataType::Float => "DOUBLE PRECISION".into(),
        DataType::Numeric { precision, scale } => format!("NUMERIC({}, {})", precision, scale),
        DataType::Bool => "BOOLEAN".into(),
        DataType::Date => "DATE".into(),
        DataType::Datetime | DataType::Timestamp => "TIMESTAMP".into(),
        DataType::List(inner) => format!("{}[]", emit_data_type_ansi(inner)),
        DataType::Struct(_) | DataType::Map { .. } => "JSON".into(),
    }
}

pub fn emit_data_type_tsql(dt: &DataType) -> String {
    match dt {
        DataType::String | DataType::Unknown => "NVARCHAR(MAX)".into(),
        DataType::Integer => "INT".into(),
        DataType::BigInt => "BIGINT".into(),
        DataType::Float => "FLOAT".into(),
        DataType::Numeric { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
        DataType::Bool => "BIT".into(),
        DataType::Date => "DATE".into(),
        DataType::Datetime | DataType::Timestamp => "DATETIME2".into(),
        DataType::List(_) | DataType::Struct(_) | DataType::Map { .. } => "NVARCHAR(MAX)".into(),
    }
}

pub fn emit_data_type_snowflake(dt: &DataType) -> String {
    match dt {
        DataType::String | DataType::Unknown => "VARCHAR".into(),
        DataType::Integer => "INTEGER".into(),
        DataType::BigInt => "BIGINT".into(),
        DataType::Float => "DOUBLE".into(),
        DataType::Numeric { precision, scale } => format!("NUMBER({}, {})", precision, scale),
        DataType::Bool => "BOOLEAN".into(),
        DataType::Date => "DATE".into(),
        DataType::Datetime => "TIMESTAMP_NTZ".into(),
        DataType::Timestamp => "TIMESTAMP_TZ".into(),
        DataType::List(_) => "ARRAY".into(),
        DataType::Struct(_) => "OBJECT".into(),
        DataType::Map { .. } => "OBJECT".into(),
    }
}

pub fn emit_data_type_bigquery(dt: &DataType) -> String {
    match dt {
        DataType::String | DataType::Unknown => "STRING".into(),
        DataType::Integer | DataType::BigInt => "INT64".into(),
        DataType::Float => "FLOAT64".into(),
        DataType::Numeric { precision, scale } => format!("NUMERIC({}, {})", precision, scale),
        DataType::Bool => "BOOL".into(),
        DataType::Date => "DATE".into(),
        DataType::Datetime => "DATETIME".into(),
        DataType::Timestamp => "TIMESTAMP".into(),
        DataType::List(inner) => format!("ARRAY<{}>", emit_data_type_bigquery(inner)),
        DataType::Struct(fields) => format!(
            "STRUCT<{}>",
            fields
                .iter()
                .map(|(n, t)| format!("{} {}", n, emit_data_type_bigquery(t)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        DataType::Map { .. } => "JSON".into(),
    }
}

/// SQLite storage classes.
pub fn emit_data_type_sqlite(dt: &DataType) -> String {
    match dt {
        DataType::Integer | DataType::BigInt | DataType::Bool => "INTEGER".into(),
        DataType::Float => "REAL".into(),
        DataType::Numeric { .. } => "NUMERIC".into(),
        _ => "TEXT".into(),
    }
}

// =============================================================================
// Date Parts
// =============================================================================

/// `EXTRACT(YEAR FROM x)`.
pub fn emit_date_part_extract(part: &str, input: TokenStream) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Raw("EXTRACT".into()))
        .lparen()
        .push(Token::Raw(part.to_uppercase()))
        .space()
        .kw(Keyword::From)
        .space()
        .append(&input)
        .rparen();
    ts
}

// =============================================================================
// Arrays
// =============================================================================

/// `open a, b, c close`.
pub fn emit_list(open: &str, items: Vec<TokenStream>, close: &str) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Raw(open.into()));
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            ts.comma().space();
        }
        ts.append(item);
    }
    ts.push(Token::Raw(close.into()));
    ts
}

/// `UNNEST(expr) AS alias(column)`, both already quoted.
pub fn emit_unnest_table_alias(input: TokenStream, alias: String, column: String) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Raw("UNNEST".into()))
        .lparen()
        .append(&input)
        .rparen()
        .space()
        .kw(Keyword::As)
        .space()
        .push(Token::Raw(format!("{}({})", alias, column)));
    ts
}
