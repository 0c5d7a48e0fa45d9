//! BigQuery SQL dialect.
//!
//! BigQuery features:
//! - Backtick identifier quoting
//! - Repeated fields, expanded with `UNNEST(x) AS alias`
//! - `INT64`/`FLOAT64` type names

use super::helpers;
use super::SqlDialect;
use crate::model::DataType;
use crate::sql::token::{Keyword, Token, TokenStream};

/// BigQuery SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct BigQuery;

impl SqlDialect for BigQuery {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_backtick(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_bigquery(name)
    }

    fn emit_data_type(&self, dt: &DataType) -> String {
        helpers::emit_data_type_bigquery(dt)
    }

    // The element is named by the alias alone.
    fn emit_unnest_source(&self, input: TokenStream, _alias: &str, column: &str) -> Option<TokenStream> {
        let mut ts = TokenStream::new();
        ts.push(Token::Raw("UNNEST".into()))
            .lparen()
            .append(&input)
            .rparen()
            .space()
            .kw(Keyword::As)
            .space()
            .push(Token::Ident(column.to_string()));
        Some(ts)
    }

    fn unnest_value(&self, _alias: &str, column: &str) -> (Option<String>, String) {
        (None, column.to_string())
    }
}
