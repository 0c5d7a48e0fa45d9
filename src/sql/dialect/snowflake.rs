//! Snowflake SQL dialect.
//!
//! Snowflake features:
//! - ANSI identifier quoting (`"`)
//! - `FLATTEN` for array expansion, elements read from `VALUE`
//! - `TIMESTAMP_NTZ`/`TIMESTAMP_TZ` types

use super::helpers;
use super::SqlDialect;
use crate::model::DataType;
use crate::sql::token::{Keyword, Token, TokenStream};

/// Snowflake SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Snowflake;

impl SqlDialect for Snowflake {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_snowflake(name)
    }

    fn emit_data_type(&self, dt: &DataType) -> String {
        helpers::emit_data_type_snowflake(dt)
    }

    fn emit_array(&self, items: Vec<TokenStream>) -> TokenStream {
        helpers::emit_list("ARRAY_CONSTRUCT(", items, ")")
    }

    fn emit_unnest_source(&self, input: TokenStream, alias: &str, _column: &str) -> Option<TokenStream> {
        let mut ts = TokenStream::new();
        ts.push(Token::Raw("TABLE(FLATTEN(input => ".into()))
            .append(&input)
            .push(Token::Raw("))".into()))
            .space()
            .kw(Keyword::As)
            .space()
            .push(Token::Ident(alias.to_string()));
        Some(ts)
    }

    fn unnest_value(&self, alias: &str, _column: &str) -> (Option<String>, String) {
        (Some(alias.to_string()), "VALUE".into())
    }
}
