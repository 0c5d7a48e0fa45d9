//! SQLite dialect.
//!
//! SQLite has no array type. Lists are JSON arrays built with
//! `json_array` and expanded with the `json_each` table function.
//! Date parts come from `strftime`.

use super::helpers;
use super::SqlDialect;
use crate::model::DataType;
use crate::sql::token::{Keyword, Token, TokenStream};

/// SQLite dialect.
#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_sqlite(name)
    }

    fn emit_data_type(&self, dt: &DataType) -> String {
        helpers::emit_data_type_sqlite(dt)
    }

    fn emit_date_part(&self, part: &str, input: TokenStream) -> TokenStream {
        let format = match part.to_lowercase().as_str() {
            "year" => "%Y",
            "month" => "%m",
            _ => "%d",
        };
        let mut ts = TokenStream::new();
        ts.push(Token::Raw(format!("CAST(strftime('{}', ", format)))
            .append(&input)
            .push(Token::Raw(") AS INTEGER)".into()));
        ts
    }

    fn emit_array(&self, items: Vec<TokenStream>) -> TokenStream {
        helpers::emit_list("json_array(", items, ")")
    }

    fn emit_unnest_source(&self, input: TokenStream, alias: &str, _column: &str) -> Option<TokenStream> {
        let mut ts = TokenStream::new();
        ts.push(Token::Raw("json_each".into()))
            .lparen()
            .append(&input)
            .rparen()
            .space()
            .kw(Keyword::As)
            .space()
            .push(Token::Ident(alias.to_string()));
        Some(ts)
    }

    fn unnest_value(&self, alias: &str, _column: &str) -> (Option<String>, String) {
        (Some(alias.to_string()), "value".into())
    }

    fn emit_create_table_as(&self, target: &str) -> Option<String> {
        Some(format!("CREATE TABLE {} AS", target))
    }
}
