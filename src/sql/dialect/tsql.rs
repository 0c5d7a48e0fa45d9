//! T-SQL (SQL Server / Azure SQL) dialect.
//!
//! T-SQL has significant differences from ANSI:
//! - Square bracket identifier quoting (`[name]`)
//! - No native boolean in SELECT
//! - OFFSET FETCH for pagination (requires ORDER BY)
//! - N'...' prefix for Unicode strings
//! - No RECURSIVE keyword for recursive CTEs
//! - String concatenation with `+`
//! - No array type, so nothing to unnest

use super::helpers;
use super::SqlDialect;
use crate::model::DataType;
use crate::sql::token::{Token, TokenStream};

/// T-SQL (SQL Server) dialect.
#[derive(Debug, Clone, Copy)]
pub struct TSql;

impl SqlDialect for TSql {
    fn name(&self) -> &'static str {
        "tsql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_bracket(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        if !s.is_ascii() {
            helpers::quote_string_unicode(s)
        } else {
            helpers::quote_string_single(s)
        }
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_numeric(b)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_tsql(limit, offset)
    }

    fn requires_order_by_for_offset(&self) -> bool {
        true
    }

    fn concat_operator(&self) -> &'static str {
        "+"
    }

    fn emit_recursive_keyword(&self) -> bool {
        false
    }

    fn supports_nulls_ordering(&self) -> bool {
        // NULLS FIRST/LAST only arrived in SQL Server 2022
        false
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_tsql(name)
    }

    fn emit_data_type(&self, dt: &DataType) -> String {
        helpers::emit_data_type_tsql(dt)
    }

    fn emit_date_part(&self, part: &str, input: TokenStream) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::Raw("DATEPART".into()))
            .lparen()
            .push(Token::Raw(part.to_lowercase()))
            .comma()
            .space()
            .append(&input)
            .rparen();
        ts
    }

    fn emit_unnest_source(&self, _input: TokenStream, _alias: &str, _column: &str) -> Option<TokenStream> {
        None
    }

    /// T-SQL materializes with `SELECT ... INTO`, which does not compose with a
    /// leading `WITH`.
    fn emit_create_table_as(&self, _target: &str) -> Option<String> {
        None
    }
}
