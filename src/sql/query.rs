//! Query builder - construct SQL queries with a fluent API.

use super::dialect::{Dialect, SqlDialect};
use super::expr::{emit_sort_item, Expr, ExprExt, NullsOrder, SortDir};
use super::token::{Keyword, Token, TokenStream};

// =============================================================================
// Select Expression (column with optional alias)
// =============================================================================

/// A SELECT list item: expression with optional alias.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct SelectExpr {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectExpr {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = self.expr.to_tokens_for_dialect(dialect);
        if let Some(alias) = &self.alias {
            ts.space()
                .kw(Keyword::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

impl From<Expr> for SelectExpr {
    fn from(expr: Expr) -> Self {
        SelectExpr::new(expr)
    }
}

// =============================================================================
// Table Reference
// =============================================================================

/// What a FROM or JOIN reads.
#[derive(Debug, Clone, PartialEq)]
pub enum TableFactor {
    /// A table or CTE name. Unquoted names are written as given, so
    /// `schema.table` passes through.
    Named { name: String, quoted: bool },
    /// A parenthesized query body.
    Derived(String),
    /// Dialect-rendered tokens carrying their own alias, such as an unnest.
    Raw(TokenStream),
}

/// A table reference with optional alias.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct TableRef {
    pub factor: TableFactor,
    pub alias: Option<String>,
}

impl TableRef {
    /// A quoted name, as used for CTEs.
    pub fn named(name: &str) -> Self {
        Self {
            factor: TableFactor::Named {
                name: name.into(),
                quoted: true,
            },
            alias: None,
        }
    }

    pub fn location(location: &str, quoted: bool) -> Self {
        Self {
            factor: TableFactor::Named {
                name: location.into(),
                quoted,
            },
            alias: None,
        }
    }

    pub fn derived(sql: &str) -> Self {
        Self {
            factor: TableFactor::Derived(sql.into()),
            alias: None,
        }
    }

    pub fn raw(tokens: TokenStream) -> Self {
        Self {
            factor: TableFactor::Raw(tokens),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn to_tokens(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        match &self.factor {
            TableFactor::Named { name, quoted: true } => ts.push(Token::Ident(name.clone())),
            TableFactor::Named { name, quoted: false } => ts.push(Token::Raw(name.clone())),
            TableFactor::Derived(sql) => ts.lparen().push(Token::Raw(sql.trim().into())).rparen(),
            TableFactor::Raw(tokens) => ts.append(tokens),
        };
        let own_name = matches!(&self.factor, TableFactor::Named { name, quoted: true } if Some(name) == self.alias.as_ref());
        if let Some(alias) = self.alias.as_ref().filter(|_| !own_name) {
            ts.space()
                .kw(Keyword::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

// =============================================================================
// Joins
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Join {
    Table {
        join_type: JoinType,
        table: TableRef,
        on: Option<Expr>,
    },
    /// A dialect-rendered join such as an array unnest.
    Raw(TokenStream),
}

impl Join {
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let (join_type, table, on) = match self {
            Join::Raw(ts) => return ts.clone(),
            Join::Table {
                join_type,
                table,
                on,
            } => (join_type, table, on),
        };
        let mut ts = TokenStream::new();

        match join_type {
            JoinType::Inner => ts.kw(Keyword::Inner),
            JoinType::Left => ts.kw(Keyword::Left).space().kw(Keyword::Outer),
            JoinType::Right => ts.kw(Keyword::Right).space().kw(Keyword::Outer),
            JoinType::Full => ts.kw(Keyword::Full).space().kw(Keyword::Outer),
            JoinType::Cross => ts.kw(Keyword::Cross),
        };

        ts.space().kw(Keyword::Join).space();
        ts.append(&table.to_tokens());

        if let Some(on) = on {
            ts.space().kw(Keyword::On).space();
            ts.append(&on.to_tokens_for_dialect(dialect));
        }

        ts
    }
}

// =============================================================================
// ORDER BY
// =============================================================================

/// An ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct OrderByExpr {
    pub expr: Expr,
    pub dir: Option<SortDir>,
    pub nulls: Option<NullsOrder>,
}

impl OrderByExpr {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            dir: Some(SortDir::Asc),
            nulls: None,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            dir: Some(SortDir::Desc),
            nulls: None,
        }
    }

    pub fn nulls(mut self, nulls: Option<NullsOrder>) -> Self {
        self.nulls = nulls;
        self
    }

    /// Skips NULLS FIRST/LAST for dialects that don't support it.
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        emit_sort_item(&mut ts, &self.expr, self.dir, self.nulls, dialect);
        ts
    }
}

// =============================================================================
// LIMIT / OFFSET
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitOffset {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl LimitOffset {
    pub fn to_tokens(&self, dialect: Dialect) -> TokenStream {
        dialect.emit_limit_offset(self.limit, self.offset)
    }
}

// =============================================================================
// CTE (Common Table Expression)
// =============================================================================

/// The body of a CTE.
#[derive(Debug, Clone, PartialEq)]
pub enum CteBody {
    Query(Box<Query>),
    /// Queries joined by `UNION ALL`.
    UnionAll(Vec<Query>),
}

/// A Common Table Expression (WITH clause).
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct Cte {
    pub name: String,
    pub columns: Option<Vec<String>>,
    pub body: CteBody,
    pub recursive: bool,
    pub comment: Option<String>,
}

impl Cte {
    pub fn new(name: &str, query: Query) -> Self {
        Self {
            name: name.into(),
            columns: None,
            body: CteBody::Query(Box::new(query)),
            recursive: false,
            comment: None,
        }
    }

    pub fn union_all(name: &str, members: Vec<Query>) -> Self {
        Self {
            name: name.into(),
            columns: None,
            body: CteBody::UnionAll(members),
            recursive: false,
            comment: None,
        }
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();
        if let Some(comment) = &self.comment {
            ts.push(Token::Comment(comment.clone()));
        }
        ts.push(Token::Ident(self.name.clone()));

        if let Some(cols) = &self.columns {
            ts.lparen();
            for (i, col) in cols.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.push(Token::Ident(col.clone()));
            }
            ts.rparen();
        }

        ts.space().kw(Keyword::As).space().lparen().newline();
        match &self.body {
            CteBody::Query(q) => {
                ts.append(&q.to_tokens_for_dialect(dialect));
            }
            CteBody::UnionAll(members) => {
                for (i, q) in members.iter().enumerate() {
                    if i > 0 {
                        ts.newline().kw(Keyword::Union).space().kw(Keyword::All).newline();
                    }
                    ts.append(&q.to_tokens_for_dialect(dialect));
                }
            }
        }
        ts.rparen();
        ts
    }
}

// =============================================================================
// Query Builder
// =============================================================================

/// A SELECT query.
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use = "Query has no effect until converted to SQL with to_sql() or to_tokens()"]
pub struct Query {
    pub with: Vec<Cte>,
    pub select: Vec<SelectExpr>,
    pub distinct: bool,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit_offset: Option<LimitOffset>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cte(mut self, cte: Cte) -> Self {
        self.with.push(cte);
        self
    }

    pub fn select(mut self, exprs: Vec<impl Into<SelectExpr>>) -> Self {
        self.select = exprs.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn from(mut self, table: TableRef) -> Self {
        self.from = Some(table);
        self
    }

    pub fn join(mut self, join_type: JoinType, table: TableRef, on: Option<Expr>) -> Self {
        self.joins.push(Join::Table {
            join_type,
            table,
            on,
        });
        self
    }

    pub fn raw_join(mut self, tokens: TokenStream) -> Self {
        self.joins.push(Join::Raw(tokens));
        self
    }

    /// Add a WHERE condition (ANDed with existing conditions).
    pub fn filter(mut self, condition: Expr) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.nested().and(condition.nested()),
            None => condition,
        });
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn having(mut self, condition: Expr) -> Self {
        self.having = Some(condition);
        self
    }

    pub fn order_by(mut self, exprs: Vec<OrderByExpr>) -> Self {
        self.order_by = exprs;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit_offset.get_or_insert_with(LimitOffset::default).limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.limit_offset.get_or_insert_with(LimitOffset::default).offset = Some(offset);
        self
    }

    /// Convert to token stream for a specific dialect, one clause per line.
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        self.emit(dialect, false)
    }

    /// The same query on a single line, for subqueries.
    pub fn to_inline_tokens(&self, dialect: Dialect) -> TokenStream {
        self.emit(dialect, true)
    }

    fn emit(&self, dialect: Dialect, inline: bool) -> TokenStream {
        let mut ts = TokenStream::new();
        let sep = |ts: &mut TokenStream| {
            if inline {
                ts.space();
            } else {
                ts.newline();
            }
        };

        // WITH clause
        if !self.with.is_empty() {
            ts.kw(Keyword::With);
            let has_recursive = self.with.iter().any(|cte| cte.recursive);
            if has_recursive && dialect.emit_recursive_keyword() {
                ts.space().kw(Keyword::Recursive);
            }
            ts.newline();
            for (i, cte) in self.with.iter().enumerate() {
                if i > 0 {
                    ts.comma().newline();
                }
                ts.append(&cte.to_tokens_for_dialect(dialect));
            }
            ts.newline();
        }

        ts.kw(Keyword::Select);
        if self.distinct {
            ts.space().kw(Keyword::Distinct);
        }

        for (i, select_expr) in self.select.iter().enumerate() {
            if i > 0 {
                ts.comma();
            }
            if inline {
                ts.space();
            } else {
                ts.newline().indent(1);
            }
            ts.append(&select_expr.to_tokens_for_dialect(dialect));
        }

        if let Some(from) = &self.from {
            sep(&mut ts);
            ts.kw(Keyword::From).space();
            ts.append(&from.to_tokens());
        }

        for join in &self.joins {
            sep(&mut ts);
            ts.append(&join.to_tokens_for_dialect(dialect));
        }

        if let Some(where_clause) = &self.where_clause {
            sep(&mut ts);
            ts.kw(Keyword::Where).space();
            ts.append(&where_clause.to_tokens_for_dialect(dialect));
        }

        if !self.group_by.is_empty() {
            sep(&mut ts);
            ts.kw(Keyword::GroupBy).space();
            for (i, expr) in self.group_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.append(&expr.to_tokens_for_dialect(dialect));
            }
        }

        if let Some(having) = &self.having {
            sep(&mut ts);
            ts.kw(Keyword::Having).space();
            ts.append(&having.to_tokens_for_dialect(dialect));
        }

        // T-SQL requires ORDER BY for OFFSET FETCH syntax; the placeholder
        // leaves row order undefined.
        let needs_order_by_placeholder = dialect.requires_order_by_for_offset()
            && self.order_by.is_empty()
            && self.limit_offset.is_some();

        if !self.order_by.is_empty() {
            sep(&mut ts);
            ts.kw(Keyword::OrderBy).space();
            for (i, order_expr) in self.order_by.iter().enumerate() {
                if i > 0 {
                    ts.comma().space();
                }
                ts.append(&order_expr.to_tokens_for_dialect(dialect));
            }
        } else if needs_order_by_placeholder {
            sep(&mut ts);
            ts.kw(Keyword::OrderBy)
                .space()
                .lparen()
                .kw(Keyword::Select)
                .space()
                .kw(Keyword::Null)
                .rparen();
        }

        if let Some(lo) = &self.limit_offset {
            sep(&mut ts);
            ts.append(&lo.to_tokens(dialect));
        }

        ts
    }

    /// Generate SQL string for a specific dialect.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        self.to_tokens_for_dialect(dialect).serialize(dialect)
    }
}

impl std::fmt::Display for Query {
    /// Formats the query using the default dialect (DuckDB).
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql(Dialect::default()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::expr::{col, lit_int, sum, table_col};
    use crate::sql::test_utils::validate_sql;

    #[test]
    fn test_simple_select() {
        let query = Query::new()
            .select(vec![col("id"), col("name")])
            .from(TableRef::location("dbo.users", false).with_alias("users"));
        let sql = query.to_sql(Dialect::TSql);
        assert_eq!(sql, "SELECT\n  [id],\n  [name]\nFROM dbo.users AS [users]");
    }

    #[test]
    fn test_cte_alias_matching_name_is_omitted() {
        let query = Query::new()
            .select(vec![table_col("c", "x")])
            .from(TableRef::named("c").with_alias("c"));
        assert_eq!(query.to_sql(Dialect::DuckDb), "SELECT\n  \"c\".\"x\"\nFROM \"c\"");
    }

    #[test]
    fn test_filter_nests_disjunctions() {
        let query = Query::new()
            .select(vec![col("a")])
            .from(TableRef::named("t"))
            .filter(col("a").eq(lit_int(1)).or(col("a").eq(lit_int(2))))
            .filter(col("b").gt(lit_int(0)));
        let sql = query.to_sql(Dialect::Postgres);
        assert!(sql.contains("WHERE (\"a\" = 1 OR \"a\" = 2) AND (\"b\" > 0)"), "{}", sql);
        validate_sql(&sql, Dialect::Postgres).unwrap();
    }

    #[test]
    fn test_aggregation() {
        let query = Query::new()
            .select(vec![
                col("region").into(),
                sum(col("amount")).alias("total"),
            ])
            .from(TableRef::named("orders"))
            .group_by(vec![col("region")])
            .having(sum(col("amount")).gt(lit_int(1000)));
        let sql = query.to_sql(Dialect::Postgres);
        assert!(sql.contains("GROUP BY \"region\""));
        assert!(sql.contains("HAVING SUM(\"amount\") > 1000"));
        validate_sql(&sql, Dialect::Postgres).unwrap();
    }

    #[test]
    fn test_limit_tsql_without_order_by() {
        let query = Query::new()
            .select(vec![col("id")])
            .from(TableRef::named("users"))
            .limit(10);
        let sql = query.to_sql(Dialect::TSql);
        assert!(sql.contains("ORDER BY (SELECT NULL)"), "{}", sql);
        assert!(sql.contains("OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"));
    }

    #[test]
    fn test_order_by_and_limit() {
        let query = Query::new()
            .select(vec![col("name")])
            .from(TableRef::named("users"))
            .order_by(vec![OrderByExpr::desc(col("age")).nulls(Some(NullsOrder::Last))])
            .limit(5);
        let sql = query.to_sql(Dialect::DuckDb);
        assert!(sql.ends_with("ORDER BY \"age\" DESC NULLS LAST\nLIMIT 5"), "{}", sql);
        validate_sql(&sql, Dialect::DuckDb).unwrap();
    }

    #[test]
    fn test_union_cte_and_recursive_keyword() {
        let a = Query::new().select(vec![col("x")]).from(TableRef::named("a"));
        let b = Query::new().select(vec![col("x")]).from(TableRef::named("b"));
        let query = Query::new()
            .with_cte(Cte::union_all("both", vec![a, b]).recursive())
            .select(vec![col("x")])
            .from(TableRef::named("both"));
        let sql = query.to_sql(Dialect::Postgres);
        assert!(sql.starts_with("WITH RECURSIVE\n\"both\" AS ("));
        assert!(sql.contains("\nUNION ALL\n"));
        validate_sql(&sql, Dialect::Postgres).unwrap();
        assert!(query.to_sql(Dialect::TSql).starts_with("WITH\n[both] AS ("));
    }

    #[test]
    fn test_derived_table() {
        let query = Query::new()
            .select(vec![table_col("q", "v")])
            .from(TableRef::derived("select 1 as v").with_alias("q"));
        let sql = query.to_sql(Dialect::Sqlite);
        assert_eq!(sql, "SELECT\n  \"q\".\"v\"\nFROM (select 1 as v) AS \"q\"");
        validate_sql(&sql, Dialect::Sqlite).unwrap();
    }

    #[test]
    fn test_join_on() {
        let query = Query::new()
            .select(vec![table_col("u", "name")])
            .from(TableRef::named("u"))
            .join(
                JoinType::Left,
                TableRef::named("o"),
                Some(table_col("u", "id").eq(table_col("o", "user_id"))),
            );
        let sql = query.to_sql(Dialect::DuckDb);
        assert!(sql.contains("LEFT OUTER JOIN \"o\" ON \"u\".\"id\" = \"o\".\"user_id\""));
        validate_sql(&sql, Dialect::DuckDb).unwrap();
    }
}
