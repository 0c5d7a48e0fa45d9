//! Expression AST - the core of SQL expression building.
//!
//! A strongly-typed AST for SQL expressions. Dialect differences are
//! resolved when the tree is turned into tokens.

use super::dialect::{Dialect, SqlDialect};
use super::query::{Query, SelectExpr};
use super::token::{Keyword, Token, TokenStream};
use crate::model::DataType;

// =============================================================================
// Expression AST
// =============================================================================

/// A SQL expression.
///
/// Every variant must be handled in `to_tokens_for_dialect()`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference: optional_table.column
    Column {
        table: Option<String>,
        column: String,
    },

    Literal(Literal),

    /// Binary operation: left op right
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },

    UnaryOp { op: UnaryOperator, expr: Box<Expr> },

    /// Function call: name(args...)
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    },

    /// CASE WHEN... THEN... ELSE... END
    Case {
        operand: Option<Box<Expr>>,
        when_clauses: Vec<(Expr, Expr)>,
        else_clause: Option<Box<Expr>>,
    },

    /// IN: expr IN (values...)
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// IN subquery: expr IN (SELECT ...)
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<Query>,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// CAST(expr AS type), with the type name chosen by the dialect.
    Cast { expr: Box<Expr>, datatype: DataType },

    /// A calendar part (`year`, `month`, `day`) of a date.
    DatePart { part: String, expr: Box<Expr> },

    /// Array literal.
    Array(Vec<Expr>),

    /// Wildcard: * or table.*
    Star { table: Option<String> },

    Paren(Box<Expr>),

    /// `function OVER (PARTITION BY ... ORDER BY ...)`
    WindowFunction {
        function: Box<Expr>,
        partition_by: Vec<Expr>,
        order_by: Vec<WindowOrderBy>,
    },

    /// SQL passed through unescaped. Only for column expressions declared
    /// on datasources and fixed fragments.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    Is,
    IsNot,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    // String
    Concat,
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
}

// =============================================================================
// Window Function Types
// =============================================================================

/// Sort direction (shared with query ORDER BY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

/// NULLS ordering (shared with query ORDER BY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

/// ORDER BY expression within a window specification.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOrderBy {
    pub expr: Expr,
    pub dir: Option<SortDir>,
    pub nulls: Option<NullsOrder>,
}

impl WindowOrderBy {
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
}

/// `expr [ASC|DESC] [NULLS FIRST|LAST]`, dropping the NULLS clause where
/// the dialect lacks it.
pub(crate) fn emit_sort_item(
    ts: &mut TokenStream,
    expr: &Expr,
    dir: Option<SortDir>,
    nulls: Option<NullsOrder>,
    dialect: Dialect,
) {
    ts.append(&expr.to_tokens_for_dialect(dialect));
    if let Some(dir) = dir {
        ts.space().push(match dir {
            SortDir::Asc => Token::Kw(Keyword::Asc),
            SortDir::Desc => Token::Kw(Keyword::Desc),
        });
    }
    if let Some(nulls) = nulls {
        if dialect.supports_nulls_ordering() {
            ts.space().push(match nulls {
                NullsOrder::First => Token::Kw(Keyword::NullsFirst),
                NullsOrder::Last => Token::Kw(Keyword::NullsLast),
            });
        }
    }
}

// =============================================================================
// Expression to Tokens
// =============================================================================

impl Expr {
    /// Convert this expression to a token stream (default dialect).
    pub fn to_tokens(&self) -> TokenStream {
        self.to_tokens_for_dialect(Dialect::default())
    }

    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();

        match self {
            Expr::Column { table, column } => {
                if let Some(t) = table {
                    ts.push(Token::Ident(t.clone()));
                    ts.push(Token::Dot);
                }
                ts.push(Token::Ident(column.clone()));
            }

            Expr::Literal(lit) => {
                ts.push(match lit {
                    Literal::Int(n) => Token::LitInt(*n),
                    Literal::Float(f) => Token::LitFloat(*f),
                    Literal::String(s) => Token::LitString(s.clone()),
                    Literal::Bool(b) => Token::LitBool(*b),
                    Literal::Null => Token::LitNull,
                });
            }

            Expr::BinaryOp { left, op, right } => {
                ts.append(&left.to_tokens_for_dialect(dialect));
                ts.space();
                ts.push(binary_op_to_token(*op));
                ts.space();
                ts.append(&right.to_tokens_for_dialect(dialect));
            }

            Expr::UnaryOp { op, expr } => {
                match op {
                    UnaryOperator::Not => ts.kw(Keyword::Not).space(),
                    UnaryOperator::Minus => ts.push(Token::Minus),
                };
                ts.append(&expr.to_tokens_for_dialect(dialect));
            }

            Expr::Function {
                name,
                args,
                distinct,
            } => {
                ts.push(Token::FunctionName(name.clone()));
                ts.lparen();
                if *distinct {
                    ts.kw(Keyword::Distinct).space();
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        ts.comma().space();
                    }
                    ts.append(&arg.to_tokens_for_dialect(dialect));
                }
                ts.rparen();
            }

            Expr::Case {
                operand,
                when_clauses,
                else_clause,
            } => {
                ts.kw(Keyword::Case);
                if let Some(op) = operand {
                    ts.space().append(&op.to_tokens_for_dialect(dialect));
                }
                for (when, then) in when_clauses {
                    ts.space().kw(Keyword::When).space();
                    ts.append(&when.to_tokens_for_dialect(dialect));
                    ts.space().kw(Keyword::Then).space();
                    ts.append(&then.to_tokens_for_dialect(dialect));
                }
                if let Some(else_expr) = else_clause {
                    ts.space().kw(Keyword::Else).space();
                    ts.append(&else_expr.to_tokens_for_dialect(dialect));
                }
                ts.space().kw(Keyword::End);
            }

            Expr::In {
                expr,
                values,
                negated,
            } => {
                // "x IN ()" is invalid SQL; an empty list matches nothing
                if values.is_empty() {
                    ts.push(Token::Raw(if *negated { "1 = 1" } else { "1 = 0" }.into()));
                } else {
                    ts.append(&expr.to_tokens_for_dialect(dialect));
                    if *negated {
                        ts.space().kw(Keyword::Not);
                    }
                    ts.space().kw(Keyword::In).space().lparen();
                    for (i, val) in values.iter().enumerate() {
                        if i > 0 {
                            ts.comma().space();
                        }
                        ts.append(&val.to_tokens_for_dialect(dialect));
                    }
                    ts.rparen();
                }
            }

            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                ts.append(&expr.to_tokens_for_dialect(dialect));
                if *negated {
                    ts.space().kw(Keyword::Not);
                }
                ts.space().kw(Keyword::In).space().lparen();
                ts.append(&subquery.to_inline_tokens(dialect));
                ts.rparen();
            }

            Expr::IsNull { expr, negated } => {
                ts.append(&expr.to_tokens_for_dialect(dialect));
                ts.space();
                ts.push(if *negated {
                    Token::Kw(Keyword::IsNotNull)
                } else {
                    Token::Kw(Keyword::IsNull)
                });
            }

            Expr::Cast { expr, datatype } => {
                ts.push(Token::Raw("CAST".into()))
                    .lparen()
                    .append(&expr.to_tokens_for_dialect(dialect))
                    .space()
                    .kw(Keyword::As)
                    .space()
                    .push(Token::Raw(dialect.emit_data_type(datatype)))
                    .rparen();
            }

            Expr::DatePart { part, expr } => {
                ts.append(&dialect.emit_date_part(part, expr.to_tokens_for_dialect(dialect)));
            }

            Expr::Array(items) => {
                let items = items.iter().map(|i| i.to_tokens_for_dialect(dialect)).collect();
                ts.append(&dialect.emit_array(items));
            }

            Expr::Star { table } => {
                if let Some(t) = table {
                    ts.push(Token::Ident(t.clone()));
                    ts.push(Token::Dot);
                }
                ts.push(Token::Star);
            }

            Expr::Paren(inner) => {
                ts.lparen();
                ts.append(&inner.to_tokens_for_dialect(dialect));
                ts.rparen();
            }

            Expr::WindowFunction {
                function,
                partition_by,
                order_by,
            } => {
                ts.append(&function.to_tokens_for_dialect(dialect));
                ts.space().kw(Keyword::Over).space().lparen();

                if !partition_by.is_empty() {
                    ts.kw(Keyword::PartitionBy).space();
                    for (i, expr) in partition_by.iter().enumerate() {
                        if i > 0 {
                            ts.comma().space();
                        }
                        ts.append(&expr.to_tokens_for_dialect(dialect));
                    }
                }

                if !order_by.is_empty() {
                    if !partition_by.is_empty() {
                        ts.space();
                    }
                    ts.kw(Keyword::OrderBy).space();
                    for (i, ob) in order_by.iter().enumerate() {
                        if i > 0 {
                            ts.comma().space();
                        }
                        emit_sort_item(&mut ts, &ob.expr, ob.dir, ob.nulls, dialect);
                    }
                }

                ts.rparen();
            }

            Expr::Raw(sql) => {
                ts.push(Token::Raw(sql.clone()));
            }
        }

        ts
    }

    /// Wrap in parentheses unless the expression is atomic.
    pub fn nested(self) -> Expr {
        match self {
            Expr::BinaryOp { .. } | Expr::UnaryOp { .. } | Expr::In { .. } | Expr::IsNull { .. } => {
                Expr::Paren(Box::new(self))
            }
            other => other,
        }
    }
}

fn binary_op_to_token(op: BinaryOperator) -> Token {
    match op {
        BinaryOperator::Eq => Token::Eq,
        BinaryOperator::Ne => Token::Ne,
        BinaryOperator::Lt => Token::Lt,
        BinaryOperator::Gt => Token::Gt,
        BinaryOperator::Lte => Token::Lte,
        BinaryOperator::Gte => Token::Gte,
        BinaryOperator::Is => Token::Raw("IS".into()),
        BinaryOperator::IsNot => Token::Raw("IS NOT".into()),
        BinaryOperator::And => Token::Kw(Keyword::And),
        BinaryOperator::Or => Token::Kw(Keyword::Or),
        BinaryOperator::Plus => Token::Plus,
        BinaryOperator::Minus => Token::Minus,
        BinaryOperator::Mul => Token::Mul,
        BinaryOperator::Div => Token::Div,
        BinaryOperator::Mod => Token::Mod,
        BinaryOperator::Concat => Token::Concat,
        BinaryOperator::Like => Token::Kw(Keyword::Like),
    }
}

// =============================================================================
// Expression Constructors
// =============================================================================

pub fn col(name: &str) -> Expr {
    Expr::Column {
        table: None,
        column: name.into(),
    }
}

/// Qualified column reference (table.column).
pub fn table_col(table: &str, column: &str) -> Expr {
    Expr::Column {
        table: Some(table.into()),
        column: column.into(),
    }
}

pub fn lit_int(n: i64) -> Expr {
    Expr::Literal(Literal::Int(n))
}

pub fn lit_float(f: f64) -> Expr {
    Expr::Literal(Literal::Float(f))
}

pub fn lit_str(s: &str) -> Expr {
    Expr::Literal(Literal::String(s.into()))
}

pub fn lit_bool(b: bool) -> Expr {
    Expr::Literal(Literal::Bool(b))
}

pub fn lit_null() -> Expr {
    Expr::Literal(Literal::Null)
}

pub fn star() -> Expr {
    Expr::Star { table: None }
}

pub fn raw_sql(sql: &str) -> Expr {
    Expr::Raw(sql.into())
}

/// Generic function call.
pub fn func(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Function {
        name: name.into(),
        args,
        distinct: false,
    }
}

pub fn count(expr: Expr) -> Expr {
    func("COUNT", vec![expr])
}

pub fn count_distinct(expr: Expr) -> Expr {
    Expr::Function {
        name: "COUNT".into(),
        args: vec![expr],
        distinct: true,
    }
}

pub fn sum(expr: Expr) -> Expr {
    func("SUM", vec![expr])
}

pub fn avg(expr: Expr) -> Expr {
    func("AVG", vec![expr])
}

pub fn min(expr: Expr) -> Expr {
    func("MIN", vec![expr])
}

pub fn max(expr: Expr) -> Expr {
    func("MAX", vec![expr])
}

pub fn coalesce(args: Vec<Expr>) -> Expr {
    func("COALESCE", args)
}

/// `CASE WHEN condition THEN then END`
pub fn case_when(condition: Expr, then: Expr, otherwise: Option<Expr>) -> Expr {
    Expr::Case {
        operand: None,
        when_clauses: vec![(condition, then)],
        else_clause: otherwise.map(Box::new),
    }
}

// =============================================================================
// Window Builder
// =============================================================================

/// Builder for window function expressions.
#[derive(Debug, Clone)]
#[must_use = "WindowBuilder has no effect until build() is called"]
pub struct WindowBuilder {
    function: Expr,
    partition_by: Vec<Expr>,
    order_by: Vec<WindowOrderBy>,
}

impl WindowBuilder {
    pub fn new(function: Expr) -> Self {
        Self {
            function,
            partition_by: vec![],
            order_by: vec![],
        }
    }

    pub fn partition_by(mut self, exprs: Vec<Expr>) -> Self {
        self.partition_by = exprs;
        self
    }

    pub fn order_by(mut self, exprs: Vec<WindowOrderBy>) -> Self {
        self.order_by = exprs;
        self
    }

    pub fn build(self) -> Expr {
        Expr::WindowFunction {
            function: Box::new(self.function),
            partition_by: self.partition_by,
            order_by: self.order_by,
        }
    }
}

/// Extension trait for adding OVER clause to expressions.
pub trait WindowExt: Sized {
    fn over(self) -> WindowBuilder;
}

impl WindowExt for Expr {
    fn over(self) -> WindowBuilder {
        WindowBuilder::new(self)
    }
}

// =============================================================================
// Expression Builder Trait
// =============================================================================

/// Extension trait for building expressions fluently.
pub trait ExprExt: Sized {
    fn into_expr(self) -> Expr;

    fn binary(self, op: BinaryOperator, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op,
            right: Box::new(other.into()),
        }
    }

    fn eq(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Eq, other)
    }

    fn ne(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Ne, other)
    }

    fn gt(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Gt, other)
    }

    fn gte(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Gte, other)
    }

    fn lt(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Lt, other)
    }

    fn lte(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Lte, other)
    }

    fn and(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::And, other)
    }

    fn or(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Or, other)
    }

    fn not(self) -> Expr {
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(self.into_expr()),
        }
    }

    fn concat(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOperator::Concat, other)
    }

    #[allow(clippy::wrong_self_convention)]
    fn is_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self.into_expr()),
            negated: false,
        }
    }

    #[allow(clippy::wrong_self_convention)]
    fn is_not_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self.into_expr()),
            negated: true,
        }
    }

    fn in_list(self, values: Vec<Expr>) -> Expr {
        Expr::In {
            expr: Box::new(self.into_expr()),
            values,
            negated: false,
        }
    }

    fn in_subquery(self, subquery: Query, negated: bool) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self.into_expr()),
            subquery: Box::new(subquery),
            negated,
        }
    }

    /// Alias this expression (for SELECT list).
    fn alias(self, name: &str) -> SelectExpr {
        SelectExpr {
            expr: self.into_expr(),
            alias: Some(name.into()),
        }
    }
}

impl ExprExt for Expr {
    fn into_expr(self) -> Expr {
        self
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        lit_int(n)
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        lit_int(n as i64)
    }
}

impl From<f64> for Expr {
    fn from(f: f64) -> Self {
        lit_float(f)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        lit_str(s)
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        lit_bool(b)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::query::TableRef;

    fn sql(expr: &Expr, dialect: Dialect) -> String {
        expr.to_tokens_for_dialect(dialect).serialize(dialect)
    }

    #[test]
    fn test_table_column() {
        assert_eq!(sql(&table_col("u", "name"), Dialect::Postgres), "\"u\".\"name\"");
        assert_eq!(sql(&table_col("u", "name"), Dialect::TSql), "[u].[name]");
    }

    #[test]
    fn test_binary_op() {
        let expr = col("age").gte(lit_int(18));
        assert_eq!(sql(&expr, Dialect::Postgres), "\"age\" >= 18");
    }

    #[test]
    fn test_count_distinct() {
        let expr = count_distinct(col("user_id"));
        assert_eq!(sql(&expr, Dialect::Postgres), "COUNT(DISTINCT \"user_id\")");
    }

    #[test]
    fn test_nested_args_use_the_dialect() {
        let expr = sum(col("amount"));
        assert_eq!(sql(&expr, Dialect::BigQuery), "SUM(`amount`)");
    }

    #[test]
    fn test_in_list_empty() {
        let expr = col("status").in_list(vec![]);
        assert_eq!(sql(&expr, Dialect::Postgres), "1 = 0");
    }

    #[test]
    fn test_case() {
        let expr = case_when(col("status").eq("A"), lit_int(1), Some(lit_int(0)));
        assert_eq!(
            sql(&expr, Dialect::DuckDb),
            "CASE WHEN \"status\" = 'A' THEN 1 ELSE 0 END"
        );
    }

    #[test]
    fn test_cast_uses_dialect_types() {
        let expr = Expr::Cast {
            expr: Box::new(col("x")),
            datatype: DataType::Integer,
        };
        assert_eq!(sql(&expr, Dialect::BigQuery), "CAST(`x` AS INT64)");
        assert_eq!(sql(&expr, Dialect::Postgres), "CAST(\"x\" AS INTEGER)");
    }

    #[test]
    fn test_rank_over_order() {
        let expr = func("RANK", vec![])
            .over()
            .order_by(vec![WindowOrderBy::desc(col("births"))])
            .build();
        assert_eq!(
            sql(&expr, Dialect::DuckDb),
            "RANK() OVER (ORDER BY \"births\" DESC)"
        );
    }

    #[test]
    fn test_nulls_ordering_dropped_on_tsql() {
        let expr = func("ROW_NUMBER", vec![])
            .over()
            .partition_by(vec![col("g")])
            .order_by(vec![WindowOrderBy::asc(col("x")).nulls(Some(NullsOrder::First))])
            .build();
        assert_eq!(
            sql(&expr, Dialect::Postgres),
            "ROW_NUMBER() OVER (PARTITION BY \"g\" ORDER BY \"x\" ASC NULLS FIRST)"
        );
        assert_eq!(
            sql(&expr, Dialect::TSql),
            "ROW_NUMBER() OVER (PARTITION BY [g] ORDER BY [x] ASC)"
        );
    }

    #[test]
    fn test_in_subquery() {
        let sub = Query::new()
            .select(vec![table_col("c", "id")])
            .from(TableRef::named("c"));
        let expr = col("id").in_subquery(sub, false);
        assert_eq!(
            sql(&expr, Dialect::DuckDb),
            "\"id\" IN (SELECT \"c\".\"id\" FROM \"c\")"
        );
    }

    #[test]
    fn test_nested_wraps_operators() {
        let expr = col("a").and(col("b").or(col("c")).nested());
        assert_eq!(sql(&expr, Dialect::DuckDb), "\"a\" AND (\"b\" OR \"c\")");
    }
}
