//! Rendering planned CTEs as dialect SQL.
//!
//! [`render`] lowers the planner's CTE list into a [`Query`] built from
//! [`query`] and [`expr`] nodes. Those emit a [`TokenStream`], and only
//! [`TokenStream::serialize`] consults the [`dialect`].

pub mod dialect;
pub mod expr;
pub mod query;
pub mod render;
pub mod token;

#[cfg(test)]
pub mod test_utils;

pub use dialect::{Dialect, SqlDialect};
pub use expr::{
    avg, case_when, coalesce, col, count, count_distinct, func, lit_bool, lit_float, lit_int,
    lit_null, lit_str, max, min, raw_sql, star, sum, table_col, BinaryOperator, Expr, ExprExt,
    Literal, NullsOrder, SortDir, UnaryOperator, WindowBuilder, WindowExt, WindowOrderBy,
};
pub use query::{
    Cte, CteBody, Join, JoinType, LimitOffset, OrderByExpr, Query, SelectExpr, TableFactor,
    TableRef,
};
pub use render::{render_query, INVALID_REFERENCE};
pub use token::{Keyword, Token, TokenStream};
