//! Shared models and seed data for integration tests.
//!
//! Each model comes with a `seed_*` function creating matching tables in a
//! SQLite connection, so the SQLite dialect's output can be executed.

#![allow(dead_code)]

use grainql::config::CompilerConfig;
use grainql::model::{
    concept, lit, Concept, DataType, Datasource, DatasourceAddress, Expr, FilterItem, Function,
    FunctionType, Lineage, OrderItem, WhereClause, WindowItem, WindowType,
};
use grainql::sql::Dialect;
use grainql::Environment;
use rusqlite::types::Value;
use rusqlite::Connection;

pub fn strict(dialect: Dialect) -> CompilerConfig {
    CompilerConfig::default()
        .with_dialect(dialect)
        .with_strict_mode(true)
}

fn table(name: &str, columns: &[&str], grain: &[&str]) -> Datasource {
    columns
        .iter()
        .fold(Datasource::new(name, DatasourceAddress::table(name)), |ds, c| ds.column(c, c))
        .with_grain(grain)
}

// ============================================================================
// Orders and customers
// ============================================================================

/// Five orders for two customers. Amounts 30 and 30 tie.
pub fn orders() -> Environment {
    let mut env = Environment::new();
    env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
    env.add_concept(Concept::key("customer_id", DataType::Integer)).unwrap();
    env.add_concept(Concept::property("amount", DataType::Float, &["order_id"]))
        .unwrap();
    env.add_concept(Concept::property("customer_name", DataType::String, &["customer_id"]))
        .unwrap();

    let even = Concept::derived(
        "even_order_id",
        Lineage::Filter(FilterItem {
            content: "local.order_id".into(),
            where_clause: WhereClause::new(
                Expr::Function(Box::new(Function::new(
                    FunctionType::Mod,
                    vec![concept("order_id"), lit(2)],
                )))
                .eq(lit(0)),
            ),
        }),
        &env,
    )
    .unwrap();
    env.add_concept(even).unwrap();

    let amount_rank = Concept::derived(
        "amount_rank",
        Lineage::Window(WindowItem {
            window_type: WindowType::Rank,
            content: "local.order_id".into(),
            over: Vec::new(),
            order_by: vec![OrderItem::desc("amount")],
            index: None,
        }),
        &env,
    )
    .unwrap();
    env.add_concept(amount_rank).unwrap();

    let revenue = Concept::metric(
        "revenue",
        Function::new(FunctionType::Sum, vec![concept("amount")]),
        &[],
        &env,
    )
    .unwrap();
    env.add_concept(revenue).unwrap();

    env.add_datasource(table("orders", &["order_id", "customer_id", "amount"], &["order_id"]))
        .unwrap();
    env.add_datasource(table("customers", &["customer_id", "customer_name"], &["customer_id"]))
        .unwrap();
    env
}

pub fn seed_orders(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE orders (order_id INTEGER, customer_id INTEGER, amount REAL);
         INSERT INTO orders VALUES
            (1, 1, 30.0), (2, 1, 30.0), (3, 2, 20.0), (4, 2, 10.0), (5, 1, 5.0);
         CREATE TABLE customers (customer_id INTEGER, customer_name TEXT);
         INSERT INTO customers VALUES (1, 'ada'), (2, 'bob');",
    )
    .unwrap();
}

// ============================================================================
// Users and posts
// ============================================================================

/// Posts at `post_id` grain, with a per-user count and its average.
pub fn users_posts() -> Environment {
    let mut env = Environment::new();
    env.add_concept(Concept::key("user_id", DataType::Integer)).unwrap();
    env.add_concept(Concept::key("post_id", DataType::Integer)).unwrap();
    env.add_concept(Concept::property("user_name", DataType::String, &["user_id"]))
        .unwrap();

    let count = Concept::metric(
        "user_post_count",
        Function::new(FunctionType::Count, vec![concept("post_id")]),
        &["user_id"],
        &env,
    )
    .unwrap();
    env.add_concept(count).unwrap();
    let avg = Concept::metric(
        "avg_user_post_count",
        Function::new(FunctionType::Avg, vec![concept("user_post_count")]),
        &[],
        &env,
    )
    .unwrap();
    env.add_concept(avg).unwrap();

    env.add_datasource(table("posts", &["post_id", "user_id"], &["post_id"]))
        .unwrap();
    env.add_datasource(table("users", &["user_id", "user_name"], &["user_id"]))
        .unwrap();
    env
}

/// User 1 has three posts, user 2 one, user 3 none.
pub fn seed_users_posts(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE posts (post_id INTEGER, user_id INTEGER);
         INSERT INTO posts VALUES (10, 1), (11, 1), (12, 1), (13, 2);
         CREATE TABLE users (user_id INTEGER, user_name TEXT);
         INSERT INTO users VALUES (1, 'ann'), (2, 'ben'), (3, 'cy');",
    )
    .unwrap();
}

// ============================================================================
// Births
// ============================================================================

/// Yearly birth counts per name, ranked by their total.
pub fn births() -> Environment {
    let mut env = Environment::new();
    env.add_concept(Concept::key("name", DataType::String)).unwrap();
    env.add_concept(Concept::key("year", DataType::Integer)).unwrap();
    env.add_concept(Concept::property("births", DataType::Integer, &["name", "year"]))
        .unwrap();

    let total = Concept::metric(
        "total_births",
        Function::new(FunctionType::Sum, vec![concept("births")]),
        &["name"],
        &env,
    )
    .unwrap();
    env.add_concept(total).unwrap();
    let rank = Concept::derived(
        "name_rank",
        Lineage::Window(WindowItem {
            window_type: WindowType::Rank,
            content: "local.name".into(),
            over: Vec::new(),
            order_by: vec![OrderItem::desc("total_births")],
            index: None,
        }),
        &env,
    )
    .unwrap();
    env.add_concept(rank).unwrap();

    env.add_datasource(table("usa_names", &["name", "year", "births"], &["name", "year"]))
        .unwrap();
    env
}

/// `ann` and `bob` tie on 15 births; `cal` has 7.
pub fn seed_births(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE usa_names (name TEXT, year INTEGER, births INTEGER);
         INSERT INTO usa_names VALUES
            ('ann', 2000, 10), ('ann', 2001, 5),
            ('bob', 2000, 15),
            ('cal', 2000, 3), ('cal', 2001, 4);",
    )
    .unwrap();
}

// ============================================================================
// Execution
// ============================================================================

/// Run `sql` and collect every row.
pub fn query_rows(conn: &Connection, sql: &str) -> Vec<Vec<Value>> {
    let mut stmt = conn
        .prepare(sql)
        .unwrap_or_else(|e| panic!("failed to prepare: {}\n{}", e, sql));
    let width = stmt.column_count();
    stmt.query_map([], |row| (0..width).map(|i| row.get::<_, Value>(i)).collect())
        .unwrap()
        .collect::<rusqlite::Result<Vec<Vec<Value>>>>()
        .unwrap()
}

/// Output column names of `sql`, in order.
pub fn column_names(conn: &Connection, sql: &str) -> Vec<String> {
    let stmt = conn.prepare(sql).unwrap();
    stmt.column_names().into_iter().map(String::from).collect()
}

pub fn parse_check(sql: &str) {
    let dialect = sqlparser::dialect::SQLiteDialect {};
    if let Err(e) = sqlparser::parser::Parser::parse_sql(&dialect, sql) {
        panic!("generated SQL does not parse: {}\n{}", e, sql);
    }
}

pub fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Integer(i) => *i,
        Value::Real(f) => *f as i64,
        other => panic!("expected a number, got {:?}", other),
    }
}

pub fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Real(f) => *f,
        other => panic!("expected a number, got {:?}", other),
    }
}
