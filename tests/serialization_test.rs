//! JSON round trips of environments and statements.

mod common;

use common::{orders, users_posts};
use grainql::model::{concept, lit, OrderItem, SelectStatement, Statement};
use grainql::sql::Dialect;
use grainql::{compile_select, Environment};

#[test]
fn test_environment_round_trip_keeps_model() {
    let env = users_posts();
    let restored = Environment::from_json(&env.to_json().unwrap()).unwrap();
    assert_eq!(
        env.concepts.keys().collect::<Vec<_>>(),
        restored.concepts.keys().collect::<Vec<_>>()
    );
    for (address, concept) in &env.concepts {
        let other = &restored.concepts[address];
        assert_eq!(concept.purpose, other.purpose, "{}", address);
        assert_eq!(concept.grain, other.grain, "{}", address);
        assert_eq!(concept.derivation, other.derivation, "{}", address);
    }
    assert_eq!(env.datasources, restored.datasources);
}

#[test]
fn test_restored_environment_compiles_identically() {
    let env = orders();
    let restored = Environment::from_json(&env.to_json().unwrap()).unwrap();
    let select = SelectStatement::new(&["customer_name", "revenue"]);
    assert_eq!(
        compile_select(&env, &select, Dialect::DuckDb).unwrap(),
        compile_select(&restored, &select, Dialect::DuckDb).unwrap()
    );
    assert!(restored.is_materialized("local.customer_name"));
}

#[test]
fn test_statement_round_trip() {
    let statement = Statement::Select(
        SelectStatement::new(&["order_id", "amount"])
            .with_where(concept("amount").gt(lit(10)))
            .order_by(vec![OrderItem::desc("amount")])
            .limit(5),
    );
    let json = serde_json::to_value(&statement).unwrap();
    assert_eq!(json["type"], "select");
    let restored: Statement = serde_json::from_value(json.clone()).unwrap();
    assert_eq!(serde_json::to_value(&restored).unwrap(), json);
}

#[test]
fn test_statement_list_from_json_compiles() {
    let statements = vec![
        Statement::Select(SelectStatement::new(&["order_id"])),
        Statement::Select(SelectStatement::new(&["customer_name"])),
    ];
    let text = serde_json::to_string(&statements).unwrap();
    let parsed: Vec<Statement> = serde_json::from_str(&text).unwrap();
    let mut env = orders();
    let sql = grainql::compile_statements(&mut env, &parsed, &common::strict(Dialect::Postgres)).unwrap();
    assert_eq!(sql.len(), 2);
}
