//! End-to-end compilation through the public API.

mod common;

use common::{births, orders, strict, users_posts};
use grainql::compile::{compile_statement, compile_statements, process_query};
use grainql::config::OptimizationSettings;
use grainql::model::{
    concept, lit, Concept, DataType, Datasource, DatasourceAddress, Function, FunctionType,
    Grain, PersistStatement, SelectStatement, Statement,
};
use grainql::sql::Dialect;
use grainql::{compile_select, Environment, Error};

// ============================================================================
// Grain
// ============================================================================

#[test]
fn test_grain_from_concepts_ignores_order() {
    let env = orders();
    let a = &env.concepts["local.order_id"];
    let b = &env.concepts["local.customer_name"];
    let lookup = |addr: &str| env.concepts.get(addr);
    assert_eq!(
        Grain::from_concepts(&[a, b], lookup),
        Grain::from_concepts(&[b, a], lookup)
    );
    assert_eq!(a.grain.union(&b.grain), b.grain.union(&a.grain));
}

#[test]
fn test_property_is_absorbed_by_its_key() {
    let env = orders();
    let key = &env.concepts["local.customer_id"];
    let name = &env.concepts["local.customer_name"];
    let grain = Grain::from_concepts(&[key, name], |addr: &str| env.concepts.get(addr));
    assert_eq!(grain, Grain::new(["local.customer_id"]));
}

// ============================================================================
// Merges
// ============================================================================

#[test]
fn test_merge_is_idempotent() {
    let mut env = orders();
    env.add_concept(Concept::key("buyer_id", DataType::Integer)).unwrap();
    assert!(env.merge_concept("buyer_id", "customer_id", &[]).unwrap());
    let once = env.to_json().unwrap();
    assert!(!env.merge_concept("buyer_id", "customer_id", &[]).unwrap());
    assert_eq!(env.to_json().unwrap(), once);
    let target = &env.concepts["local.customer_id"];
    assert_eq!(
        target.pseudonyms.iter().filter(|p| *p == "local.buyer_id").count(),
        1
    );
}

#[test]
fn test_merged_concept_selects_through_target() {
    let mut env = orders();
    env.add_concept(Concept::key("buyer_id", DataType::Integer)).unwrap();
    env.merge_concept("buyer_id", "customer_id", &[]).unwrap();
    let sql = compile_select(&env, &SelectStatement::new(&["buyer_id", "customer_name"]), Dialect::DuckDb)
        .unwrap();
    assert!(sql.contains("customers"), "{}", sql);
}

// ============================================================================
// Planning shape
// ============================================================================

#[test]
fn test_nested_aggregate_compiles_to_two_ctes() {
    let env = users_posts();
    let select = SelectStatement::new(&["avg_user_post_count"]);
    let query = process_query(&env, &select, &strict(Dialect::DuckDb)).unwrap();

    assert_eq!(query.ctes.len(), 2, "{:#?}", query.ctes.iter().map(|c| &c.name).collect::<Vec<_>>());
    let inner = &query.ctes[0];
    let outer = &query.ctes[1];
    assert!(inner.group_to_grain);
    assert_eq!(inner.grain, Grain::new(["local.user_id"]));
    assert!(outer.grain.is_abstract());
    assert_eq!(outer.parent_ctes, vec![inner.name.clone()]);

    let sql = compile_select(&env, &select, Dialect::DuckDb).unwrap();
    assert_eq!(sql.matches("GROUP BY").count(), 1, "{}", sql);
    assert!(sql.contains("AVG("), "{}", sql);
    assert!(sql.contains("COUNT("), "{}", sql);
}

#[test]
fn test_table_read_is_inlined_into_its_consumer() {
    let env = users_posts();
    let select = SelectStatement::new(&["avg_user_post_count"]);
    let mut unoptimized = strict(Dialect::DuckDb);
    unoptimized.optimizations = OptimizationSettings::disabled();
    let raw = process_query(&env, &select, &unoptimized).unwrap();
    let optimized = process_query(&env, &select, &strict(Dialect::DuckDb)).unwrap();

    assert!(raw.ctes.len() > optimized.ctes.len());
    assert!(raw.ctes.iter().any(|c| c.parent_ctes.is_empty() && c.root_datasource().is_some()));
    assert!(optimized.ctes[0].parent_ctes.is_empty());
}

#[test]
fn test_aggregate_at_source_grain_is_not_regrouped() {
    let env = orders();
    let select = SelectStatement::new(&["order_id", "order_total"]).derive(
        Concept::metric(
            "order_total",
            Function::new(FunctionType::Sum, vec![concept("amount")]),
            &["order_id"],
            &env,
        )
        .unwrap(),
    );
    let sql = compile_select(&env, &select, Dialect::DuckDb).unwrap();
    assert!(!sql.contains("GROUP BY"), "{}", sql);
    assert!(!sql.contains("SUM("), "{}", sql);
}

#[test]
fn test_property_join_uses_key() {
    let env = orders();
    let sql = compile_select(
        &env,
        &SelectStatement::new(&["order_id", "customer_name"]),
        Dialect::Postgres,
    )
    .unwrap();
    assert!(sql.contains("JOIN"), "{}", sql);
    assert!(sql.contains("\"customer_id\""), "{}", sql);
}

#[test]
fn test_where_on_unselected_concept_filters_rows() {
    let env = orders();
    let select = SelectStatement::new(&["customer_name"]).with_where(concept("amount").gt(lit(15)));
    let sql = compile_select(&env, &select, Dialect::DuckDb).unwrap();
    assert!(sql.contains("WHERE"), "{}", sql);
    assert!(sql.contains("> 15"), "{}", sql);
}

#[test]
fn test_window_renders_rank() {
    let sql = compile_select(&births(), &SelectStatement::new(&["name", "name_rank"]), Dialect::Postgres)
        .unwrap();
    assert!(sql.contains("RANK() OVER (ORDER BY"), "{}", sql);
    assert!(sql.contains("DESC"), "{}", sql);
}

// ============================================================================
// Failures
// ============================================================================

fn ambiguous() -> Environment {
    let mut env = Environment::new();
    for key in ["order_id", "customer_id", "store_id", "customer_region_key", "store_region_key"] {
        env.add_concept(Concept::key(key, DataType::Integer)).unwrap();
    }
    env.add_concept(Concept::key("region_name", DataType::String)).unwrap();
    let tables: [(&str, &[&str]); 5] = [
        ("orders", &["order_id", "customer_id", "store_id"]),
        ("customers", &["customer_id", "customer_region_key"]),
        ("stores", &["store_id", "store_region_key"]),
        ("regions_c", &["customer_region_key", "region_name"]),
        ("regions_s", &["store_region_key", "region_name"]),
    ];
    for (name, columns) in tables {
        let ds = columns
            .iter()
            .fold(Datasource::new(name, DatasourceAddress::table(name)), |ds, c| ds.column(c, c))
            .with_grain(&columns[..1]);
        env.add_datasource(ds).unwrap();
    }
    env
}

#[test]
fn test_two_join_paths_fail_closed() {
    let err = compile_select(
        &ambiguous(),
        &SelectStatement::new(&["order_id", "region_name"]),
        Dialect::DuckDb,
    )
    .unwrap_err();
    match err {
        Error::AmbiguousRelationshipResolution { parents, .. } => assert_eq!(parents.len(), 2),
        other => panic!("expected an ambiguity error, got {}", other),
    }
}

#[test]
fn test_explicit_path_concept_resolves_ambiguity() {
    let sql = compile_select(
        &ambiguous(),
        &SelectStatement::new(&["order_id", "customer_region_key", "region_name"]),
        Dialect::DuckDb,
    )
    .unwrap();
    assert!(sql.contains("regions_c"), "{}", sql);
    assert!(!sql.contains("regions_s"), "{}", sql);
}

#[test]
fn test_undefined_concept_names_suggestions() {
    let err = compile_select(&orders(), &SelectStatement::new(&["ordr_id"]), Dialect::DuckDb).unwrap_err();
    match err {
        Error::UndefinedConcept { address, suggestions } => {
            assert_eq!(address, "local.ordr_id");
            assert!(suggestions.contains(&"local.order_id".to_string()));
        }
        other => panic!("expected undefined concept, got {}", other),
    }
}

// ============================================================================
// Statements
// ============================================================================

#[test]
fn test_persist_then_select() {
    let mut env = orders();
    let persist = Statement::Persist(PersistStatement {
        datasource: Datasource::new("customer_revenue", DatasourceAddress::table("customer_revenue"))
            .column("customer_id", "customer_id")
            .column("revenue", "revenue")
            .with_grain(&["customer_id"]),
        select: SelectStatement::new(&["customer_id", "revenue"]),
    });
    let config = strict(Dialect::Sqlite);
    let sql = compile_statement(&mut env, &persist, &config).unwrap().unwrap();
    assert!(sql.starts_with("CREATE TABLE customer_revenue AS\n"), "{}", sql);
    assert!(env.datasources.contains_key("customer_revenue"));
}

#[test]
fn test_failed_persist_leaves_environment_unchanged() {
    let mut env = orders();
    let persist = Statement::Persist(PersistStatement {
        datasource: Datasource::new("customer_revenue", DatasourceAddress::table("customer_revenue"))
            .column("customer_id", "customer_id")
            .column("revenue", "revenue")
            .with_grain(&["customer_id"]),
        select: SelectStatement::new(&["customer_id", "revenue"]),
    });
    let err = compile_statement(&mut env, &persist, &strict(Dialect::TSql)).unwrap_err();
    assert!(matches!(err, Error::InvalidSyntax(_)), "{}", err);
    assert!(!env.datasources.contains_key("customer_revenue"));

    compile_statement(&mut env, &persist, &strict(Dialect::DuckDb)).unwrap();
    assert!(env.datasources.contains_key("customer_revenue"));
}

#[test]
fn test_statements_share_environment() {
    let mut env = orders();
    let statements = vec![
        Statement::ConceptDeclaration(grainql::model::ConceptDeclarationStatement {
            concept: Concept::key("region", DataType::String),
        }),
        Statement::Select(SelectStatement::new(&["order_id", "amount"]).limit(3)),
    ];
    let out = compile_statements(&mut env, &statements, &strict(Dialect::Snowflake)).unwrap();
    assert_eq!(out.len(), 1);
    assert!(out[0].ends_with("LIMIT 3"), "{}", out[0]);
    assert!(env.concepts.contains_key("local.region"));
}

#[test]
fn test_every_dialect_renders() {
    let env = orders();
    let select = SelectStatement::new(&["customer_name", "revenue"]);
    for dialect in Dialect::ALL {
        let sql = compile_select(&env, &select, dialect).unwrap();
        assert!(sql.contains("SUM("), "{}: {}", dialect, sql);
        assert!(sql.contains("GROUP BY"), "{}: {}", dialect, sql);
    }
}
