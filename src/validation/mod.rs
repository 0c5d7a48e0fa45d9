//! Validation of models against their declarations and against live data.
//!
//! Structural checks need only the environment. Row checks take a sample of
//! a datasource, either supplied directly or fetched through a SQLite
//! connection, and compare it with the declared types, nullability and
//! grain. Every check runs before anything is reported, so one pass shows
//! every violation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::model::{ColumnAlias, ConceptLookup, DataType, Datasource, Derivation, Modifier, Purpose};

/// One violation found by validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelValidationIssue {
    /// A datasource column is bound to a concept the environment lacks.
    UndefinedConcept { datasource: String, concept: String },
    /// A grain component of a datasource is not one of its columns.
    GrainNotBound { datasource: String, concept: String },
    /// A root concept no datasource provides.
    UnboundConcept { concept: String },
    /// A declared column is absent from the sampled rows.
    MissingColumn { datasource: String, column: String },
    TypeMismatch {
        datasource: String,
        column: String,
        expected: DataType,
        found: String,
    },
    /// A null in a column declared neither nullable nor partial.
    UnexpectedNull { datasource: String, column: String },
    /// Two sampled rows share the same grain key.
    GrainViolation { datasource: String, key: Vec<String> },
}

impl fmt::Display for ModelValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelValidationIssue::UndefinedConcept {
                datasource,
                concept,
            } => write!(f, "datasource '{}' binds undefined concept '{}'", datasource, concept),
            ModelValidationIssue::GrainNotBound {
                datasource,
                concept,
            } => write!(
                f,
                "datasource '{}' declares grain on '{}' but has no column for it",
                datasource, concept
            ),
            ModelValidationIssue::UnboundConcept { concept } => {
                write!(f, "concept '{}' is not bound to any datasource", concept)
            }
            ModelValidationIssue::MissingColumn { datasource, column } => {
                write!(f, "datasource '{}' is missing column '{}'", datasource, column)
            }
            ModelValidationIssue::TypeMismatch {
                datasource,
                column,
                expected,
                found,
            } => write!(
                f,
                "column '{}.{}' is declared {} but holds {}",
                datasource, column, expected, found
            ),
            ModelValidationIssue::UnexpectedNull { datasource, column } => write!(
                f,
                "column '{}.{}' holds nulls but is not declared nullable",
                datasource, column
            ),
            ModelValidationIssue::GrainViolation { datasource, key } => write!(
                f,
                "datasource '{}' has more than one row for grain key ({})",
                datasource,
                key.join(", ")
            ),
        }
    }
}

/// Sampled rows of a datasource, by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl SampleRows {
    pub fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

// ============================================================================
// Structural checks
// ============================================================================

/// Check datasource bindings and concept coverage for `scope` (all
/// datasources when empty).
pub fn validate_environment(env: &Environment, scope: &[String]) -> Result<()> {
    let mut issues = Vec::new();
    for (name, ds) in &env.datasources {
        if scope.is_empty() || scope.contains(name) {
            validate_bindings(env, ds, &mut issues);
        }
    }
    if !issues.is_empty() {
        return Err(Error::DatasourceModelValidation(issues));
    }
    if scope.is_empty() {
        validate_concept_coverage(env, &mut issues);
    }
    if !issues.is_empty() {
        return Err(Error::ConceptModelValidation(issues));
    }
    log::info!("validated {} datasources", env.datasources.len());
    Ok(())
}

fn validate_bindings(env: &Environment, ds: &Datasource, issues: &mut Vec<ModelValidationIssue>) {
    let name = ds.identifier();
    for col in &ds.columns {
        if env.lookup(&col.concept).is_none() {
            issues.push(ModelValidationIssue::UndefinedConcept {
                datasource: name.clone(),
                concept: col.concept.clone(),
            });
        }
    }
    if let Some(grain) = &ds.grain {
        for component in &grain.components {
            if ds.column_for(component).is_none() {
                issues.push(ModelValidationIssue::GrainNotBound {
                    datasource: name.clone(),
                    concept: component.clone(),
                });
            }
        }
    }
}

fn validate_concept_coverage(env: &Environment, issues: &mut Vec<ModelValidationIssue>) {
    for (address, concept) in &env.concepts {
        if concept.address != *address
            || concept.derivation != Derivation::Root
            || concept.purpose == Purpose::Constant
        {
            continue;
        }
        if !env.is_materialized(address) {
            issues.push(ModelValidationIssue::UnboundConcept {
                concept: address.clone(),
            });
        }
    }
}

// ============================================================================
// Row checks
// ============================================================================

/// Compare sampled rows of `ds` with its declaration.
pub fn validate_datasource_rows(env: &Environment, ds: &Datasource, sample: &SampleRows) -> Result<()> {
    let mut issues = Vec::new();
    let name = ds.identifier();
    let mut positions: BTreeMap<&str, usize> = BTreeMap::new();

    for col in &ds.columns {
        let ColumnAlias::Name(column) = &col.alias else {
            continue;
        };
        let Some(idx) = sample.index_of(column) else {
            issues.push(ModelValidationIssue::MissingColumn {
                datasource: name.clone(),
                column: column.clone(),
            });
            continue;
        };
        positions.insert(col.concept.as_str(), idx);
        let Some(concept) = env.lookup(&col.concept) else {
            continue;
        };
        let nullable = col.is_nullable()
            || col.is_partial()
            || concept.modifiers.contains(&Modifier::Nullable)
            || concept.modifiers.contains(&Modifier::Optional);
        let values = sample.rows.iter().filter_map(|r| r.get(idx));
        check_values(&name, column, &concept.datatype, nullable, values, &mut issues);
    }

    check_grain(env, ds, sample, &positions, &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::DatasourceModelValidation(issues))
    }
}

fn check_values<'a>(
    datasource: &str,
    column: &str,
    expected: &DataType,
    nullable: bool,
    values: impl Iterator<Item = &'a Value>,
    issues: &mut Vec<ModelValidationIssue>,
) {
    let mut null_reported = false;
    for value in values {
        if value.is_null() {
            if !nullable && !null_reported {
                issues.push(ModelValidationIssue::UnexpectedNull {
                    datasource: datasource.to_string(),
                    column: column.to_string(),
                });
                null_reported = true;
            }
            continue;
        }
        if !value_matches(expected, value) {
            issues.push(ModelValidationIssue::TypeMismatch {
                datasource: datasource.to_string(),
                column: column.to_string(),
                expected: expected.clone(),
                found: value_kind(value).to_string(),
            });
            return;
        }
    }
}

/// Whether a sampled value fits a declared type. Dates and nested values
/// may arrive as text.
fn value_matches(expected: &DataType, value: &Value) -> bool {
    match expected {
        DataType::Integer | DataType::BigInt => value.is_i64() || value.is_u64(),
        DataType::Float | DataType::Numeric { .. } => value.is_number(),
        DataType::Bool => {
            value.is_boolean() || matches!(value.as_i64(), Some(0) | Some(1))
        }
        DataType::String => value.is_string(),
        DataType::Date | DataType::Datetime | DataType::Timestamp => {
            value.is_string() || value.is_number()
        }
        DataType::List(_) => value.is_array() || value.is_string(),
        DataType::Struct(_) | DataType::Map { .. } => value.is_object() || value.is_string(),
        DataType::Unknown => true,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "struct",
    }
}

fn check_grain(
    env: &Environment,
    ds: &Datasource,
    sample: &SampleRows,
    positions: &BTreeMap<&str, usize>,
    issues: &mut Vec<ModelValidationIssue>,
) {
    let grain = ds.resolved_grain(env);
    let Some(key_positions) = grain
        .components
        .iter()
        .map(|c| positions.get(c.as_str()).copied())
        .collect::<Option<Vec<usize>>>()
    else {
        return;
    };
    if key_positions.is_empty() {
        return;
    }
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    for row in &sample.rows {
        let key: Vec<String> = key_positions
            .iter()
            .map(|i| row.get(*i).map(Value::to_string).unwrap_or_default())
            .collect();
        if !seen.insert(key.clone()) {
            issues.push(ModelValidationIssue::GrainViolation {
                datasource: ds.identifier(),
                key,
            });
            return;
        }
    }
}

// ============================================================================
// SQLite sampling
// ============================================================================

/// Read up to `limit` rows of the named columns of `ds`.
pub fn fetch_sample(conn: &Connection, ds: &Datasource, limit: usize) -> Result<SampleRows> {
    let columns: Vec<String> = ds
        .columns
        .iter()
        .filter_map(|c| c.alias.as_name().map(str::to_string))
        .collect();
    if columns.is_empty() {
        return Ok(SampleRows::default());
    }
    let select = columns
        .iter()
        .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(", ");
    let from = if ds.address.is_query() {
        format!("({}) AS sample", ds.address.location)
    } else {
        ds.address.location.clone()
    };
    let sql = format!("SELECT {} FROM {} LIMIT {}", select, from, limit);
    log::debug!("sampling {} with {}", ds.identifier(), sql);

    let mut stmt = conn.prepare(&sql)?;
    let width = columns.len();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(json_value))
                .collect::<rusqlite::Result<Vec<Value>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(SampleRows { columns, rows })
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(format!("<{} bytes>", b.len())),
    }
}

/// Sample `ds` from `conn` and validate the rows.
pub fn validate_datasource(env: &Environment, conn: &Connection, name: &str, limit: usize) -> Result<()> {
    let ds = env
        .datasources
        .get(name)
        .ok_or_else(|| Error::NoDatasource(name.to_string()))?;
    let sample = fetch_sample(conn, ds, limit)?;
    validate_datasource_rows(env, ds, &sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Concept, DatasourceAddress};
    use serde_json::json;

    fn environment() -> Environment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("amount", DataType::Float, &["order_id"]))
            .unwrap();
        env.add_concept(Concept::property("note", DataType::String, &["order_id"]))
            .unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("order_id", "order_id")
                .column("amount", "amount")
                .nullable_column("note", "note")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        env
    }

    fn orders(env: &Environment) -> &Datasource {
        &env.datasources["orders"]
    }

    #[test]
    fn test_structure_passes_for_bound_model() {
        assert!(validate_environment(&environment(), &[]).is_ok());
    }

    #[test]
    fn test_unbound_root_concept_is_reported() {
        let mut env = environment();
        env.add_concept(Concept::key("customer_id", DataType::Integer)).unwrap();
        let err = validate_environment(&env, &[]).unwrap_err();
        let Error::ConceptModelValidation(issues) = err else {
            panic!("expected concept issues, got {:?}", err);
        };
        assert_eq!(
            issues,
            vec![ModelValidationIssue::UnboundConcept {
                concept: "local.customer_id".into()
            }]
        );
    }

    #[test]
    fn test_clean_rows_pass() {
        let env = environment();
        let sample = SampleRows::new(
            &["order_id", "amount", "note"],
            vec![
                vec![json!(1), json!(10.5), json!("a")],
                vec![json!(2), json!(3), Value::Null],
            ],
        );
        assert!(validate_datasource_rows(&env, orders(&env), &sample).is_ok());
    }

    #[test]
    fn test_row_issues_are_aggregated() {
        let env = environment();
        let sample = SampleRows::new(
            &["order_id", "amount"],
            vec![
                vec![json!(1), Value::Null],
                vec![json!(1), json!("ten")],
            ],
        );
        let err = validate_datasource_rows(&env, orders(&env), &sample).unwrap_err();
        let Error::DatasourceModelValidation(issues) = err else {
            panic!("expected datasource issues, got {:?}", err);
        };
        assert!(issues.contains(&ModelValidationIssue::MissingColumn {
            datasource: "orders".into(),
            column: "note".into()
        }));
        assert!(issues.contains(&ModelValidationIssue::UnexpectedNull {
            datasource: "orders".into(),
            column: "amount".into()
        }));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ModelValidationIssue::TypeMismatch { column, .. } if column == "amount")));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ModelValidationIssue::GrainViolation { .. })));
        assert_eq!(issues.len(), 4);
    }

    #[test]
    fn test_sqlite_sample_is_validated() {
        let env = environment();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (order_id INTEGER, amount REAL, note TEXT);
             INSERT INTO orders VALUES (1, 2.5, NULL), (2, 4.0, 'x');",
        )
        .unwrap();
        let sample = fetch_sample(&conn, orders(&env), 10).unwrap();
        assert_eq!(sample.rows.len(), 2);
        assert!(validate_datasource(&env, &conn, "orders", 10).is_ok());

        conn.execute("INSERT INTO orders VALUES (2, 1.0, 'dup')", []).unwrap();
        assert!(matches!(
            validate_datasource(&env, &conn, "orders", 10),
            Err(Error::DatasourceModelValidation(_))
        ));
    }
}
