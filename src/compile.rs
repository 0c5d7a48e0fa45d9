//! End-to-end compilation from statements to SQL.
//!
//! ```text
//! Statement → bind grain → search → QueryDatasource → CTEs → optimize → SQL
//! ```
//!
//! # Example
//!
//! ```ignore
//! use grainql::compile::compile_statement;
//! use grainql::config::CompilerConfig;
//! use grainql::model::{SelectStatement, Statement};
//!
//! let select = Statement::Select(SelectStatement::new(&["order_id", "revenue"]));
//! let sql = compile_statement(&mut env, &select, &CompilerConfig::default())?;
//! println!("{}", sql.unwrap_or_default());
//! ```

use std::collections::BTreeSet;

use crate::config::CompilerConfig;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::model::{
    Address, BuildConcept, ConceptLookup, CopyTarget, Datasource, Factory, MergeStatement,
    MultiSelectStatement, OrderBy, PersistStatement, SelectItem, SelectStatement, ShowContent, Statement,
};
use crate::optimizer::optimize_ctes;
use crate::plan::{Cte, Lowering, NamePool};
use crate::processing::{QueryTarget, Searcher};
use crate::sql::{render_query, Dialect, SqlDialect, INVALID_REFERENCE};
use crate::validation;

// ============================================================================
// Result Types
// ============================================================================

/// A select, planned into dependency-ordered CTEs.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedQuery {
    /// Projected concepts in select order, hidden ones included.
    pub output_columns: Vec<BuildConcept>,
    pub ctes: Vec<Cte>,
    /// The CTE the final projection reads from.
    pub base_cte: String,
    pub hidden_columns: BTreeSet<Address>,
    pub limit: Option<u64>,
    pub order_by: Option<OrderBy>,
}

impl ProcessedQuery {
    pub fn base(&self) -> Option<&Cte> {
        self.ctes.iter().find(|c| c.name == self.base_cte)
    }

    /// Output columns that appear in the result set.
    pub fn visible_columns(&self) -> impl Iterator<Item = &BuildConcept> {
        self.output_columns
            .iter()
            .filter(|c| !self.hidden_columns.contains(&c.address))
    }
}

/// A select materialized into a datasource.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedQueryPersist {
    pub query: ProcessedQuery,
    /// Location of the table written to.
    pub output_to: String,
    pub datasource: Datasource,
}

/// A select exported to a file by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedCopy {
    pub query: ProcessedQuery,
    pub target: String,
    pub target_type: CopyTarget,
}

/// What a statement compiles to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessedStatement {
    Query(ProcessedQuery),
    Persist(ProcessedQueryPersist),
    Copy(ProcessedCopy),
    /// SQL passed through untouched.
    RawSql(String),
    /// The SQL a statement would run, returned as text rather than executed.
    Show(Box<ProcessedStatement>),
    /// A listing of environment contents.
    Listing(Vec<String>),
}

// ============================================================================
// Planning
// ============================================================================

/// Plan one select against `env`.
pub fn process_query(
    env: &Environment,
    select: &SelectStatement,
    config: &CompilerConfig,
) -> Result<ProcessedQuery> {
    select.validate(env)?;
    let grain = select.grain(env)?;
    log::debug!("select grain: {}", grain);
    let build = Factory::new(env, grain)
        .with_local_concepts(&select.local_concepts)
        .build_environment()?;

    let target = QueryTarget::from_statement(select);
    let mut searcher = Searcher::new(env, &build, config.search);
    let node = searcher.get_query_node(&target)?;
    let root = node.resolve(&build)?;

    let mut pool = NamePool::new(config.human_identifiers);
    let ctes = Lowering::new(&mut pool, config.validate_missing).datasource_to_ctes(&root)?;
    let before = ctes.len();
    let mut ctes = optimize_ctes(ctes, &config.optimizations)?;
    log::info!("planned {} CTEs ({} before optimization)", ctes.len(), before);

    let base = ctes
        .last_mut()
        .ok_or_else(|| Error::UnresolvableQuery {
            targets: target.outputs.clone(),
        })?;
    // Hidden outputs are still selected by the base CTE so the final
    // projection can order by them.
    base.hidden_concepts.retain(|a| !target.hidden.contains(a));
    let base_cte = base.name.clone();

    Ok(ProcessedQuery {
        output_columns: build.concepts_for(&target.outputs)?,
        ctes,
        base_cte,
        hidden_columns: target.hidden,
        limit: select.limit,
        order_by: select.order_by.clone(),
    })
}

/// Plan a persist and register its datasource with `env`.
///
/// The select is planned before registration, so it never reads from the
/// table it writes. [`compile_statement`] stages the registration until the
/// SQL has rendered.
pub fn process_persist(
    env: &mut Environment,
    persist: &PersistStatement,
    config: &CompilerConfig,
) -> Result<ProcessedQueryPersist> {
    let query = process_query(env, &persist.select, config)?;
    for local in &persist.select.local_concepts {
        if env.lookup(&local.address).is_none() {
            env.add_concept(local.clone())?;
        }
    }
    let datasource = persist.datasource.clone();
    env.add_datasource(datasource.clone())?;
    log::info!(
        "persist registers datasource {} at {}",
        datasource.identifier(),
        datasource.address.location
    );
    Ok(ProcessedQueryPersist {
        query,
        output_to: datasource.address.location.clone(),
        datasource,
    })
}

/// Register a multiselect's outputs, then plan a select over them.
pub fn process_multiselect(
    env: &mut Environment,
    multi: &MultiSelectStatement,
    config: &CompilerConfig,
) -> Result<ProcessedQuery> {
    let created = env.add_multiselect(multi)?;
    let select = SelectStatement {
        selection: created
            .into_iter()
            .map(|concept| SelectItem {
                concept,
                modifiers: BTreeSet::new(),
            })
            .collect(),
        local_concepts: Vec::new(),
        where_clause: multi.where_clause.clone(),
        having_clause: None,
        order_by: multi.order_by.clone(),
        limit: multi.limit,
    };
    process_query(env, &select, config)
}

fn process_merge(env: &mut Environment, merge: &MergeStatement) -> Result<()> {
    if let Some((source, target)) = &merge.wildcard {
        let merged = env.merge_namespace(source, target, &merge.modifiers)?;
        log::debug!("merged {} concepts from {} into {}", merged, source, target);
    }
    for (source, target) in merge.sources.iter().zip(&merge.targets) {
        env.merge_concept(source, target, &merge.modifiers)?;
    }
    Ok(())
}

/// Apply a statement to `env` and plan whatever SQL it produces.
///
/// Declarations mutate the environment and yield `None`.
pub fn process_statement(
    env: &mut Environment,
    statement: &Statement,
    config: &CompilerConfig,
) -> Result<Option<ProcessedStatement>> {
    let processed = match statement {
        Statement::Select(select) => ProcessedStatement::Query(process_query(env, select, config)?),
        Statement::Persist(persist) => {
            ProcessedStatement::Persist(process_persist(env, persist, config)?)
        }
        Statement::MultiSelect(multi) => {
            ProcessedStatement::Query(process_multiselect(env, multi, config)?)
        }
        Statement::Copy(copy) => ProcessedStatement::Copy(ProcessedCopy {
            query: process_query(env, &copy.select, config)?,
            target: copy.target.clone(),
            target_type: copy.target_type,
        }),
        Statement::Chart(chart) => {
            ProcessedStatement::Query(process_query(env, &chart.select, config)?)
        }
        Statement::Show(show) => match &show.content {
            ShowContent::Select(select) => ProcessedStatement::Show(Box::new(
                ProcessedStatement::Query(process_query(env, select, config)?),
            )),
            ShowContent::Persist(persist) => {
                // Showing a persist must not register its datasource.
                let mut scratch = env.duplicate();
                ProcessedStatement::Show(Box::new(ProcessedStatement::Persist(process_persist(
                    &mut scratch,
                    persist,
                    config,
                )?)))
            }
            ShowContent::Concepts => ProcessedStatement::Listing(env.concepts.keys().cloned().collect()),
            ShowContent::Datasources => {
                ProcessedStatement::Listing(env.datasources.keys().cloned().collect())
            }
        },
        Statement::RawSql(raw) => ProcessedStatement::RawSql(raw.text.clone()),
        Statement::ConceptDeclaration(decl) => {
            env.add_concept(decl.concept.clone())?;
            return Ok(None);
        }
        Statement::Datasource(ds) => {
            env.add_datasource(ds.datasource.clone())?;
            return Ok(None);
        }
        Statement::Import(import) => {
            env.add_import(&import.alias, &import.environment, import.path.as_deref())?;
            return Ok(None);
        }
        Statement::Merge(merge) => {
            process_merge(env, merge)?;
            return Ok(None);
        }
        Statement::RowsetDerivation(rowset) => {
            env.add_rowset(&rowset.name, &rowset.select)?;
            return Ok(None);
        }
        Statement::Validate(validate) => {
            validation::validate_environment(env, &validate.scope)?;
            return Ok(None);
        }
    };
    Ok(Some(processed))
}

// ============================================================================
// SQL
// ============================================================================

/// Render a planned statement to SQL text without a trailing semicolon.
///
/// In strict mode SQL carrying an unresolved reference is an error.
pub fn render_statement(processed: &ProcessedStatement, config: &CompilerConfig) -> Result<String> {
    let sql = match processed {
        ProcessedStatement::Query(query) => render_sql(query, config)?,
        ProcessedStatement::Copy(copy) => render_sql(&copy.query, config)?,
        ProcessedStatement::Persist(persist) => {
            let Some(prefix) = config.dialect.emit_create_table_as(&persist.output_to) else {
                return Err(Error::syntax(format!(
                    "{} cannot persist to {}",
                    config.dialect, persist.output_to
                )));
            };
            format!("{}\n{}", prefix, render_sql(&persist.query, config)?)
        }
        ProcessedStatement::RawSql(text) => text.clone(),
        ProcessedStatement::Show(inner) => render_statement(inner, config)?,
        ProcessedStatement::Listing(items) => items.join("\n"),
    };
    Ok(sql)
}

fn render_sql(query: &ProcessedQuery, config: &CompilerConfig) -> Result<String> {
    let sql = render_query(query, config)?.to_sql(config.dialect);
    check_references(sql, config)
}

fn check_references(sql: String, config: &CompilerConfig) -> Result<String> {
    if config.strict_mode && sql.contains(INVALID_REFERENCE) {
        return Err(Error::InvalidReference { sql });
    }
    Ok(sql)
}

/// Apply a statement to `env` and render the SQL it produces, if any.
///
/// Statements that both register model objects and render SQL (persist and
/// multiselect) only change `env` once rendering succeeds.
pub fn compile_statement(
    env: &mut Environment,
    statement: &Statement,
    config: &CompilerConfig,
) -> Result<Option<String>> {
    if matches!(statement, Statement::Persist(_) | Statement::MultiSelect(_)) {
        let mut staged = env.clone();
        let sql = process_and_render(&mut staged, statement, config)?;
        *env = staged;
        return Ok(sql);
    }
    process_and_render(env, statement, config)
}

fn process_and_render(
    env: &mut Environment,
    statement: &Statement,
    config: &CompilerConfig,
) -> Result<Option<String>> {
    process_statement(env, statement, config)?
        .map(|p| render_statement(&p, config))
        .transpose()
}

/// Compile statements in order, each seeing the declarations before it.
pub fn compile_statements(
    env: &mut Environment,
    statements: &[Statement],
    config: &CompilerConfig,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for (idx, statement) in statements.iter().enumerate() {
        log::debug!("compiling statement {}", idx);
        if let Some(sql) = compile_statement(env, statement, config)? {
            out.push(sql);
        }
    }
    Ok(out)
}

/// Compile one select for `dialect` with otherwise default settings.
pub fn compile_select(env: &Environment, select: &SelectStatement, dialect: Dialect) -> Result<String> {
    let config = CompilerConfig::default().with_dialect(dialect);
    render_sql(&process_query(env, select, &config)?, &config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        concept, lit, Concept, DataType, DatasourceAddress, Function, FunctionType,
        RawSqlStatement, ShowStatement,
    };

    fn environment() -> Environment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("amount", DataType::Float, &["order_id"]))
            .unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("order_id", "order_id")
                .column("amount", "amount")
                .with_grain(&["order_id"]),
        )
        .unwrap();
        env
    }

    fn config() -> CompilerConfig {
        CompilerConfig::default().with_strict_mode(true)
    }

    #[test]
    fn test_select_reads_one_table() {
        let env = environment();
        let query = process_query(&env, &SelectStatement::new(&["order_id", "amount"]), &config()).unwrap();
        assert_eq!(query.base().map(|c| c.name.as_str()), Some(query.base_cte.as_str()));
        let sql = render_sql(&query, &config()).unwrap();
        assert!(sql.contains("FROM orders AS \"orders\""), "{}", sql);
        assert!(!sql.contains("GROUP BY"), "{}", sql);
    }

    #[test]
    fn test_hidden_order_column_is_not_projected() {
        let env = environment();
        let select = SelectStatement::new(&["order_id", "amount"])
            .hidden("amount")
            .order_by(vec![crate::model::OrderItem::desc("amount")])
            .limit(2);
        let query = process_query(&env, &select, &config()).unwrap();
        assert!(query.hidden_columns.contains("local.amount"));
        assert_eq!(query.visible_columns().count(), 1);
        let sql = render_sql(&query, &config()).unwrap();
        let tail = &sql[sql.rfind("SELECT").unwrap_or(0)..];
        assert!(!tail.contains("AS \"amount\""), "{}", sql);
        assert!(tail.contains("DESC"), "{}", sql);
        assert!(tail.ends_with("LIMIT 2"), "{}", sql);
    }

    #[test]
    fn test_strict_mode_rejects_invalid_reference() {
        let sql = format!("SELECT {}<local.x>", INVALID_REFERENCE);
        let err = check_references(sql.clone(), &config()).unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));
        let lenient = config().with_strict_mode(false);
        assert_eq!(check_references(sql.clone(), &lenient).unwrap(), sql);
    }

    #[test]
    fn test_persist_registers_datasource() {
        let mut env = environment();
        let revenue = Concept::metric(
            "revenue",
            Function::new(FunctionType::Sum, vec![concept("amount")]),
            &[],
            &env,
        )
        .unwrap();
        env.add_concept(revenue).unwrap();
        let persist = PersistStatement {
            datasource: Datasource::new("revenue_total", DatasourceAddress::table("revenue_total"))
                .column("revenue", "revenue"),
            select: SelectStatement::new(&["revenue"]),
        };
        let stmt = Statement::Persist(persist);
        let sql = compile_statement(&mut env, &stmt, &config()).unwrap().unwrap();
        assert!(sql.starts_with("CREATE OR REPLACE TABLE revenue_total AS\nWITH"), "{}", sql);
        assert!(env.datasources.contains_key("revenue_total"));
        assert!(env.is_materialized("local.revenue"));
    }

    #[test]
    fn test_show_persist_leaves_environment_alone() {
        let mut env = environment();
        let show = Statement::Show(ShowStatement {
            content: ShowContent::Persist(Box::new(PersistStatement {
                datasource: Datasource::new("copy", DatasourceAddress::table("order_copy"))
                    .column("order_id", "order_id"),
                select: SelectStatement::new(&["order_id"]),
            })),
        });
        let sql = compile_statement(&mut env, &show, &config()).unwrap().unwrap();
        assert!(sql.starts_with("CREATE OR REPLACE TABLE order_copy AS"), "{}", sql);
        assert!(!env.datasources.contains_key("copy"));
    }

    #[test]
    fn test_declarations_produce_no_sql() {
        let mut env = Environment::new();
        let statements = vec![
            Statement::ConceptDeclaration(crate::model::ConceptDeclarationStatement {
                concept: Concept::key("order_id", DataType::Integer),
            }),
            Statement::Datasource(crate::model::DatasourceStatement {
                datasource: Datasource::new("orders", DatasourceAddress::table("orders"))
                    .column("order_id", "order_id"),
            }),
            Statement::RawSql(RawSqlStatement {
                text: "SELECT 1".into(),
            }),
            Statement::Select(
                SelectStatement::new(&["order_id"])
                    .with_where(concept("order_id").gt(lit(1))),
            ),
        ];
        let sql = compile_statements(&mut env, &statements, &config()).unwrap();
        assert_eq!(sql.len(), 2);
        assert_eq!(sql[0], "SELECT 1");
        assert!(sql[1].contains("WHERE"), "{}", sql[1]);
    }

    #[test]
    fn test_tsql_cannot_persist() {
        let mut env = environment();
        let persist = Statement::Persist(PersistStatement {
            datasource: Datasource::new("copy", DatasourceAddress::table("order_copy"))
                .column("order_id", "order_id"),
            select: SelectStatement::new(&["order_id"]),
        });
        let tsql = config().with_dialect(Dialect::TSql);
        assert!(matches!(
            compile_statement(&mut env, &persist, &tsql),
            Err(Error::InvalidSyntax(_))
        ));
    }
}
