//! Lowers planned CTEs into a [`Query`].
//!
//! Every planned CTE becomes one `WITH` entry, or two for a recursive edge
//! walk. A concept is read as a column when the CTE's source map names a
//! parent for it, and computed from its lineage otherwise. A concept that
//! resolves to neither renders as an [`INVALID_REFERENCE`] marker so the SQL
//! stays inspectable; strict compilation rejects SQL that carries one.

use std::collections::BTreeSet;

use super::dialect::{Dialect, SqlDialect};
use super::expr::{
    avg, case_when, coalesce, count, count_distinct, func, lit_bool, lit_float, lit_int, lit_null,
    lit_str, max, min, raw_sql, star, sum, table_col, BinaryOperator, Expr, ExprExt, NullsOrder,
    SortDir, WindowExt, WindowOrderBy,
};
use super::query::{Cte as SqlCte, JoinType, OrderByExpr, Query, SelectExpr, TableRef};
use super::token::{Keyword, TokenStream};
use crate::compile::ProcessedQuery;
use crate::config::CompilerConfig;
use crate::error::{Error, Result};
use crate::model::concept::{address_with_namespace, safe_address};
use crate::model::{
    self, Address, BooleanOperator, BuildConcept, ComparisonOperator, Function, FunctionType,
    Lineage, MultiSelectLineage, Ordering, WindowItem, WindowType,
};
use crate::plan::{cte_lookup, BaseTable, ColumnRef, Cte, CteJoin, CteKind, CteLookup, InstantiatedUnnestJoin, Join};

/// Marker written in place of a column that could not be resolved.
pub const INVALID_REFERENCE: &str = "INVALID_REFERENCE_BUG";

const MAX_RENDER_DEPTH: usize = 64;

/// Render every CTE of `query`, then the final projection from its base.
pub fn render_query(query: &ProcessedQuery, config: &CompilerConfig) -> Result<Query> {
    let lookup = cte_lookup(&query.ctes);
    // CTEs with nothing to select are only anchors for constant rows.
    let skipped: BTreeSet<&str> = query
        .ctes
        .iter()
        .filter(|c| c.visible_outputs().is_empty())
        .map(|c| c.name.as_str())
        .collect();

    let mut out = Query::new();
    for cte in &query.ctes {
        if skipped.contains(cte.name.as_str()) {
            log::trace!("skipping CTE {} with no columns", cte.name);
            continue;
        }
        let renderer = CteRenderer {
            cte,
            lookup: &lookup,
            config,
            skipped: &skipped,
        };
        for rendered in renderer.render()? {
            out = out.with_cte(rendered);
        }
    }

    let Some(base) = lookup.get(query.base_cte.as_str()) else {
        return Err(Error::syntax(format!(
            "base CTE {} is not part of the query",
            query.base_cte
        )));
    };
    let select: Vec<SelectExpr> = query
        .output_columns
        .iter()
        .filter(|c| !query.hidden_columns.contains(&c.address))
        .map(|c| table_col(&base.name, &c.safe_address()).alias(&c.safe_address()))
        .collect();
    out = out.select(select).from(TableRef::named(&base.name));
    if let Some(order_by) = &query.order_by {
        let items = order_by
            .items
            .iter()
            .map(|i| order_expr(table_col(&base.name, &safe_address(&i.concept)), i.order))
            .collect();
        out = out.order_by(items);
    }
    if let Some(limit) = query.limit {
        out = out.limit(limit);
    }
    Ok(out)
}

fn sort_spec(order: Ordering) -> (SortDir, Option<NullsOrder>) {
    match order {
        Ordering::Asc => (SortDir::Asc, None),
        Ordering::Desc => (SortDir::Desc, None),
        Ordering::AscNullsFirst => (SortDir::Asc, Some(NullsOrder::First)),
        Ordering::AscNullsLast => (SortDir::Asc, Some(NullsOrder::Last)),
        Ordering::DescNullsFirst => (SortDir::Desc, Some(NullsOrder::First)),
        Ordering::DescNullsLast => (SortDir::Desc, Some(NullsOrder::Last)),
    }
}

fn order_expr(expr: Expr, order: Ordering) -> OrderByExpr {
    let (dir, nulls) = sort_spec(order);
    let item = match dir {
        SortDir::Asc => OrderByExpr::asc(expr),
        SortDir::Desc => OrderByExpr::desc(expr),
    };
    item.nulls(nulls)
}

fn window_order(expr: Expr, order: Ordering) -> WindowOrderBy {
    let (dir, nulls) = sort_spec(order);
    let item = match dir {
        SortDir::Asc => WindowOrderBy::asc(expr),
        SortDir::Desc => WindowOrderBy::desc(expr),
    };
    item.nulls(nulls)
}

/// A marker that fails to parse, naming the concept and the CTE it was
/// rendered in.
fn invalid_reference(address: &str, site: &str) -> Expr {
    log::warn!("no source for {} in {}; writing an invalid reference", address, site);
    raw_sql(&format!("{}<{}@{}>", INVALID_REFERENCE, address, site))
}

fn column_expr(column: ColumnRef) -> Expr {
    match column {
        ColumnRef::Column { source, column } => table_col(&source, &column),
        ColumnRef::Raw(sql) => raw_sql(&sql),
    }
}

fn literal(value: &model::Literal) -> Expr {
    match value {
        model::Literal::Null => lit_null(),
        model::Literal::Bool(b) => lit_bool(*b),
        model::Literal::Int(n) => lit_int(*n),
        model::Literal::Float(f) => lit_float(*f),
        model::Literal::String(s) => lit_str(s),
    }
}

fn table_ref(base: &BaseTable) -> TableRef {
    match base {
        BaseTable::Table {
            location,
            alias,
            quoted,
        } => TableRef::location(location, *quoted).with_alias(alias),
        BaseTable::Subquery { sql, alias } => TableRef::derived(sql).with_alias(alias),
        BaseTable::Cte(name) => TableRef::named(name).with_alias(name),
    }
}

fn join_type(join_type: model::JoinType) -> JoinType {
    match join_type {
        model::JoinType::Inner => JoinType::Inner,
        model::JoinType::LeftOuter => JoinType::Left,
        model::JoinType::RightOuter => JoinType::Right,
        model::JoinType::Full => JoinType::Full,
        model::JoinType::Cross => JoinType::Cross,
    }
}

/// `(l = r OR (l IS NULL AND r IS NULL))`
fn null_safe_eq(left: Expr, right: Expr) -> Expr {
    let both_null = left.clone().is_null().and(right.clone().is_null()).nested();
    Expr::Paren(Box::new(left.eq(right).or(both_null)))
}

fn fold_binary(args: Vec<Expr>, op: BinaryOperator) -> Result<Expr> {
    let mut iter = args.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| Error::syntax(format!("{:?} needs at least one argument", op)))?;
    Ok(iter.fold(first.nested(), |acc, next| acc.binary(op, next.nested())))
}

fn first_arg(args: Vec<Expr>, operator: FunctionType) -> Result<Expr> {
    args.into_iter()
        .next()
        .ok_or_else(|| Error::syntax(format!("{:?} needs an argument", operator)))
}

struct CteRenderer<'a> {
    cte: &'a Cte,
    lookup: &'a CteLookup<'a>,
    config: &'a CompilerConfig,
    skipped: &'a BTreeSet<&'a str>,
}

impl<'a> CteRenderer<'a> {
    fn dialect(&self) -> Dialect {
        self.config.dialect
    }

    fn member(&self, cte: &'a Cte) -> CteRenderer<'a> {
        CteRenderer {
            cte,
            lookup: self.lookup,
            config: self.config,
            skipped: self.skipped,
        }
    }

    fn render(&self) -> Result<Vec<SqlCte>> {
        let comment = self.config.show_comments.then(|| self.cte.comment());
        let columns = self.cte.visible_outputs();
        match &self.cte.kind {
            CteKind::Standard => {
                let body = self.body(&columns)?;
                Ok(vec![SqlCte::new(&self.cte.name, body).with_comment(comment)])
            }
            CteKind::Union { internal } => {
                let members = internal
                    .iter()
                    .map(|m| self.member(m).body(&columns))
                    .collect::<Result<Vec<_>>>()?;
                Ok(vec![SqlCte::union_all(&self.cte.name, members).with_comment(comment)])
            }
            CteKind::Recursive => self.recursive(comment),
        }
    }

    // =========================================================================
    // Query shape
    // =========================================================================

    fn body(&self, columns: &[&BuildConcept]) -> Result<Query> {
        let cte = self.cte;
        let mut select = Vec::with_capacity(columns.len());
        for c in columns {
            select.push(self.render_concept(c, 0)?.alias(&c.safe_address()));
        }
        let mut query = self.from_clause(Query::new().select(select))?;

        let (wheres, havings) = self.split_condition()?;
        for part in wheres {
            query = query.filter(part);
        }
        if cte.group_to_grain {
            let resolve = |a: &str| cte.get_concept(a, self.lookup);
            let groups = cte
                .group_concepts(&resolve)
                .iter()
                .map(|g| self.render_concept(g, 0))
                .collect::<Result<Vec<_>>>()?;
            if !groups.is_empty() {
                query = query.group_by(groups);
            }
        }
        if let Some(having) = havings
            .into_iter()
            .reduce(|a, b| a.nested().and(b.nested()))
        {
            query = query.having(having);
        }
        if let Some(order_by) = &cte.order_by {
            let mut items = Vec::with_capacity(order_by.items.len());
            for item in &order_by.items {
                items.push(order_expr(self.render_address(&item.concept, 0)?, item.order));
            }
            query = query.order_by(items);
        }
        if let Some(limit) = cte.limit {
            query = query.limit(limit);
        }
        Ok(query)
    }

    fn from_clause(&self, mut query: Query) -> Result<Query> {
        let cte = self.cte;
        let base = cte.base();
        let anchored = match &base {
            BaseTable::Cte(name) => *name != cte.name && !self.skipped.contains(name.as_str()),
            _ => true,
        };
        let mut unnests = cte.joins.iter().filter_map(|j| match j {
            Join::Unnest(u) => Some(u),
            Join::Cte(_) => None,
        });
        if cte.render_from_clause() && anchored {
            query = query.from(table_ref(&base));
            query = self.cte_joins(query, base.alias())?;
        } else if let Some(first) = unnests.next() {
            query = query.from(TableRef::raw(self.unnest_source(first)?));
        }
        for unnest in unnests {
            let mut ts = TokenStream::new();
            ts.kw(Keyword::Cross)
                .space()
                .kw(Keyword::Join)
                .space()
                .append(&self.unnest_source(unnest)?);
            query = query.raw_join(ts);
        }
        Ok(query)
    }

    fn cte_joins(&self, mut query: Query, base_alias: &str) -> Result<Query> {
        let cte = self.cte;
        let mut joined: BTreeSet<String> = BTreeSet::from([base_alias.to_string()]);
        for join in &cte.joins {
            let Join::Cte(j) = join else {
                continue;
            };
            let right = j.right_table();
            let right_alias = right.alias().to_string();
            let on = self.join_condition(j, &right_alias)?;
            let kind = match &on {
                Some(_) => join_type(j.join_type),
                None => JoinType::Cross,
            };
            query = query.join(kind, table_ref(&right), on);
            joined.insert(right_alias);
        }
        // Parents the source map reads that no join brings in, such as
        // single-row constants.
        let referenced: BTreeSet<&str> = cte
            .source_map
            .values()
            .flatten()
            .map(String::as_str)
            .collect();
        for parent in &cte.parent_ctes {
            if referenced.contains(parent.as_str())
                && !joined.contains(parent)
                && !self.skipped.contains(parent.as_str())
            {
                query = query.join(JoinType::Cross, TableRef::named(parent), None);
                joined.insert(parent.clone());
            }
        }
        Ok(query)
    }

    fn join_condition(&self, join: &CteJoin, right_alias: &str) -> Result<Option<Expr>> {
        let outer = !matches!(join.join_type, model::JoinType::Inner | model::JoinType::Cross);
        let mut parts = Vec::with_capacity(join.joinkey_pairs.len());
        for pair in &join.joinkey_pairs {
            let left = self.read_from(&pair.left, &join.alias_for(&pair.cte));
            let right = self.read_from(&pair.right, right_alias);
            let null_safe = self.config.null_safe_joins
                && outer
                && (self.is_nullable(&pair.left) || self.is_nullable(&pair.right));
            parts.push(if null_safe {
                null_safe_eq(left, right)
            } else {
                left.eq(right)
            });
        }
        Ok(parts.into_iter().reduce(|a, b| a.and(b)))
    }

    fn split_condition(&self) -> Result<(Vec<Expr>, Vec<Expr>)> {
        let mut wheres = Vec::new();
        let mut havings = Vec::new();
        let Some(condition) = &self.cte.condition else {
            return Ok((wheres, havings));
        };
        for part in condition.decompose() {
            let rendered = self.render_expr(&part, 0)?;
            if self.cte.group_to_grain && self.reads_local_aggregate(&part) {
                havings.push(rendered);
            } else {
                wheres.push(rendered);
            }
        }
        Ok((wheres, havings))
    }

    /// An aggregate computed in this CTE, so only visible after grouping.
    fn reads_local_aggregate(&self, expr: &model::Expr) -> bool {
        expr.row_arguments().iter().any(|a| {
            let local = !self.cte.source_map.get(a).is_some_and(|s| !s.is_empty());
            local
                && self.concept(a).is_some_and(|c| {
                    c.is_aggregate || c.lineage.as_ref().is_some_and(Lineage::is_aggregate)
                })
        })
    }

    // =========================================================================
    // Recursive walk
    // =========================================================================

    /// The walk CTE climbs each edge until the parent is null. The main CTE
    /// keeps the rows whose last step has no further parent.
    fn recursive(&self, comment: Option<String>) -> Result<Vec<SqlCte>> {
        let cte = self.cte;
        let Some(root) = cte
            .output_columns
            .iter()
            .find(|c| c.function().is_some_and(|f| f.operator == FunctionType::RecurseEdge))
        else {
            return Err(Error::syntax(format!("recursive CTE {} has no edge walk", cte.name)));
        };
        let edge = root.function().map(Function::concept_arguments).unwrap_or_default();
        let [parent, child] = edge.as_slice() else {
            return Err(Error::syntax(format!(
                "recurse_edge for {} takes a parent and a child",
                root.address
            )));
        };
        let base = cte.base();
        let edges = table_ref(&base);
        let p = self.read_from(parent, base.alias());
        let c = self.read_from(child, base.alias());
        let p_col = safe_address(parent);
        let c_col = safe_address(child);
        let r_col = root.safe_address();
        let walk = format!("{}_walk", cte.name);

        let seed = Query::new()
            .select(vec![
                c.clone().alias(&c_col),
                p.clone().alias(&p_col),
                coalesce(vec![p.clone(), c.clone()]).alias(&r_col),
            ])
            .from(edges.clone());
        let step = Query::new()
            .select(vec![
                table_col("w", &c_col).alias(&c_col),
                table_col("w", &p_col).alias(&p_col),
                p.clone().alias(&r_col),
            ])
            .from(TableRef::named(&walk).with_alias("w"))
            .join(
                JoinType::Inner,
                edges.clone(),
                Some(c.clone().eq(table_col("w", &r_col))),
            )
            .filter(p.clone().is_not_null());
        let linked = Query::new()
            .select(vec![c.clone()])
            .from(edges)
            .filter(p.is_not_null().and(c.is_not_null()));

        let columns: Vec<SelectExpr> = cte
            .visible_outputs()
            .into_iter()
            .map(|o| {
                let column = if o.address == root.address {
                    Some(&r_col)
                } else if o.matches(child) {
                    Some(&c_col)
                } else if o.matches(parent) {
                    Some(&p_col)
                } else {
                    None
                };
                match column {
                    Some(column) => table_col(&walk, column).alias(&o.safe_address()),
                    None => invalid_reference(&o.address, &self.cte.name).alias(&o.safe_address()),
                }
            })
            .collect();
        let body = Query::new()
            .select(columns)
            .from(TableRef::named(&walk))
            .filter(table_col(&walk, &r_col).in_subquery(linked, true));
        Ok(vec![
            SqlCte::union_all(&walk, vec![seed, step])
                .with_columns(vec![c_col.clone(), p_col.clone(), r_col.clone()])
                .recursive()
                .with_comment(comment),
            SqlCte::new(&cte.name, body),
        ])
    }

    // =========================================================================
    // Concepts
    // =========================================================================

    fn concept(&self, address: &str) -> Option<BuildConcept> {
        self.cte.get_concept(address, self.lookup)
    }

    fn is_nullable(&self, address: &str) -> bool {
        self.cte.nullable_concepts.contains(address)
            || self.concept(address).is_some_and(|c| c.is_nullable())
    }

    fn sources_of(&self, c: &BuildConcept) -> Option<&'a Vec<String>> {
        let cte: &'a Cte = self.cte;
        cte.source_map
            .get(&c.address)
            .or_else(|| c.pseudonyms.iter().find_map(|p| cte.source_map.get(p)))
    }

    /// `address` as read from one source alias.
    fn read_from(&self, address: &str, source: &str) -> Expr {
        let Some(c) = self.concept(address) else {
            return invalid_reference(address, &self.cte.name);
        };
        self.alias_in(&c, source)
            .map(column_expr)
            .unwrap_or_else(|| invalid_reference(address, &self.cte.name))
    }

    fn alias_in(&self, c: &BuildConcept, source: &str) -> Option<ColumnRef> {
        self.cte.get_alias(c, Some(source), self.lookup).or_else(|| {
            c.pseudonyms.iter().find_map(|p| {
                let other = self.concept(p)?;
                self.cte.get_alias(&other, Some(source), self.lookup)
            })
        })
    }

    fn render_address(&self, address: &str, depth: usize) -> Result<Expr> {
        match self.concept(address) {
            Some(c) => self.render_concept(&c, depth + 1),
            None => Ok(invalid_reference(address, &self.cte.name)),
        }
    }

    fn render_concept(&self, c: &BuildConcept, depth: usize) -> Result<Expr> {
        if depth > MAX_RENDER_DEPTH {
            return Err(Error::syntax(format!(
                "lineage of {} is nested too deeply to render",
                c.address
            )));
        }
        match self.sources_of(c) {
            Some(sources) if !sources.is_empty() => Ok(self.render_sourced(c, sources)),
            _ => match &c.lineage {
                Some(lineage) => self.render_lineage(c, lineage, depth),
                None => Ok(self
                    .cte
                    .get_alias(c, None, self.lookup)
                    .map(column_expr)
                    .unwrap_or_else(|| invalid_reference(&c.address, &self.cte.name))),
            },
        }
    }

    /// Read from every source, coalescing when an outer join may leave one
    /// side null.
    fn render_sourced(&self, c: &BuildConcept, sources: &[String]) -> Expr {
        let mut refs: Vec<ColumnRef> = Vec::new();
        for source in sources {
            if let Some(r) = self.alias_in(c, source) {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }
        match refs.len() {
            0 => self
                .cte
                .get_alias(c, None, self.lookup)
                .map(column_expr)
                .unwrap_or_else(|| invalid_reference(&c.address, &self.cte.name)),
            1 => column_expr(refs.remove(0)),
            _ => coalesce(refs.into_iter().map(column_expr).collect()),
        }
    }

    fn render_lineage(&self, c: &BuildConcept, lineage: &Lineage, depth: usize) -> Result<Expr> {
        match lineage {
            Lineage::Function(f) => self.render_function(Some(c), f, depth),
            Lineage::Aggregate(a) => self.render_function(Some(c), &a.function, depth),
            Lineage::Window(w) => self.render_window(w, depth),
            Lineage::Filter(f) => {
                let content = self.render_address(&f.content, depth)?;
                let condition = self.render_expr(&f.where_clause.conditional, depth)?;
                Ok(case_when(condition, content, None))
            }
            Lineage::Rowset(r) => self.render_address(&r.content, depth),
            Lineage::MultiSelect(m) => self.render_multiselect(c, m, depth),
        }
    }

    fn render_window(&self, w: &WindowItem, depth: usize) -> Result<Expr> {
        let function = match w.window_type {
            WindowType::RowNumber => func("ROW_NUMBER", vec![]),
            WindowType::Rank => func("RANK", vec![]),
            WindowType::DenseRank => func("DENSE_RANK", vec![]),
            WindowType::Lag | WindowType::Lead => {
                let mut args = vec![self.render_address(&w.content, depth)?];
                if let Some(index) = w.index {
                    args.push(lit_int(index));
                }
                let name = if w.window_type == WindowType::Lag { "LAG" } else { "LEAD" };
                func(name, args)
            }
            WindowType::Sum => sum(self.render_address(&w.content, depth)?),
            WindowType::Count => count(self.render_address(&w.content, depth)?),
            WindowType::Avg => avg(self.render_address(&w.content, depth)?),
            WindowType::Max => max(self.render_address(&w.content, depth)?),
            WindowType::Min => min(self.render_address(&w.content, depth)?),
        };
        let partition = w
            .over
            .iter()
            .map(|a| self.render_address(a, depth))
            .collect::<Result<Vec<_>>>()?;
        let mut order = Vec::with_capacity(w.order_by.len());
        for item in &w.order_by {
            order.push(window_order(self.render_address(&item.concept, depth)?, item.order));
        }
        Ok(function.over().partition_by(partition).order_by(order).build())
    }

    fn render_multiselect(
        &self,
        c: &BuildConcept,
        lineage: &MultiSelectLineage,
        depth: usize,
    ) -> Result<Expr> {
        let candidates: Vec<Address> = match lineage
            .align
            .iter()
            .find(|a| lineage.align_address(a) == c.address)
        {
            Some(item) => item.concepts.clone(),
            None => lineage
                .selects
                .iter()
                .flat_map(|s| s.selection.iter())
                .filter(|s| address_with_namespace(s, &lineage.namespace) == c.address)
                .cloned()
                .collect(),
        };
        self.first_sourced(&candidates, depth, &c.address)
    }

    /// The first candidate this CTE reads from a parent.
    fn first_sourced(&self, candidates: &[Address], depth: usize, owner: &str) -> Result<Expr> {
        for a in candidates {
            if self.cte.source_map.get(a).is_some_and(|s| !s.is_empty()) {
                return self.render_address(a, depth);
            }
        }
        Ok(invalid_reference(owner, &self.cte.name))
    }

    fn render_function(
        &self,
        owner: Option<&BuildConcept>,
        f: &Function,
        depth: usize,
    ) -> Result<Expr> {
        let op = f.operator;
        match op {
            FunctionType::Case => return self.render_case(f, depth),
            FunctionType::Cast => {
                let Some(input) = f.arguments.first() else {
                    return Err(Error::syntax("cast needs an argument"));
                };
                let datatype = match f.arguments.get(1) {
                    Some(model::Expr::Type(dt)) => dt.clone(),
                    _ => f.output_datatype.clone(),
                };
                return Ok(Expr::Cast {
                    expr: Box::new(self.render_expr(input, depth)?),
                    datatype,
                });
            }
            FunctionType::Union => {
                let candidates: Vec<Address> = f.concept_arguments();
                let name = owner.map(|c| c.address.as_str()).unwrap_or("union");
                return self.first_sourced(&candidates, depth, name);
            }
            FunctionType::Unnest => {
                return match owner {
                    Some(c) => Ok(self.unnest_value(c)),
                    None => Ok(invalid_reference("unnest", &self.cte.name)),
                };
            }
            FunctionType::RecurseEdge => {
                let name = owner.map(|c| c.address.as_str()).unwrap_or("recurse_edge");
                return Ok(invalid_reference(name, &self.cte.name));
            }
            _ => {}
        }

        let args = f
            .arguments
            .iter()
            .map(|a| self.render_expr(a, depth))
            .collect::<Result<Vec<_>>>()?;
        if op.is_aggregate() && !self.cte.group_to_grain {
            return self.grain_match(op, args);
        }
        Ok(match op {
            FunctionType::Count => match args.into_iter().next() {
                Some(arg) => count(arg),
                None => count(star()),
            },
            FunctionType::CountDistinct => count_distinct(first_arg(args, op)?),
            FunctionType::Sum => sum(first_arg(args, op)?),
            FunctionType::Avg => avg(first_arg(args, op)?),
            FunctionType::Max => max(first_arg(args, op)?),
            FunctionType::Min => min(first_arg(args, op)?),
            FunctionType::Any => func("ANY_VALUE", args),
            FunctionType::ArrayAgg => func("ARRAY_AGG", args),
            FunctionType::Add => fold_binary(args, BinaryOperator::Plus)?,
            FunctionType::Subtract => fold_binary(args, BinaryOperator::Minus)?,
            FunctionType::Multiply => fold_binary(args, BinaryOperator::Mul)?,
            FunctionType::Divide => fold_binary(args, BinaryOperator::Div)?,
            FunctionType::Mod => fold_binary(args, BinaryOperator::Mod)?,
            FunctionType::Concat => fold_binary(args, BinaryOperator::Concat)?,
            FunctionType::Alias | FunctionType::Constant | FunctionType::Group => {
                first_arg(args, op)?
            }
            FunctionType::Coalesce => coalesce(args),
            FunctionType::Upper => func("UPPER", args),
            FunctionType::Lower => func("LOWER", args),
            FunctionType::Length => func("LENGTH", args),
            FunctionType::Abs => func("ABS", args),
            FunctionType::Round => func("ROUND", args),
            FunctionType::IsNull => first_arg(args, op)?.is_null(),
            FunctionType::Year | FunctionType::Month | FunctionType::Day => {
                let part = match op {
                    FunctionType::Year => "year",
                    FunctionType::Month => "month",
                    _ => "day",
                };
                Expr::DatePart {
                    part: part.into(),
                    expr: Box::new(first_arg(args, op)?),
                }
            }
            FunctionType::CurrentDate => raw_sql("CURRENT_DATE"),
            FunctionType::CurrentDatetime => raw_sql("CURRENT_TIMESTAMP"),
            FunctionType::Case
            | FunctionType::Cast
            | FunctionType::Union
            | FunctionType::Unnest
            | FunctionType::RecurseEdge => unreachable!("handled above"),
        })
    }

    /// The aggregate's value when every row is already its own group.
    fn grain_match(&self, op: FunctionType, args: Vec<Expr>) -> Result<Expr> {
        let arg = match args.into_iter().next() {
            Some(arg) => arg,
            None if op == FunctionType::Count => return Ok(lit_int(1)),
            None => return Err(Error::syntax(format!("{:?} needs an argument", op))),
        };
        Ok(match op {
            FunctionType::Count | FunctionType::CountDistinct => {
                case_when(arg.is_not_null(), lit_int(1), Some(lit_int(0)))
            }
            FunctionType::ArrayAgg => Expr::Array(vec![arg]),
            _ => arg,
        })
    }

    fn render_case(&self, f: &Function, depth: usize) -> Result<Expr> {
        let mut when_clauses = Vec::new();
        let mut else_clause = None;
        for arg in &f.arguments {
            match arg {
                model::Expr::CaseWhen(cw) => when_clauses.push((
                    self.render_expr(&cw.comparison, depth)?,
                    self.render_expr(&cw.expr, depth)?,
                )),
                model::Expr::CaseElse(e) => {
                    else_clause = Some(Box::new(self.render_expr(e, depth)?));
                }
                other => {
                    return Err(Error::syntax(format!(
                        "case arguments must be WHEN or ELSE branches, got {}",
                        other
                    )))
                }
            }
        }
        if when_clauses.is_empty() {
            return Err(Error::syntax("case needs at least one WHEN branch"));
        }
        Ok(Expr::Case {
            operand: None,
            when_clauses,
            else_clause,
        })
    }

    fn unnest_join(&self, c: &BuildConcept) -> Option<&'a InstantiatedUnnestJoin> {
        let cte: &'a Cte = self.cte;
        cte.joins.iter().find_map(|j| match j {
            Join::Unnest(u) if u.concept.address == c.address => Some(u),
            _ => None,
        })
    }

    fn unnest_value(&self, c: &BuildConcept) -> Expr {
        let Some(join) = self.unnest_join(c) else {
            return invalid_reference(&c.address, &self.cte.name);
        };
        let (table, column) = self.dialect().unnest_value(&join.alias, &c.safe_address());
        Expr::Column { table, column }
    }

    fn unnest_source(&self, join: &InstantiatedUnnestJoin) -> Result<TokenStream> {
        let Some(input) = join.concept.function().and_then(|f| f.arguments.first()) else {
            return Err(Error::syntax(format!(
                "unnest of {} has no input",
                join.concept.address
            )));
        };
        let input = self.render_expr(input, 0)?.to_tokens_for_dialect(self.dialect());
        self.dialect()
            .emit_unnest_source(input, &join.alias, &join.concept.safe_address())
            .ok_or_else(|| {
                Error::syntax(format!(
                    "{} cannot unnest {}",
                    self.dialect(),
                    join.concept.address
                ))
            })
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn render_expr(&self, expr: &model::Expr, depth: usize) -> Result<Expr> {
        match expr {
            model::Expr::Concept(address) => self.render_address(address, depth),
            model::Expr::Literal(value) => Ok(literal(value)),
            model::Expr::Function(f) => self.render_function(None, f, depth + 1),
            model::Expr::Comparison(c) => self.render_comparison(c, depth),
            model::Expr::Conditional(c) => {
                let op = match c.operator {
                    BooleanOperator::And => BinaryOperator::And,
                    BooleanOperator::Or => BinaryOperator::Or,
                };
                let left = self.render_branch(&c.left, c.operator, depth)?;
                let right = self.render_branch(&c.right, c.operator, depth)?;
                Ok(left.binary(op, right))
            }
            model::Expr::Parenthetical(inner) => {
                Ok(Expr::Paren(Box::new(self.render_expr(inner, depth)?)))
            }
            model::Expr::CaseWhen(_) | model::Expr::CaseElse(_) => {
                Err(Error::syntax("WHEN and ELSE branches are only valid inside case()"))
            }
            model::Expr::List(items) => Ok(Expr::Array(
                items
                    .iter()
                    .map(|i| self.render_expr(i, depth))
                    .collect::<Result<Vec<_>>>()?,
            )),
            model::Expr::Type(dt) => Ok(raw_sql(&self.dialect().emit_data_type(dt))),
        }
    }

    /// A boolean operand, parenthesized when it mixes AND with OR.
    fn render_branch(&self, expr: &model::Expr, parent: BooleanOperator, depth: usize) -> Result<Expr> {
        let rendered = self.render_expr(expr, depth)?;
        Ok(match expr {
            model::Expr::Conditional(c) if c.operator != parent => Expr::Paren(Box::new(rendered)),
            _ => rendered,
        })
    }

    fn render_comparison(&self, c: &model::Comparison, depth: usize) -> Result<Expr> {
        let left = self.render_expr(&c.left, depth)?;
        let negated = c.operator == ComparisonOperator::NotIn;
        if c.is_subselect() {
            return self.render_existence(left, &c.right, negated, depth);
        }
        Ok(match (c.operator, &c.right) {
            (ComparisonOperator::In | ComparisonOperator::NotIn, model::Expr::List(items)) => {
                Expr::In {
                    expr: Box::new(left),
                    values: items
                        .iter()
                        .map(|i| self.render_expr(i, depth))
                        .collect::<Result<Vec<_>>>()?,
                    negated,
                }
            }
            (ComparisonOperator::In | ComparisonOperator::NotIn, other) => Expr::In {
                expr: Box::new(left),
                values: vec![self.render_expr(other, depth)?],
                negated,
            },
            (ComparisonOperator::Is, model::Expr::Literal(model::Literal::Null)) => left.is_null(),
            (ComparisonOperator::IsNot, model::Expr::Literal(model::Literal::Null)) => {
                left.is_not_null()
            }
            (op, right) => {
                let op = match op {
                    ComparisonOperator::Eq => BinaryOperator::Eq,
                    ComparisonOperator::Ne => BinaryOperator::Ne,
                    ComparisonOperator::Lt => BinaryOperator::Lt,
                    ComparisonOperator::Gt => BinaryOperator::Gt,
                    ComparisonOperator::Lte => BinaryOperator::Lte,
                    ComparisonOperator::Gte => BinaryOperator::Gte,
                    ComparisonOperator::Is => BinaryOperator::Is,
                    ComparisonOperator::IsNot => BinaryOperator::IsNot,
                    ComparisonOperator::Like => BinaryOperator::Like,
                    ComparisonOperator::In | ComparisonOperator::NotIn => {
                        unreachable!("membership handled above")
                    }
                };
                left.binary(op, self.render_expr(right, depth)?)
            }
        })
    }

    /// `x IN (SELECT "cte"."y" FROM "cte")` against the CTE holding `y`.
    fn render_existence(
        &self,
        left: Expr,
        right: &model::Expr,
        negated: bool,
        depth: usize,
    ) -> Result<Expr> {
        let model::Expr::Concept(target) = right else {
            return Err(Error::syntax("membership subselect needs a concept"));
        };
        let Some(source) = self
            .cte
            .existence_source_map
            .get(target)
            .and_then(|s| s.first())
        else {
            return Ok(Expr::In {
                expr: Box::new(left),
                values: vec![self.render_address(target, depth)?],
                negated,
            });
        };
        let column = self
            .concept(target)
            .map(|c| c.safe_address())
            .unwrap_or_else(|| safe_address(target));
        let subquery = Query::new()
            .select(vec![table_col(source, &column)])
            .from(TableRef::named(source));
        Ok(left.in_subquery(subquery, negated))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::model::{concept, lit, Derivation, OrderBy, OrderItem, Purpose};
    use crate::optimizer::test_support::{child_cte, concept as build_concept, select_cte, table};
    use crate::plan::CteConceptPair;
    use crate::sql::test_utils::validate_sql;

    fn processed(ctes: Vec<Cte>, outputs: &[&str]) -> ProcessedQuery {
        let base = ctes.last().map(|c| c.name.clone()).unwrap_or_default();
        ProcessedQuery {
            output_columns: outputs.iter().map(|o| build_concept(o)).collect(),
            ctes,
            base_cte: base,
            hidden_columns: BTreeSet::new(),
            limit: None,
            order_by: None,
        }
    }

    fn render(query: &ProcessedQuery, dialect: Dialect) -> String {
        let config = CompilerConfig::default().with_dialect(dialect);
        render_query(query, &config).unwrap().to_sql(dialect)
    }

    fn metric(address: &str, function: Function) -> BuildConcept {
        let mut c = build_concept(address);
        c.purpose = Purpose::Metric;
        c.derivation = Derivation::Aggregate;
        c.is_aggregate = true;
        c.lineage = Some(Lineage::Function(function));
        c
    }

    #[test]
    fn test_direct_select_reads_table_columns() {
        let orders = select_cte("orders", table("orders", &["local.order_id", "local.amount"]));
        let query = processed(vec![orders], &["local.order_id", "local.amount"]);
        let sql = render(&query, Dialect::DuckDb);
        assert!(sql.starts_with("WITH\n\"orders\" AS ("), "{}", sql);
        assert!(sql.contains("\"orders\".\"order_id\" AS \"order_id\""), "{}", sql);
        assert!(sql.contains("FROM orders AS \"orders\""), "{}", sql);
        assert!(sql.ends_with("FROM \"orders\""), "{}", sql);
        validate_sql(&sql, Dialect::DuckDb).unwrap();
    }

    #[test]
    fn test_group_renders_aggregate_and_group_by() {
        let posts = select_cte("posts", table("posts", &["local.post_id", "local.user_id"]));
        let mut inner = child_cte("inner", &posts, &["local.user_id"]);
        let count_posts = metric(
            "local.user_post_count",
            Function::new(FunctionType::Count, vec![concept("post_id")]),
        );
        inner.output_columns.push(count_posts.clone());
        inner.source.output_concepts.push(count_posts);
        inner.source.input_concepts.push(build_concept("local.post_id"));
        inner.source_map.insert("local.post_id".into(), vec!["posts".into()]);
        inner.source_map.insert("local.user_post_count".into(), Vec::new());
        inner.group_to_grain = true;
        let query = processed(vec![posts, inner], &["local.user_id", "local.user_post_count"]);
        let sql = render(&query, Dialect::Postgres);
        assert!(sql.contains("COUNT(\"posts\".\"post_id\") AS \"user_post_count\""), "{}", sql);
        assert!(sql.contains("GROUP BY \"posts\".\"user_id\""), "{}", sql);
        validate_sql(&sql, Dialect::Postgres).unwrap();
    }

    #[test]
    fn test_grain_match_skips_aggregation() {
        let posts = select_cte("posts", table("posts", &["local.post_id"]));
        let mut child = child_cte("final", &posts, &["local.post_id"]);
        let total = metric(
            "local.total",
            Function::new(FunctionType::Sum, vec![concept("post_id")]),
        );
        child.output_columns.push(total);
        child.source_map.insert("local.total".into(), Vec::new());
        let query = processed(vec![posts, child], &["local.post_id", "local.total"]);
        let sql = render(&query, Dialect::DuckDb);
        assert!(sql.contains("\"posts\".\"post_id\" AS \"total\""), "{}", sql);
        assert!(!sql.contains("SUM("), "{}", sql);
        assert!(!sql.contains("GROUP BY"), "{}", sql);
    }

    #[test]
    fn test_unresolved_concept_marker_names_its_cte() {
        let orders = select_cte("orders", table("orders", &["local.order_id"]));
        let mut child = child_cte("final", &orders, &["local.order_id"]);
        child.output_columns.push(build_concept("local.ghost"));
        let query = processed(vec![orders, child], &["local.order_id"]);
        let sql = render(&query, Dialect::DuckDb);
        assert!(sql.contains("INVALID_REFERENCE_BUG<local.ghost@final>"), "{}", sql);
    }

    #[test]
    fn test_aggregate_condition_becomes_having() {
        let orders = select_cte("orders", table("orders", &["local.customer_id", "local.amount"]));
        let mut child = child_cte("final", &orders, &["local.customer_id"]);
        let total = metric(
            "local.total",
            Function::new(FunctionType::Sum, vec![concept("amount")]),
        );
        child.output_columns.push(total);
        child.source_map.insert("local.total".into(), Vec::new());
        child.source_map.insert("local.amount".into(), vec!["orders".into()]);
        child.group_to_grain = true;
        child.condition = Some(
            concept("total")
                .gt(lit(100))
                .and(concept("customer_id").gt(lit(1))),
        );
        let query = processed(vec![orders, child], &["local.customer_id", "local.total"]);
        let sql = render(&query, Dialect::Sqlite);
        assert!(sql.contains("WHERE \"orders\".\"customer_id\" > 1"), "{}", sql);
        assert!(sql.contains("HAVING SUM(\"orders\".\"amount\") > 100"), "{}", sql);
        validate_sql(&sql, Dialect::Sqlite).unwrap();
    }

    #[test]
    fn test_outer_join_keys_are_null_safe() {
        let orders = select_cte("orders", table("orders", &["local.order_id", "local.customer_id"]));
        let customers = select_cte("customers", table("customers", &["local.customer_id", "local.name"]));
        let mut merged = child_cte("merged", &orders, &["local.order_id", "local.name"]);
        merged.parent_ctes.push("customers".into());
        merged.source_map.insert("local.name".into(), vec!["customers".into()]);
        merged.nullable_concepts.insert("local.customer_id".into());
        merged.joins.push(Join::Cte(CteJoin {
            left_cte: Some("orders".into()),
            right_cte: "customers".into(),
            join_type: model::JoinType::LeftOuter,
            joinkey_pairs: vec![CteConceptPair {
                left: "local.customer_id".into(),
                right: "local.customer_id".into(),
                cte: "orders".into(),
            }],
            inlined_ctes: Default::default(),
        }));
        merged.base_override = Some(BaseTable::Cte("orders".into()));
        merged.source.output_concepts.push(build_concept("local.customer_id"));
        let query = processed(vec![orders, customers, merged], &["local.order_id", "local.name"]);

        let config = CompilerConfig::default().with_dialect(Dialect::Postgres);
        let sql = render_query(&query, &config).unwrap().to_sql(Dialect::Postgres);
        assert!(
            sql.contains(
                "LEFT OUTER JOIN \"customers\" ON (\"orders\".\"customer_id\" = \"customers\".\"customer_id\" OR (\"orders\".\"customer_id\" IS NULL AND \"customers\".\"customer_id\" IS NULL))"
            ),
            "{}",
            sql
        );
        validate_sql(&sql, Dialect::Postgres).unwrap();

        let mut plain = config.clone();
        plain.null_safe_joins = false;
        let sql = render_query(&query, &plain).unwrap().to_sql(Dialect::Postgres);
        assert!(
            sql.contains("ON \"orders\".\"customer_id\" = \"customers\".\"customer_id\""),
            "{}",
            sql
        );
        assert!(!sql.contains("IS NULL AND"), "{}", sql);
    }

    #[test]
    fn test_final_select_orders_and_hides() {
        let orders = select_cte("orders", table("orders", &["local.order_id", "local.amount"]));
        let mut query = processed(vec![orders], &["local.order_id", "local.amount"]);
        query.hidden_columns.insert("local.amount".into());
        query.order_by = Some(OrderBy::new(vec![OrderItem::desc("local.amount")]));
        query.limit = Some(3);
        let sql = render(&query, Dialect::DuckDb);
        let final_select = sql.rsplit_once(')').map(|(_, tail)| tail).unwrap_or_default();
        assert!(!final_select.contains("AS \"amount\""), "{}", sql);
        assert!(final_select.contains("ORDER BY \"orders\".\"amount\" DESC"), "{}", sql);
        assert!(final_select.ends_with("LIMIT 3"), "{}", sql);
    }

    #[test]
    fn test_comments_are_written_when_enabled() {
        let orders = select_cte("orders", table("orders", &["local.order_id"]));
        let query = processed(vec![orders], &["local.order_id"]);
        let config = CompilerConfig::default().with_comments(true);
        let sql = render_query(&query, &config).unwrap().to_sql(Dialect::DuckDb);
        assert!(sql.contains("-- Target:"), "{}", sql);
    }
}
