//! Join discovery between resolved parents.

use std::collections::{BTreeMap, BTreeSet};

use super::nodes::instantiated_on;
use crate::error::Result;
use crate::model::{Address, BuildConcept, BuildEnvironment, Expr, JoinType, Lineage, Purpose};
use crate::plan::{BaseJoin, ConceptPair, QueryDatasource, SourceMap, SourceRef};

pub fn padding(depth: usize) -> String {
    "\t".repeat(depth)
}

/// One step of a join plan: `right` joins onto the already placed sources
/// listed in `keys`, on the concepts they share.
#[derive(Debug, Clone, PartialEq)]
struct JoinOrder {
    right: String,
    join_type: JoinType,
    keys: BTreeMap<String, BTreeSet<Address>>,
}

struct JoinGraph {
    /// Source identifiers, in parent order.
    sources: Vec<String>,
    /// Concepts each source can be joined on, including pseudonyms.
    concepts: BTreeMap<String, BTreeSet<Address>>,
    partials: BTreeMap<String, BTreeSet<Address>>,
    nullables: BTreeMap<String, BTreeSet<Address>>,
}

impl JoinGraph {
    fn build(datasets: &[QueryDatasource], lookup: &dyn Fn(&str) -> Option<BuildConcept>) -> Self {
        let mut sources = Vec::new();
        let mut concepts = BTreeMap::new();
        let mut partials = BTreeMap::new();
        let mut nullables = BTreeMap::new();
        for ds in datasets {
            let id = ds.identifier();
            let mut joinable = BTreeSet::new();
            for c in &ds.output_concepts {
                if ds.hidden_concepts.contains(&c.address) {
                    continue;
                }
                joinable.insert(c.address.clone());
                for p in &c.pseudonyms {
                    if lookup(p).is_some() {
                        joinable.insert(p.clone());
                    }
                }
            }
            partials.insert(id.clone(), ds.partial_concepts.clone());
            nullables.insert(id.clone(), ds.nullable_concepts.clone());
            concepts.insert(id.clone(), joinable);
            sources.push(id);
        }
        Self {
            sources,
            concepts,
            partials,
            nullables,
        }
    }

    fn common(&self, a: &str, b: &str) -> BTreeSet<Address> {
        match (self.concepts.get(a), self.concepts.get(b)) {
            (Some(x), Some(y)) => x.intersection(y).cloned().collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Concepts shared by at least two sources, with the sources holding them.
    fn pivots(&self) -> BTreeMap<Address, Vec<String>> {
        let mut pivots: BTreeMap<Address, Vec<String>> = BTreeMap::new();
        for id in &self.sources {
            for c in &self.concepts[id] {
                pivots.entry(c.clone()).or_default().push(id.clone());
            }
        }
        pivots.retain(|_, v| v.len() > 1);
        pivots
    }
}

/// Order the sources into joins.
///
/// Sources holding a concept in full are placed before sources holding it
/// partially. A partial left side gives a FULL join; a partial right side
/// gives a LEFT OUTER join; a nullable key on either side gives a LEFT
/// OUTER join, and nullable keys on both sides give a FULL join.
fn resolve_join_order(graph: &JoinGraph) -> Vec<JoinOrder> {
    let pivots = graph.pivots();
    if pivots.is_empty() {
        return Vec::new();
    }
    let mut placed: Vec<String> = Vec::new();
    let mut output: Vec<JoinOrder> = Vec::new();

    let mut pivot_queue: Vec<(Address, Vec<String>)> = pivots.into_iter().collect();
    // Most widely shared keys first, so joins fan out from a common base.
    pivot_queue.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));

    while let Some((pivot, holders)) = pivot_queue.first().cloned() {
        pivot_queue.remove(0);
        let mut to_place: Vec<String> = holders.iter().filter(|h| !placed.contains(h)).cloned().collect();
        if to_place.is_empty() {
            continue;
        }
        if placed.is_empty() {
            // Seed with a holder that has the pivot in full.
            let seed_pos = to_place
                .iter()
                .position(|s| !graph.partials[s].contains(&pivot))
                .unwrap_or(0);
            let seed = to_place.remove(seed_pos);
            placed.push(seed);
        }
        // Full holders join before partial ones.
        to_place.sort_by_key(|s| graph.partials[s].contains(&pivot));
        for right in to_place {
            let keys = join_keys_for(graph, &placed, &right);
            if keys.is_empty() {
                continue;
            }
            let join_type = join_type_for(graph, &keys, &right);
            placed.push(right.clone());
            output.push(JoinOrder {
                right,
                join_type,
                keys,
            });
        }
    }
    // Anything left touches a placed source only through keys that were
    // not pivots at the time; attach it to whatever it shares.
    let mut progress = true;
    while progress {
        progress = false;
        for right in &graph.sources {
            if placed.contains(right) {
                continue;
            }
            let keys = join_keys_for(graph, &placed, right);
            if keys.is_empty() {
                continue;
            }
            let join_type = join_type_for(graph, &keys, right);
            placed.push(right.clone());
            output.push(JoinOrder {
                right: right.clone(),
                join_type,
                keys,
            });
            progress = true;
        }
    }
    output
}

fn join_keys_for(graph: &JoinGraph, placed: &[String], right: &str) -> BTreeMap<String, BTreeSet<Address>> {
    let mut keys: BTreeMap<String, BTreeSet<Address>> = BTreeMap::new();
    let mut claimed: BTreeSet<Address> = BTreeSet::new();
    // Prefer sources with the key in full, then the earliest placed.
    let mut ordered: Vec<&String> = placed.iter().collect();
    for key in graph.common_all(placed, right) {
        ordered.sort_by_key(|s| graph.partials[*s].contains(&key));
        if let Some(left) = ordered.iter().find(|s| graph.concepts[**s].contains(&key)) {
            if claimed.insert(key.clone()) {
                keys.entry((*left).clone()).or_default().insert(key);
            }
        }
    }
    keys
}

impl JoinGraph {
    fn common_all(&self, placed: &[String], right: &str) -> BTreeSet<Address> {
        placed.iter().flat_map(|p| self.common(p, right)).collect()
    }
}

fn join_type_for(graph: &JoinGraph, keys: &BTreeMap<String, BTreeSet<Address>>, right: &str) -> JoinType {
    let mut left_partial = false;
    let mut right_partial = false;
    let mut left_nullable = false;
    let mut right_nullable = false;
    for (left, concepts) in keys {
        for c in concepts {
            left_partial |= graph.partials[left].contains(c);
            right_partial |= graph.partials[right].contains(c);
            left_nullable |= graph.nullables[left].contains(c);
            right_nullable |= graph.nullables[right].contains(c);
        }
    }
    if left_partial || (left_nullable && right_nullable) {
        JoinType::Full
    } else if right_partial || left_nullable || right_nullable {
        JoinType::LeftOuter
    } else {
        JoinType::Inner
    }
}

/// Work out the joins needed to combine `datasets`.
pub fn get_node_joins(
    datasets: &[QueryDatasource],
    lookup: &dyn Fn(&str) -> Option<BuildConcept>,
) -> Result<Vec<BaseJoin>> {
    let graph = JoinGraph::build(datasets, lookup);
    let orders = resolve_join_order(&graph);
    let mut joined: BTreeSet<String> = BTreeSet::new();
    for order in &orders {
        joined.insert(order.right.clone());
        joined.extend(order.keys.keys().cloned());
    }
    let sources: Vec<SourceRef> = datasets
        .iter()
        .map(|d| SourceRef::Query(Box::new(d.clone())))
        .collect();
    let by_id = |id: &str| datasets.iter().position(|d| d.identifier() == id);
    let mut joins = Vec::new();
    for order in orders {
        let Some(right_idx) = by_id(&order.right) else {
            continue;
        };
        let right_ds = &datasets[right_idx];
        let mut pairs: Vec<ConceptPair> = Vec::new();
        for (left_id, concepts) in &order.keys {
            let Some(left_idx) = by_id(left_id) else {
                continue;
            };
            for c in concepts {
                let pair = ConceptPair {
                    left: instantiated_on(c, &datasets[left_idx], lookup),
                    right: instantiated_on(c, right_ds, lookup),
                    existing_datasource: left_id.clone(),
                };
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
        let pairs = reduce_concept_pairs(pairs, right_ds, lookup);
        let left = if order.keys.len() == 1 {
            order.keys.keys().next().and_then(|id| by_id(id)).map(|i| &sources[i])
        } else {
            None
        };
        let join = BaseJoin::new(left, &sources[right_idx], order.join_type, pairs, &sources, lookup)?;
        log::debug!("planned join {}", join);
        joins.push(join);
    }
    // Sources sharing no keys are cross joined onto the base; only valid
    // when one side is single-row.
    let base = datasets
        .iter()
        .position(|d| joined.contains(&d.identifier()))
        .unwrap_or(0);
    for (idx, ds) in datasets.iter().enumerate() {
        if idx == base || joined.contains(&ds.identifier()) {
            continue;
        }
        let join = BaseJoin::new(Some(&sources[base]), &sources[idx], JoinType::Full, Vec::new(), &sources, lookup)?;
        log::debug!("planned cross join {}", join);
        joins.push(join);
    }
    Ok(joins)
}

/// Drop property keys when their own keys are already join keys on the
/// right side.
pub fn reduce_concept_pairs(
    pairs: Vec<ConceptPair>,
    right: &QueryDatasource,
    lookup: &dyn Fn(&str) -> Option<BuildConcept>,
) -> Vec<ConceptPair> {
    let rights: BTreeSet<Address> = pairs.iter().map(|p| p.right.clone()).collect();
    pairs
        .into_iter()
        .filter(|pair| {
            let Some(concept) = lookup(&pair.right) else {
                return true;
            };
            if !matches!(concept.purpose, Purpose::Property | Purpose::UniqueProperty) {
                return true;
            }
            match &concept.keys {
                Some(keys) if !keys.is_empty() => {
                    !keys.iter().all(|k| rights.contains(k) && right.has_output(k))
                }
                _ => true,
            }
        })
        .collect()
}

/// Concepts of a join output that may be null.
///
/// A concept is nullable when every source providing it marks it nullable,
/// or when all its sources sit on the outer side of a join.
pub fn find_nullable_concepts(
    source_map: &SourceMap,
    datasources: &[QueryDatasource],
    joins: &[BaseJoin],
) -> BTreeSet<Address> {
    let by_id: BTreeMap<String, &QueryDatasource> =
        datasources.iter().map(|d| (d.identifier(), d)).collect();
    let mut nullable_sources: BTreeSet<String> = BTreeSet::new();
    for join in joins {
        let Some(right) = by_id.get(&join.right_datasource) else {
            continue;
        };
        match join.join_type {
            JoinType::LeftOuter => {
                nullable_sources.insert(join.right_datasource.clone());
            }
            JoinType::Full => {
                nullable_sources.insert(join.right_datasource.clone());
                for pair in &join.concept_pairs {
                    nullable_sources.insert(pair.existing_datasource.clone());
                }
                if let Some(left) = &join.left_datasource {
                    nullable_sources.insert(left.clone());
                }
            }
            _ => {}
        }
        let on_nullable = join.concept_pairs.iter().any(|pair| {
            right.nullable_concepts.contains(&pair.right)
                || by_id
                    .get(join.left_datasource.as_ref().unwrap_or(&pair.existing_datasource))
                    .is_some_and(|l| l.nullable_concepts.contains(&pair.left))
        });
        if on_nullable {
            nullable_sources.insert(join.right_datasource.clone());
        }
    }
    let mut out = BTreeSet::new();
    for (address, sources) in source_map {
        let providers: Vec<&QueryDatasource> =
            datasources.iter().filter(|d| d.has_output(address)).collect();
        if !providers.is_empty() && providers.iter().all(|d| d.nullable_concepts.contains(address)) {
            out.insert(address.clone());
            continue;
        }
        if !sources.is_empty() && !nullable_sources.is_empty() {
            let all_nullable = sources.iter().all(|s| {
                nullable_sources.contains(s)
                    || by_id.get(s).is_some_and(|d| d.nullable_concepts.contains(address))
            });
            if all_nullable {
                out.insert(address.clone());
            }
        }
    }
    out
}

/// Whether a condition can be evaluated on individual rows, before any
/// grouping.
pub fn is_scalar_condition(expr: &Expr, env: &BuildEnvironment) -> bool {
    match expr {
        Expr::Concept(address) => {
            if env.materialized_concepts.contains(address) {
                return true;
            }
            let Some(concept) = env.get(address) else {
                return true;
            };
            match &concept.lineage {
                Some(Lineage::Aggregate(_)) => false,
                Some(Lineage::Function(f)) => {
                    !f.operator.is_aggregate()
                        && f.arguments.iter().all(|a| is_scalar_condition(a, env))
                }
                _ => true,
            }
        }
        Expr::Literal(_) | Expr::Type(_) => true,
        Expr::Function(f) => {
            !f.operator.is_aggregate() && f.arguments.iter().all(|a| is_scalar_condition(a, env))
        }
        Expr::Comparison(c) => {
            c.is_subselect() || (is_scalar_condition(&c.left, env) && is_scalar_condition(&c.right, env))
        }
        Expr::Conditional(c) => is_scalar_condition(&c.left, env) && is_scalar_condition(&c.right, env),
        Expr::Parenthetical(inner) | Expr::CaseElse(inner) => is_scalar_condition(inner, env),
        Expr::CaseWhen(cw) => is_scalar_condition(&cw.comparison, env) && is_scalar_condition(&cw.expr, env),
        Expr::List(items) => items.iter().all(|i| is_scalar_condition(i, env)),
    }
}

/// Drop concepts whose keys are all in the list; joining on the keys suffices.
pub fn concept_to_relevant_joins(concepts: &[BuildConcept]) -> Vec<BuildConcept> {
    let addresses: BTreeSet<&str> = concepts.iter().map(|c| c.address.as_str()).collect();
    let mut out: Vec<BuildConcept> = Vec::new();
    for c in concepts {
        let covered = c
            .keys
            .as_ref()
            .is_some_and(|k| !k.is_empty() && k.iter().all(|k| addresses.contains(k.as_str()) && *k != c.address));
        if !covered && !out.iter().any(|o| o.address == c.address) {
            out.push(c.clone());
        }
    }
    out
}
