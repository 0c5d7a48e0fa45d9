//! Lowering of resolved query datasources into CTEs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;

use super::cte::{merge_ctes, BaseTable, Cte, CteConceptPair, CteJoin, CteKind, InstantiatedUnnestJoin, Join};
use super::datasource::{QueryDatasource, QueryJoin, SourceRef};
use crate::error::{Error, Result};
use crate::model::{Address, BuildConcept, JoinType, SourceType};

const NAME_POOL: &[&str] = &[
    "anchor", "beacon", "cedar", "delta", "ember", "falcon", "glacier", "harbor", "iris",
    "juniper", "kestrel", "lantern", "meadow", "nimbus", "orchid", "pebble", "quartz", "raven",
    "summit", "thistle", "umber", "vale", "willow", "yarrow", "zephyr",
];

/// Assigns CTE names, stable per source identifier within one compilation.
#[derive(Debug, Clone, Default)]
pub struct NamePool {
    human: bool,
    assigned: HashMap<String, String>,
    used: BTreeSet<String>,
}

impl NamePool {
    pub fn new(human: bool) -> Self {
        Self {
            human,
            ..Default::default()
        }
    }

    pub fn name_for(&mut self, identifier: &str) -> String {
        if let Some(name) = self.assigned.get(identifier) {
            return name.clone();
        }
        let name = if self.human {
            self.next_human()
        } else {
            identifier.replace('.', "_")
        };
        self.used.insert(name.clone());
        self.assigned.insert(identifier.to_string(), name.clone());
        name
    }

    fn next_human(&self) -> String {
        let mut idx = self.used.len();
        loop {
            let base = NAME_POOL[idx % NAME_POOL.len()];
            let candidate = if idx >= NAME_POOL.len() {
                format!("{}_{}", base, idx / NAME_POOL.len())
            } else {
                base.to_string()
            };
            if !self.used.contains(&candidate) {
                return candidate;
            }
            idx += 1;
        }
    }
}

/// Lowers a datasource tree, sharing one name pool.
pub struct Lowering<'p> {
    pool: &'p mut NamePool,
    validate_missing: bool,
}

impl<'p> Lowering<'p> {
    pub fn new(pool: &'p mut NamePool, validate_missing: bool) -> Self {
        Self {
            pool,
            validate_missing,
        }
    }

    /// Lower `root` into a dependency-ordered CTE list; the root CTE is last.
    pub fn datasource_to_ctes(&mut self, root: &QueryDatasource) -> Result<Vec<Cte>> {
        let mut out = Vec::new();
        let cte = self.lower_node(root, &mut out)?;
        out.push(cte);
        merge_ctes(out)
    }

    /// Lower one node. Parents are pushed to `out`; the node's own CTE is returned.
    fn lower_node(&mut self, qds: &QueryDatasource, out: &mut Vec<Cte>) -> Result<Cte> {
        if qds.source_type == SourceType::Union {
            return self.lower_union(qds, out);
        }
        let direct = matches!(qds.datasources.as_slice(), [SourceRef::Datasource(_)]);
        let mut parents: Vec<Cte> = Vec::new();
        if !direct {
            for source in &qds.datasources {
                let child = match source {
                    SourceRef::Query(q) => self.lower_node(q, out)?,
                    SourceRef::Datasource(ds) => {
                        let concepts: Vec<BuildConcept> = qds
                            .input_concepts
                            .iter()
                            .chain(qds.output_concepts.iter())
                            .filter(|c| {
                                qds.source_map
                                    .get(&c.address)
                                    .is_some_and(|ids| ids.contains(&ds.identifier))
                                    || qds
                                        .existence_source_map
                                        .get(&c.address)
                                        .is_some_and(|ids| ids.contains(&ds.identifier))
                            })
                            .unique_by(|c| c.address.clone())
                            .cloned()
                            .collect();
                        let wrapped = QueryDatasource::from_datasource(ds, concepts);
                        self.lower_node(&wrapped, out)?
                    }
                };
                out.push(child.clone());
                parents.push(child);
            }
        }

        let (source_map, existence_source_map) = if direct {
            let SourceRef::Datasource(ds) = &qds.datasources[0] else {
                return Err(Error::syntax("direct source must be a datasource"));
            };
            let constant = qds.datasources[0].is_constant();
            let map = qds
                .source_map
                .iter()
                .map(|(k, v)| {
                    let names = if v.is_empty() || constant {
                        Vec::new()
                    } else {
                        vec![ds.safe_identifier()]
                    };
                    (k.clone(), names)
                })
                .collect();
            (map, BTreeMap::new())
        } else {
            let map = self.generate_source_map(qds, &parents)?;
            let existence = qds
                .existence_source_map
                .iter()
                .map(|(k, ids)| {
                    let names = ids
                        .iter()
                        .filter_map(|id| find_parent(&parents, id).map(|p| p.name.clone()))
                        .collect();
                    (k.clone(), names)
                })
                .collect();
            (map, existence)
        };

        let joins = qds
            .joins
            .iter()
            .map(|j| base_join_to_join(j, &parents))
            .collect::<Result<Vec<Join>>>()?;

        let kind = match qds.source_type {
            SourceType::Recursive => CteKind::Recursive,
            _ => CteKind::Standard,
        };
        let mut cte = Cte {
            name: self.pool.name_for(&qds.identifier()),
            kind,
            source: qds.clone(),
            output_columns: qds.output_concepts.clone(),
            source_map,
            existence_source_map,
            grain: qds.grain.clone(),
            group_to_grain: qds.group_required(),
            parent_ctes: parents.iter().map(|p| p.name.clone()).collect(),
            joins,
            condition: qds.condition.clone(),
            partial_concepts: qds.partial_concepts.clone(),
            nullable_concepts: qds.nullable_concepts.clone(),
            join_derived_concepts: qds.join_derived_concepts.clone(),
            hidden_concepts: qds.hidden_concepts.clone(),
            order_by: qds.ordering.clone(),
            limit: qds.limit,
            base_override: None,
        };
        if !direct {
            cte.base_override = resolve_base(&cte)?;
        }
        if self.validate_missing {
            check_missing(&cte)?;
        }
        log::trace!(
            "lowered {} to CTE {} with parents [{}]",
            qds.identifier(),
            cte.name,
            cte.parent_ctes.join(", ")
        );
        Ok(cte)
    }

    fn lower_union(&mut self, qds: &QueryDatasource, out: &mut Vec<Cte>) -> Result<Cte> {
        let outputs: BTreeSet<Address> = qds.output_addresses().into_iter().collect();
        let mut internal = Vec::new();
        for source in &qds.datasources {
            let SourceRef::Query(child) = source else {
                return Err(Error::syntax("union members must be resolved queries"));
            };
            let mut cte = self.lower_node(child, out)?;
            for c in &cte.output_columns {
                if !outputs.contains(&c.address) {
                    cte.hidden_concepts.insert(c.address.clone());
                }
            }
            internal.push(cte);
        }
        let Some(first) = internal.first() else {
            return Err(Error::syntax("union requires at least one member"));
        };
        let grain = first.grain.clone();
        let mut parent_ctes: Vec<String> = Vec::new();
        for child in &internal {
            for p in &child.parent_ctes {
                if !parent_ctes.contains(p) {
                    parent_ctes.push(p.clone());
                }
            }
        }
        Ok(Cte {
            name: self.pool.name_for(&qds.identifier()),
            kind: CteKind::Union { internal },
            source: qds.clone(),
            output_columns: qds.output_concepts.clone(),
            source_map: qds
                .output_concepts
                .iter()
                .map(|c| (c.address.clone(), Vec::new()))
                .collect(),
            existence_source_map: BTreeMap::new(),
            grain,
            group_to_grain: false,
            parent_ctes,
            joins: Vec::new(),
            condition: None,
            partial_concepts: qds.partial_concepts.clone(),
            nullable_concepts: qds.nullable_concepts.clone(),
            join_derived_concepts: Vec::new(),
            hidden_concepts: qds.hidden_concepts.clone(),
            order_by: qds.ordering.clone(),
            limit: qds.limit,
            base_override: None,
        })
    }

    fn generate_source_map(
        &self,
        qds: &QueryDatasource,
        parents: &[Cte],
    ) -> Result<BTreeMap<Address, Vec<String>>> {
        let mut out = BTreeMap::new();
        // Either side of a full join may be null, so its keys read every side.
        let full_keys: BTreeSet<&str> = qds
            .joins
            .iter()
            .filter_map(|j| match j {
                QueryJoin::Base(b) if b.join_type == JoinType::Full => Some(b),
                _ => None,
            })
            .flat_map(|b| b.concept_pairs.iter().flat_map(|p| [p.left.as_str(), p.right.as_str()]))
            .collect();
        for (address, ids) in &qds.source_map {
            if ids.is_empty() {
                out.insert(address.clone(), Vec::new());
                continue;
            }
            let concept = qds.concept(address);
            let supplies = |p: &Cte| {
                p.has_output(address)
                    || concept.is_some_and(|c| c.pseudonyms.iter().any(|ps| p.has_output(ps)))
            };
            let matches: Vec<&Cte> = ids
                .iter()
                .filter_map(|id| find_parent(parents, id))
                .filter(|p| supplies(p))
                .collect();
            if matches.is_empty() {
                if self.validate_missing {
                    return Err(Error::syntax(format!(
                        "No parent CTE supplies {} from [{}]",
                        address,
                        ids.iter().join(", ")
                    )));
                }
                out.insert(address.clone(), Vec::new());
                continue;
            }
            let full_parent = matches
                .iter()
                .find(|p| !p.partial_concepts.contains(address))
                .filter(|_| !full_keys.contains(address.as_str()));
            let names = match full_parent {
                Some(full) => vec![full.name.clone()],
                None => matches.iter().map(|p| p.name.clone()).unique().collect(),
            };
            out.insert(address.clone(), names);
        }
        Ok(out)
    }
}

fn find_parent<'a>(parents: &'a [Cte], identifier: &str) -> Option<&'a Cte> {
    parents.iter().find(|p| {
        p.source.identifier() == identifier
            || matches!(p.source.datasources.as_slice(), [only] if only.identifier() == identifier)
    })
}

fn base_join_to_join(join: &QueryJoin, parents: &[Cte]) -> Result<Join> {
    match join {
        QueryJoin::Unnest(u) => Ok(Join::Unnest(InstantiatedUnnestJoin {
            concept: u.concept.clone(),
            alias: u.alias.clone(),
        })),
        QueryJoin::Base(b) => {
            let name_of = |id: &str| {
                find_parent(parents, id).map(|p| p.name.clone()).ok_or_else(|| {
                    Error::syntax(format!("Invalid join configuration: no CTE for {}", id))
                })
            };
            let left_cte = b.left_datasource.as_deref().map(name_of).transpose()?;
            let right_cte = name_of(&b.right_datasource)?;
            let joinkey_pairs = b
                .concept_pairs
                .iter()
                .map(|p| {
                    Ok(CteConceptPair {
                        left: p.left.clone(),
                        right: p.right.clone(),
                        cte: name_of(&p.existing_datasource)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Join::Cte(CteJoin {
                left_cte,
                right_cte,
                join_type: b.join_type,
                joinkey_pairs,
                inlined_ctes: BTreeMap::new(),
            }))
        }
    }
}

/// Pick the FROM anchor of a CTE with parents.
///
/// With joins, the first left-side CTE that is never joined in wins.
/// Otherwise the parent referenced most often by the source map wins,
/// ties going to the first parent.
fn resolve_base(cte: &Cte) -> Result<Option<BaseTable>> {
    if cte.parent_ctes.is_empty() {
        return Ok(None);
    }
    let cte_joins: Vec<&CteJoin> = cte
        .joins
        .iter()
        .filter_map(|j| match j {
            Join::Cte(j) => Some(j),
            Join::Unnest(_) => None,
        })
        .collect();
    if !cte_joins.is_empty() {
        let disallowed: BTreeSet<&str> = cte_joins.iter().map(|j| j.right_cte.as_str()).collect();
        let candidates = cte_joins.iter().flat_map(|j| {
            j.left_cte
                .iter()
                .map(String::as_str)
                .chain(j.joinkey_pairs.iter().map(|p| p.cte.as_str()))
        });
        for candidate in candidates {
            if !disallowed.contains(candidate) {
                return Ok(Some(BaseTable::Cte(candidate.to_string())));
            }
        }
        return Err(Error::syntax(format!(
            "Invalid join configuration for {}: every source is joined in",
            cte.name
        )));
    }
    let outputs: BTreeSet<Address> = cte.output_addresses().into_iter().collect();
    let inputs: BTreeSet<Address> = cte.source.input_addresses().into_iter().collect();
    let mut counts: Vec<(String, usize)> = cte.parent_ctes.iter().map(|p| (p.clone(), 0)).collect();
    for (address, names) in &cte.source_map {
        for name in names {
            if let Some(entry) = counts.iter_mut().find(|(n, _)| n == name) {
                entry.1 += 1;
                if outputs.contains(address) {
                    entry.1 += 1;
                }
                if inputs.contains(address) {
                    entry.1 += 1;
                }
            }
        }
    }
    let mut best: Option<(String, usize)> = None;
    for (name, count) in counts {
        if best.as_ref().map_or(true, |(_, c)| count > *c) {
            best = Some((name, count));
        }
    }
    Ok(best.map(|(name, _)| BaseTable::Cte(name)))
}

/// Every output must be traceable to the source map.
fn check_missing(cte: &Cte) -> Result<()> {
    for c in &cte.output_columns {
        let found = cte.source_map.contains_key(&c.address)
            || c.pseudonyms.iter().any(|p| cte.source_map.contains_key(p));
        if !found {
            return Err(Error::syntax(format!(
                "Output {} of CTE {} has no source; have {}",
                c.address,
                cte.name,
                cte.source_map.keys().join(", ")
            )));
        }
    }
    Ok(())
}
