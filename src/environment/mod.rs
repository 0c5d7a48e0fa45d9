//! The concept registry.
//!
//! An [`Environment`] owns every concept and datasource a model declares. It
//! is the single place where address identity is mutated: merges, imports and
//! rowset registrations all go through it. Planning never mutates it; a
//! compilation works on a [`BuildEnvironment`](crate::model::BuildEnvironment)
//! built from a snapshot.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::build::suggest;
use crate::model::concept::{
    address_with_namespace, qualify, split_address, Address, Concept, ConceptLookup, Scoped,
    DEFAULT_NAMESPACE,
};
use crate::model::datasource::Datasource;
use crate::model::enums::{Derivation, Modifier, Purpose};
use crate::model::grain::Grain;
use crate::model::lineage::{Lineage, RowsetItem, RowsetLineage};
use crate::model::statement::{MultiSelectStatement, SelectStatement};

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub concepts: BTreeMap<Address, Concept>,
    /// Datasources keyed by identifier.
    #[serde(default)]
    pub datasources: BTreeMap<String, Datasource>,
    /// The original concept for every address merged into another.
    #[serde(default)]
    pub alias_origin: BTreeMap<Address, Concept>,
    /// Import alias to source path, when one is known.
    #[serde(default)]
    pub imports: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default = "default_true")]
    pub fail_on_missing: bool,
    /// Addresses backed by a datasource. Cleared on every mutation.
    #[serde(skip)]
    materialized: OnceCell<BTreeSet<Address>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self {
            namespace: default_namespace(),
            concepts: BTreeMap::new(),
            datasources: BTreeMap::new(),
            alias_origin: BTreeMap::new(),
            imports: BTreeMap::new(),
            frozen: false,
            fail_on_missing: true,
            materialized: OnceCell::new(),
        }
    }

    /// Defer missing references instead of failing on them.
    ///
    /// Concepts declared against missing arguments are stored with their
    /// unresolved addresses and bound when a statement is built.
    pub fn non_strict(mut self) -> Self {
        self.fail_on_missing = false;
        self
    }

    /// An independent, unfrozen copy.
    pub fn duplicate(&self) -> Environment {
        let mut env = self.clone();
        env.frozen = false;
        env.touch();
        env
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::FrozenEnvironment);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.materialized = OnceCell::new();
    }

    // ========================================================================
    // Concepts
    // ========================================================================

    /// Register a concept.
    ///
    /// Redeclaring an address with a different lineage is an error.
    /// Redeclaring with the same lineage replaces the concept.
    pub fn add_concept(&mut self, concept: Concept) -> Result<()> {
        self.check_mutable()?;
        if let Some(existing) = self.concepts.get(&concept.address) {
            if existing.lineage != concept.lineage && !self.alias_origin.contains_key(&concept.address)
            {
                return Err(Error::syntax(format!(
                    "concept {} is already declared with a different definition",
                    concept.address
                )));
            }
        }
        log::debug!("adding concept {}", concept.address);
        self.concepts.insert(concept.address.clone(), concept);
        self.touch();
        Ok(())
    }

    pub fn concept(&self, address: &str) -> Result<&Concept> {
        self.require(&qualify(address))
    }

    /// Concepts whose address sits directly under `namespace`.
    pub fn concepts_in_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Concept> {
        self.concepts
            .iter()
            .filter(move |(k, c)| split_address(k).0 == namespace && c.address == **k)
            .map(|(_, c)| c)
    }

    // ========================================================================
    // Datasources
    // ========================================================================

    /// Register a datasource.
    ///
    /// Every bound concept must exist. A constant bound into a datasource is
    /// read from it from then on and becomes a root concept.
    pub fn add_datasource(&mut self, datasource: Datasource) -> Result<()> {
        self.check_mutable()?;
        if self.fail_on_missing {
            if let Some(col) = datasource
                .columns
                .iter()
                .find(|c| self.lookup(&c.concept).is_none())
            {
                return Err(Error::undefined(
                    col.concept.clone(),
                    self.suggestions(&col.concept),
                ));
            }
        }
        for col in &datasource.columns {
            if let Some(c) = self.concepts.get_mut(&col.concept) {
                if c.derivation == Derivation::Constant {
                    log::debug!("{} is bound on {}, promoting to root", c.address, datasource.name);
                    c.lineage = None;
                    c.derivation = Derivation::Root;
                }
            }
        }
        log::debug!("adding datasource {}", datasource.identifier());
        self.datasources
            .insert(datasource.identifier(), datasource);
        self.touch();
        Ok(())
    }

    /// Addresses backed by at least one datasource, directly or through a
    /// pseudonym.
    pub fn materialized_concepts(&self) -> &BTreeSet<Address> {
        self.materialized.get_or_init(|| {
            let mut bound: BTreeSet<Address> = self
                .datasources
                .values()
                .flat_map(|ds| ds.output_concepts().cloned())
                .collect();
            let via_pseudonym: Vec<Address> = self
                .concepts
                .iter()
                .filter(|(_, c)| c.pseudonyms.iter().any(|p| bound.contains(p)))
                .map(|(k, _)| k.clone())
                .collect();
            bound.extend(via_pseudonym);
            bound
        })
    }

    pub fn is_materialized(&self, address: &str) -> bool {
        self.materialized_concepts().contains(address)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge `source` into `target`.
    ///
    /// Every concept, grain and datasource column referencing `source` is
    /// rewritten to `target`, and each side is recorded as a pseudonym of the
    /// other. Returns false when the merge was already applied.
    pub fn merge_concept(&mut self, source: &str, target: &str, modifiers: &[Modifier]) -> Result<bool> {
        self.check_mutable()?;
        let source = qualify(source);
        let target = qualify(target);
        if source == target {
            return Ok(false);
        }
        if self.alias_origin.contains_key(&source)
            && self.concepts.get(&source).is_some_and(|c| c.address == target)
        {
            return Ok(false);
        }
        let original = self.require(&source)?.clone();
        self.require(&target)?;
        log::debug!("merging {} into {}", source, target);

        for (key, concept) in self.concepts.iter_mut() {
            if *key == source {
                continue;
            }
            *concept = concept.with_merge(&source, &target);
        }
        for ds in self.datasources.values_mut() {
            ds.merge_concept(&source, &target, modifiers);
        }
        let target_concept = match self.concepts.get_mut(&target) {
            Some(t) => {
                t.pseudonyms.insert(source.clone());
                t.pseudonyms.extend(original.pseudonyms.iter().filter(|p| **p != target).cloned());
                t.clone()
            }
            None => return Err(Error::undefined(target, Vec::new())),
        };
        let mut origin = original;
        origin.pseudonyms.insert(target.clone());
        self.alias_origin.insert(source.clone(), origin);
        self.concepts.insert(source, target_concept);
        self.touch();
        Ok(true)
    }

    /// Merge every concept under `source_ns` into the concept of the same
    /// name under `target_ns`.
    pub fn merge_namespace(&mut self, source_ns: &str, target_ns: &str, modifiers: &[Modifier]) -> Result<usize> {
        let pairs: Vec<(Address, Address)> = self
            .concepts_in_namespace(source_ns)
            .map(|c| (c.address.clone(), format!("{}.{}", target_ns, c.name)))
            .filter(|(_, t)| self.concepts.contains_key(t))
            .collect();
        let mut merged = 0;
        for (s, t) in pairs {
            if self.merge_concept(&s, &t, modifiers)? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    // ========================================================================
    // Imports
    // ========================================================================

    /// Copy another environment in under `alias`.
    ///
    /// Importing under the current namespace flattens the source into this
    /// environment without renaming.
    pub fn add_import(&mut self, alias: &str, source: &Environment, path: Option<&str>) -> Result<()> {
        self.check_mutable()?;
        let flatten = alias == self.namespace;
        log::debug!(
            "importing {} concepts under {}{}",
            source.concepts.len(),
            alias,
            if flatten { " (flattened)" } else { "" }
        );
        let rekey = |address: &str| {
            if flatten {
                address.to_string()
            } else {
                address_with_namespace(address, alias)
            }
        };
        for (key, concept) in &source.concepts {
            let moved = if flatten {
                concept.clone()
            } else {
                concept.with_namespace(alias)
            };
            self.concepts.insert(rekey(key), moved);
        }
        for (key, concept) in &source.alias_origin {
            let moved = if flatten {
                concept.clone()
            } else {
                concept.with_namespace(alias)
            };
            self.alias_origin.insert(rekey(key), moved);
        }
        for ds in source.datasources.values() {
            let moved = if flatten {
                ds.clone()
            } else {
                ds.with_namespace(alias)
            };
            self.datasources.insert(moved.identifier(), moved);
        }
        for (nested, nested_path) in &source.imports {
            self.imports.insert(rekey(nested), nested_path.clone());
        }
        self.imports.insert(alias.to_string(), path.map(str::to_string));
        self.touch();
        Ok(())
    }

    // ========================================================================
    // Rowsets and multiselects
    // ========================================================================

    /// Register a named sub-select. Its outputs are exposed as `name.<concept>`.
    pub fn add_rowset(&mut self, name: &str, select: &SelectStatement) -> Result<Vec<Address>> {
        self.check_mutable()?;
        select.validate(&*self)?;
        for local in &select.local_concepts {
            if !self.concepts.contains_key(&local.address) {
                self.add_concept(local.clone())?;
            }
        }
        let lineage = RowsetLineage {
            name: name.to_string(),
            select: select.as_lineage(),
        };
        let outputs = select.output_components();
        let mapped: BTreeMap<Address, Address> = outputs
            .iter()
            .map(|o| (o.clone(), address_with_namespace(o, name)))
            .collect();
        let inner_grain = select.grain(&*self)?;
        let rowset_grain = Grain::new(
            inner_grain
                .components
                .iter()
                .map(|c| mapped.get(c).cloned().unwrap_or_else(|| address_with_namespace(c, name))),
        );

        let mut created = Vec::new();
        for output in &outputs {
            let address = mapped[output].clone();
            let mut concept = Concept::derived(
                &address,
                Lineage::Rowset(RowsetItem {
                    content: output.clone(),
                    rowset: Box::new(lineage.clone()),
                }),
                &*self,
            )?;
            let keys_inside = concept
                .keys
                .as_ref()
                .is_some_and(|k| !k.is_empty() && k.iter().all(|a| mapped.contains_key(a)));
            if keys_inside {
                concept.keys = concept
                    .keys
                    .map(|k| k.iter().map(|a| mapped[a].clone()).collect());
                concept.grain.rewrite_addresses(&mut |a| mapped.get(a).cloned());
            } else {
                concept.keys = Some(BTreeSet::new());
                concept.grain = if concept.purpose == Purpose::Key {
                    Grain::new([address.clone()])
                } else {
                    rowset_grain.clone()
                };
            }
            created.push(address);
            self.concepts.insert(concept.address.clone(), concept);
        }
        log::debug!("registered rowset {} with {} outputs", name, created.len());
        self.touch();
        Ok(created)
    }

    /// Register the outputs of a multiselect under its namespace.
    ///
    /// Aligned outputs become keys of the merged result; every other output
    /// is exposed under the namespace with its original purpose.
    pub fn add_multiselect(&mut self, multi: &MultiSelectStatement) -> Result<Vec<Address>> {
        self.check_mutable()?;
        for select in &multi.selects {
            select.validate(&*self)?;
            for local in &select.local_concepts {
                if !self.concepts.contains_key(&local.address) {
                    self.add_concept(local.clone())?;
                }
            }
        }
        let lineage = multi.as_lineage();
        let aligned = multi.align_addresses();
        let grain = Grain::new(aligned.iter().cloned());
        let mut created = Vec::new();
        for address in &aligned {
            let concept = Concept::derived(address, Lineage::MultiSelect(lineage.clone()), &*self)?;
            created.push(concept.address.clone());
            self.concepts.insert(concept.address.clone(), concept);
        }
        for select in &multi.selects {
            for output in select.output_components() {
                if lineage.find_alignment(&output).is_some() {
                    continue;
                }
                let source = {
                    let local = select.local_map();
                    let scoped = Scoped {
                        local: &local,
                        parent: &*self,
                    };
                    scoped.require(&output)?.clone()
                };
                let address = address_with_namespace(&output, &multi.namespace);
                let mut concept =
                    Concept::derived(&address, Lineage::MultiSelect(lineage.clone()), &*self)?;
                concept.datatype = source.datatype.clone();
                concept.purpose = match source.purpose {
                    Purpose::Key => Purpose::Property,
                    other => other,
                };
                concept.keys = Some(grain.components.clone());
                concept.grain = grain.clone();
                concept.modifiers = source.modifiers.clone();
                created.push(address.clone());
                self.concepts.insert(address, concept);
            }
        }
        self.touch();
        Ok(created)
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Environment> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ConceptLookup for Environment {
    fn lookup(&self, address: &str) -> Option<&Concept> {
        self.concepts.get(address)
    }

    fn suggestions(&self, address: &str) -> Vec<String> {
        suggest(address, self.concepts.keys())
    }

    fn fail_on_missing(&self) -> bool {
        self.fail_on_missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::datasource::DatasourceAddress;
    use crate::model::enums::FunctionType;
    use crate::model::expr::{concept, lit};
    use crate::model::lineage::Function;
    use crate::model::types::DataType;

    fn orders() -> Environment {
        let mut env = Environment::new();
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::key("customer_id", DataType::Integer)).unwrap();
        env.add_concept(Concept::property("revenue", DataType::Float, &["order_id"]))
            .unwrap();
        env.add_datasource(
            Datasource::new("orders", DatasourceAddress::table("orders"))
                .column("id", "order_id")
                .column("customer", "customer_id")
                .column("amount", "revenue"),
        )
        .unwrap();
        env
    }

    #[test]
    fn test_undefined_concept_suggests_near_names() {
        let env = orders();
        let err = env.concept("revenu").unwrap_err();
        match err {
            Error::UndefinedConcept { suggestions, .. } => {
                assert_eq!(suggestions, vec!["local.revenue".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_conflicting_redeclaration_rejected() {
        let mut env = orders();
        let upper = Concept::derived(
            "revenue",
            Lineage::Function(Function::new(FunctionType::Abs, vec![concept("order_id")])),
            &env,
        )
        .unwrap();
        assert!(env.add_concept(upper).is_err());
        // same definition is accepted
        env.add_concept(Concept::key("order_id", DataType::Integer)).unwrap();
    }

    #[test]
    fn test_frozen_environment_rejects_mutation() {
        let mut env = orders();
        env.freeze();
        assert!(matches!(
            env.add_concept(Concept::key("x", DataType::Integer)),
            Err(Error::FrozenEnvironment)
        ));
        assert!(matches!(
            env.merge_concept("customer_id", "order_id", &[]),
            Err(Error::FrozenEnvironment)
        ));
        assert!(!env.duplicate().is_frozen());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut env = orders();
        env.add_concept(Concept::key("client_id", DataType::Integer)).unwrap();
        assert!(env.merge_concept("client_id", "customer_id", &[]).unwrap());
        let once = env.concepts.clone();
        assert!(!env.merge_concept("client_id", "customer_id", &[]).unwrap());
        assert_eq!(once, env.concepts);

        let target = env.concept("customer_id").unwrap();
        assert!(target.pseudonyms.contains("local.client_id"));
        assert_eq!(env.concept("client_id").unwrap().address, "local.customer_id");
        assert!(env.alias_origin["local.client_id"]
            .pseudonyms
            .contains("local.customer_id"));
    }

    #[test]
    fn test_merge_rewrites_datasource_columns() {
        let mut env = orders();
        env.add_concept(Concept::key("buyer_id", DataType::Integer)).unwrap();
        env.merge_concept("customer_id", "buyer_id", &[Modifier::Partial])
            .unwrap();
        let ds = &env.datasources["orders"];
        assert!(ds.column_for("local.buyer_id").unwrap().is_partial());
        assert!(env.is_materialized("local.buyer_id"));
    }

    #[test]
    fn test_materialized_cache_tracks_mutation() {
        let mut env = orders();
        env.add_concept(Concept::property("status", DataType::String, &["order_id"]))
            .unwrap();
        assert!(!env.is_materialized("local.status"));
        env.add_datasource(
            Datasource::new("order_status", DatasourceAddress::table("order_status"))
                .column("id", "order_id")
                .column("status", "status"),
        )
        .unwrap();
        assert!(env.is_materialized("local.status"));
    }

    #[test]
    fn test_bound_constant_becomes_root() {
        let mut env = orders();
        env.add_concept(Concept::constant("region", "emea")).unwrap();
        env.add_datasource(
            Datasource::new("regions", DatasourceAddress::table("regions")).column("r", "region"),
        )
        .unwrap();
        let region = env.concept("region").unwrap();
        assert_eq!(region.derivation, Derivation::Root);
        assert!(region.lineage.is_none());
    }

    #[test]
    fn test_import_namespaces_everything() {
        let source = orders();
        let mut env = Environment::new();
        env.add_import("sales", &source, Some("sales.preql")).unwrap();
        let revenue = env.concept("sales.revenue").unwrap();
        assert_eq!(revenue.keys.as_ref().unwrap().iter().next().unwrap(), "sales.order_id");
        let ds = &env.datasources["sales_orders"];
        assert!(ds.column_for("sales.customer_id").is_some());
        assert!(env.is_materialized("sales.order_id"));
    }

    #[test]
    fn test_import_under_own_namespace_flattens() {
        let source = orders();
        let mut env = Environment::new();
        env.add_import("local", &source, None).unwrap();
        assert!(env.concept("local.revenue").is_ok());
        assert!(env.datasources.contains_key("orders"));
    }

    #[test]
    fn test_rowset_outputs_are_namespaced() {
        let mut env = orders();
        let select = SelectStatement::new(&["order_id", "revenue"])
            .with_where(concept("revenue").gt(lit(10)));
        let created = env.add_rowset("big", &select).unwrap();
        assert_eq!(created, vec!["big.order_id", "big.revenue"]);
        let revenue = env.concept("big.revenue").unwrap();
        assert_eq!(revenue.derivation, Derivation::Rowset);
        assert_eq!(revenue.keys, Some(BTreeSet::from(["big.order_id".to_string()])));
        assert_eq!(env.concept("big.order_id").unwrap().grain, Grain::new(["big.order_id"]));
    }

    #[test]
    fn test_non_strict_defers_missing_reference() {
        let env = Environment::new().non_strict();
        let c = Concept::derived(
            "later",
            Lineage::Function(Function::new(FunctionType::Upper, vec![concept("name")])),
            &env,
        )
        .unwrap();
        assert!(c.unresolved.contains("local.name"));
    }

    #[test]
    fn test_json_round_trip_keeps_identity() {
        let env = orders();
        let restored = Environment::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(restored.concepts, env.concepts);
        assert_eq!(restored.datasources, env.datasources);
        assert!(restored.is_materialized("local.revenue"));
    }
}
