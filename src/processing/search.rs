//! The concept search loop.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;

use super::history::History;
use super::join::padding;
use super::nodes::{group_required_for, NodeKind, StrategyNode};
use super::{addresses, pseudonym_related, unique_concepts};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::graph::ReferenceGraph;
use crate::model::{
    Address, BuildConcept, BuildEnvironment, Derivation, Factory, FunctionType, Granularity,
    OrderBy, SelectLineage, SelectStatement, WhereClause,
};
use crate::plan::QueryDatasource;

/// Derivations resolved by their own generator; once tried they are never
/// offered to another generator as an optional extra.
const SKIP_DERIVATIONS: &[Derivation] = &[
    Derivation::Aggregate,
    Derivation::Filter,
    Derivation::Window,
    Derivation::Unnest,
    Derivation::Rowset,
    Derivation::Basic,
    Derivation::Multiselect,
    Derivation::Union,
    Derivation::GroupTo,
    Derivation::Recursive,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchConfig {
    /// Recursion limit for nested searches.
    pub max_depth: usize,
    /// How many alternative join paths to try before declaring ambiguity.
    pub ambiguity_check_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_depth: 30,
            ambiguity_check_limit: 20,
        }
    }
}

/// The state of a stack of candidate nodes against the search targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Complete,
    /// Every target is present but the nodes share no join keys.
    Disconnected,
    Incomplete,
    /// Every target is present but the conditions cannot be applied.
    IncompleteCondition,
}

#[derive(Debug)]
struct StackState {
    status: ValidationResult,
    found: BTreeSet<Address>,
    partial: BTreeSet<Address>,
    virtual_outputs: BTreeSet<Address>,
}

/// What a select asks for, in address form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryTarget {
    pub outputs: Vec<Address>,
    pub hidden: BTreeSet<Address>,
    pub where_clause: Option<WhereClause>,
    pub having_clause: Option<WhereClause>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
}

impl QueryTarget {
    /// Ordering arguments are already projected, since validation rejects
    /// any that are not.
    pub fn from_statement(select: &SelectStatement) -> Self {
        Self {
            outputs: select.output_components(),
            hidden: select.hidden_components(),
            where_clause: select.where_clause.clone(),
            having_clause: select.having_clause.clone(),
            order_by: select.order_by.clone(),
            limit: select.limit,
        }
    }

    pub fn from_lineage(select: &SelectLineage) -> Self {
        Self {
            outputs: select.selection.clone(),
            hidden: BTreeSet::new(),
            where_clause: select.where_clause.clone(),
            having_clause: select.having_clause.clone(),
            order_by: select.order_by.clone(),
            limit: select.limit,
        }
    }
}

/// Resolves target concepts into strategy nodes against one build
/// environment.
pub struct Searcher<'a> {
    pub(crate) authoring: &'a Environment,
    pub(crate) env: &'a BuildEnvironment,
    pub(crate) graph: ReferenceGraph,
    pub(crate) history: History,
    pub(crate) config: SearchConfig,
}

impl<'a> Searcher<'a> {
    pub fn new(authoring: &'a Environment, env: &'a BuildEnvironment, config: SearchConfig) -> Self {
        Self {
            authoring,
            env,
            graph: ReferenceGraph::from_environment(env),
            history: History::new(),
            config,
        }
    }

    pub fn environment(&self) -> &BuildEnvironment {
        self.env
    }

    /// Find a node producing every `mandatory` concept with `conditions`
    /// applied. `None` when no combination of sources works.
    pub fn search_concepts(
        &mut self,
        mandatory: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
        accept_partial: bool,
    ) -> Result<Option<StrategyNode>> {
        if depth > self.config.max_depth {
            return Err(Error::syntax(format!(
                "Maximum recursion depth of {} exceeded resolving {}",
                self.config.max_depth,
                addresses(mandatory).join(", ")
            )));
        }
        if let Some(hit) = self.history.get_history(mandatory, accept_partial, conditions) {
            log::debug!("{}[SEARCH] history hit for {}", padding(depth), addresses(mandatory).join(", "));
            return Ok(hit);
        }
        let result = self.search_inner(mandatory, depth, conditions, accept_partial)?;
        self.history
            .search_to_history(mandatory, accept_partial, result.clone(), conditions);
        Ok(result)
    }

    fn search_inner(
        &mut self,
        targets: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
        accept_partial: bool,
    ) -> Result<Option<StrategyNode>> {
        let original = unique_concepts(targets.iter().cloned());
        let row_args: Vec<Address> = conditions.map(|c| c.row_arguments()).unwrap_or_default();
        let mut completion = original.clone();
        for a in &row_args {
            if !completion.iter().any(|c| c.matches(a)) {
                completion.push(self.env.concept(a)?.clone());
            }
        }
        // A derived concept the condition reads has to be computed below
        // the filter, so the whole completion is searched together.
        let must_evaluate_here = conditions.is_some()
            && original
                .iter()
                .any(|c| !c.derivation.is_root_like() && row_args.contains(&c.address));
        let mandatory = if must_evaluate_here {
            completion.clone()
        } else {
            original.clone()
        };
        let should_evaluate_here = conditions.is_some()
            && row_args.iter().all(|a| mandatory.iter().any(|m| m.matches(a)))
            && !mandatory
                .iter()
                .any(|c| !c.derivation.is_root_like() && !row_args.contains(&c.address));
        log::info!(
            "{}[SEARCH] depth {} for {} (partial: {}, conditions: {})",
            padding(depth),
            depth,
            addresses(&mandatory).join(", "),
            accept_partial,
            conditions.map(|c| c.to_string()).unwrap_or_else(|| "none".into())
        );

        let mut stack: Vec<StrategyNode> = Vec::new();
        let mut attempted: BTreeSet<Address> = BTreeSet::new();
        let mut skip: BTreeSet<Address> = BTreeSet::new();
        let mut state = StackState {
            status: ValidationResult::Incomplete,
            found: BTreeSet::new(),
            partial: BTreeSet::new(),
            virtual_outputs: BTreeSet::new(),
        };
        loop {
            let remaining: Vec<&BuildConcept> = mandatory
                .iter()
                .filter(|c| !attempted.contains(&c.address) && !state.found.contains(&c.address))
                .collect();
            if remaining.is_empty() {
                break;
            }
            let priority = self.priority_concept(&remaining, depth).clone();
            let candidates = self.candidates(&priority, &mandatory, &skip, conditions)?;
            let mut local_conditions = if !must_evaluate_here && !should_evaluate_here {
                conditions
            } else {
                None
            };
            if conditions.is_some()
                && !priority.derivation.is_root_like()
                && !row_args.contains(&priority.address)
            {
                local_conditions = conditions;
            }
            log::info!(
                "{}[SEARCH] priority {} ({}) with optional [{}]",
                padding(depth),
                priority.address,
                priority.derivation,
                addresses(&candidates).join(", ")
            );
            let node = self.generate_node(&priority, &candidates, depth + 1, local_conditions, accept_partial)?;
            if let Some(node) = node {
                node.resolve(self.env)?;
                stack.push(node);
            }
            if SKIP_DERIVATIONS.contains(&priority.derivation) {
                skip.insert(priority.address.clone());
            }
            attempted.insert(priority.address.clone());
            state = self.validate_stack(&stack, &mandatory, &completion, conditions, accept_partial)?;
            log::debug!(
                "{}[SEARCH] stack of {} is {:?}",
                padding(depth),
                stack.len(),
                state.status
            );
            match state.status {
                ValidationResult::IncompleteCondition => {
                    return Err(Error::syntax(format!(
                        "Could not apply conditions {} while resolving {}",
                        conditions.map(|c| c.to_string()).unwrap_or_default(),
                        addresses(&mandatory).join(", ")
                    )));
                }
                ValidationResult::Complete if !accept_partial || state.partial.is_empty() => break,
                _ => {}
            }
            if priority.derivation == Derivation::Root {
                break;
            }
        }

        if state.status == ValidationResult::Complete {
            let node = self.finish_stack(
                stack,
                &original,
                &mandatory,
                &completion,
                conditions,
                &state.virtual_outputs,
                depth,
            )?;
            log::info!("{}[SEARCH] resolved {} as {}", padding(depth), addresses(&original).join(", "), node);
            return Ok(Some(node));
        }
        if !accept_partial {
            log::info!(
                "{}[SEARCH] retrying {} with partial sources",
                padding(depth),
                addresses(&original).join(", ")
            );
            return self.search_concepts(&original, depth, conditions, true);
        }
        log::info!(
            "{}[SEARCH] could not resolve {} ({:?})",
            padding(depth),
            addresses(&original).join(", "),
            state.status
        );
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_stack(
        &mut self,
        mut stack: Vec<StrategyNode>,
        original: &[BuildConcept],
        mandatory: &[BuildConcept],
        completion: &[BuildConcept],
        conditions: Option<&WhereClause>,
        virtual_outputs: &BTreeSet<Address>,
        depth: usize,
    ) -> Result<StrategyNode> {
        let injected = completion.len() != original.len();
        let satisfied = conditions.map_or(true, |c| {
            stack
                .iter()
                .all(|n| n.preexisting_conditions.as_ref() == Some(&c.conditional))
        });
        let condition_required = conditions.is_some() && !satisfied;
        let pool = if condition_required { completion } else { mandatory };
        let non_virtual: Vec<BuildConcept> = pool
            .iter()
            .filter(|c| !virtual_outputs.contains(&c.address))
            .cloned()
            .collect();
        let original_addresses: BTreeSet<Address> = addresses(original).into_iter().collect();

        let mut output = if stack.len() == 1 {
            let mut only = stack.remove(0);
            if injected && !condition_required {
                let keep: Vec<BuildConcept> = only
                    .output_concepts
                    .iter()
                    .filter(|c| original_addresses.contains(&c.address))
                    .cloned()
                    .collect();
                only.set_output_concepts(keep);
            }
            only
        } else {
            StrategyNode::merge(non_virtual.clone(), non_virtual, stack).with_depth(depth)
        };

        match conditions {
            Some(where_clause) if condition_required => {
                let needs_existence = !where_clause.existence_arguments().is_empty();
                if needs_existence && !matches!(output.kind, NodeKind::Merge { .. }) {
                    let outputs = output.usable_outputs();
                    output = StrategyNode::merge(outputs.clone(), outputs, vec![output]).with_depth(depth);
                }
                output.add_condition(where_clause.conditional.clone());
                self.append_existence_check(&mut output, where_clause, depth)?;
            }
            Some(where_clause) => {
                output.preexisting_conditions = Some(where_clause.conditional.clone());
            }
            None => {}
        }

        if condition_required && injected {
            let resolved = output.resolve(self.env)?;
            let target_refs: Vec<&BuildConcept> = original.iter().collect();
            let target = self.env.grain_of(&target_refs);
            if group_required_for(self.env, &target, std::slice::from_ref(&resolved)) {
                log::info!("{}[SEARCH] grouping back to {}", padding(depth), target);
                let partial = output
                    .partial_concepts
                    .iter()
                    .filter(|p| original_addresses.contains(*p))
                    .cloned()
                    .collect();
                return Ok(StrategyNode::group(original.to_vec(), original.to_vec(), vec![output])
                    .with_partials(partial)
                    .with_preexisting(conditions.map(|c| c.conditional.clone()))
                    .with_depth(depth));
            }
            let extra: Vec<Address> = output
                .usable_addresses()
                .into_iter()
                .filter(|a| !original_addresses.contains(a))
                .collect();
            output.hide_output_concepts(&extra);
        }
        Ok(output)
    }

    fn validate_stack(
        &self,
        stack: &[StrategyNode],
        mandatory: &[BuildConcept],
        completion: &[BuildConcept],
        conditions: Option<&WhereClause>,
        accept_partial: bool,
    ) -> Result<StackState> {
        let mut found: BTreeSet<Address> = BTreeSet::new();
        let mut partial: BTreeSet<Address> = BTreeSet::new();
        let mut non_partial: BTreeSet<Address> = BTreeSet::new();
        let mut virtual_outputs: BTreeSet<Address> = BTreeSet::new();
        let mut per_node: Vec<BTreeSet<Address>> = Vec::with_capacity(stack.len());
        for node in stack {
            let resolved = node.resolve(self.env)?;
            let mut local = BTreeSet::new();
            for c in &resolved.output_concepts {
                if resolved.hidden_concepts.contains(&c.address) {
                    continue;
                }
                let is_partial = node.partial_concepts.contains(&c.address)
                    || resolved.partial_concepts.contains(&c.address);
                for name in std::iter::once(&c.address).chain(c.pseudonyms.iter()) {
                    if is_partial {
                        partial.insert(name.clone());
                        if accept_partial {
                            found.insert(name.clone());
                            local.insert(name.clone());
                        }
                    } else {
                        non_partial.insert(name.clone());
                        found.insert(name.clone());
                        local.insert(name.clone());
                    }
                }
            }
            for v in &node.virtual_output_concepts {
                virtual_outputs.insert(v.clone());
                found.insert(v.clone());
            }
            per_node.push(local);
        }
        partial.retain(|p| !non_partial.contains(p));
        let mut state = StackState {
            status: ValidationResult::Incomplete,
            found,
            partial,
            virtual_outputs,
        };
        if !mandatory.iter().all(|c| state.found.contains(&c.address)) {
            return Ok(state);
        }
        let conditions_met = match conditions {
            None => true,
            Some(c) => {
                stack
                    .iter()
                    .all(|n| n.preexisting_conditions.as_ref() == Some(&c.conditional))
                    || completion.iter().all(|c| state.found.contains(&c.address))
            }
        };
        if !conditions_met {
            state.status = ValidationResult::IncompleteCondition;
            return Ok(state);
        }
        state.status = if self.components(&per_node) <= 1 {
            ValidationResult::Complete
        } else {
            ValidationResult::Disconnected
        };
        Ok(state)
    }

    /// Count groups of nodes linked through shared join-relevant concepts.
    fn components(&self, per_node: &[BTreeSet<Address>]) -> usize {
        let relevant = |a: &Address| {
            self.env.get(a).map_or(true, |c| {
                c.granularity != Granularity::SingleRow && !(c.is_aggregate && c.grain.is_abstract())
            })
        };
        let sets: Vec<BTreeSet<&Address>> = per_node
            .iter()
            .map(|s| s.iter().filter(|a| relevant(a)).collect())
            .collect();
        let active: Vec<usize> = (0..sets.len()).filter(|i| !sets[*i].is_empty()).collect();
        let mut parent: Vec<usize> = (0..sets.len()).collect();
        fn find(parent: &mut [usize], i: usize) -> usize {
            let mut root = i;
            while parent[root] != root {
                root = parent[root];
            }
            parent[i] = root;
            root
        }
        for (x, &i) in active.iter().enumerate() {
            for &j in &active[x + 1..] {
                if !sets[i].is_disjoint(&sets[j]) {
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    parent[ri] = rj;
                }
            }
        }
        active
            .iter()
            .map(|&i| find(&mut parent, i))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Pick the next concept to resolve: the most derived first, and never
    /// one another remaining concept is built from.
    fn priority_concept<'c>(&self, remaining: &[&'c BuildConcept], depth: usize) -> &'c BuildConcept {
        let rank = |c: &BuildConcept| -> u8 {
            if c.derivation == Derivation::Constant && c.granularity == Granularity::SingleRow {
                return 0;
            }
            match c.derivation {
                Derivation::Multiselect => 1,
                Derivation::Rowset => 2,
                Derivation::Union => 3,
                Derivation::Aggregate => 4,
                Derivation::Window => 5,
                Derivation::Filter => 6,
                Derivation::Unnest => 7,
                Derivation::Recursive => 8,
                Derivation::GroupTo => 9,
                Derivation::Basic => 10,
                Derivation::Root => 11,
                Derivation::Constant => 12,
            }
        };
        let sorted: Vec<&'c BuildConcept> = remaining
            .iter()
            .copied()
            .sorted_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.address.cmp(&b.address)))
            .collect();
        let upstream: BTreeMap<&str, BTreeSet<Address>> = sorted
            .iter()
            .map(|c| (c.address.as_str(), self.upstream_of(c)))
            .collect();
        for candidate in &sorted {
            let delayed = sorted.iter().any(|other| {
                other.address != candidate.address
                    && upstream
                        .get(other.address.as_str())
                        .is_some_and(|u| u.contains(&candidate.address))
            });
            if delayed {
                log::debug!(
                    "{}[SEARCH] delaying {}, another target derives from it",
                    padding(depth),
                    candidate.address
                );
                continue;
            }
            return candidate;
        }
        sorted[0]
    }

    fn upstream_of(&self, concept: &BuildConcept) -> BTreeSet<Address> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<Address> = concept.concept_arguments();
        while let Some(next) = queue.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(c) = self.env.get(&next) {
                queue.extend(c.concept_arguments());
            }
        }
        seen
    }

    fn candidates(
        &self,
        priority: &BuildConcept,
        mandatory: &[BuildConcept],
        skip: &BTreeSet<Address>,
        conditions: Option<&WhereClause>,
    ) -> Result<Vec<BuildConcept>> {
        if priority.granularity == Granularity::SingleRow {
            // Constants share one node; other single-row values stand alone.
            if priority.derivation != Derivation::Constant {
                return Ok(Vec::new());
            }
            return Ok(mandatory
                .iter()
                .filter(|c| c.address != priority.address && c.derivation == Derivation::Constant)
                .cloned()
                .collect());
        }
        let mut out = Vec::new();
        if let Some(c) = conditions {
            if priority.derivation.is_root_like() {
                for a in c.row_arguments() {
                    if a != priority.address {
                        out.push(self.env.concept(&a)?.clone());
                    }
                }
            }
        }
        for c in mandatory {
            if c.address == priority.address
                || skip.contains(&c.address)
                || c.granularity == Granularity::SingleRow
                || pseudonym_related(c, priority)
            {
                continue;
            }
            out.push(c.clone());
        }
        Ok(unique_concepts(out))
    }

    pub(crate) fn generate_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
        accept_partial: bool,
    ) -> Result<Option<StrategyNode>> {
        match concept.derivation {
            Derivation::Window => self.gen_window_node(concept, optional, depth, conditions),
            Derivation::Filter => self.gen_filter_node(concept, optional, depth, conditions),
            Derivation::Unnest => self.gen_unnest_node(concept, optional, depth, conditions),
            Derivation::Union => self.gen_union_node(concept, optional, depth, conditions),
            Derivation::Recursive => self.gen_recursive_node(concept, optional, depth, conditions),
            Derivation::Aggregate => self.gen_group_node(concept, optional, depth, conditions),
            Derivation::GroupTo => self.gen_group_to_node(concept, optional, depth, conditions),
            Derivation::Basic if concept.function().map(|f| f.operator) == Some(FunctionType::Group) => {
                self.gen_group_to_node(concept, optional, depth, conditions)
            }
            Derivation::Basic => self.gen_basic_node(concept, optional, depth, conditions),
            Derivation::Rowset => self.gen_rowset_node(concept, optional, depth, conditions),
            Derivation::Multiselect => self.gen_multiselect_node(concept, optional, depth, conditions),
            Derivation::Constant => self.gen_constant_node(concept, optional, depth, conditions),
            Derivation::Root => self.gen_root_node(concept, optional, depth, conditions, accept_partial),
        }
    }

    fn gen_root_node(
        &mut self,
        concept: &BuildConcept,
        optional: &[BuildConcept],
        depth: usize,
        conditions: Option<&WhereClause>,
        accept_partial: bool,
    ) -> Result<Option<StrategyNode>> {
        let mut targets = vec![concept.clone()];
        targets.extend(optional.iter().cloned());
        if optional.iter().any(|o| !o.derivation.is_root_like()) {
            if !self.history.check_started(&targets, accept_partial, None) {
                self.history.log_start(&targets, accept_partial, None);
                log::info!(
                    "{}[GEN_ROOT_NODE] derived optionals, searching {} together",
                    padding(depth),
                    addresses(&targets).join(", ")
                );
                return self.search_concepts(&targets, depth, None, accept_partial);
            }
            targets.retain(|c| c.derivation.is_root_like());
        }
        if let Some(node) = self.cached_select_node(&targets, depth, accept_partial, conditions)? {
            return Ok(Some(node));
        }
        if let Some(node) = self.gen_merge_node(&targets, depth, accept_partial, conditions)? {
            return Ok(Some(node));
        }
        self.gen_synonym_node(&targets, depth, accept_partial, conditions)
    }

    fn cached_select_node(
        &mut self,
        targets: &[BuildConcept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&WhereClause>,
    ) -> Result<Option<StrategyNode>> {
        if let Some(hit) = self.history.get_select(targets, accept_partial, conditions) {
            return Ok(hit);
        }
        let node = self.gen_select_node(targets, depth, accept_partial, conditions)?;
        self.history
            .select_to_history(targets, accept_partial, node.clone(), conditions);
        Ok(node)
    }

    /// Attach subselect sources for each membership test in `where_clause`
    /// that `node` cannot already answer.
    pub(crate) fn append_existence_check(
        &mut self,
        node: &mut StrategyNode,
        where_clause: &WhereClause,
        depth: usize,
    ) -> Result<()> {
        for args in where_clause.existence_arguments() {
            if args
                .iter()
                .all(|a| node.input_concepts.iter().any(|i| i.matches(a)))
            {
                continue;
            }
            log::info!(
                "{}[SEARCH] sourcing existence check on {}",
                padding(depth),
                args.join(", ")
            );
            let concepts = self.env.concepts_for(&args)?;
            let mut parent = self.source_query_concepts(&concepts, None)?;
            let extra: Vec<Address> = parent
                .usable_addresses()
                .into_iter()
                .filter(|a| !args.contains(a))
                .collect();
            parent.hide_output_concepts(&extra);
            node.add_parents(vec![parent]);
            node.add_existence_concepts(concepts);
        }
        Ok(())
    }

    /// Resolve `outputs` at their own grain.
    pub fn source_query_concepts(
        &mut self,
        outputs: &[BuildConcept],
        conditions: Option<&WhereClause>,
    ) -> Result<StrategyNode> {
        if outputs.is_empty() {
            return Err(Error::syntax("Cannot source an empty concept list"));
        }
        let Some(root) = self.search_concepts(outputs, 0, conditions, false)? else {
            return Err(Error::UnresolvableQuery {
                targets: addresses(outputs),
            });
        };
        let resolved = root.resolve(self.env)?;
        let refs: Vec<&BuildConcept> = outputs.iter().collect();
        let target = self.env.grain_of(&refs);
        if group_required_for(self.env, &target, std::slice::from_ref(&resolved)) {
            let usable: Vec<BuildConcept> = root
                .usable_outputs()
                .into_iter()
                .filter(|c| outputs.iter().any(|o| o.address == c.address))
                .collect();
            let partial = root.partial_concepts.clone();
            return Ok(StrategyNode::group(usable.clone(), usable, vec![root])
                .with_partials(partial)
                .with_preexisting(conditions.map(|c| c.conditional.clone())));
        }
        Ok(root)
    }

    /// Build the node tree for a whole select.
    pub fn get_query_node(&mut self, target: &QueryTarget) -> Result<StrategyNode> {
        let outputs = self.env.concepts_for(&target.outputs)?;
        let mut node = match &target.where_clause {
            Some(where_clause) => self.filtered_query_node(&outputs, where_clause)?,
            None => self.source_query_concepts(&outputs, None)?,
        };
        if let Some(having) = &target.having_clause {
            let usable = node.usable_outputs();
            node = StrategyNode::new(NodeKind::Basic, usable.clone(), usable, vec![node])
                .with_conditions(Some(having.conditional.clone()));
        }
        node.hide_output_concepts(&target.hidden.iter().cloned().collect::<Vec<_>>());
        Ok(node)
    }

    fn filtered_query_node(&mut self, outputs: &[BuildConcept], where_clause: &WhereClause) -> Result<StrategyNode> {
        let missing: Vec<Address> = where_clause
            .row_arguments()
            .into_iter()
            .filter(|a| !outputs.iter().any(|o| o.matches(a)))
            .collect();
        let all_aggregate = !missing.is_empty()
            && missing
                .iter()
                .all(|a| self.env.get(a).is_some_and(|c| c.is_aggregate));
        // An aggregate applies the filter below its grouping.
        let filters_inside = outputs.iter().any(|o| o.derivation == Derivation::Aggregate);
        if missing.is_empty() || all_aggregate || filters_inside {
            return self.source_query_concepts(outputs, Some(where_clause));
        }
        // Filter on concepts outside the projection: search them together,
        // then reduce back to the projection.
        let mut search: Vec<BuildConcept> = outputs.to_vec();
        search.extend(self.env.concepts_for(&missing)?);
        let search = unique_concepts(search);
        let Some(mut root) = self.search_concepts(&search, 0, Some(where_clause), false)? else {
            return Err(Error::UnresolvableQuery {
                targets: addresses(&search),
            });
        };
        let resolved = root.resolve(self.env)?;
        let refs: Vec<&BuildConcept> = outputs.iter().collect();
        let target = self.env.grain_of(&refs);
        if group_required_for(self.env, &target, std::slice::from_ref(&resolved)) {
            return Ok(StrategyNode::group(outputs.to_vec(), outputs.to_vec(), vec![root])
                .with_preexisting(Some(where_clause.conditional.clone())));
        }
        root.hide_output_concepts(&missing);
        Ok(root)
    }

    /// Plan a nested select in its own build environment and return the
    /// resolved datasource.
    pub(crate) fn plan_select(&self, select: &SelectLineage) -> Result<QueryDatasource> {
        let statement = SelectStatement::from(select);
        let grain = statement.grain(self.authoring)?;
        let inner_env = Factory::new(self.authoring, grain).build_environment()?;
        let mut inner = Searcher::new(self.authoring, &inner_env, self.config.clone());
        let node = inner.get_query_node(&QueryTarget::from_lineage(select))?;
        let mut resolved = node.resolve(&inner_env)?;
        resolved.ordering = select.order_by.clone();
        resolved.limit = select.limit;
        Ok(resolved)
    }
}
