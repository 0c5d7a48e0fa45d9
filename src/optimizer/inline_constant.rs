use super::OptimizationRule;
use crate::error::Result;
use crate::model::{BuildConcept, Derivation, FunctionType, Lineage};
use crate::plan::{cte_lookup, Cte};

/// Write literal constants in place instead of reading them from the
/// constant CTE.
pub struct InlineConstant;

fn is_literal_constant(c: &BuildConcept) -> bool {
    c.derivation == Derivation::Constant
        && matches!(&c.lineage, Some(Lineage::Function(f)) if f.operator == FunctionType::Constant)
}

impl OptimizationRule for InlineConstant {
    fn name(&self) -> &'static str {
        "InlineConstant"
    }

    fn optimize(&self, ctes: &mut Vec<Cte>) -> Result<bool> {
        let mut found: Vec<(usize, BuildConcept)> = Vec::new();
        {
            let lookup = cte_lookup(ctes);
            for (idx, cte) in ctes.iter().enumerate() {
                for (address, sources) in &cte.source_map {
                    if sources.is_empty() {
                        continue;
                    }
                    if let Some(c) = cte.get_concept(address, &lookup) {
                        if is_literal_constant(&c) {
                            found.push((idx, c));
                        }
                    }
                }
            }
        }
        let mut changed = false;
        for (idx, concept) in found {
            if ctes[idx].inline_constant(&concept) {
                log::trace!("[OPTIMIZER] inlined constant {} in {}", concept.address, ctes[idx].name);
                changed = true;
            }
        }
        Ok(changed)
    }
}
