use crate::common::{LayerDim, LayerOperand};
use crate::workload::equation::{DimRelation, Equation};
use crate::workload::WorkloadError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The partially relevant dimensions of a layer: each maps to the two loop dimensions it is an
/// affine combination of, along with their coefficients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrLoops {
    pairs: IndexMap<LayerDim, [LayerDim; 2]>,
    scaling: IndexMap<LayerDim, [u64; 2]>,
    /// Every dimension taking part in some relation, in relation order.
    involved: Vec<LayerDim>,
}

impl PrLoops {
    pub fn from_relations(relations: &[DimRelation]) -> Result<Self, WorkloadError> {
        let mut pr = PrLoops::default();
        for relation in relations {
            let [(c1, a), (c2, b)] = &relation.terms;
            if pr
                .pairs
                .insert(relation.dim.clone(), [a.clone(), b.clone()])
                .is_some()
            {
                return Err(WorkloadError::DuplicateRelation(relation.dim.clone()));
            }
            pr.scaling.insert(relation.dim.clone(), [*c1, *c2]);
            pr.involved
                .extend([relation.dim.clone(), a.clone(), b.clone()]);
        }
        Ok(pr)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pair(&self, dim: &LayerDim) -> Option<&[LayerDim; 2]> {
        self.pairs.get(dim)
    }

    pub fn scaling(&self, dim: &LayerDim) -> Option<[u64; 2]> {
        self.scaling.get(dim).copied()
    }

    pub fn contains(&self, dim: &LayerDim) -> bool {
        self.pairs.contains_key(dim)
    }

    pub fn involves(&self, dim: &LayerDim) -> bool {
        self.involved.contains(dim)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&LayerDim, &[LayerDim; 2])> {
        self.pairs.iter()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Relevancy {
    Relevant,
    Irrelevant,
    PartiallyRelevant,
}

/// Per-operand classification of layer dimensions into relevant, irrelevant and partially
/// relevant sets.
///
/// Dimensions of size 1 are left out of the r and ir sets unless the operand is indexed by a
/// partially relevant dimension, in which case only the ir set is filtered.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LoopRelevancy {
    r: IndexMap<LayerOperand, Vec<LayerDim>>,
    ir: IndexMap<LayerOperand, Vec<LayerDim>>,
    pr: IndexMap<LayerOperand, IndexMap<LayerDim, [LayerDim; 2]>>,
}

impl LoopRelevancy {
    pub fn extract(
        equation: &Equation,
        dim_sizes: &IndexMap<LayerDim, u64>,
        pr_loops: &PrLoops,
    ) -> Self {
        let mut relevancy = LoopRelevancy::default();
        let not_unit = |d: &LayerDim| dim_sizes.get(d).copied().unwrap_or(1) != 1;
        for op in equation.operands() {
            let r_list = equation.dims_of(op);
            let ir_list = dim_sizes
                .keys()
                .filter(|d| !r_list.contains(d))
                .cloned()
                .collect::<Vec<_>>();
            let (r, ir, pr) = if r_list.iter().any(|d| pr_loops.contains(d)) {
                (
                    r_list
                        .iter()
                        .filter(|d| !pr_loops.involves(d))
                        .cloned()
                        .collect(),
                    ir_list
                        .into_iter()
                        .filter(|d| !pr_loops.involves(d) && not_unit(d))
                        .collect(),
                    pr_loops
                        .pairs()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            } else {
                (
                    r_list.iter().filter(|d| not_unit(d)).cloned().collect(),
                    ir_list.into_iter().filter(not_unit).collect(),
                    IndexMap::new(),
                )
            };
            relevancy.r.insert(op.clone(), r);
            relevancy.ir.insert(op.clone(), ir);
            relevancy.pr.insert(op.clone(), pr);
        }
        relevancy
    }

    /// The relevancy used once partially relevant loops are decoupled: every partially relevant
    /// dimension `X` contributes a relevant `X_r` and an irrelevant `X_ir` virtual dimension to
    /// every operand.
    pub fn decoupled(&self, pr_loops: &PrLoops) -> Self {
        let mut out = self.clone();
        for op in self.r.keys() {
            for (pr_dim, _) in pr_loops.pairs() {
                out.r[op].push(pr_dim.r_version());
                out.ir[op].push(pr_dim.ir_version());
            }
        }
        out
    }

    pub fn r_dims(&self, op: &LayerOperand) -> &[LayerDim] {
        self.r.get(op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ir_dims(&self, op: &LayerOperand) -> &[LayerDim] {
        self.ir.get(op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pr_dims(&self, op: &LayerOperand) -> Option<&IndexMap<LayerDim, [LayerDim; 2]>> {
        self.pr.get(op).filter(|m| !m.is_empty())
    }

    pub fn is_r(&self, op: &LayerOperand, dim: &LayerDim) -> bool {
        self.r_dims(op).contains(dim)
    }

    pub fn is_ir(&self, op: &LayerOperand, dim: &LayerDim) -> bool {
        self.ir_dims(op).contains(dim)
    }

    pub fn classify(&self, op: &LayerOperand, dim: &LayerDim) -> Option<Relevancy> {
        if self.is_r(op, dim) {
            Some(Relevancy::Relevant)
        } else if self.pr_dims(op).is_some_and(|pr| {
            pr.contains_key(dim) || pr.values().any(|pair| pair.contains(dim))
        }) {
            Some(Relevancy::PartiallyRelevant)
        } else if self.is_ir(op, dim) {
            Some(Relevancy::Irrelevant)
        } else {
            None
        }
    }
}
