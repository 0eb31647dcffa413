use crate::common::{LayerDim, LayerOperand, LoopSizes, MemoryOperand, UnrollFactor};
use crate::loma::ordering::TemporalOrdering;
use crate::mapping::spatial::{SpatialMapping, SpatialMappingHint};
use crate::workload::equation::{DimRelation, Equation};
use crate::workload::relevancy::{LoopRelevancy, PrLoops};
use crate::workload::WorkloadError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything needed to build a [LayerNode], as provided by the workload and mapping inputs.
#[derive(Debug, Clone, Default)]
pub struct LayerAttributes {
    pub operator_type: Option<String>,
    pub equation: Option<Equation>,
    pub dimension_relations: Vec<DimRelation>,
    pub loop_dim_size: IndexMap<LayerDim, u64>,
    /// Bit widths per operand. The key `O_final` gives the precision of the final output.
    pub operand_precision: IndexMap<LayerOperand, u32>,
    pub constant_operands: Vec<LayerOperand>,
    pub operand_source: IndexMap<LayerOperand, Vec<usize>>,
    pub memory_operand_links: IndexMap<LayerOperand, MemoryOperand>,
    pub padding: IndexMap<LayerDim, (u64, u64)>,
    pub pr_loop_dim_size: IndexMap<LayerDim, u64>,
    pub core_allocation: Vec<usize>,
    pub spatial_mapping: Option<SpatialMapping>,
    pub spatial_mapping_hint: SpatialMappingHint,
    pub temporal_ordering: TemporalOrdering,
}

/// A single layer of a workload. Immutable once built.
#[derive(Debug, Clone)]
pub struct LayerNode {
    pub id: usize,
    pub name: String,
    pub operator_type: Option<String>,
    pub equation: Equation,
    pub dimension_relations: Vec<DimRelation>,
    pub loop_dim_size: IndexMap<LayerDim, u64>,
    pub operand_precision: IndexMap<LayerOperand, u32>,
    pub constant_operands: Vec<LayerOperand>,
    pub operand_source: IndexMap<LayerOperand, Vec<usize>>,
    pub memory_operand_links: IndexMap<LayerOperand, MemoryOperand>,
    pub padding: IndexMap<LayerDim, (u64, u64)>,
    pub core_allocation: Vec<usize>,
    pub spatial_mapping: Option<SpatialMapping>,
    pub spatial_mapping_hint: SpatialMappingHint,
    pub temporal_ordering: TemporalOrdering,

    pub pr_loops: PrLoops,
    /// Upper bound on each partially relevant dimension, after padding.
    pub pr_layer_dim_sizes: IndexMap<LayerDim, u64>,
    pub relevancy: LoopRelevancy,
    pub decoupled_relevancy: LoopRelevancy,
    pub total_mac_count: u64,
    pub operand_size_elem: IndexMap<LayerOperand, u64>,
}

impl LayerNode {
    pub fn new(id: usize, name: &str, attrs: LayerAttributes) -> Result<Self, WorkloadError> {
        let err_layer = || name.to_owned();
        let Some(equation) = attrs.equation else {
            return Err(WorkloadError::Equation {
                layer: err_layer(),
                source: crate::workload::equation::EquationError::NoInputs(String::new()),
            });
        };

        for (dim, &size) in &attrs.loop_dim_size {
            if size == 0 {
                return Err(WorkloadError::ZeroSizedDimension {
                    layer: err_layer(),
                    dim: dim.clone(),
                });
            }
        }

        let pr_loops = PrLoops::from_relations(&attrs.dimension_relations)?;
        for (_, pair) in pr_loops.pairs() {
            for d in pair {
                if !attrs.loop_dim_size.contains_key(d) {
                    return Err(WorkloadError::UndefinedDimension {
                        layer: err_layer(),
                        dim: d.clone(),
                    });
                }
            }
        }
        for dim in equation.all_dims() {
            if !attrs.loop_dim_size.contains_key(&dim) && !pr_loops.contains(&dim) {
                return Err(WorkloadError::MissingRelation {
                    layer: err_layer(),
                    dim,
                });
            }
        }

        for op in equation.operands() {
            if !attrs.operand_precision.contains_key(op) {
                return Err(WorkloadError::MissingPrecision {
                    layer: err_layer(),
                    operand: op.clone(),
                });
            }
        }

        let memory_operand_links = if attrs.memory_operand_links.is_empty() {
            default_memory_operand_links(&equation, &attrs.constant_operands)
        } else {
            attrs.memory_operand_links
        };
        for op in equation.operands() {
            if !memory_operand_links.contains_key(op) {
                return Err(WorkloadError::MissingMemoryOperandLink {
                    layer: err_layer(),
                    operand: op.clone(),
                });
            }
        }
        let mut seen = Vec::new();
        for mem_op in memory_operand_links.values() {
            if seen.contains(mem_op) {
                return Err(WorkloadError::DuplicateMemoryOperandLink {
                    layer: err_layer(),
                    mem_op: *mem_op,
                });
            }
            seen.push(*mem_op);
        }

        for (dim, _) in attrs.spatial_mapping.iter().flat_map(|sm| sm.flatten()) {
            if !attrs.loop_dim_size.contains_key(dim) {
                log::warn!("Layer {name}: spatial mapping unrolls {dim}, which the layer does not have");
            }
        }

        let relevancy = LoopRelevancy::extract(&equation, &attrs.loop_dim_size, &pr_loops);
        let decoupled_relevancy = relevancy.decoupled(&pr_loops);

        let mut layer = LayerNode {
            id,
            name: name.to_owned(),
            operator_type: attrs.operator_type,
            equation,
            dimension_relations: attrs.dimension_relations,
            loop_dim_size: attrs.loop_dim_size,
            operand_precision: attrs.operand_precision,
            constant_operands: attrs.constant_operands,
            operand_source: attrs.operand_source,
            memory_operand_links,
            padding: attrs.padding,
            core_allocation: if attrs.core_allocation.is_empty() {
                vec![0]
            } else {
                attrs.core_allocation
            },
            spatial_mapping: attrs.spatial_mapping,
            spatial_mapping_hint: attrs.spatial_mapping_hint,
            temporal_ordering: attrs.temporal_ordering,
            pr_loops,
            pr_layer_dim_sizes: IndexMap::new(),
            relevancy,
            decoupled_relevancy,
            total_mac_count: 0,
            operand_size_elem: IndexMap::new(),
        };

        layer.pr_layer_dim_sizes = if attrs.pr_loop_dim_size.is_empty() {
            layer
                .pr_loops
                .pairs()
                .map(|(dim, _)| (dim.clone(), layer.pr_dimension_size_total(dim)))
                .collect()
        } else {
            attrs.pr_loop_dim_size
        };
        layer.total_mac_count = layer.loop_dim_size.values().product();
        let full_sizes = layer.full_loop_sizes();
        layer.operand_size_elem = layer
            .equation
            .operands()
            .map(|op| (op.clone(), layer.calc_tensor_size(op, &full_sizes) as u64))
            .collect();
        Ok(layer)
    }

    pub fn output_operand(&self) -> &LayerOperand {
        self.equation.output()
    }

    pub fn input_operands(&self) -> impl Iterator<Item = &LayerOperand> {
        self.equation.inputs()
    }

    /// All operands, output first.
    pub fn layer_operands(&self) -> impl Iterator<Item = &LayerOperand> {
        self.equation.operands()
    }

    pub fn layer_dims(&self) -> Vec<LayerDim> {
        self.loop_dim_size.keys().cloned().collect()
    }

    pub fn core_id(&self) -> usize {
        self.core_allocation.first().copied().unwrap_or(0)
    }

    pub fn is_output(&self, op: &LayerOperand) -> bool {
        op == self.output_operand()
    }

    pub fn memory_operand(&self, op: &LayerOperand) -> Option<MemoryOperand> {
        self.memory_operand_links.get(op).copied()
    }

    pub fn layer_operand(&self, mem_op: MemoryOperand) -> Option<&LayerOperand> {
        self.memory_operand_links
            .iter()
            .find(|(_, m)| **m == mem_op)
            .map(|(op, _)| op)
    }

    pub fn memory_operands(&self) -> impl Iterator<Item = MemoryOperand> + '_ {
        self.memory_operand_links.values().copied()
    }

    pub fn precision(&self, op: &LayerOperand) -> u32 {
        self.operand_precision.get(op).copied().unwrap_or(0)
    }

    /// The precision of the fully accumulated output, defaulting to the output precision.
    pub fn final_output_precision(&self) -> u32 {
        self.operand_precision
            .get(&LayerOperand::final_output())
            .copied()
            .unwrap_or_else(|| self.precision(self.output_operand()))
    }

    pub fn operand_size_bit(&self, op: &LayerOperand) -> u64 {
        self.operand_size_elem.get(op).copied().unwrap_or(0) * u64::from(self.precision(op))
    }

    pub fn full_loop_sizes(&self) -> LoopSizes {
        self.loop_dim_size
            .iter()
            .map(|(d, &s)| (d.clone(), s as f64))
            .collect()
    }

    /// The number of distinct indices `c = sa*a + sb*b` for `a` in `0..a_size`, `b` in
    /// `0..b_size`.
    pub fn pr_dimension_size(sa: u64, a_size: u64, sb: u64, b_size: u64) -> i64 {
        let g = crate::common::gcd(sa, sb).max(1) as f64;
        let (a, b) = (a_size as f64, b_size as f64);
        (a * b - f64::max(0.0, b - sa as f64 / g) * (a - sb as f64 / g)) as i64
    }

    fn pr_dimension_size_total(&self, dim: &LayerDim) -> u64 {
        let (Some([a, b]), Some([sa, sb])) = (self.pr_loops.pair(dim), self.pr_loops.scaling(dim))
        else {
            return 1;
        };
        let size = |d: &LayerDim| self.loop_dim_size.get(d).copied().unwrap_or(1);
        let total = Self::pr_dimension_size(sa, size(a), sb, size(b));
        let (before, after) = self.padding.get(dim).copied().unwrap_or((0, 0));
        (total - (before + after) as i64).max(1) as u64
    }

    /// The size of an operand dimension given loop sizes: looked up directly, derived through the
    /// dimension relation for partially relevant dimensions (bounded by the padded total), or 1
    /// when the loop is absent.
    pub fn calc_tensor_dim(&self, dim: &LayerDim, sizes: &LoopSizes) -> UnrollFactor {
        if let Some(&size) = sizes.get(dim) {
            return size;
        }
        if let (Some([a, b]), Some([sa, sb])) = (self.pr_loops.pair(dim), self.pr_loops.scaling(dim)) {
            let size = |d: &LayerDim| sizes.get(d).copied().unwrap_or(1.0) as u64;
            let pr_size = Self::pr_dimension_size(sa, size(a), sb, size(b)).max(0) as u64;
            let bound = self.pr_layer_dim_sizes.get(dim).copied().unwrap_or(u64::MAX);
            return pr_size.min(bound) as f64;
        }
        1.0
    }

    /// The number of elements of `op` touched by loops of the given sizes.
    pub fn calc_tensor_size(&self, op: &LayerOperand, sizes: &LoopSizes) -> UnrollFactor {
        let r = self.relevancy.r_dims(op).iter();
        let pr = self.relevancy.pr_dims(op).into_iter().flat_map(|m| m.keys());
        r.chain(pr).map(|d| self.calc_tensor_dim(d, sizes)).product()
    }
}

impl fmt::Display for LayerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Links the output to `O`; a constant input goes to `I2` and the other input to `I1`. Without
/// a constant input, inputs are linked to `I1` then `I2` in equation order.
fn default_memory_operand_links(
    equation: &Equation,
    constant_operands: &[LayerOperand],
) -> IndexMap<LayerOperand, MemoryOperand> {
    let mut links = IndexMap::new();
    links.insert(equation.output().clone(), MemoryOperand::O);
    let inputs: Vec<_> = equation.inputs().cloned().collect();
    let constant = inputs.iter().position(|op| constant_operands.contains(op));
    let mut free = vec![MemoryOperand::I1, MemoryOperand::I2];
    if let Some(c) = constant {
        if inputs.len() == 2 {
            links.insert(inputs[c].clone(), MemoryOperand::I2);
            free.retain(|m| *m != MemoryOperand::I2);
        }
    }
    for op in inputs {
        if links.contains_key(&op) {
            continue;
        }
        if free.is_empty() {
            break;
        }
        links.insert(op, free.remove(0));
    }
    links
}

/// Serializable summary of a layer, embedded in cost model results.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LayerSummary {
    pub id: usize,
    pub name: String,
    pub equation: String,
    pub equation_relations: Vec<String>,
    pub loop_dimensions: IndexMap<LayerDim, u64>,
    pub operand_precision: IndexMap<LayerOperand, u32>,
    pub core_allocation: Vec<usize>,
    pub memory_operand_links: IndexMap<LayerOperand, MemoryOperand>,
}

impl From<&LayerNode> for LayerSummary {
    fn from(layer: &LayerNode) -> Self {
        LayerSummary {
            id: layer.id,
            name: layer.name.clone(),
            equation: layer.equation.to_string(),
            equation_relations: layer
                .dimension_relations
                .iter()
                .map(ToString::to_string)
                .collect(),
            loop_dimensions: layer.loop_dim_size.clone(),
            operand_precision: layer.operand_precision.clone(),
            core_allocation: layer.core_allocation.clone(),
            memory_operand_links: layer.memory_operand_links.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn conv_attrs(k: u64, c: u64, oy: u64, ox: u64, fy: u64, fx: u64) -> LayerAttributes {
        let dims = |entries: &[(&str, u64)]| {
            entries
                .iter()
                .map(|(d, s)| (LayerDim::new(d), *s))
                .collect::<IndexMap<_, _>>()
        };
        LayerAttributes {
            operator_type: Some("Conv".to_owned()),
            equation: Some(
                "O[b][k][oy][ox]+=W[k][c][fy][fx]*I[b][c][iy][ix]"
                    .parse()
                    .unwrap(),
            ),
            dimension_relations: vec![
                "ix=1*ox+1*fx".parse().unwrap(),
                "iy=1*oy+1*fy".parse().unwrap(),
            ],
            loop_dim_size: dims(&[
                ("B", 1),
                ("K", k),
                ("C", c),
                ("OY", oy),
                ("OX", ox),
                ("FY", fy),
                ("FX", fx),
            ]),
            operand_precision: [("O", 16), ("O_final", 8), ("W", 8), ("I", 8)]
                .into_iter()
                .map(|(o, p)| (LayerOperand::new(o), p))
                .collect(),
            constant_operands: vec![LayerOperand::new("W")],
            ..Default::default()
        }
    }

    pub(crate) fn gemm_attrs(m: u64, k: u64, n: u64) -> LayerAttributes {
        LayerAttributes {
            operator_type: Some("Gemm".to_owned()),
            equation: Some("O[m][n]+=A[m][k]*B[k][n]".parse().unwrap()),
            loop_dim_size: [("M", m), ("K", k), ("N", n)]
                .into_iter()
                .map(|(d, s)| (LayerDim::new(d), s))
                .collect(),
            operand_precision: [("O", 16), ("O_final", 8), ("A", 8), ("B", 8)]
                .into_iter()
                .map(|(o, p)| (LayerOperand::new(o), p))
                .collect(),
            memory_operand_links: [
                ("O", MemoryOperand::O),
                ("B", MemoryOperand::I2),
                ("A", MemoryOperand::I1),
            ]
            .into_iter()
            .map(|(o, m)| (LayerOperand::new(o), m))
            .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_conv_layer_sizes() {
        let layer = LayerNode::new(0, "conv", conv_attrs(16, 8, 7, 7, 3, 3)).unwrap();
        assert_eq!(layer.total_mac_count, 16 * 8 * 7 * 7 * 3 * 3);
        assert_eq!(layer.pr_layer_dim_sizes[&LayerDim::new("IX")], 9);
        assert_eq!(layer.operand_size_elem[&LayerOperand::new("I")], 8 * 9 * 9);
        assert_eq!(layer.operand_size_elem[&LayerOperand::new("W")], 16 * 8 * 9);
        assert_eq!(layer.operand_size_elem[&LayerOperand::new("O")], 16 * 49);
        assert_eq!(layer.operand_size_bit(&LayerOperand::new("W")), 16 * 8 * 9 * 8);
        assert_eq!(layer.final_output_precision(), 8);
        assert_eq!(
            layer.memory_operand(&LayerOperand::new("W")),
            Some(MemoryOperand::I2)
        );
        assert_eq!(
            layer.memory_operand(&LayerOperand::new("I")),
            Some(MemoryOperand::I1)
        );
    }

    #[test]
    fn test_strided_pr_dimension_size() {
        // ix = 2*ox + 1*fx with OX = 4, FX = 3 spans 0..=8.
        assert_eq!(LayerNode::pr_dimension_size(2, 4, 1, 3), 9);
        // Unit stride: OX + FX - 1.
        assert_eq!(LayerNode::pr_dimension_size(1, 7, 1, 3), 9);
    }

    #[test]
    fn test_padding_reduces_pr_bound() {
        let mut attrs = conv_attrs(4, 4, 8, 8, 3, 3);
        attrs.padding.insert(LayerDim::new("IX"), (1, 1));
        let layer = LayerNode::new(0, "conv", attrs).unwrap();
        assert_eq!(layer.pr_layer_dim_sizes[&LayerDim::new("IX")], 8);
        assert_eq!(layer.pr_layer_dim_sizes[&LayerDim::new("IY")], 10);
    }

    #[test]
    fn test_missing_relation_is_rejected() {
        let mut attrs = conv_attrs(4, 4, 8, 8, 3, 3);
        attrs.dimension_relations.pop();
        assert!(matches!(
            LayerNode::new(0, "conv", attrs),
            Err(WorkloadError::MissingRelation { .. })
        ));
    }

    #[test]
    fn test_missing_precision_is_rejected() {
        let mut attrs = gemm_attrs(8, 8, 8);
        attrs.operand_precision.shift_remove(&LayerOperand::new("A"));
        assert!(matches!(
            LayerNode::new(0, "gemm", attrs),
            Err(WorkloadError::MissingPrecision { .. })
        ));
    }

    proptest! {
        #[test]
        fn test_pr_dimension_size_matches_enumeration(
            sa in 1u64..5, a in 1u64..8, b in 1u64..8
        ) {
            let mut seen = std::collections::HashSet::new();
            for i in 0..a {
                for j in 0..b {
                    seen.insert(sa * i + j);
                }
            }
            prop_assert_eq!(LayerNode::pr_dimension_size(sa, a, 1, b), seen.len() as i64);
        }

        #[test]
        fn test_total_mac_count_is_product_of_sizes(
            k in 1u64..16, c in 1u64..16, oy in 1u64..8, ox in 1u64..8, fy in 1u64..4, fx in 1u64..4
        ) {
            let layer = LayerNode::new(0, "conv", conv_attrs(k, c, oy, ox, fy, fx)).unwrap();
            prop_assert_eq!(layer.total_mac_count, k * c * oy * ox * fy * fx);
        }
    }
}
