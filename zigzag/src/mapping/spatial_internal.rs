use crate::common::{round_count, LayerOperand, Loop, MappingDict, UnrollFactor};
use crate::mapping::decouple::decouple_pr_loops;
use crate::mapping::MappingError;
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;

/// A spatial mapping attached to memory levels.
///
/// For each operand, entry `lv` holds the loops unrolled across the array dimensions served by
/// memory level `lv`; the extra last entry holds the loops over dimensions no memory serves.
/// Level-indexed vectors below therefore have one entry per memory level plus one, where index 0
/// stands for the operational array and index `lv + 1` for the instances of memory level `lv`.
#[derive(Debug, Clone)]
pub struct SpatialMappingInternal {
    pub mapping: MappingDict,
    /// [Self::mapping] with partially relevant loops decoupled.
    pub reformed: MappingDict,
    pub arch_level: IndexMap<LayerOperand, usize>,
    pub unroll_size_r: IndexMap<LayerOperand, Vec<UnrollFactor>>,
    pub unroll_size_ir: IndexMap<LayerOperand, Vec<UnrollFactor>>,
    pub unroll_size_total: IndexMap<LayerOperand, Vec<UnrollFactor>>,
    /// Number of unrolled instances at each level.
    pub unit_count: IndexMap<LayerOperand, Vec<u64>>,
    /// Number of instances at each level holding distinct data.
    pub unit_unique: IndexMap<LayerOperand, Vec<UnrollFactor>>,
    /// Number of instances at each level sharing the same data.
    pub unit_duplicate: IndexMap<LayerOperand, Vec<UnrollFactor>>,
    /// For inputs, how many units below receive each element; for the output, how many units
    /// below are reduced into each element. One entry less than the other level vectors.
    pub data_serve_scope: IndexMap<LayerOperand, Vec<UnrollFactor>>,
    /// Bandwidth multiplication between a level and the one above. One entry less than the other
    /// level vectors.
    pub mem_bw_boost: IndexMap<LayerOperand, Vec<u64>>,
    /// All spatial loops, without level information.
    pub spatial_loop_dim_size: Vec<Loop>,
}

impl SpatialMappingInternal {
    pub fn new(mapping: MappingDict, layer: &LayerNode) -> Result<Self, MappingError> {
        for op in layer.layer_operands() {
            if !mapping.contains_key(op) {
                return Err(MappingError::MissingOperand(op.clone()));
            }
        }
        let reformed = decouple_pr_loops(&mapping, layer);
        let arch_level: IndexMap<_, _> = mapping
            .iter()
            .map(|(op, levels)| (op.clone(), levels.len()))
            .collect();

        let mut unroll_size_r = IndexMap::new();
        let mut unroll_size_ir = IndexMap::new();
        let mut unroll_size_total = IndexMap::new();
        for (op, levels) in &reformed {
            let mut r = vec![1.0; levels.len()];
            let mut ir = vec![1.0; levels.len()];
            let mut total = vec![1.0; levels.len()];
            for (lv, loops) in levels.iter().enumerate() {
                for (dim, size) in loops {
                    if layer.decoupled_relevancy.is_r(op, dim) {
                        r[lv] *= size;
                    } else {
                        ir[lv] *= size;
                    }
                    total[lv] *= size;
                }
            }
            unroll_size_r.insert(op.clone(), r);
            unroll_size_ir.insert(op.clone(), ir);
            unroll_size_total.insert(op.clone(), total);
        }

        let suffix_products = |sizes: &[UnrollFactor]| -> Vec<UnrollFactor> {
            (0..sizes.len())
                .map(|lv| sizes[lv..].iter().product())
                .collect()
        };
        let unit_count: IndexMap<LayerOperand, Vec<u64>> = unroll_size_total
            .iter()
            .map(|(op, sizes)| {
                let counts = suffix_products(sizes).into_iter().map(round_count).collect();
                (op.clone(), counts)
            })
            .collect();
        let mut bottom = unit_count.iter().map(|(op, c)| (op, c.first().copied().unwrap_or(1)));
        if let Some((_, expected)) = bottom.next() {
            if let Some((op, found)) = bottom.find(|(_, c)| *c != expected) {
                return Err(MappingError::InconsistentUnitCount {
                    operand: op.clone(),
                    expected,
                    found,
                });
            }
        }

        let map_suffix = |sizes: &IndexMap<LayerOperand, Vec<UnrollFactor>>| {
            sizes
                .iter()
                .map(|(op, s)| (op.clone(), suffix_products(s)))
                .collect::<IndexMap<_, _>>()
        };
        let unit_unique = map_suffix(&unroll_size_r);
        let unit_duplicate = map_suffix(&unroll_size_ir);

        let data_serve_scope = unit_duplicate
            .iter()
            .map(|(op, dup)| (op.clone(), dup.windows(2).map(|w| w[0] / w[1]).collect()))
            .collect();
        let mem_bw_boost = unit_unique
            .iter()
            .map(|(op, unique)| {
                let boost = unique
                    .windows(2)
                    .map(|w| (w[0] / w[1]).round_ties_even().max(0.0) as u64)
                    .collect();
                (op.clone(), boost)
            })
            .collect();

        let spatial_loop_dim_size = layer
            .input_operands()
            .next()
            .or_else(|| mapping.keys().next())
            .and_then(|op| mapping.get(op))
            .map(|levels| levels.iter().flatten().cloned().collect())
            .unwrap_or_default();

        Ok(SpatialMappingInternal {
            mapping,
            reformed,
            arch_level,
            unroll_size_r,
            unroll_size_ir,
            unroll_size_total,
            unit_count,
            unit_unique,
            unit_duplicate,
            data_serve_scope,
            mem_bw_boost,
            spatial_loop_dim_size,
        })
    }

    /// The loops unrolled at `level` for `op`, 0 being the operational array.
    pub fn unrolling(&self, op: &LayerOperand, level: usize) -> &[Loop] {
        self.mapping
            .get(op)
            .and_then(|levels| levels.get(level))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All loops unrolled at `min_level` and above.
    pub fn unrolling_from(&self, op: &LayerOperand, min_level: usize) -> Vec<Loop> {
        self.mapping
            .get(op)
            .map(|levels| levels.iter().skip(min_level).flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn arch_level(&self, op: &LayerOperand) -> usize {
        self.arch_level.get(op).copied().unwrap_or(0)
    }

    /// The number of operational units, as unrolled by this mapping.
    pub fn mac_unit_count(&self) -> u64 {
        self.unit_count
            .values()
            .next()
            .and_then(|c| c.first().copied())
            .unwrap_or(1)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::LayerDim;
    use crate::workload::layer::tests::{conv_attrs, gemm_attrs};

    pub(crate) fn dict(entries: &[(&str, &[&[(&str, f64)]])]) -> MappingDict {
        entries
            .iter()
            .map(|(op, levels)| {
                (
                    LayerOperand::new(op),
                    levels
                        .iter()
                        .map(|l| l.iter().map(|(d, s)| (LayerDim::new(d), *s)).collect())
                        .collect(),
                )
            })
            .collect()
    }

    /// M, N and K unrolled 8 times each; O's register serves the K (reduction) column.
    pub(crate) fn gemm_sm() -> MappingDict {
        dict(&[
            ("O", &[&[("K", 8.0)], &[("M", 8.0), ("N", 8.0)], &[], &[]]),
            ("A", &[&[("M", 8.0), ("N", 8.0), ("K", 8.0)], &[], &[]]),
            ("B", &[&[("M", 8.0), ("N", 8.0), ("K", 8.0)], &[], &[]]),
        ])
    }

    #[test]
    fn test_gemm_unit_counts() {
        let layer = LayerNode::new(0, "gemm", gemm_attrs(32, 32, 32)).unwrap();
        let sm = SpatialMappingInternal::new(gemm_sm(), &layer).unwrap();
        let o = LayerOperand::new("O");
        let a = LayerOperand::new("A");
        assert_eq!(sm.unit_count[&o], [512, 64, 1, 1]);
        assert_eq!(sm.unit_count[&a], [512, 1, 1]);
        assert_eq!(sm.mac_unit_count(), 512);
        // A is indexed by M and K: 64 distinct values, each broadcast over N.
        assert_eq!(sm.unit_unique[&a][0], 64.0);
        assert_eq!(sm.unit_duplicate[&a][0], 8.0);
        assert_eq!(sm.data_serve_scope[&a], [8.0, 1.0]);
        // O is reduced over K below its register.
        assert_eq!(sm.mem_bw_boost[&o], [1, 64, 1]);
        assert_eq!(sm.data_serve_scope[&o][0], 8.0);
        assert_eq!(sm.spatial_loop_dim_size.len(), 3);
    }

    #[test]
    fn test_inconsistent_unit_count_is_rejected() {
        let layer = LayerNode::new(0, "gemm", gemm_attrs(32, 32, 32)).unwrap();
        let mut mapping = gemm_sm();
        mapping[&LayerOperand::new("A")][0].pop();
        assert!(matches!(
            SpatialMappingInternal::new(mapping, &layer),
            Err(MappingError::InconsistentUnitCount { .. })
        ));
    }

    #[test]
    fn test_conv_pr_unrolling_counts_unique_inputs() {
        let layer = LayerNode::new(0, "conv", conv_attrs(4, 4, 4, 4, 3, 3)).unwrap();
        let mapping = dict(&[
            ("O", &[&[], &[("OX", 4.0), ("FX", 3.0)]]),
            ("W", &[&[], &[("OX", 4.0), ("FX", 3.0)]]),
            ("I", &[&[], &[("OX", 4.0), ("FX", 3.0)]]),
        ]);
        let sm = SpatialMappingInternal::new(mapping, &layer).unwrap();
        let i = LayerOperand::new("I");
        // 12 units read 6 distinct input columns.
        assert_eq!(sm.unit_count[&i][0], 12);
        assert!((sm.unit_unique[&i][0] - 6.0).abs() < 1e-9);
        assert_eq!(sm.unit_unique[&LayerOperand::new("W")][0], 3.0);
    }
}
