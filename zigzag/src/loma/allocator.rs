use crate::common::{LayerOperand, Loop, LoopSizes, MappingDict, MemoryOperand, UnrollFactor};
use crate::hardware::cores::Core;
use crate::hardware::memory_level::MemoryLevel;
use crate::loma::LomaError;
use crate::mapping::spatial_internal::SpatialMappingInternal;
use crate::mapping::temporal::TemporalMapping;
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;

/// Assigns the loops of one temporal ordering to the memories of a core, bottom-up.
///
/// Every memory takes, for each operand it stores, the innermost unallocated loops such that the
/// operand tiles still fit and the number of accesses to the memory above is minimal.
pub struct MemoryAllocator<'a> {
    layer: &'a LayerNode,
    core: &'a Core,
    spatial: &'a SpatialMappingInternal,
    operands: Vec<(LayerOperand, MemoryOperand)>,
    unallocated: IndexMap<MemoryOperand, Vec<Loop>>,
    allocated: IndexMap<MemoryOperand, Vec<Loop>>,
    mem_level: IndexMap<LayerOperand, usize>,
    mapping: MappingDict,
}

impl<'a> MemoryAllocator<'a> {
    /// `ordering` lists the temporal loops innermost first.
    pub fn new(
        layer: &'a LayerNode,
        core: &'a Core,
        spatial: &'a SpatialMappingInternal,
        ordering: &[Loop],
    ) -> Self {
        let operands: Vec<(LayerOperand, MemoryOperand)> = layer
            .memory_operand_links
            .iter()
            .map(|(op, mem_op)| (op.clone(), *mem_op))
            .collect();
        let unallocated = operands
            .iter()
            .map(|(_, mem_op)| (*mem_op, ordering.to_vec()))
            .collect();
        let allocated = operands
            .iter()
            .map(|(op, mem_op)| (*mem_op, spatial.unrolling(op, 0).to_vec()))
            .collect();
        let mem_level = operands.iter().map(|(op, _)| (op.clone(), 1)).collect();
        let mapping = operands
            .iter()
            .map(|(op, _)| (op.clone(), Vec::new()))
            .collect();
        MemoryAllocator {
            layer,
            core,
            spatial,
            operands,
            unallocated,
            allocated,
            mem_level,
            mapping,
        }
    }

    pub fn run(mut self) -> Result<TemporalMapping, LomaError> {
        let hierarchy = &self.core.memory_hierarchy;
        let top_levels: IndexMap<MemoryOperand, usize> = self
            .operands
            .iter()
            .filter_map(|(_, mem_op)| hierarchy.top_level(*mem_op).map(|l| (*mem_op, l.id)))
            .collect();
        for node in hierarchy.levels() {
            self.allocate_node(node, &top_levels)?;
        }
        Ok(TemporalMapping::new(self.mapping, self.layer)?)
    }

    fn layer_operand(&self, mem_op: MemoryOperand) -> Option<&LayerOperand> {
        self.operands
            .iter()
            .find(|(_, m)| *m == mem_op)
            .map(|(op, _)| op)
    }

    fn allocate_node(
        &mut self,
        node: &MemoryLevel,
        top_levels: &IndexMap<MemoryOperand, usize>,
    ) -> Result<(), LomaError> {
        let mem_ops: Vec<MemoryOperand> = node
            .operands
            .iter()
            .copied()
            .filter(|m| self.unallocated.contains_key(m))
            .collect();
        let mut all_sizes = Vec::with_capacity(mem_ops.len());
        for &mem_op in &mem_ops {
            all_sizes.push(self.size_slices(mem_op, node)?);
        }
        let best = self.best_loop_combination(&mem_ops, all_sizes, node, top_levels)?;

        for (idx, mem_op) in best.into_iter().zip(mem_ops) {
            let Some(op) = self.layer_operand(mem_op).cloned() else {
                continue;
            };
            let Some(unallocated) = self.unallocated.get_mut(&mem_op) else {
                continue;
            };
            let loops: Vec<Loop> = unallocated.drain(..idx).collect();
            let remaining = unallocated.len();
            let level = self.mem_level.get(&op).copied().unwrap_or(1);
            let spatial_above = self.spatial.unrolling(&op, level);
            if let Some(allocated) = self.allocated.get_mut(&mem_op) {
                allocated.extend(loops.iter().cloned());
                allocated.extend(spatial_above.iter().cloned());
            }
            if let Some(levels) = self.mapping.get_mut(&op) {
                levels.push(loops);
            }
            if top_levels.get(&mem_op) == Some(&node.id) && remaining > 0 {
                return Err(LomaError::HierarchyTooSmall {
                    memory: node.name().to_owned(),
                    mem_op,
                });
            }
            self.mem_level.insert(op, level + 1);
        }
        Ok(())
    }

    /// The precision `mem_op` is stored with at the current level. The output is kept at partial
    /// precision while some irrelevant loop, spatial or temporal, still waits above.
    fn precision(&self, mem_op: MemoryOperand, op: &LayerOperand) -> u32 {
        if !mem_op.is_output() {
            return self.layer.precision(op);
        }
        let irrelevant = self.layer.relevancy.ir_dims(op);
        let level = self.mem_level.get(op).copied().unwrap_or(1);
        let spatial_above = self.spatial.unrolling_from(op, level);
        let temporal_above = self.unallocated.get(&mem_op).map_or(&[][..], Vec::as_slice);
        let accumulating = spatial_above
            .iter()
            .chain(temporal_above)
            .any(|(d, _)| irrelevant.contains(d));
        if accumulating {
            self.layer.precision(op)
        } else {
            self.layer.final_output_precision()
        }
    }

    /// Bits needed for the allocated loops plus each prefix of the unallocated ones, stopping at
    /// the first prefix that no longer fits.
    fn size_slices(
        &self,
        mem_op: MemoryOperand,
        node: &MemoryLevel,
    ) -> Result<Vec<UnrollFactor>, LomaError> {
        let (Some(op), Some(allocated), Some(unallocated)) = (
            self.layer_operand(mem_op),
            self.allocated.get(&mem_op),
            self.unallocated.get(&mem_op),
        ) else {
            return Ok(Vec::new());
        };
        let precision = f64::from(self.precision(mem_op, op));
        let capacity = node.instance.size as f64;
        let mut sizes = Vec::with_capacity(unallocated.len() + 1);
        for i in 0..=unallocated.len() {
            let loops = allocated.iter().chain(&unallocated[..i]);
            let size = self.loops_size(loops, op) * precision;
            if size <= capacity {
                sizes.push(size);
            } else if i == 0 {
                return Err(LomaError::MemoryTooSmall {
                    memory: node.name().to_owned(),
                    mem_op,
                    required: size.ceil() as u64,
                    capacity: node.instance.size,
                });
            } else {
                break;
            }
        }
        Ok(sizes)
    }

    fn loops_size<'l>(&self, loops: impl Iterator<Item = &'l Loop>, op: &LayerOperand) -> f64 {
        let mut sizes = LoopSizes::new();
        for (dim, size) in loops {
            *sizes.entry(dim.clone()).or_insert(1.0) *= size;
        }
        self.layer.calc_tensor_size(op, &sizes)
    }

    /// Picks, per operand, how many unallocated loops go to `node`. Among the combinations that fit
    /// together, the one with the fewest accesses to the levels above wins; on ties, the last.
    fn best_loop_combination(
        &self,
        mem_ops: &[MemoryOperand],
        mut all_sizes: Vec<Vec<UnrollFactor>>,
        node: &MemoryLevel,
        top_levels: &IndexMap<MemoryOperand, usize>,
    ) -> Result<Vec<usize>, LomaError> {
        let capacity = node.instance.size as f64;
        let mut offsets = vec![0; mem_ops.len()];
        let mut all_accesses = Vec::with_capacity(mem_ops.len());
        for (k, &mem_op) in mem_ops.iter().enumerate() {
            let is_top = top_levels.get(&mem_op) == Some(&node.id);
            // The top level must take every remaining loop.
            if is_top {
                offsets[k] = all_sizes[k].len().saturating_sub(1);
                let last = all_sizes[k].last().copied();
                all_sizes[k] = last.into_iter().collect();
            }
            let unallocated = self.unallocated.get(&mem_op).map_or(&[][..], Vec::as_slice);
            let accesses: Vec<f64> = all_sizes[k]
                .iter()
                .enumerate()
                .map(|(i, size)| {
                    if is_top {
                        return 0.0;
                    }
                    let above = unallocated
                        .get(i + offsets[k]..)
                        .unwrap_or(&[])
                        .iter()
                        .map(|(_, s)| s)
                        .product::<f64>();
                    above * size
                })
                .collect();
            all_accesses.push(accesses);
        }

        let radices: Vec<usize> = all_sizes.iter().map(Vec::len).collect();
        let nb_combinations: usize = radices.iter().product();
        let mut best = vec![0; mem_ops.len()];
        let mut best_accesses = f64::INFINITY;
        for i in 0..nb_combinations {
            let mut size = 0.0;
            let mut accesses = 0.0;
            let mut current = Vec::with_capacity(mem_ops.len());
            for k in 0..mem_ops.len() {
                let stride: usize = radices[k + 1..].iter().product();
                let idx = (i / stride) % radices[k];
                current.push(idx + offsets[k]);
                size += all_sizes[k][idx];
                accesses += all_accesses[k][idx];
            }
            if size > capacity {
                if i == 0 {
                    return Err(LomaError::MemoryTooSmall {
                        memory: node.name().to_owned(),
                        mem_op: mem_ops[0],
                        required: size.ceil() as u64,
                        capacity: node.instance.size,
                    });
                }
                continue;
            }
            if accesses <= best_accesses {
                best_accesses = accesses;
                best = current;
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LayerDim;
    use crate::hardware::presets;
    use crate::mapping::spatial_internal::tests::{dict, gemm_sm};
    use crate::workload::layer::tests::gemm_attrs;

    fn loops(entries: &[(&str, f64)]) -> Vec<Loop> {
        entries.iter().map(|(d, s)| (LayerDim::new(d), *s)).collect()
    }

    #[test]
    fn test_gemm_allocation_fills_the_register_first() {
        let acc = presets::gemm_l1().unwrap();
        let core = acc.get_core(1).unwrap();
        let layer = LayerNode::new(0, "gemm", gemm_attrs(16, 16, 16)).unwrap();
        let spatial = SpatialMappingInternal::new(gemm_sm(), &layer).unwrap();
        let ordering = loops(&[("K", 2.0), ("M", 2.0), ("N", 2.0)]);
        let tm = MemoryAllocator::new(&layer, core, &spatial, &ordering)
            .run()
            .unwrap();
        let o = LayerOperand::new("O");
        // Two partial sums of 16 bits fill the 32-bit register exactly.
        assert_eq!(tm.mapping[&o][0], loops(&[("K", 2.0), ("M", 2.0)]));
        assert_eq!(tm.mapping[&o].len(), 3);
        assert_eq!(tm.total_cycle, 8);
        for levels in tm.mapping.values() {
            let flat: Vec<Loop> = levels.iter().flatten().cloned().collect();
            assert_eq!(flat, ordering);
        }
    }

    #[test]
    fn test_spatial_unrolling_overflowing_the_register() {
        let acc = presets::gemm_l1().unwrap();
        let core = acc.get_core(1).unwrap();
        let layer = LayerNode::new(0, "gemm", gemm_attrs(16, 16, 16)).unwrap();
        // Eight distinct outputs under reg_O need 128 bits.
        let sm = dict(&[
            ("O", &[&[("M", 8.0)], &[("N", 8.0), ("K", 8.0)], &[], &[]]),
            ("A", &[&[("M", 8.0), ("N", 8.0), ("K", 8.0)], &[], &[]]),
            ("B", &[&[("M", 8.0), ("N", 8.0), ("K", 8.0)], &[], &[]]),
        ]);
        let spatial = SpatialMappingInternal::new(sm, &layer).unwrap();
        let ordering = loops(&[("K", 2.0), ("M", 2.0), ("N", 2.0)]);
        let err = MemoryAllocator::new(&layer, core, &spatial, &ordering)
            .run()
            .unwrap_err();
        match err {
            LomaError::MemoryTooSmall {
                memory,
                required,
                capacity,
                ..
            } => {
                assert_eq!(memory, "reg_O");
                assert_eq!(required, 128);
                assert_eq!(capacity, 32);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
