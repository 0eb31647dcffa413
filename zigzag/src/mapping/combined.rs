//! Joint spatial and temporal mapping, and the per-level data movement it implies.

use crate::common::{round_half_even, LayerOperand, LevelLoops, MappingDict};
use crate::hardware::cores::Core;
use crate::hardware::memory_port::DataDirection;
use crate::mapping::data_movement::{DataMovePattern, FourWay};
use crate::mapping::decouple::decouple_pr_loops;
use crate::mapping::spatial_internal::SpatialMappingInternal;
use crate::mapping::temporal::TemporalMapping;
use crate::mapping::MappingError;
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;

/// A complete mapping of one layer. Hardware-unaware except for the optional same-data
/// optimization, which compares tile sizes with the read bandwidth of the innermost memories.
///
/// Level-indexed vectors have one entry per architectural level (the operational array, then
/// each memory level) unless noted otherwise.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub spatial: SpatialMappingInternal,
    pub temporal: TemporalMapping,
    /// Whether each output memory level (plus one extra `false` on top) holds partial sums.
    pub psum_flag: Vec<bool>,
    /// Element precision per memory level, plus one for the level above the top.
    pub data_precision: IndexMap<LayerOperand, Vec<u64>>,
    /// Elements held by each unrolled instance of a level.
    pub data_elem_per_level_unrolled: IndexMap<LayerOperand, Vec<u64>>,
    pub data_bit_per_level_unrolled: IndexMap<LayerOperand, Vec<u64>>,
    /// Elements held by all instances of a level together.
    pub data_elem_per_level: IndexMap<LayerOperand, Vec<u64>>,
    pub data_bit_per_level: IndexMap<LayerOperand, Vec<u64>>,
    /// Unrolled data divided by the outermost relevant loops: the part that must be present
    /// before the level can start serving.
    pub effective_data_elem: IndexMap<LayerOperand, Vec<u64>>,
    pub effective_data_bit: IndexMap<LayerOperand, Vec<u64>>,
    /// Indexed by memory level.
    pub unit_mem_data_movement: IndexMap<LayerOperand, Vec<DataMovePattern>>,
}

/// Loop sizes per level of one operand, split by relevancy.
struct LevelSizes {
    r_cabl: Vec<f64>,
    ir_cabl: Vec<f64>,
    ir_per_level: Vec<f64>,
}

impl LevelSizes {
    fn of(levels: &LevelLoops, op: &LayerOperand, layer: &LayerNode, count: usize) -> Self {
        let per_level = |relevant: bool| -> Vec<f64> {
            levels
                .iter()
                .take(count)
                .map(|loops| {
                    loops
                        .iter()
                        .filter(|(d, _)| {
                            if relevant {
                                layer.decoupled_relevancy.is_r(op, d)
                            } else {
                                layer.decoupled_relevancy.is_ir(op, d)
                            }
                        })
                        .map(|(_, s)| s)
                        .product()
                })
                .collect()
        };
        let cumulative = |sizes: &[f64]| -> Vec<f64> {
            let mut acc = 1.0;
            sizes
                .iter()
                .map(|s| {
                    acc *= s;
                    acc
                })
                .collect()
        };
        let r_per_level = per_level(true);
        let ir_per_level = per_level(false);
        LevelSizes {
            r_cabl: cumulative(&r_per_level)
                .into_iter()
                .map(round_half_even)
                .collect(),
            ir_cabl: cumulative(&ir_per_level),
            ir_per_level,
        }
    }
}

fn uint(x: f64) -> u64 {
    if x <= 0.0 {
        0
    } else {
        x as u64
    }
}

impl Mapping {
    /// Combines a spatial and a temporal mapping of `layer`.
    ///
    /// With `same_data_no_access`, repeated reads of the same input from the innermost memory
    /// count once when the whole tile fits in one read of `core`'s innermost memory.
    pub fn new(
        spatial: SpatialMappingInternal,
        temporal: TemporalMapping,
        layer: &LayerNode,
        core: &Core,
        same_data_no_access: bool,
    ) -> Result<Self, MappingError> {
        let operands: Vec<LayerOperand> = layer.layer_operands().cloned().collect();
        let output = layer.output_operand().clone();
        for op in &operands {
            let (arch, mem) = (spatial.arch_level(op), temporal.mem_level(op));
            if arch != mem + 1 {
                return Err(MappingError::LevelMismatch {
                    operand: op.clone(),
                    spatial: arch,
                    temporal: mem,
                });
            }
        }

        // 1s1t: each level's spatial loops on top of its own temporal loops.
        // 1s2t: each level's spatial loops on top of the temporal loops of the level above.
        let mut one_s_one_t = MappingDict::new();
        let mut one_s_two_t = MappingDict::new();
        for op in &operands {
            let arch = spatial.arch_level(op);
            let mut tm_seed: LevelLoops = vec![Vec::new()];
            tm_seed.extend(temporal.stationary[op].iter().cloned());
            tm_seed.push(Vec::new());
            let mut s1t: LevelLoops = Vec::with_capacity(arch);
            let mut s2t: LevelLoops = vec![Vec::new(); arch + 1];
            for lv in 0..arch {
                let su = spatial.unrolling(op, lv);
                s1t.push(tm_seed[lv].iter().chain(su).cloned().collect());
                s2t[lv + 1] = tm_seed[lv + 1].iter().chain(su).cloned().collect();
            }
            one_s_one_t.insert(op.clone(), s1t);
            one_s_two_t.insert(op.clone(), s2t);
        }
        let one_s_one_t = decouple_pr_loops(&one_s_one_t, layer);
        let one_s_two_t = decouple_pr_loops(&one_s_two_t, layer);

        let psum_flag = psum_flags(&one_s_one_t[&output], &output, layer);

        let mut data_precision = IndexMap::new();
        for op in &operands {
            let levels = temporal.mem_level(op) + 1;
            let precisions = if *op == output {
                psum_flag
                    .iter()
                    .take(levels)
                    .map(|&partial| {
                        if partial {
                            u64::from(layer.precision(op))
                        } else {
                            u64::from(layer.final_output_precision())
                        }
                    })
                    .collect()
            } else {
                vec![u64::from(layer.precision(op)); levels]
            };
            data_precision.insert(op.clone(), precisions);
        }

        let mut sizes = IndexMap::new();
        let mut sizes2 = IndexMap::new();
        for op in &operands {
            let arch = spatial.arch_level(op);
            sizes.insert(op.clone(), LevelSizes::of(&one_s_one_t[op], op, layer, arch));
            sizes2.insert(op.clone(), LevelSizes::of(&one_s_two_t[op], op, layer, arch));
        }
        let mut output_ir_caal: Vec<f64> = {
            let ir = &sizes[&output].ir_per_level;
            (0..ir.len()).map(|lv| ir[lv..].iter().product()).collect()
        };
        output_ir_caal.extend([1.0, 1.0]);

        let mut mapping = Mapping {
            spatial,
            temporal,
            psum_flag,
            data_precision,
            data_elem_per_level_unrolled: IndexMap::new(),
            data_bit_per_level_unrolled: IndexMap::new(),
            data_elem_per_level: IndexMap::new(),
            data_bit_per_level: IndexMap::new(),
            effective_data_elem: IndexMap::new(),
            effective_data_bit: IndexMap::new(),
            unit_mem_data_movement: IndexMap::new(),
        };
        mapping.calc_data_size(&operands, &sizes2);
        mapping.calc_data_access(layer, core, same_data_no_access, &sizes, &sizes2, &output_ir_caal);
        mapping.calc_req_mem_bw_and_data_transfer_rate(layer, same_data_no_access);
        for op in &operands {
            if let Some(top) = mapping
                .unit_mem_data_movement
                .get_mut(op)
                .and_then(|levels| levels.last_mut())
            {
                top.clear_direction(DataDirection::RdOutToHigh);
                top.clear_direction(DataDirection::WrInByHigh);
            }
        }
        Ok(mapping)
    }

    fn calc_data_size(&mut self, operands: &[LayerOperand], sizes2: &IndexMap<LayerOperand, LevelSizes>) {
        for op in operands {
            let precision = &self.data_precision[op];
            let unique = &self.spatial.unit_unique[op];
            let top_r = &self.temporal.top_r_loop_size[op];
            let elem_unrolled: Vec<u64> = sizes2[op].r_cabl.iter().map(|&s| uint(s)).collect();
            let bit_unrolled: Vec<u64> = elem_unrolled
                .iter()
                .zip(precision)
                .map(|(e, p)| e * p)
                .collect();
            let elem: Vec<u64> = elem_unrolled
                .iter()
                .zip(unique)
                .map(|(&e, &u)| uint(round_half_even(e as f64 * u)))
                .collect();
            let bit = elem.iter().zip(precision).map(|(e, p)| e * p).collect();
            let effective_elem = elem_unrolled
                .iter()
                .zip(top_r)
                .map(|(e, r)| e / (*r).max(1))
                .collect();
            let effective_bit = bit_unrolled
                .iter()
                .zip(top_r)
                .map(|(b, r)| b / (*r).max(1))
                .collect();
            self.data_elem_per_level_unrolled.insert(op.clone(), elem_unrolled);
            self.data_bit_per_level_unrolled.insert(op.clone(), bit_unrolled);
            self.data_elem_per_level.insert(op.clone(), elem);
            self.data_bit_per_level.insert(op.clone(), bit);
            self.effective_data_elem.insert(op.clone(), effective_elem);
            self.effective_data_bit.insert(op.clone(), effective_bit);
        }
    }

    fn calc_data_access(
        &mut self,
        layer: &LayerNode,
        core: &Core,
        same_data_no_access: bool,
        sizes: &IndexMap<LayerOperand, LevelSizes>,
        sizes2: &IndexMap<LayerOperand, LevelSizes>,
        output_ir_caal: &[f64],
    ) {
        let total_mac = layer.total_mac_count as f64;
        let raw = |s: &LevelSizes| -> Vec<u64> {
            s.ir_cabl
                .iter()
                .map(|ir| uint(round_half_even(total_mac / ir)))
                .collect()
        };
        let output = layer.output_operand().clone();

        for op in layer.input_operands() {
            let access = raw(&sizes[op]);
            let access2 = raw(&sizes2[op]);
            let precision = u64::from(layer.precision(op));
            let lowest_r_bw = layer
                .memory_operand(op)
                .and_then(|m| core.get_memory_level(m, 0))
                .map_or(0, |l| l.instance.r_bw);
            let mut patterns = Vec::new();
            for lv in 0..self.temporal.mem_level(op) {
                let tile_bits = self.data_bit_per_level[op][0] as f64 / self.spatial.unit_unique[op][1];
                let rd_out_to_low = if same_data_no_access && lv == 0 && lowest_r_bw as f64 >= tile_bits.floor() {
                    access[lv] / self.temporal.mac_level_data_stationary_cycle[op].max(1)
                } else {
                    access[lv]
                };
                patterns.push(DataMovePattern {
                    data_elem_move_count: FourWay::new(rd_out_to_low, 0, 0, access2[lv + 1]),
                    data_precision: FourWay::new(precision, 0, 0, precision),
                    ..Default::default()
                });
            }
            self.unit_mem_data_movement.insert(op.clone(), patterns);
        }

        let access = raw(&sizes[&output]);
        let access2 = raw(&sizes2[&output]);
        let size = layer.operand_size_elem.get(&output).copied().unwrap_or(0) as f64;
        let partial = u64::from(layer.precision(&output));
        let fin = u64::from(layer.final_output_precision());
        let mut patterns = Vec::new();
        for lv in 0..self.temporal.mem_level(&output) {
            let wr_in_by_low = access[lv];
            let rd_out_to_low = uint(size * (output_ir_caal[lv + 1] - 1.0));
            let rd_out_to_high = access2[lv + 1];
            let wr_in_by_high = uint(size * (output_ir_caal[lv + 2] - 1.0));
            let (tl_pre, fl_pre) = if rd_out_to_low != 0 { (partial, partial) } else { (0, fin) };
            let (th_pre, fh_pre) = if wr_in_by_high != 0 { (partial, partial) } else { (fin, 0) };
            patterns.push(DataMovePattern {
                data_elem_move_count: FourWay::new(rd_out_to_low, wr_in_by_low, rd_out_to_high, wr_in_by_high),
                data_precision: FourWay::new(tl_pre, fl_pre, th_pre, fh_pre),
                ..Default::default()
            });
        }
        self.unit_mem_data_movement.insert(output, patterns);
    }

    fn calc_req_mem_bw_and_data_transfer_rate(&mut self, layer: &LayerNode, same_data_no_access: bool) {
        let output = layer.output_operand().clone();
        let total_cycle = self.temporal.total_cycle;
        let operands: Vec<LayerOperand> = layer.layer_operands().cloned().collect();

        for op in &operands {
            let first = if same_data_no_access && *op != output {
                self.temporal.mac_level_data_stationary_cycle[op]
            } else {
                1
            };
            let mut cycles = vec![first.max(1)];
            cycles.extend(self.temporal.cycle_cabl_level[op].iter().map(|c| (*c).max(1)));
            let unrolled = &self.data_elem_per_level_unrolled[op];
            let mut boost = self.spatial.mem_bw_boost[op].clone();
            boost.push(1);
            let low: Vec<f64> = (0..unrolled.len())
                .map(|lv| unrolled[lv] as f64 / cycles[lv] as f64)
                .collect();
            let high: Vec<f64> = low.iter().zip(&boost).map(|(l, &b)| l * b as f64).collect();

            let is_output = *op == output;
            let psum = &self.psum_flag;
            let top_ir = &self.temporal.top_ir_loop_size[op];
            let Some(patterns) = self.unit_mem_data_movement.get_mut(op) else {
                continue;
            };
            for (lv, pattern) in patterns.iter_mut().enumerate() {
                // Towards the level below and from the level above.
                let below_bw = uint(high[lv]);
                let below_pd = cycles[lv];
                let below_pc = total_cycle / cycles[lv];
                let below_da = unrolled[lv] * boost[lv];
                let above_bw = uint(low[lv + 1]);
                let above_pd = cycles[lv + 1];
                let above_pc = total_cycle / cycles[lv + 1];
                let above_da = unrolled[lv + 1];

                if is_output {
                    let (tl, fl) = if psum[lv] {
                        ([below_bw, below_pd, below_pc, below_da], [below_bw, below_pd, below_pc, below_da])
                    } else {
                        ([0; 4], [below_bw, below_pd, below_pc, below_da])
                    };
                    let th = [above_bw, above_pd, above_pc, above_da];
                    let fh = if psum[lv + 1] { th } else { [0; 4] };
                    pattern.req_mem_bw_aver = FourWay::new(tl[0], fl[0], th[0], fh[0]);
                    pattern.data_trans_period = FourWay::new(tl[1], fl[1], th[1], fh[1]);
                    pattern.data_trans_period_count = FourWay::new(tl[2], fl[2], th[2], fh[2]);
                    pattern.data_trans_amount_per_period = FourWay::new(tl[3], fl[3], th[3], fh[3]);
                } else {
                    pattern.req_mem_bw_aver = FourWay::new(below_bw, 0, 0, above_bw);
                    pattern.data_trans_period = FourWay::new(below_pd, 0, 0, above_pd);
                    pattern.data_trans_period_count = FourWay::new(below_pc, 0, 0, above_pc);
                    pattern.data_trans_amount_per_period = FourWay::new(below_da, 0, 0, above_da);
                }

                // Instant behavior: the outermost irrelevant loops of a level leave the data
                // untouched, so the transfer must fit in the remaining window.
                let ir_of = |dir: DataDirection| {
                    let idx = match dir {
                        DataDirection::RdOutToLow | DataDirection::WrInByLow => lv,
                        DataDirection::RdOutToHigh | DataDirection::WrInByHigh => lv + 1,
                    };
                    top_ir.get(idx).copied().unwrap_or(1).max(1)
                };
                pattern.req_mem_bw_inst = pattern.req_mem_bw_aver.map(|d, bw| bw * ir_of(d));
                pattern.inst_data_trans_window = pattern.data_trans_period.map(|d, pd| pd / ir_of(d));
            }
        }
    }

    pub fn operands(&self) -> impl Iterator<Item = &LayerOperand> {
        self.unit_mem_data_movement.keys()
    }

    pub fn mem_level(&self, op: &LayerOperand) -> usize {
        self.temporal.mem_level(op)
    }

    pub fn movement(&self, op: &LayerOperand, lv: usize) -> Option<&DataMovePattern> {
        self.unit_mem_data_movement.get(op).and_then(|l| l.get(lv))
    }
}

/// For every output memory level, whether it ever holds partial sums: true when irrelevant loops
/// of size > 1 iterate above it. An extra `false` is appended for the level above the top.
fn psum_flags(levels: &LevelLoops, output: &LayerOperand, layer: &LayerNode) -> Vec<bool> {
    let has_ir: Vec<bool> = levels
        .iter()
        .map(|loops| {
            loops
                .iter()
                .any(|(d, s)| *s > 1.0 && layer.decoupled_relevancy.is_ir(output, d))
        })
        .collect();
    let mut flags: Vec<bool> = (1..has_ir.len())
        .map(|lv| has_ir[lv..].iter().any(|&f| f))
        .collect();
    flags.push(false);
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::presets;
    use crate::mapping::spatial_internal::tests::dict;
    use crate::workload::layer::tests::gemm_attrs;

    const A_K_INNERMOST: &[(&str, f64)] = &[("K", 2.0), ("M", 2.0), ("N", 2.0)];
    const A_N_INNERMOST: &[(&str, f64)] = &[("N", 2.0), ("K", 2.0), ("M", 2.0)];

    fn gemm_mapping(same_data: bool, a_loops: &[(&str, f64)]) -> (LayerNode, Mapping) {
        let layer = LayerNode::new(0, "gemm", gemm_attrs(16, 16, 16)).unwrap();
        let acc = presets::gemm_l1().unwrap();
        let core = acc.get_core(1).unwrap();
        let sm = dict(&[
            ("O", &[&[("K", 8.0)], &[("M", 8.0), ("N", 8.0)], &[], &[]]),
            ("A", &[&[("M", 8.0), ("N", 8.0), ("K", 8.0)], &[], &[]]),
            ("B", &[&[("M", 8.0), ("N", 8.0), ("K", 8.0)], &[], &[]]),
        ]);
        // The 2x2x2 remainder: K at the output register, everything else in l1.
        let tm = dict(&[
            ("O", &[&[("K", 2.0)], &[("M", 2.0), ("N", 2.0)], &[]]),
            ("A", &[a_loops, &[]]),
            ("B", &[A_K_INNERMOST, &[]]),
        ]);
        let spatial = SpatialMappingInternal::new(sm, &layer).unwrap();
        let temporal = TemporalMapping::new(tm, &layer).unwrap();
        let mapping = Mapping::new(spatial, temporal, &layer, core, same_data).unwrap();
        (layer, mapping)
    }

    #[test]
    fn test_psum_flags_close_at_the_register() {
        let (_, mapping) = gemm_mapping(false, A_K_INNERMOST);
        // The K loops all run inside reg_O, so only the register sees partial sums.
        assert_eq!(mapping.psum_flag, [true, false, false, false]);
        let o = LayerOperand::new("O");
        assert_eq!(mapping.data_precision[&o], [16, 8, 8, 8]);
    }

    #[test]
    fn test_input_refills_match_reads_below() {
        let (layer, mapping) = gemm_mapping(false, A_N_INNERMOST);
        for op in layer.input_operands() {
            let levels = &mapping.unit_mem_data_movement[op];
            for lv in 0..levels.len() - 1 {
                assert_eq!(
                    levels[lv].data_elem_move_count.wr_in_by_high,
                    levels[lv + 1].data_elem_move_count.rd_out_to_low,
                    "{op} level {lv}"
                );
            }
            // No traffic with the outside world.
            assert_eq!(levels.last().unwrap().data_elem_move_count.wr_in_by_high, 0);
        }
    }

    #[test]
    fn test_gemm_access_counts() {
        let (layer, mapping) = gemm_mapping(false, A_K_INNERMOST);
        let a = LayerOperand::new("A");
        let o = LayerOperand::new("O");
        // A is broadcast over the 8 N columns: one l1 read per 8 MACs.
        assert_eq!(mapping.unit_mem_data_movement[&a][0].data_elem_move_count.rd_out_to_low, 512);
        // l3 streams each A element once.
        assert_eq!(mapping.unit_mem_data_movement[&a][0].data_elem_move_count.wr_in_by_high, 256);
        // O: the register takes a write per 8 MACs and hands over each output once.
        let reg = &mapping.unit_mem_data_movement[&o][0];
        assert_eq!(reg.data_elem_move_count.wr_in_by_low, 512);
        assert_eq!(reg.data_elem_move_count.rd_out_to_high, 256);
        assert_eq!(mapping.data_elem_per_level[&o][1], 64);
        assert_eq!(layer.total_mac_count, 4096);
        assert_eq!(mapping.temporal.total_cycle, 8);
    }

    #[test]
    fn test_same_data_optimisation_reduces_innermost_reads() {
        let reads = |m: &Mapping, op: &str| {
            m.unit_mem_data_movement[&LayerOperand::new(op)][0]
                .data_elem_move_count
                .rd_out_to_low
        };
        // With K innermost, no input stays at the array for more than a cycle.
        let (_, plain) = gemm_mapping(false, A_K_INNERMOST);
        let (_, optimised) = gemm_mapping(true, A_K_INNERMOST);
        assert_eq!(reads(&plain, "A"), reads(&optimised, "A"));
        assert_eq!(reads(&plain, "B"), reads(&optimised, "B"));

        // With N innermost, A stays for two cycles and its 512-bit tile fits one l1 read.
        let (_, plain) = gemm_mapping(false, A_N_INNERMOST);
        let (_, optimised) = gemm_mapping(true, A_N_INNERMOST);
        assert_eq!(plain.temporal.mac_level_data_stationary_cycle[&LayerOperand::new("A")], 2);
        assert_eq!(reads(&plain, "A"), 512);
        assert_eq!(reads(&optimised, "A"), 256);
        assert_eq!(reads(&plain, "B"), reads(&optimised, "B"));
    }
}
