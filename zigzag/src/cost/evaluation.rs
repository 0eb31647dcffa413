use crate::common::{LayerOperand, MappingDict, MemoryOperand};
use crate::cost::port_activity::{PortActivity, PortStall};
use crate::cost::{CostError, CostTotals, Latency};
use crate::hardware::cores::Core;
use crate::hardware::memory_level::MemoryLevel;
use crate::hardware::memory_port::DataDirection;
use crate::mapping::{FourWay, Mapping, TemporalMapping};
use crate::spatial::ConvertedSpatialMapping;
use crate::workload::layer::{LayerNode, LayerSummary};
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

/// How full each memory level is for one mapping.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MemoryUtilization {
    /// Bits of one operand over the memory size, per operand and memory level.
    pub individual: IndexMap<LayerOperand, Vec<f64>>,
    /// [Self::individual] summed over the operands sharing the same physical memory.
    pub shared: IndexMap<LayerOperand, Vec<f64>>,
    /// As [Self::individual], counting only the data needed before the level can start serving.
    pub effective_individual: IndexMap<LayerOperand, Vec<f64>>,
    pub effective_shared: IndexMap<LayerOperand, Vec<f64>>,
}

/// The one-off cycles spent filling the input memories, split by how the ports on each side of
/// a transfer are shared between the two inputs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LoadingBreakdown {
    pub individual: IndexMap<LayerOperand, u64>,
    pub half_shared: IndexMap<LayerOperand, u64>,
    pub shared: IndexMap<LayerOperand, u64>,
    /// Extra cycles for the first access of innermost memories with a latency above one cycle.
    pub memory_latency: u64,
}

/// Energy and latency of one layer under one spatial and temporal mapping on one core.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CostModelEvaluation {
    pub layer: LayerSummary,
    pub core_id: usize,
    pub accelerator: String,
    pub spatial_mapping: MappingDict,
    pub spatial_mapping_int: MappingDict,
    pub temporal_mapping: MappingDict,
    /// Names of the memory levels each operand is mapped to, innermost first.
    pub memory_levels: IndexMap<LayerOperand, Vec<String>>,
    pub utilization: MemoryUtilization,
    /// Per operand: `false` for the operational array, then whether each memory level can
    /// double buffer.
    pub double_buffer: IndexMap<LayerOperand, Vec<bool>>,
    pub port_stalls: Vec<PortStall>,
    pub loading: LoadingBreakdown,
    pub totals: CostTotals,
}

/// Per operand, per memory level.
type PerLevel<T> = IndexMap<LayerOperand, Vec<T>>;

impl CostModelEvaluation {
    /// Evaluates `temporal` on top of `spatial` for `layer` on `core`.
    ///
    /// Energy and memory sizes use the fractional spatial mapping; transfer periods and latency
    /// use the integer one.
    pub fn new(
        accelerator: &str,
        core: &Core,
        layer: &LayerNode,
        spatial: &ConvertedSpatialMapping,
        temporal: &TemporalMapping,
        same_data_no_access: bool,
    ) -> Result<Self, CostError> {
        let mapping = Mapping::new(
            spatial.fractional.clone(),
            temporal.clone(),
            layer,
            core,
            same_data_no_access,
        )?;
        let mapping_int = Mapping::new(
            spatial.integer.clone(),
            temporal.clone(),
            layer,
            core,
            same_data_no_access,
        )?;

        let mut levels: IndexMap<LayerOperand, (MemoryOperand, Vec<&MemoryLevel>)> = IndexMap::new();
        for op in layer.layer_operands() {
            let mem_op = layer
                .memory_operand(op)
                .ok_or_else(|| CostError::UnlinkedOperand {
                    layer: layer.name.clone(),
                    operand: op.clone(),
                })?;
            let mem_levels = core.mem_levels(mem_op);
            if mapping.mem_level(op) > mem_levels.len() {
                return Err(CostError::TooManyLevels {
                    layer: layer.name.clone(),
                    operand: op.clone(),
                    mapped: mapping.mem_level(op),
                    available: mem_levels.len(),
                });
            }
            levels.insert(op.clone(), (mem_op, mem_levels));
        }
        let eval = Evaluator {
            layer,
            core,
            mapping: &mapping,
            mapping_int: &mapping_int,
            levels,
        };

        let memory_word_access = eval.memory_word_access();
        let (mem_energy_breakdown, mem_energy_breakdown_further) = eval.memory_energy(&memory_word_access);
        let mac_energy = core.operational_array.mac_energy(layer.total_mac_count);
        let mem_energy: f64 = mem_energy_breakdown.values().flatten().sum();

        let utilization = eval.memory_utilization();
        let double_buffer = eval.double_buffer(&utilization);
        let allowed = eval.allowed_cycles(&double_buffer);
        let real = eval.real_cycles();
        let port_stalls = eval.port_stalls(&real, &allowed);
        let temporal_stall = port_stalls
            .iter()
            .map(|p| p.ss_comb)
            .fold(0, i64::max)
            .unsigned_abs();
        let loading = eval.loading(&real);
        let data_loading_cycle = loading_cycle(layer, &loading);
        let data_offloading_cycle = eval.offloading_cycle(&real);

        let ideal_cycle = layer
            .total_mac_count
            .div_ceil(core.operational_array.total_unit_count().max(1));
        let latency = Latency::new(
            ideal_cycle,
            mapping_int.temporal.total_cycle,
            temporal_stall,
            data_loading_cycle,
            data_offloading_cycle,
        );

        let totals = CostTotals {
            mac_count: layer.total_mac_count,
            mac_energy,
            mem_energy,
            energy_total: mac_energy + mem_energy,
            mem_energy_breakdown,
            mem_energy_breakdown_further,
            memory_word_access,
            latency,
        };
        totals.check_energy_sum();

        let memory_levels = eval
            .levels
            .iter()
            .map(|(op, (_, lvs))| {
                let names = lvs
                    .iter()
                    .take(mapping.mem_level(op))
                    .map(|l| l.name().to_owned())
                    .collect();
                (op.clone(), names)
            })
            .collect();
        let cme = CostModelEvaluation {
            layer: LayerSummary::from(layer),
            core_id: core.id,
            accelerator: accelerator.to_owned(),
            spatial_mapping: mapping.spatial.mapping.clone(),
            spatial_mapping_int: mapping_int.spatial.mapping.clone(),
            temporal_mapping: temporal.mapping.clone(),
            memory_levels,
            utilization,
            double_buffer,
            port_stalls,
            loading,
            totals,
        };
        debug!(
            "{layer}: energy {:.3e}, latency {}",
            cme.totals.energy_total, cme.totals.latency.latency_total2
        );
        Ok(cme)
    }

    pub fn energy_total(&self) -> f64 {
        self.totals.energy_total
    }

    pub fn latency_total(&self) -> u64 {
        self.totals.latency.latency_total2
    }
}

struct Evaluator<'a> {
    layer: &'a LayerNode,
    core: &'a Core,
    mapping: &'a Mapping,
    mapping_int: &'a Mapping,
    levels: IndexMap<LayerOperand, (MemoryOperand, Vec<&'a MemoryLevel>)>,
}

impl<'a> Evaluator<'a> {
    fn memory_level(&self, op: &LayerOperand, lv: usize) -> Option<&'a MemoryLevel> {
        self.levels.get(op).and_then(|(_, l)| l.get(lv)).copied()
    }

    /// Physical word accesses: each transfer is rounded up to the memory's access granularity
    /// and, towards a lower level, split into the cycles the narrower side of the link needs.
    fn memory_word_access(&self) -> PerLevel<FourWay<f64>> {
        let mut out = IndexMap::new();
        for op in self.mapping.operands() {
            let unique = &self.mapping.spatial.unit_unique[op];
            let count = &self.mapping.spatial.unit_count[op];
            let mut per_level = Vec::new();
            for lv in 0..self.mapping.mem_level(op) {
                let (Some(pattern), Some(level)) = (self.mapping.movement(op, lv), self.memory_level(op, lv)) else {
                    continue;
                };
                let below = lv.checked_sub(1).and_then(|b| self.memory_level(op, b));
                let units = count.get(lv + 1).copied().unwrap_or(1) as f64;
                let access = pattern.data_trans_amount_per_period.map(|dir, amount| {
                    let precision = pattern.data_precision.get(dir);
                    if amount == 0 || precision == 0 {
                        return 0.0;
                    }
                    let (amount, precision) = (amount as f64, precision as f64);
                    let (max_bw, min_bw) = if dir.is_read() {
                        (level.instance.r_bw as f64, level.instance.r_bw_min() as f64)
                    } else {
                        (level.instance.w_bw as f64, level.instance.w_bw_min() as f64)
                    };
                    let periods = pattern.data_trans_period_count.get(dir) as f64;
                    let (per_cycle, cycles) = match below {
                        Some(below) if dir.faces_low() => {
                            let other_side = if dir.is_read() {
                                below.instance.w_bw
                            } else {
                                below.instance.r_bw
                            } as f64;
                            let fanout = unique[lv] / unique[lv + 1];
                            let per_cycle = (other_side * fanout / precision)
                                .min(max_bw / precision)
                                .min(amount);
                            if per_cycle > 0.0 {
                                (per_cycle, (amount / per_cycle).ceil())
                            } else {
                                (amount, 1.0)
                            }
                        }
                        _ => (amount, 1.0),
                    };
                    (per_cycle * precision / min_bw).ceil() * (min_bw / max_bw) * periods * cycles * units
                });
                per_level.push(access);
            }
            out.insert(op.clone(), per_level);
        }
        out
    }

    fn memory_energy(&self, word_access: &PerLevel<FourWay<f64>>) -> (PerLevel<f64>, PerLevel<FourWay<f64>>) {
        let mut breakdown = IndexMap::new();
        let mut further = IndexMap::new();
        for (op, accesses) in word_access {
            let per_dir: Vec<FourWay<f64>> = accesses
                .iter()
                .enumerate()
                .filter_map(|(lv, access)| {
                    let level = self.memory_level(op, lv)?;
                    Some(access.map(|dir, n| {
                        if dir.is_read() {
                            n * level.instance.r_cost
                        } else {
                            n * level.instance.w_cost
                        }
                    }))
                })
                .collect();
            breakdown.insert(op.clone(), per_dir.iter().map(FourWay::total).collect());
            further.insert(op.clone(), per_dir);
        }
        (breakdown, further)
    }

    fn memory_utilization(&self) -> MemoryUtilization {
        let mut util = MemoryUtilization::default();
        for op in self.mapping.operands() {
            let unrolled = &self.mapping.data_bit_per_level_unrolled[op];
            let effective = &self.mapping.effective_data_bit[op];
            let mut individual = Vec::new();
            let mut effective_individual = Vec::new();
            for lv in 0..self.mapping.mem_level(op) {
                let size = self.memory_level(op, lv).map_or(0, |l| l.instance.size);
                let fraction = |bits: Option<&u64>| match (bits, size) {
                    (_, 0) | (None, _) => 0.0,
                    (Some(&b), s) => b as f64 / s as f64,
                };
                individual.push(fraction(unrolled.get(lv + 1)));
                effective_individual.push(fraction(effective.get(lv + 1)));
            }
            util.individual.insert(op.clone(), individual);
            util.effective_individual.insert(op.clone(), effective_individual);
        }
        util.shared = util.individual.clone();
        util.effective_shared = util.effective_individual.clone();

        for group in self.core.mem_sharing_list() {
            let members: Vec<(&LayerOperand, usize)> = group
                .iter()
                .filter_map(|(&mem_op, &lv)| Some((self.layer.layer_operand(mem_op)?, lv)))
                .filter(|(op, lv)| *lv < self.mapping.mem_level(op))
                .collect();
            let sum = |table: &PerLevel<f64>| -> f64 {
                members.iter().map(|(op, lv)| table[*op][*lv]).sum()
            };
            let (shared, effective_shared) = (sum(&util.individual), sum(&util.effective_individual));
            for (op, lv) in &members {
                util.shared[*op][*lv] = shared;
                util.effective_shared[*op][*lv] = effective_shared;
            }
        }
        util
    }

    /// A level can double buffer when its effective data fits twice, counting the operands
    /// sharing the memory. An operand granted double buffering takes its share of the free space
    /// from the others.
    fn double_buffer(&self, util: &MemoryUtilization) -> PerLevel<bool> {
        let mut shared = util.effective_shared.clone();
        let mut flags = IndexMap::new();
        for op in self.mapping_int.operands() {
            let Some((mem_op, _)) = self.levels.get(op) else {
                continue;
            };
            let mut per_level = vec![false];
            for lv in 0..self.mapping_int.mem_level(op) {
                let own = util.effective_individual[op][lv];
                let occupied = shared[op][lv];
                if occupied <= 0.5 {
                    per_level.push(true);
                } else if own <= 1.0 - occupied {
                    per_level.push(true);
                    let group = self
                        .core
                        .mem_sharing_list()
                        .iter()
                        .find(|g| g.get(mem_op) == Some(&lv));
                    for (&other_mem_op, &other_lv) in group.into_iter().flatten() {
                        if let Some(other) = self.layer.layer_operand(other_mem_op) {
                            if let Some(v) = shared.get_mut(other).and_then(|l| l.get_mut(other_lv)) {
                                *v += own;
                            }
                        }
                    }
                } else {
                    per_level.push(false);
                }
            }
            flags.insert(op.clone(), per_level);
        }
        flags
    }

    /// Cycles each transfer may take per period without stalling the array: the whole period
    /// when the receiving side double buffers, otherwise only the instant window.
    fn allowed_cycles(&self, double_buffer: &PerLevel<bool>) -> PerLevel<FourWay<u64>> {
        let mut out = IndexMap::new();
        for op in self.mapping_int.operands() {
            let db = &double_buffer[op];
            let per_level = (0..self.mapping_int.mem_level(op))
                .filter_map(|lv| {
                    let pattern = self.mapping_int.movement(op, lv)?;
                    Some(pattern.data_trans_period.map(|dir, period| {
                        let idx = if dir.faces_low() { lv } else { lv + 1 };
                        if db.get(idx).copied().unwrap_or(false) {
                            period
                        } else {
                            pattern.inst_data_trans_window.get(dir)
                        }
                    }))
                })
                .collect();
            out.insert(op.clone(), per_level);
        }
        out
    }

    /// Cycles each transfer takes per period at the memory's bandwidth.
    fn real_cycles(&self) -> PerLevel<FourWay<u64>> {
        let mut out = IndexMap::new();
        for op in self.mapping_int.operands() {
            let per_level = (0..self.mapping_int.mem_level(op))
                .filter_map(|lv| {
                    let pattern = self.mapping_int.movement(op, lv)?;
                    let level = self.memory_level(op, lv)?;
                    Some(pattern.data_trans_amount_per_period.map(|dir, amount| {
                        let bw = if dir.is_read() {
                            level.instance.r_bw
                        } else {
                            level.instance.w_bw
                        };
                        (amount * pattern.data_precision.get(dir)).div_ceil(bw.max(1))
                    }))
                })
                .collect();
            out.insert(op.clone(), per_level);
        }
        out
    }

    /// Walks every active `(operand, level, direction)` served by each physical port.
    fn served_transfers<'m>(
        &'m self,
        level: &'m MemoryLevel,
    ) -> impl Iterator<Item = (&'m str, Vec<(MemoryOperand, &'a LayerOperand, usize, DataDirection)>)> + 'm {
        level.ports.iter().map(move |port| {
            let active = port
                .served
                .iter()
                .filter_map(|&(mem_op, lv, dir)| {
                    let op = self.layer.layer_operand(mem_op)?;
                    let pattern = self.mapping_int.movement(op, lv)?;
                    (pattern.data_trans_period_count.get(dir) != 0).then_some((mem_op, op, lv, dir))
                })
                .collect();
            (port.name.as_str(), active)
        })
    }

    fn port_stalls(&self, real: &PerLevel<FourWay<u64>>, allowed: &PerLevel<FourWay<u64>>) -> Vec<PortStall> {
        let mut stalls = Vec::new();
        for level in self.core.memory_hierarchy.levels() {
            for (port, transfers) in self.served_transfers(level) {
                let activities: Vec<PortActivity> = transfers
                    .into_iter()
                    .filter_map(|(_, op, lv, dir)| {
                        let pattern = self.mapping_int.movement(op, lv)?;
                        Some(PortActivity::new(
                            op.clone(),
                            lv,
                            dir,
                            real[op].get(lv)?.get(dir),
                            allowed[op].get(lv)?.get(dir),
                            pattern.data_trans_period.get(dir),
                            pattern.data_trans_period_count.get(dir),
                        ))
                    })
                    .collect();
                if !activities.is_empty() {
                    stalls.push(PortStall::new(level.name(), port, activities));
                }
            }
        }
        stalls
    }

    /// The first fill of every input memory level. Transfers on ports shared by both inputs
    /// serialize; separate ports work in parallel.
    fn loading(&self, real: &PerLevel<FourWay<u64>>) -> LoadingBreakdown {
        let mut cycles: IndexMap<&LayerOperand, IndexMap<(usize, DataDirection), (u64, bool)>> = IndexMap::new();
        for level in self.core.memory_hierarchy.levels() {
            let port_inputs: Vec<_> = level
                .ports
                .iter()
                .map(|p| {
                    let mut inputs: Vec<MemoryOperand> =
                        p.served.iter().map(|s| s.0).filter(|m| !m.is_output()).collect();
                    inputs.sort();
                    inputs.dedup();
                    inputs.len() > 1
                })
                .collect();
            for ((_, transfers), shared) in self.served_transfers(level).zip(port_inputs) {
                for (mem_op, op, lv, dir) in transfers {
                    if mem_op.is_output() {
                        continue;
                    }
                    let Some(r) = real.get(op).and_then(|l| l.get(lv)) else {
                        continue;
                    };
                    cycles.entry(op).or_default().insert((lv, dir), (r.get(dir), shared));
                }
            }
        }

        let mut loading = LoadingBreakdown::default();
        for op in self.layer.input_operands() {
            let (mut individual, mut half_shared, mut shared) = (0, 0, 0);
            let per_op = cycles.get(op);
            let lookup = |lv: usize, dir: DataDirection| {
                per_op
                    .and_then(|c| c.get(&(lv, dir)))
                    .copied()
                    .unwrap_or((0, false))
            };
            for lv in 0..self.mapping_int.mem_level(op).saturating_sub(1) {
                let (fill, fill_shared) = lookup(lv, DataDirection::WrInByHigh);
                let (feed, feed_shared) = lookup(lv + 1, DataDirection::RdOutToLow);
                let longest = fill.max(feed);
                match (fill_shared, feed_shared) {
                    (false, false) => individual += longest,
                    (true, true) => shared += longest,
                    // Only the last half-shared link counts.
                    _ => half_shared = longest,
                }
            }
            loading.individual.insert(op.clone(), individual);
            loading.half_shared.insert(op.clone(), half_shared);
            loading.shared.insert(op.clone(), shared);
        }
        loading.memory_latency = self
            .layer
            .input_operands()
            .filter_map(|op| self.memory_level(op, 0))
            .map(|l| l.instance.latency.saturating_sub(1))
            .max()
            .unwrap_or(0);
        loading
    }

    /// The final drain of the outputs, assuming the ports work one after the other.
    fn offloading_cycle(&self, real: &PerLevel<FourWay<u64>>) -> u64 {
        let output = self.layer.output_operand();
        let mut drains: IndexMap<(usize, DataDirection), u64> = IndexMap::new();
        for level in self.core.memory_hierarchy.levels() {
            for (_, transfers) in self.served_transfers(level) {
                for (_, op, lv, dir) in transfers {
                    if op != output || !matches!(dir, DataDirection::RdOutToHigh | DataDirection::WrInByLow) {
                        continue;
                    }
                    if let Some(r) = real.get(op).and_then(|l| l.get(lv)) {
                        drains.insert((lv, dir), r.get(dir));
                    }
                }
            }
        }
        (0..self.mapping_int.mem_level(output).saturating_sub(1))
            .map(|lv| {
                let out = drains.get(&(lv, DataDirection::RdOutToHigh)).copied().unwrap_or(0);
                let into = drains.get(&(lv + 1, DataDirection::WrInByLow)).copied().unwrap_or(0);
                out.max(into)
            })
            .sum()
    }
}

/// Combines the loading parts of the (at most two) inputs: each input's shared part
/// serializes, and the order is picked to minimize the total.
fn loading_cycle(layer: &LayerNode, loading: &LoadingBreakdown) -> u64 {
    let part = |table: &IndexMap<LayerOperand, u64>, op: &LayerOperand| table.get(op).copied().unwrap_or(0);
    let inputs: Vec<&LayerOperand> = layer.input_operands().collect();
    let cycles = match inputs.as_slice() {
        [] => 0,
        [only] => part(&loading.individual, only),
        [a, b, ..] => {
            let rest = |op: &LayerOperand| part(&loading.half_shared, op) + part(&loading.individual, op);
            let first_then = |x: &LayerOperand, y: &LayerOperand| {
                part(&loading.shared, x) + (part(&loading.shared, y) + rest(y)).max(rest(x))
            };
            first_then(a, b).min(first_then(b, a))
        }
    };
    cycles + loading.memory_latency
}
