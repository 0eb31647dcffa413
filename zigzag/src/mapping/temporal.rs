use crate::common::{round_count, LayerDim, LayerOperand, LevelLoops, MappingDict};
use crate::mapping::MappingError;
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;

/// A temporal mapping: for each operand, the loops stored at each of its memory levels,
/// innermost first.
#[derive(Debug, Clone)]
pub struct TemporalMapping {
    pub mapping: MappingDict,
    /// [Self::mapping] after innermost irrelevant loops were pushed down to the level below.
    pub stationary: MappingDict,
    pub mem_level: IndexMap<LayerOperand, usize>,
    /// Product of the innermost irrelevant loops of the lowest level: how many cycles an
    /// operand stays unchanged at the operational array.
    pub mac_level_data_stationary_cycle: IndexMap<LayerOperand, u64>,
    /// Cycles covered by one refresh of each level (its loops and all loops below).
    pub cycle_cabl_level: IndexMap<LayerOperand, Vec<u64>>,
    pub total_cycle: u64,
    /// Product of the outermost relevant loops of each level. Index `lv + 1` is memory level
    /// `lv`; index 0 stands for the operational array and is always 1.
    pub top_r_loop_size: IndexMap<LayerOperand, Vec<u64>>,
    /// Same as [Self::top_r_loop_size] for irrelevant loops.
    pub top_ir_loop_size: IndexMap<LayerOperand, Vec<u64>>,
}

impl TemporalMapping {
    pub fn new(mapping: MappingDict, layer: &LayerNode) -> Result<Self, MappingError> {
        for op in layer.layer_operands() {
            if !mapping.contains_key(op) {
                return Err(MappingError::MissingOperand(op.clone()));
            }
        }
        let mem_level = mapping
            .iter()
            .map(|(op, levels)| (op.clone(), levels.len()))
            .collect();
        let (stationary, mac_level_data_stationary_cycle) = merge_down(&mapping, layer);

        let cycle_cabl_level: IndexMap<LayerOperand, Vec<u64>> = stationary
            .iter()
            .map(|(op, levels)| {
                let mut below = 1.0;
                let cycles = levels
                    .iter()
                    .map(|loops| {
                        below *= loops.iter().map(|(_, s)| s).product::<f64>();
                        round_count(below)
                    })
                    .collect();
                (op.clone(), cycles)
            })
            .collect();
        let mut totals = cycle_cabl_level
            .iter()
            .map(|(op, c)| (op, c.last().copied().unwrap_or(1)));
        let total_cycle = totals.next().map_or(1, |(_, c)| c);
        if let Some((op, found)) = totals.find(|(_, c)| *c != total_cycle) {
            return Err(MappingError::InconsistentCycles {
                operand: op.clone(),
                expected: total_cycle,
                found,
            });
        }

        let mut top_r_loop_size = IndexMap::new();
        let mut top_ir_loop_size = IndexMap::new();
        for (op, levels) in &stationary {
            let mut top_r = vec![1; levels.len() + 1];
            let mut top_ir = vec![1; levels.len() + 1];
            for (lv, loops) in levels.iter().enumerate() {
                let outermost = |relevant: &dyn Fn(&LayerDim) -> bool| {
                    loops
                        .iter()
                        .rev()
                        .take_while(|(d, _)| relevant(d))
                        .map(|(_, s)| s)
                        .product::<f64>()
                };
                top_r[lv + 1] = round_count(outermost(&|d| layer.relevancy.is_r(op, d)));
                top_ir[lv + 1] = round_count(outermost(&|d| layer.relevancy.is_ir(op, d)));
            }
            top_r_loop_size.insert(op.clone(), top_r);
            top_ir_loop_size.insert(op.clone(), top_ir);
        }

        Ok(TemporalMapping {
            mapping,
            stationary,
            mem_level,
            mac_level_data_stationary_cycle,
            cycle_cabl_level,
            total_cycle,
            top_r_loop_size,
            top_ir_loop_size,
        })
    }

    pub fn mem_level(&self, op: &LayerOperand) -> usize {
        self.mem_level.get(op).copied().unwrap_or(0)
    }
}

/// Pushes the innermost irrelevant loops of every level down to the level below until nothing
/// moves anymore. Data needs no refresh while only irrelevant loops iterate, so such loops
/// effectively run at the lower level.
fn merge_down(mapping: &MappingDict, layer: &LayerNode) -> (MappingDict, IndexMap<LayerOperand, u64>) {
    let mut current = mapping.clone();
    loop {
        let mut next = MappingDict::new();
        let mut stationary_cycle = IndexMap::new();
        for (op, levels) in &current {
            let mut merged: LevelLoops = vec![Vec::new(); levels.len()];
            let mut cycle = 1.0;
            for (lv, loops) in levels.iter().enumerate() {
                let bottom_ir = loops
                    .iter()
                    .take_while(|(d, _)| layer.relevancy.is_ir(op, d))
                    .count();
                if lv == 0 {
                    cycle *= loops[..bottom_ir].iter().map(|(_, s)| s).product::<f64>();
                    merged[0].extend(loops.iter().cloned());
                } else {
                    merged[lv - 1].extend(loops[..bottom_ir].iter().cloned());
                    merged[lv].extend(loops[bottom_ir..].iter().cloned());
                }
            }
            next.insert(op.clone(), merged);
            stationary_cycle.insert(op.clone(), round_count(cycle));
        }
        if next == current {
            return (next, stationary_cycle);
        }
        current = next;
    }
}
