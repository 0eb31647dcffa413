//! Removal of memories a workload does not need.
//!
//! [SearchUnusedMemoryStage] walks the whole workload once and decides, per layer, the highest
//! memory each operand has to reach: a layer's input lives where its producer left its output,
//! outputs stay in the lowest memory that also feeds the next layer, and all weights of the
//! workload share the lowest memory that holds them together. [RemoveUnusedMemoryStage] then
//! cuts each layer's hierarchy down to that plan.

use crate::common::{LayerOperand, MemoryOperand};
use crate::hardware::{Accelerator, Core};
use crate::pipeline::stage::{run_next, Stage, StageContext, StageIter};
use crate::pipeline::PipelineError;
use crate::workload::{LayerNode, Workload};
use indexmap::IndexMap;
use log::{debug, info, warn};

/// What each memory operand of a layer is to the search.
#[derive(Debug, Clone)]
struct Roles {
    act: MemoryOperand,
    /// `None` for layers without a constant input (e.g. adders); all their inputs count as
    /// activations.
    weight: Option<MemoryOperand>,
    output: MemoryOperand,
    /// Inputs that are neither `act` nor `weight`.
    others: Vec<MemoryOperand>,
    act_bits: u64,
    weight_bits: u64,
    output_bits: u64,
}

impl Roles {
    /// A single constant input is the weight. Without constants the first input is the
    /// activation. With two constants the activation is the one with partially relevant
    /// dimensions.
    fn of(layer: &LayerNode) -> Option<Self> {
        let inputs: Vec<&LayerOperand> = layer.input_operands().collect();
        let (act, weight) = match layer.constant_operands.as_slice() {
            [] => (inputs.first().copied(), None),
            [weight] => (
                inputs.iter().copied().find(|op| *op != weight),
                Some(weight),
            ),
            constants => {
                let act = constants
                    .iter()
                    .find(|op| layer.relevancy.pr_dims(op).is_some_and(|pr| !pr.is_empty()))
                    .or(constants.first());
                (act, constants.iter().find(|op| Some(*op) != act))
            }
        };
        let act = act?;
        let act_bits = match weight {
            None => inputs.iter().map(|op| layer.operand_size_bit(op)).sum(),
            Some(_) => layer.operand_size_bit(act),
        };
        let act_mem = layer.memory_operand(act)?;
        let weight_mem = match weight {
            Some(w) => Some(layer.memory_operand(w)?),
            None => None,
        };
        let others = inputs
            .iter()
            .filter_map(|op| layer.memory_operand(op))
            .filter(|m| *m != act_mem && Some(*m) != weight_mem)
            .collect();
        Some(Roles {
            act: act_mem,
            weight: weight_mem,
            output: layer.memory_operand(layer.output_operand())?,
            others,
            act_bits,
            weight_bits: weight.map_or(0, |w| layer.operand_size_bit(w)),
            output_bits: layer.operand_size_bit(layer.output_operand()),
        })
    }

    /// Bits of `mem_op` that count as layer input or output.
    fn io_bits(&self, mem_op: MemoryOperand) -> u64 {
        if mem_op == self.act {
            self.act_bits
        } else if mem_op == self.output {
            self.output_bits
        } else {
            0
        }
    }
}

/// Highest levels found so far for one layer. Only ever lowered.
#[derive(Debug, Default)]
struct Tops {
    act: Option<usize>,
    output: Option<usize>,
}

fn lower(slot: &mut Option<usize>, level: usize) {
    *slot = Some(slot.map_or(level, |current| current.min(level)));
}

/// Per layer, the highest memory (as an index into the core's
/// [levels](crate::hardware::MemoryHierarchy::levels)) each memory operand keeps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPlan {
    core_id: usize,
    layers: IndexMap<usize, IndexMap<MemoryOperand, usize>>,
}

impl MemoryPlan {
    /// Plans every layer of `workload` allocated to `core`. Layers on other cores, and layers
    /// whose operands are not all linked to memory operands, are left out.
    pub fn search(workload: &Workload, core: &Core) -> Self {
        let hierarchy = &core.memory_hierarchy;
        let nb_oa_dims = core.operational_array.dimensions.len();
        let top = |mem_op: MemoryOperand| hierarchy.top_level(mem_op).map(|l| l.id);

        let all_layers = workload.layers();
        let roles: IndexMap<usize, Roles> = all_layers
            .iter()
            .filter_map(|layer| match Roles::of(layer) {
                Some(r) => Some((layer.id, r)),
                None => {
                    warn!("{layer}: operands are not all linked to memories, keeping every memory");
                    None
                }
            })
            .collect();
        let planned: Vec<_> = all_layers
            .iter()
            .filter(|l| l.core_id() == core.id && roles.contains_key(&l.id))
            .collect();
        let weight_total: u64 = planned.iter().map(|l| roles[&l.id].weight_bits).sum();

        let mut tops: IndexMap<usize, Tops> = IndexMap::new();
        let mut weight_level: Option<usize> = None;
        for layer in &planned {
            let r = &roles[&layer.id];
            let predecessors = workload.layer_predecessors(layer.id);
            let successors = workload.layer_successors(layer.id);
            let is_first = predecessors.is_empty();
            let is_final = successors.is_empty();

            let mut t = Tops::default();
            if let Some(level) = predecessors
                .first()
                .and_then(|prev| tops.get(&prev.id))
                .and_then(|prev| prev.output)
            {
                lower(&mut t.act, level);
            }

            let branch_start = successors.len() > 1;
            let branch_final = successors.len() == 1
                && workload.layer_predecessors(successors[0].id).len() > 1;
            if branch_start || branch_final {
                if is_first {
                    if let Some(level) = top(r.act) {
                        lower(&mut t.act, level);
                    }
                }
                if let Some(level) = top(r.output) {
                    lower(&mut t.output, level);
                }
                tops.insert(layer.id, t);
                continue;
            }

            let next_act = match successors.first() {
                Some(next) if !is_final => roles.get(&next.id).map_or(r.act, |n| n.act),
                _ => r.act,
            };
            for level in hierarchy.levels().iter().rev() {
                let io_both = level.holds(next_act) && level.holds(r.output);
                let serves_weight = r.weight.is_some_and(|w| level.holds(w));
                if !io_both && !serves_weight {
                    continue;
                }
                // The next layer's activation may be another memory operand than this layer's.
                let io_bits = if r.weight.is_none() && io_both {
                    r.act_bits + r.output_bits
                } else {
                    level.operands.iter().map(|op| r.io_bits(*op)).sum()
                };
                let required = io_bits + if serves_weight { weight_total } else { 0 };
                if required > level.instance.size * level.unroll_count {
                    continue;
                }
                if io_both {
                    if is_first {
                        lower(&mut t.act, level.id);
                    }
                    lower(&mut t.output, level.id);
                }
                if serves_weight && level.served_dimensions.len() == nb_oa_dims {
                    lower(&mut weight_level, level.id);
                }
            }
            tops.insert(layer.id, t);
        }

        // Every operand must keep at least one memory below its target.
        let resolve = |layer: &LayerNode, mem_op: MemoryOperand, target: Option<usize>| {
            let fallback = top(mem_op).unwrap_or(0);
            match target {
                Some(t) if hierarchy.levels_of(mem_op).any(|l| l.id <= t) => t,
                Some(_) => fallback,
                None => {
                    warn!("{layer}: no memory fits {mem_op} below the top, keeping all of them");
                    fallback
                }
            }
        };
        let layers = planned
            .iter()
            .map(|layer| {
                let r = &roles[&layer.id];
                let t = &tops[&layer.id];
                let act = resolve(layer, r.act, t.act);
                let mut levels = IndexMap::new();
                levels.insert(r.act, act);
                levels.insert(r.output, resolve(layer, r.output, t.output));
                if let Some(w) = r.weight {
                    levels.insert(w, resolve(layer, w, weight_level.or(top(w))));
                }
                for &other in &r.others {
                    levels.insert(other, resolve(layer, other, Some(act)));
                }
                (layer.id, levels)
            })
            .collect();
        MemoryPlan {
            core_id: core.id,
            layers,
        }
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The highest level index each memory operand of layer `id` keeps, if it was planned.
    pub fn top_levels(&self, id: usize) -> Option<&IndexMap<MemoryOperand, usize>> {
        self.layers.get(&id)
    }
}

/// Plans which memories every layer of the workload needs, for the [RemoveUnusedMemoryStage]
/// further down. The plan covers the core of the first layer.
#[derive(Debug, Default)]
pub struct SearchUnusedMemoryStage;

impl Stage for SearchUnusedMemoryStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let workload = ctx.workload()?.clone();
        let Some(first) = workload.layers().into_iter().next() else {
            return run_next(self, ctx, downstream);
        };
        let core = ctx.accelerator.get_core(first.core_id())?;
        let plan = MemoryPlan::search(&workload, core);
        info!("Planned the memories of {} layers on core {}", plan.len(), core.id);
        run_next(self, ctx.with_memory_plan(plan), downstream)
    }
}

/// Runs the stages below on an accelerator whose core keeps, for the layer at hand, only the
/// memories the [MemoryPlan] gives it. Layers outside the plan run on the full hierarchy.
#[derive(Debug, Default)]
pub struct RemoveUnusedMemoryStage;

impl RemoveUnusedMemoryStage {
    pub const NAME_SUFFIX: &'static str = "-removing-nouse-mem";

    fn reduced_accelerator(ctx: &StageContext) -> Result<Option<Accelerator>, PipelineError> {
        let layer = ctx.layer()?;
        let plan = ctx.memory_plan()?;
        let core = ctx.core()?;
        let Some(top_levels) = plan.top_levels(layer.id).filter(|_| plan.core_id() == core.id)
        else {
            return Ok(None);
        };
        let hierarchy = core
            .memory_hierarchy
            .with_top_levels(top_levels, &core.operational_array)?;
        debug!(
            "{layer}: kept {} of {} memories",
            hierarchy.levels().len(),
            core.memory_hierarchy.levels().len()
        );
        let reduced = core.with_hierarchy(hierarchy)?;
        let cores = ctx
            .accelerator
            .cores()
            .iter()
            .map(|c| {
                if c.id == reduced.id {
                    reduced.clone()
                } else {
                    (**c).clone()
                }
            })
            .collect();
        Ok(Some(Accelerator::new(
            &format!("{}{}", ctx.accelerator.name, Self::NAME_SUFFIX),
            cores,
        )?))
    }
}

impl Stage for RemoveUnusedMemoryStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        match Self::reduced_accelerator(&ctx)? {
            Some(accelerator) => run_next(self, ctx.with_accelerator(accelerator), downstream),
            None => {
                debug!("{}: not in the memory plan", ctx.layer()?);
                run_next(self, ctx, downstream)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::OaDim;
    use crate::hardware::{MemoryHierarchy, MemoryInstance, OperationalArray, ServedDimensions};
    use crate::pipeline::mapping_stages::{
        CostModelStage, SpatialMappingConversionStage, TemporalMappingStage,
    };
    use crate::pipeline::reduce::MinimalLatencyStage;
    use crate::pipeline::stage::run_chain;
    use crate::pipeline::stage::tests::{gemm_ctx, mapped_gemm};
    use crate::pipeline::WorkloadStage;
    use crate::workload::layer::tests::gemm_attrs;
    use crate::workload::WorkloadNode;
    use std::sync::Arc;
    use MemoryOperand::*;

    /// rf_w(I2) 0, rf_o(O) 1, sram(I1 I2 O) 2, gb(I1 O) 3, dram(I1 I2 O) 4.
    fn core() -> Core {
        let oa = OperationalArray::new(
            1.0,
            1.0,
            vec![8, 8],
            [(OaDim::new("D1"), 4), (OaDim::new("D2"), 4)]
                .into_iter()
                .collect(),
        )
        .unwrap();
        let mem = |name: &str, size| MemoryInstance::new(name, size, 64, 64, 1.0, 1.0, 0.0);
        let mut mh = MemoryHierarchy::new("test");
        mh.add_memory(mem("rf_w", 64), &[I2], None, &ServedDimensions::none(), &oa)
            .unwrap();
        mh.add_memory(mem("rf_o", 64), &[O], None, &ServedDimensions::dims(&["D2"]), &oa)
            .unwrap();
        mh.add_memory(mem("sram", 4096), &[I1, I2, O], None, &ServedDimensions::All, &oa)
            .unwrap();
        mh.add_memory(mem("gb", 1 << 20), &[I1, O], None, &ServedDimensions::All, &oa)
            .unwrap();
        mh.add_memory(
            mem("dram", 1 << 30).with_ports(0, 0, 1),
            &[I1, I2, O],
            None,
            &ServedDimensions::All,
            &oa,
        )
        .unwrap();
        Core::new(0, oa, mh).unwrap()
    }

    /// A 4x4x4 gemm with constant B: A is 128 bits, B 128 and O 256.
    fn layer(id: usize, sources: &[usize]) -> WorkloadNode {
        let mut attrs = gemm_attrs(4, 4, 4);
        attrs.constant_operands = vec![LayerOperand::new("B")];
        if !sources.is_empty() {
            attrs
                .operand_source
                .insert(LayerOperand::new("A"), sources.to_vec());
        }
        let name = format!("l{id}");
        WorkloadNode::Layer(Arc::new(LayerNode::new(id, &name, attrs).unwrap()))
    }

    fn tops(plan: &MemoryPlan, id: usize) -> [usize; 3] {
        let levels = plan.top_levels(id).unwrap();
        [levels[&I1], levels[&I2], levels[&O]]
    }

    #[test]
    fn test_chained_layers_stay_in_sram() {
        let workload =
            Workload::new(vec![layer(0, &[]), layer(1, &[0]), layer(2, &[1])]).unwrap();
        let plan = MemoryPlan::search(&workload, &core());
        assert_eq!(plan.len(), 3);
        // 128 + 256 bits of IO plus 3 * 128 bits of weights fit the sram. Layer 0 finds its
        // input there; the others take it from their producer.
        assert_eq!(tops(&plan, 0), [2, 2, 2]);
        assert_eq!(tops(&plan, 1), [2, 2, 2]);
        assert_eq!(tops(&plan, 2), [2, 2, 2]);
    }

    #[test]
    fn test_branches_go_through_the_top() {
        // 0 feeds 1 and 2, which both feed 3.
        let workload = Workload::new(vec![
            layer(0, &[]),
            layer(1, &[0]),
            layer(2, &[0]),
            layer(3, &[1, 2]),
        ])
        .unwrap();
        let plan = MemoryPlan::search(&workload, &core());
        // The branch start and both branch ends write their output to dram, and each
        // consumer reads it from there.
        assert_eq!(tops(&plan, 0), [4, 2, 4]);
        assert_eq!(tops(&plan, 1), [4, 2, 4]);
        assert_eq!(tops(&plan, 2), [4, 2, 4]);
        // The last layer still keeps its own output low.
        assert_eq!(tops(&plan, 3), [4, 2, 2]);
    }

    #[test]
    fn test_dummy_nodes_do_not_break_chains() {
        let workload = Workload::new(vec![
            layer(0, &[]),
            WorkloadNode::Dummy {
                id: 1,
                name: "relu".to_owned(),
                sources: vec![0],
            },
            layer(2, &[1]),
        ])
        .unwrap();
        let plan = MemoryPlan::search(&workload, &core());
        assert_eq!(plan.len(), 2);
        assert_eq!(tops(&plan, 2), [2, 2, 2]);
    }

    #[test]
    fn test_oversized_weights_keep_the_top() {
        // 16x16x16: A and B are 2048 bits each, O 4096. The sram is too small for anything.
        let mut attrs = gemm_attrs(16, 16, 16);
        attrs.constant_operands = vec![LayerOperand::new("B")];
        let big = LayerNode::new(0, "big", attrs).unwrap();
        let plan = MemoryPlan::search(&Workload::from_layers([big]).unwrap(), &core());
        // gb holds input and output; weights have nowhere below dram to go.
        assert_eq!(tops(&plan, 0), [3, 4, 3]);
    }

    #[test]
    fn test_other_cores_are_not_planned() {
        let mut attrs = gemm_attrs(4, 4, 4);
        attrs.core_allocation = vec![7];
        let elsewhere = LayerNode::new(0, "elsewhere", attrs).unwrap();
        let plan = MemoryPlan::search(&Workload::from_layers([elsewhere]).unwrap(), &core());
        assert!(plan.is_empty());
        assert!(plan.top_levels(0).is_none());
    }

    #[test]
    fn test_removal_follows_the_plan() {
        let workload = Workload::from_layers([mapped_gemm(0, "gemm", 16, 16, 16)]).unwrap();
        let ctx = gemm_ctx().with_workload(workload);
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SearchUnusedMemoryStage),
            Box::new(WorkloadStage),
            Box::new(RemoveUnusedMemoryStage),
            Box::new(SpatialMappingConversionStage),
            Box::new(MinimalLatencyStage),
            Box::new(TemporalMappingStage),
            Box::new(CostModelStage),
        ];
        let out: Vec<_> = run_chain(&chain, ctx)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(out.len(), 1);
        let cme = out[0].0.as_layer().unwrap();
        assert_eq!(cme.accelerator, "gemm_l1-removing-nouse-mem");
        // Both inputs and the output of a 16x16x16 gemm fit l1, so l3 is gone.
        assert!(cme
            .memory_levels
            .values()
            .all(|names| !names.iter().any(|n| n == "l3")));
    }

    #[test]
    fn test_removal_needs_a_plan() {
        let ctx = gemm_ctx().with_layer(Arc::new(mapped_gemm(0, "gemm", 16, 16, 16)));
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(RemoveUnusedMemoryStage),
            Box::new(CostModelStage),
        ];
        assert!(matches!(
            run_chain(&chain, ctx).err(),
            Some(PipelineError::MissingContext("memory plan"))
        ));
    }
}
