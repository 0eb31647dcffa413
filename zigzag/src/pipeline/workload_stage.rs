use crate::pipeline::parallel;
use crate::pipeline::stage::{run_next, ExtraInfo, SkipInfeasible, Stage, StageContext, StageIter};
use crate::pipeline::PipelineError;
use log::{info, warn, Level};
use std::iter;

/// Runs the stages below once per layer of the workload, in topological order. Dummy nodes
/// are skipped, and so are layers for which no feasible mapping exists.
#[derive(Debug, Default)]
pub struct WorkloadStage;

impl Stage for WorkloadStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let layers = ctx.workload()?.layers();
        if ctx.config.jobs > 1 {
            return parallel::run_layers(self, &ctx, downstream, layers);
        }
        let total = layers.len();
        Ok(Box::new(layers.into_iter().enumerate().flat_map(
            move |(i, layer)| {
                info!("Processing layer {layer} ({}/{total})", i + 1);
                layer_results(self, ctx.with_layer(layer), downstream)
            },
        )))
    }
}

/// The results of one layer, tagged with its id.
pub(crate) fn layer_results<'s>(
    stage: &dyn Stage,
    ctx: StageContext,
    downstream: &'s [Box<dyn Stage>],
) -> StageIter<'s> {
    let Some(layer) = ctx.layer.clone() else {
        return Box::new(iter::once(Err(PipelineError::MissingContext("layer"))));
    };
    match run_next(stage, ctx, downstream) {
        Ok(results) => {
            let id = layer.id;
            Box::new(
                SkipInfeasible::new(results, layer.to_string(), Level::Warn).map(move |r| {
                    r.map(|(cme, extra)| {
                        (
                            cme,
                            ExtraInfo::Layer {
                                id,
                                inner: Box::new(extra),
                            },
                        )
                    })
                }),
            )
        }
        Err(e) if e.is_feasibility() => {
            warn!("{layer}: {e}");
            Box::new(iter::empty())
        }
        Err(e) => Box::new(iter::once(Err(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DseConfig;
    use crate::pipeline::stage::run_chain;
    use crate::pipeline::stage::tests::{cme_with, gemm_ctx, mapped_gemm, FixedResults};
    use crate::workload::Workload;
    use std::sync::Arc;

    fn three_layers() -> Workload {
        let first = mapped_gemm(0, "first", 16, 16, 16);
        let mut second = mapped_gemm(1, "second", 16, 16, 16);
        second
            .operand_source
            .insert(crate::common::LayerOperand::new("A"), vec![2]);
        let third = mapped_gemm(2, "third", 16, 16, 16);
        Workload::from_layers([first, second, third]).unwrap()
    }

    fn layer_ids(out: &[(crate::cost::Cme, ExtraInfo)]) -> Vec<usize> {
        out.iter()
            .map(|(_, extra)| match extra {
                ExtraInfo::Layer { id, .. } => *id,
                other => panic!("unexpected extra info {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_layers_run_in_topological_order() {
        let leaf = FixedResults::new(vec![Ok(cme_with(1.0, 1))]);
        let chain: Vec<Box<dyn Stage>> = vec![Box::new(WorkloadStage), Box::new(leaf)];
        let ctx = gemm_ctx().with_workload(three_layers());
        let out: Vec<_> = run_chain(&chain, ctx).unwrap().map(Result::unwrap).collect();
        assert_eq!(layer_ids(&out), [0, 2, 1]);
    }

    #[test]
    fn test_worker_pool_keeps_the_order() {
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(WorkloadStage),
            Box::new(FixedResults::new(vec![Ok(cme_with(1.0, 1)), Ok(cme_with(2.0, 2))])),
        ];
        let acc = crate::hardware::presets::gemm_l1().unwrap();
        let config = DseConfig {
            jobs: 3,
            ..DseConfig::default()
        };
        let ctx = StageContext::new(config, acc).with_workload(three_layers());
        let out: Vec<_> = run_chain(&chain, ctx).unwrap().map(Result::unwrap).collect();
        assert_eq!(layer_ids(&out), [0, 0, 2, 2, 1, 1]);
        assert_eq!(out[1].0.energy_total(), 2.0);
    }

    #[test]
    fn test_infeasible_layers_are_skipped() {
        let leaf = FixedResults::new(vec![Err("any".to_owned())]);
        let chain: Vec<Box<dyn Stage>> = vec![Box::new(WorkloadStage), Box::new(leaf)];
        let ctx = gemm_ctx().with_workload(three_layers());
        assert_eq!(run_chain(&chain, ctx).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_workload() {
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(WorkloadStage),
            Box::new(FixedResults::new(vec![])),
        ];
        assert!(matches!(
            run_chain(&chain, gemm_ctx()),
            Err(PipelineError::MissingContext("workload"))
        ));
        let layer = Arc::new(mapped_gemm(0, "gemm", 16, 16, 16));
        let out: Vec<_> =
            layer_results(&WorkloadStage, gemm_ctx().with_layer(layer), &chain[1..]).collect();
        assert!(out.is_empty());
    }
}
