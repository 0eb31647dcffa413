//! Layer-level worker pool. Each layer's sub-chain is an independent job; layers and the
//! accelerator are shared read-only.

use crate::pipeline::stage::{Stage, StageContext, StageIter, StageOutput};
use crate::pipeline::workload_stage::layer_results;
use crate::pipeline::PipelineError;
use crate::workload::LayerNode;
use log::info;
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use std::sync::Arc;

/// Evaluates every layer on a dedicated pool of `ctx.config.jobs` threads, then hands the
/// results on in the order of `layers`.
pub(crate) fn run_layers<'s>(
    stage: &dyn Stage,
    ctx: &StageContext,
    downstream: &'s [Box<dyn Stage>],
    layers: Vec<Arc<LayerNode>>,
) -> Result<StageIter<'s>, PipelineError> {
    let jobs = ctx.config.jobs;
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    info!("Evaluating {} layers on {jobs} threads", layers.len());

    // Collect per layer so that the output order does not depend on scheduling.
    let per_layer: Vec<Vec<Result<StageOutput, PipelineError>>> = pool.install(|| {
        layers
            .into_par_iter()
            .map(|layer| {
                info!("Processing layer {layer}");
                layer_results(stage, ctx.with_layer(layer), downstream).collect()
            })
            .collect()
    });
    Ok(Box::new(per_layer.into_iter().flatten()))
}
