use crate::pipeline::stage::{run_next, Stage, StageContext, StageIter};
use crate::pipeline::PipelineError;
use log::info;

/// Runs the stages below on an accelerator whose operational arrays are scaled by `factor` in
/// every dimension. User spatial mappings of the workload are scaled along, so that they keep
/// filling the array.
#[derive(Debug)]
pub struct PeArrayScalingStage {
    pub factor: f64,
}

impl PeArrayScalingStage {
    pub fn new(factor: f64) -> Self {
        PeArrayScalingStage { factor }
    }
}

impl Stage for PeArrayScalingStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let accelerator = ctx.accelerator.scaled(self.factor)?;
        let workload = ctx.workload()?.map_layers(|layer| {
            let mut layer = layer.clone();
            layer.spatial_mapping = layer.spatial_mapping.map(|sm| sm.scaled(self.factor));
            layer
        });
        info!(
            "Scaled the operational arrays of {} by {}",
            ctx.accelerator, self.factor
        );
        let ctx = ctx.with_accelerator(accelerator).with_workload(workload);
        run_next(self, ctx, downstream)
    }
}
