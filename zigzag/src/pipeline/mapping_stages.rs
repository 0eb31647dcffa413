use crate::cost::{Cme, CostModelEvaluation};
use crate::loma::{LomaEngine, MemoryAllocator};
use crate::mapping::{SpatialMapping, TemporalMapping};
use crate::pipeline::stage::{
    run_next, ExtraInfo, SkipInfeasible, Stage, StageContext, StageIter,
};
use crate::pipeline::PipelineError;
use crate::salsa::SalsaEngine;
use crate::spatial::{convert, SpatialMappingError, SpatialMappingGenerator};
use log::{debug, info, Level};
use std::iter;
use std::sync::Arc;

/// Runs the stages below with one spatial mapping, tagging the results with it. Candidates the
/// stages below reject as infeasible are dropped.
fn with_spatial_mapping<'s>(
    stage: &dyn Stage,
    ctx: &StageContext,
    downstream: &'s [Box<dyn Stage>],
    mapping: SpatialMapping,
) -> StageIter<'s> {
    let converted = match ctx.layer().and_then(|layer| {
        let core = ctx.core()?;
        Ok(convert(&mapping, layer, core)?)
    }) {
        Ok(c) => c,
        Err(e) => return Box::new(iter::once(Err(e))),
    };
    let subject = format!("Spatial mapping {mapping}");
    match run_next(stage, ctx.with_spatial_mapping(converted), downstream) {
        Ok(results) => Box::new(SkipInfeasible::new(results, subject, Level::Debug).map(
            move |r| {
                r.map(|(cme, extra)| {
                    (
                        cme,
                        ExtraInfo::SpatialMapping {
                            mapping: mapping.clone(),
                            inner: Box::new(extra),
                        },
                    )
                })
            },
        )),
        Err(e) if e.is_feasibility() => {
            debug!("{subject}: {e}");
            Box::new(iter::empty())
        }
        Err(e) => Box::new(iter::once(Err(e))),
    }
}

/// Generates the spatial mappings of the layer in the context and runs the stages below once
/// per mapping. Fails with [PipelineError::NoFeasibleMapping] if none of them worked out.
#[derive(Debug, Default)]
pub struct SpatialMappingGeneratorStage;

impl Stage for SpatialMappingGeneratorStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let layer = ctx.layer()?.clone();
        let mappings = SpatialMappingGenerator::new(
            &layer,
            ctx.core()?,
            ctx.config.enable_mix_spatial_mapping_generation,
            ctx.config.nb_spatial_mappings_generated,
        )
        .generate()?;
        let total = mappings.len();
        let subject = format!("{layer} under any of its {total} spatial mappings");
        let results = Box::new(mappings.into_iter().enumerate().flat_map(
            move |(i, mapping)| {
                info!("{layer}: Launching spatial mapping {}/{total}: {mapping}", i + 1);
                with_spatial_mapping(self, &ctx, downstream, mapping)
            },
        ));
        Ok(Box::new(
            SkipInfeasible::new(results, subject, Level::Debug).failing_when_empty(),
        ))
    }
}

/// Runs the stages below with the layer's own spatial mapping, as given.
#[derive(Debug, Default)]
pub struct SpatialMappingConversionStage;

impl Stage for SpatialMappingConversionStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let layer = ctx.layer()?;
        let Some(mapping) = layer.spatial_mapping.clone() else {
            return Err(SpatialMappingError::InvalidUserMapping {
                layer: layer.name.clone(),
            }
            .into());
        };
        let subject = format!("{layer} under its own spatial mapping");
        let results = with_spatial_mapping(self, &ctx, downstream, mapping);
        Ok(Box::new(
            SkipInfeasible::new(results, subject, Level::Debug).failing_when_empty(),
        ))
    }
}

fn for_each_temporal_mapping<'s>(
    stage: &'s dyn Stage,
    ctx: StageContext,
    downstream: &'s [Box<dyn Stage>],
    mappings: impl Iterator<Item = Result<TemporalMapping, PipelineError>> + 's,
) -> StageIter<'s> {
    Box::new(mappings.flat_map(move |tm| -> StageIter<'s> {
        let tm = match tm {
            Ok(tm) => tm,
            Err(e) => return Box::new(iter::once(Err(e))),
        };
        match run_next(stage, ctx.with_temporal_mapping(tm), downstream) {
            Ok(results) => results,
            Err(e) => Box::new(iter::once(Err(e))),
        }
    }))
}

/// Runs the stages below once per temporal mapping of the layer and spatial mapping in the
/// context, as loma produces them.
///
/// A layer whose temporal ordering names every loop is allocated in that order only. Otherwise
/// loma enumerates loop orderings, honouring whatever positions the ordering pins.
#[derive(Debug, Default)]
pub struct TemporalMappingStage;

impl Stage for TemporalMappingStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let layer = ctx.layer()?.clone();
        let core = ctx.core()?.clone();
        let spatial = Arc::new(ctx.spatial_mapping()?.fractional.clone());
        let ordering = &layer.temporal_ordering;

        let engine = LomaEngine::new(
            layer.clone(),
            core.clone(),
            spatial.clone(),
            ctx.config.lpf_limit,
        );
        if ordering.is_complete(engine.temporal_loop_sizes()) {
            debug!("{layer}: allocating the given temporal ordering");
            let loops = ordering.resolve(&layer.loop_dim_size, &spatial.spatial_loop_dim_size);
            let tm = MemoryAllocator::new(&layer, &core, &spatial, &loops).run()?;
            return Ok(for_each_temporal_mapping(self, ctx, downstream, iter::once(Ok(tm))));
        }
        let mappings = engine
            .with_constraints(ordering.constraints())
            .with_progress(ctx.config.verbose)
            .run()
            .map(|tm| tm.map_err(PipelineError::from));
        Ok(for_each_temporal_mapping(self, ctx, downstream, mappings))
    }
}

/// Anneals over loop orderings instead of enumerating them and runs the stages below with the
/// best temporal mapping found. Layers that pin any loop go through loma, which honours pins.
#[derive(Debug, Default)]
pub struct SalsaStage;

impl Stage for SalsaStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let layer = ctx.layer()?.clone();
        if !layer.temporal_ordering.is_empty() {
            debug!("{layer}: temporal ordering given, enumerating with loma");
            let loma: &'static TemporalMappingStage = &TemporalMappingStage;
            return loma.run(ctx, downstream);
        }
        let settings = &ctx.config.salsa;
        info!(
            "{layer}: annealing loop orderings for {} with {} chain(s)",
            settings.opt, settings.chains
        );
        let engine = SalsaEngine::new(
            &ctx.accelerator.name,
            layer,
            ctx.core()?.clone(),
            ctx.spatial_mapping()?.clone(),
            ctx.config.lpf_limit,
            settings.clone(),
        )
        .with_same_data_no_access(ctx.config.access_same_data_considered_as_no_access);
        let annealed = engine.run()?;
        Ok(for_each_temporal_mapping(
            self,
            ctx,
            downstream,
            iter::once(Ok(annealed.temporal_mapping)),
        ))
    }
}

/// Runs the stages below with the layer's temporal ordering allocated as given. An `all` size
/// takes whatever the spatial mapping and earlier loops leave of the dimension.
#[derive(Debug, Default)]
pub struct TemporalOrderingConversionStage;

impl Stage for TemporalOrderingConversionStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let layer = ctx.layer()?;
        let spatial = &ctx.spatial_mapping()?.fractional;
        let mut ordering = layer.temporal_ordering.clone();
        ordering.remove_invalid_layer_dims(&layer.layer_dims(), &layer.name);
        let loops = ordering.resolve(&layer.loop_dim_size, &spatial.spatial_loop_dim_size);
        let tm = MemoryAllocator::new(layer, ctx.core()?, spatial, &loops).run()?;
        Ok(for_each_temporal_mapping(self, ctx, downstream, iter::once(Ok(tm))))
    }
}

/// Evaluates the mapping in the context. The last stage of every chain.
#[derive(Debug, Default)]
pub struct CostModelStage;

impl Stage for CostModelStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        _downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let cme = CostModelEvaluation::new(
            &ctx.accelerator.name,
            ctx.core()?,
            ctx.layer()?,
            ctx.spatial_mapping()?,
            ctx.temporal_mapping()?,
            ctx.config.access_same_data_considered_as_no_access,
        )?;
        Ok(Box::new(iter::once(Ok((Cme::from(cme), ExtraInfo::None)))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LayerDim;
    use crate::loma::TemporalOrdering;
    use crate::pipeline::reduce::{MinimalEnergyStage, MinimalLatencyStage};
    use crate::pipeline::stage::run_chain;
    use crate::pipeline::stage::tests::{gemm_ctx, mapped_gemm, FixedResults};
    use crate::workload::LayerNode;
    use std::sync::Arc;

    fn layer_ctx(layer: LayerNode) -> StageContext {
        gemm_ctx().with_layer(Arc::new(layer))
    }

    fn evaluate(chain: Vec<Box<dyn Stage>>, ctx: StageContext) -> Vec<(Cme, ExtraInfo)> {
        run_chain(&chain, ctx)
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn test_every_temporal_mapping_is_evaluated() {
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SpatialMappingConversionStage),
            Box::new(TemporalMappingStage),
            Box::new(CostModelStage),
        ];
        let out = evaluate(chain, layer_ctx(mapped_gemm(0, "gemm", 32, 32, 32)));
        // M, N and K each have 4 temporal iterations left: 2x2 for each, so at most
        // 6!/(2!2!2!) orderings.
        assert!(!out.is_empty() && out.len() <= 90);
        for (cme, extra) in &out {
            assert!(cme.totals().check_energy_sum());
            assert_eq!(cme.totals().mac_count, 32 * 32 * 32);
            assert!(matches!(extra, ExtraInfo::SpatialMapping { .. }));
        }
    }

    #[test]
    fn test_complete_ordering_gives_one_mapping() {
        let mut layer = mapped_gemm(0, "gemm", 32, 32, 32);
        layer.temporal_ordering = TemporalOrdering::new(
            [("K", 4), ("M", 4), ("N", 4)]
                .into_iter()
                .map(|(d, s)| (LayerDim::new(d), Some(s)))
                .collect(),
        );
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SpatialMappingConversionStage),
            Box::new(TemporalMappingStage),
            Box::new(CostModelStage),
        ];
        let out = evaluate(chain, layer_ctx(layer));
        assert_eq!(out.len(), 1);
        let cme = out[0].0.as_layer().unwrap();
        assert_eq!(cme.totals.latency.ideal_temporal_cycle, 64);
    }

    #[test]
    fn test_ordering_conversion_fills_open_sizes() {
        let mut layer = mapped_gemm(0, "gemm", 32, 32, 32);
        layer.temporal_ordering = TemporalOrdering::new(vec![
            (LayerDim::new("K"), None),
            (LayerDim::new("Z"), Some(2)),
            (LayerDim::new("M"), None),
            (LayerDim::new("N"), None),
        ]);
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SpatialMappingConversionStage),
            Box::new(TemporalOrderingConversionStage),
            Box::new(CostModelStage),
        ];
        let out = evaluate(chain, layer_ctx(layer));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.totals().latency.ideal_temporal_cycle, 64);
    }

    #[test]
    fn test_generated_mappings_are_reduced() {
        let mut layer = mapped_gemm(0, "gemm", 32, 32, 32);
        layer.spatial_mapping = None;
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(MinimalEnergyStage),
            Box::new(SpatialMappingGeneratorStage),
            Box::new(MinimalLatencyStage),
            Box::new(TemporalMappingStage),
            Box::new(CostModelStage),
        ];
        let out = evaluate(chain, layer_ctx(layer));
        assert_eq!(out.len(), 1);
        let ExtraInfo::SpatialMapping { mapping, .. } = &out[0].1 else {
            panic!("expected the spatial mapping as extra info");
        };
        assert!(mapping.oa_dims().count() > 0);
        assert_eq!(out[0].0.totals().mac_count, 32 * 32 * 32);
    }

    #[test]
    fn test_salsa_hands_on_one_mapping() {
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SpatialMappingConversionStage),
            Box::new(SalsaStage),
            Box::new(CostModelStage),
        ];
        let mut ctx = layer_ctx(mapped_gemm(0, "gemm", 32, 32, 32));
        let mut config = (*ctx.config).clone();
        config.salsa.iterations = 40;
        ctx.config = Arc::new(config);
        let out = evaluate(chain, ctx);
        assert_eq!(out.len(), 1);
        assert!(out[0].0.totals().check_energy_sum());
        assert_eq!(out[0].0.totals().mac_count, 32 * 32 * 32);
    }

    #[test]
    fn test_salsa_defers_pinned_orderings_to_loma() {
        let mut layer = mapped_gemm(0, "gemm", 32, 32, 32);
        layer.temporal_ordering = TemporalOrdering::new(
            [("K", 4), ("M", 4), ("N", 4)]
                .into_iter()
                .map(|(d, s)| (LayerDim::new(d), Some(s)))
                .collect(),
        );
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SpatialMappingConversionStage),
            Box::new(SalsaStage),
            Box::new(CostModelStage),
        ];
        let out = evaluate(chain, layer_ctx(layer));
        assert_eq!(out.len(), 1);
        let cme = out[0].0.as_layer().unwrap();
        let o = &cme.temporal_mapping[&crate::common::LayerOperand::new("O")];
        let dims: Vec<_> = o.iter().flatten().map(|(d, _)| d.as_str().to_owned()).collect();
        assert_eq!(dims, ["K", "M", "N"]);
    }

    #[test]
    fn test_infeasible_mappings_end_in_one_error() {
        let leaf = FixedResults::new(vec![Err("gemm".to_owned()), Err("gemm".to_owned())]);
        let chain: Vec<Box<dyn Stage>> =
            vec![Box::new(SpatialMappingConversionStage), Box::new(leaf)];
        let results: Vec<_> = run_chain(&chain, layer_ctx(mapped_gemm(0, "gemm", 16, 16, 16)))
            .unwrap()
            .collect();
        assert!(matches!(
            &results[..],
            [Err(PipelineError::NoFeasibleMapping(subject))]
                if subject.ends_with("under its own spatial mapping")
        ));
    }

    #[test]
    fn test_user_mapping_is_required_for_conversion() {
        let mut layer = mapped_gemm(0, "gemm", 16, 16, 16);
        layer.spatial_mapping = None;
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SpatialMappingConversionStage),
            Box::new(CostModelStage),
        ];
        let err = run_chain(&chain, layer_ctx(layer)).err().unwrap();
        assert!(err.is_feasibility());
    }

    #[test]
    fn test_cost_model_needs_a_temporal_mapping() {
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SpatialMappingConversionStage),
            Box::new(CostModelStage),
        ];
        let results: Vec<_> = run_chain(&chain, layer_ctx(mapped_gemm(0, "gemm", 16, 16, 16)))
            .unwrap()
            .collect();
        assert!(matches!(
            results[..],
            [Err(PipelineError::MissingContext("temporal mapping"))]
        ));
    }
}
