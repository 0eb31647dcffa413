//! One-call entry points: assemble the default stage chain and run it over a workload.

use crate::config::{DseConfig, TemporalEngine};
use crate::cost::Cme;
use crate::hardware::input::AcceleratorDescriptor;
use crate::hardware::presets::{self, PRESET_NAMES};
use crate::hardware::Accelerator;
use crate::pipeline::reduce::minimal_stage;
use crate::pipeline::{
    run_chain, CompleteSaveStage, CostModelStage, PeArrayScalingStage, PickleSaveStage,
    PipelineError, RemoveUnusedMemoryStage, SalsaStage, SearchUnusedMemoryStage, SimpleSaveStage,
    SkipIfDumpExistsStage, SpatialMappingGeneratorStage, Stage, StageContext, SumStage,
    TemporalMappingStage, WorkloadStage,
};
use crate::workload::input::{MappingDescriptor, WorkloadDescriptor};
use crate::workload::Workload;
use log::info;
use std::path::Path;

/// What a run produces: the sum over all layers and the best result of each layer, in
/// topological order.
#[derive(Debug, Clone)]
pub struct DseOutcome {
    pub total: Cme,
    pub layers: Vec<Cme>,
}

/// The stages of a full exploration, outermost first.
///
/// The sum over layers is dumped (complete, simple and as a list of the per-layer results),
/// each layer's best result is dumped, and per layer the best temporal mapping of every
/// generated spatial mapping competes under `config.opt`.
pub fn default_chain(config: &DseConfig) -> Vec<Box<dyn Stage>> {
    let pattern = config.dump_pattern();
    let mut chain: Vec<Box<dyn Stage>> = vec![
        Box::new(CompleteSaveStage::new(&pattern)),
        Box::new(SimpleSaveStage::new(&pattern)),
        Box::new(PickleSaveStage::new(&config.pickle_filename)),
        Box::new(SumStage),
    ];
    if config.pe_array_scaling != 1.0 {
        chain.push(Box::new(PeArrayScalingStage::new(config.pe_array_scaling)));
    }
    if config.remove_unused_memory {
        chain.push(Box::new(SearchUnusedMemoryStage));
    }
    chain.push(Box::new(WorkloadStage));
    if config.skip_if_dump_exists {
        chain.push(Box::new(SkipIfDumpExistsStage::new(&pattern)));
    }
    if config.remove_unused_memory {
        chain.push(Box::new(RemoveUnusedMemoryStage));
    }
    chain.extend([
        Box::new(CompleteSaveStage::new(&pattern)) as Box<dyn Stage>,
        minimal_stage(config.opt),
        Box::new(SpatialMappingGeneratorStage),
        minimal_stage(config.opt),
    ]);
    chain.push(match config.temporal_engine {
        TemporalEngine::Loma => Box::new(TemporalMappingStage) as Box<dyn Stage>,
        TemporalEngine::Salsa => Box::new(SalsaStage),
    });
    chain.push(Box::new(CostModelStage));
    chain
}

/// Explores `workload` on `accelerator`.
///
/// Layers without a feasible mapping are skipped with a warning; if no layer at all can be
/// mapped the run fails with [PipelineError::NoFeasibleMapping].
pub fn run(
    workload: Workload,
    accelerator: Accelerator,
    config: DseConfig,
) -> Result<DseOutcome, PipelineError> {
    config.validate()?;
    let chain = default_chain(&config);
    let accelerator_name = accelerator.name.clone();
    let ctx = StageContext::new(config, accelerator).with_workload(workload);
    let mut results = run_chain(&chain, ctx)?.collect::<Result<Vec<_>, _>>()?;
    let Some((total, extra)) = results.pop() else {
        return Err(PipelineError::NoFeasibleMapping(format!(
            "any layer on {accelerator_name}"
        )));
    };
    let layers = extra.results().iter().map(|(c, _)| c.clone()).collect();
    Ok(DseOutcome { total, layers })
}

/// Resolves `accelerator` as a preset name, or else as the path of an accelerator JSON file.
/// Presets come with the mapping they are meant to be used with.
pub fn load_accelerator(
    accelerator: &str,
) -> Result<(Accelerator, Option<MappingDescriptor>), PipelineError> {
    if PRESET_NAMES.contains(&accelerator) {
        return Ok((
            presets::by_name(accelerator)?,
            Some(presets::default_mapping(accelerator)?),
        ));
    }
    let acc = AcceleratorDescriptor::from_json_file(accelerator)?.build(None)?;
    Ok((acc, None))
}

/// Loads the inputs from disk and explores them. A mapping file, when given, replaces the
/// preset's mapping.
pub fn get_hardware_performance(
    workload: &Path,
    accelerator: &str,
    mapping: Option<&Path>,
    config: DseConfig,
) -> Result<DseOutcome, PipelineError> {
    let (acc, preset_mapping) = load_accelerator(accelerator)?;
    let mapping = match mapping {
        Some(path) => Some(MappingDescriptor::from_json_file(path)?),
        None => preset_mapping,
    };
    let workload = WorkloadDescriptor::from_json_file(workload)?.build(mapping.as_ref())?;
    info!(
        "Exploring {} layers on {}",
        workload.layers().len(),
        acc.name
    );
    run(workload, acc, config)
}
