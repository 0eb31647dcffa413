//! Composable stages that drive a design space exploration: per-layer fan-out, spatial and
//! temporal mapping enumeration, cost model evaluation, reduction and dumps.

pub mod mapping_stages;
pub mod parallel;
pub mod pe_array_scaling;
pub mod reduce;
pub mod save;
pub mod stage;
pub mod unused_memory;
pub mod util_stages;
pub mod workload_stage;

pub use mapping_stages::{
    CostModelStage, SalsaStage, SpatialMappingConversionStage, SpatialMappingGeneratorStage,
    TemporalMappingStage, TemporalOrderingConversionStage,
};
pub use pe_array_scaling::PeArrayScalingStage;
pub use reduce::{MinimalEdpStage, MinimalEnergyStage, MinimalLatencyStage, SumStage};
pub use save::{load_cme_list, CompleteSaveStage, PickleSaveStage, SimpleSaveStage};
pub use stage::{run_chain, ExtraInfo, Stage, StageContext, StageIter, StageOutput};
pub use unused_memory::{MemoryPlan, RemoveUnusedMemoryStage, SearchUnusedMemoryStage};
pub use util_stages::{CacheBeforeYieldStage, RemoveExtraInfoStage, SkipIfDumpExistsStage};
pub use workload_stage::WorkloadStage;

use crate::config::ConfigError;
use crate::cost::CostError;
use crate::hardware::HardwareError;
use crate::loma::LomaError;
use crate::mapping::MappingError;
use crate::salsa::SalsaError;
use crate::spatial::SpatialMappingError;
use crate::workload::WorkloadError;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    SpatialMapping(#[from] SpatialMappingError),
    #[error(transparent)]
    Loma(#[from] LomaError),
    #[error(transparent)]
    Salsa(#[from] SalsaError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Cost(#[from] CostError),
    #[error("Stage context has no {0}")]
    MissingContext(&'static str),
    #[error("{0} needs a stage below it")]
    MissingDownstream(String),
    #[error("No feasible mapping for {0}")]
    NoFeasibleMapping(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not write JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not (de)serialize results: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Worker pool failed to start: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    /// Errors that only rule out the candidate at hand; anything else is a malformed input or
    /// an environment failure.
    pub fn is_feasibility(&self) -> bool {
        match self {
            PipelineError::SpatialMapping(e) => matches!(
                e,
                SpatialMappingError::NoValidSpatialMapping { .. }
                    | SpatialMappingError::InvalidUserMapping { .. }
            ),
            PipelineError::Loma(e) | PipelineError::Salsa(SalsaError::Loma(e)) => {
                e.is_capacity() || matches!(e, LomaError::NoValidLoopOrdering { .. })
            }
            PipelineError::NoFeasibleMapping(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemoryOperand;

    #[test]
    fn test_feasibility_classification() {
        let capacity = PipelineError::from(LomaError::MemoryTooSmall {
            memory: "l1".to_owned(),
            mem_op: MemoryOperand::I1,
            required: 10,
            capacity: 1,
        });
        assert!(capacity.is_feasibility());
        assert!(PipelineError::from(SpatialMappingError::NoValidSpatialMapping {
            layer: "a".to_owned()
        })
        .is_feasibility());
        assert!(PipelineError::from(SalsaError::Loma(LomaError::NoValidLoopOrdering {
            layer: "a".to_owned()
        }))
        .is_feasibility());
        assert!(!PipelineError::from(HardwareError::UnknownCore(3)).is_feasibility());
        assert!(!PipelineError::MissingContext("layer").is_feasibility());
        assert!(!PipelineError::from(ConfigError::BelowOne {
            field: "jobs",
            value: 0
        })
        .is_feasibility());
    }
}
