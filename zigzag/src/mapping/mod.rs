pub mod combined;
pub mod data_movement;
pub mod decouple;
pub mod spatial;
pub mod spatial_internal;
pub mod temporal;

pub use combined::Mapping;
pub use data_movement::{DataMovePattern, FourWay};
pub use spatial::{SpatialMapping, SpatialMappingHint};
pub use spatial_internal::SpatialMappingInternal;
pub use temporal::TemporalMapping;

use crate::common::LayerOperand;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("Mapping has no loops for operand {0}")]
    MissingOperand(LayerOperand),
    #[error("Spatial mapping unrolls operand {operand} over {found} units, expected {expected}")]
    InconsistentUnitCount {
        operand: LayerOperand,
        expected: u64,
        found: u64,
    },
    #[error("Temporal mapping of operand {operand} takes {found} cycles, expected {expected}")]
    InconsistentCycles {
        operand: LayerOperand,
        expected: u64,
        found: u64,
    },
    #[error(
        "Operand {operand} has {spatial} spatial levels but {temporal} temporal levels; \
         expected one spatial level more"
    )]
    LevelMismatch {
        operand: LayerOperand,
        spatial: usize,
        temporal: usize,
    },
}
