//! Spatial mapping generation (which layer dimensions unroll over the operational array) and
//! conversion into the per-memory-level form used by the cost model.

pub mod conversion;
pub mod generator;

pub use conversion::{convert, ConvertedSpatialMapping};
pub use generator::SpatialMappingGenerator;

use crate::common::{LayerOperand, MemoryOperand};
use crate::mapping::MappingError;

#[derive(thiserror::Error, Debug)]
pub enum SpatialMappingError {
    #[error("Layer {layer}: no valid spatial mapping for the operational array")]
    NoValidSpatialMapping { layer: String },
    #[error("Layer {layer}: the given spatial mapping does not fit the operational array")]
    InvalidUserMapping { layer: String },
    #[error("Layer {layer}: operand {operand} is not linked to a memory operand")]
    UnlinkedOperand { layer: String, operand: LayerOperand },
    #[error("Layer {layer}: the core has no memory for operand {mem_op}")]
    UnservedOperand { layer: String, mem_op: MemoryOperand },
    #[error(transparent)]
    Mapping(#[from] MappingError),
}
