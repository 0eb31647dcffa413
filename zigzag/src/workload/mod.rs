pub mod equation;
pub mod graph;
pub mod input;
pub mod layer;
pub mod relevancy;

use crate::common::{LayerDim, LayerOperand, MemoryOperand};
use equation::EquationError;

pub use graph::{Workload, WorkloadNode};
pub use layer::{LayerAttributes, LayerNode};

#[derive(thiserror::Error, Debug)]
pub enum WorkloadError {
    #[error("Layer {layer}: {source}")]
    Equation {
        layer: String,
        #[source]
        source: EquationError,
    },
    #[error("More than one relation defines dimension {0}")]
    DuplicateRelation(LayerDim),
    #[error("Layer {layer}: dimension {dim} is used but has no size")]
    UndefinedDimension { layer: String, dim: LayerDim },
    #[error("Layer {layer}: dimension {dim} must have a positive size")]
    ZeroSizedDimension { layer: String, dim: LayerDim },
    #[error("Layer {layer}: operand dimension {dim} is neither a loop dimension nor defined by a relation")]
    MissingRelation { layer: String, dim: LayerDim },
    #[error("Layer {layer}: operand {operand} has no precision")]
    MissingPrecision { layer: String, operand: LayerOperand },
    #[error("Layer {layer}: operand {operand} is not linked to a memory operand")]
    MissingMemoryOperandLink { layer: String, operand: LayerOperand },
    #[error("Layer {layer}: memory operand {mem_op} is linked more than once")]
    DuplicateMemoryOperandLink { layer: String, mem_op: MemoryOperand },
    #[error("Layer {layer}: spatial mapping or hint references dimension {dim} which is not in the layer")]
    UnknownMappedDimension { layer: String, dim: LayerDim },
    #[error("Layer {layer}: temporal ordering size must be a number or \"all\", got \"{word}\"")]
    InvalidTemporalOrdering { layer: String, word: String },
    #[error("Layer id {0} appears more than once")]
    DuplicateLayerId(usize),
    #[error("Layer {layer} takes input from unknown layer id {source_id}")]
    UnknownSource { layer: String, source_id: usize },
    #[error("Workload graph has a cycle through layer {0}")]
    Cycle(String),
    #[error("Could not read workload: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse workload: {0}")]
    Json(#[from] serde_json::Error),
}
