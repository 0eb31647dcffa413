//! Loop-order based memory allocation: enumerates orderings of the temporal loop prime factors
//! and allocates each to the memory hierarchy, bottom-up.

pub mod allocator;
pub mod engine;
pub mod multipermute;
pub mod ordering;

pub use allocator::MemoryAllocator;
pub use engine::LomaEngine;
pub use multipermute::{Lpf, PermutationConstraint};
pub use ordering::TemporalOrdering;

use crate::common::MemoryOperand;
use crate::mapping::MappingError;

#[derive(thiserror::Error, Debug)]
pub enum LomaError {
    #[error(
        "Memory {memory} cannot hold the loops assigned to operand {mem_op} \
         ({required} bits needed, {capacity} available)"
    )]
    MemoryTooSmall {
        memory: String,
        mem_op: MemoryOperand,
        required: u64,
        capacity: u64,
    },
    #[error("Highest memory of operand {mem_op}, {memory}, is too small to store all loops")]
    HierarchyTooSmall { memory: String, mem_op: MemoryOperand },
    #[error(
        "No valid loop ordering was found for layer {layer}; check that the spatial mapping is \
         compatible with the architecture"
    )]
    NoValidLoopOrdering { layer: String },
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl LomaError {
    /// Errors that only rule out the ordering at hand.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            LomaError::MemoryTooSmall { .. } | LomaError::HierarchyTooSmall { .. }
        )
    }
}
