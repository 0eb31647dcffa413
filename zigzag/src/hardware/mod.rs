pub mod accelerator;
pub mod cores;
pub mod input;
pub mod memory_hierarchy;
pub mod memory_instance;
pub mod memory_level;
pub mod memory_port;
pub mod operational_array;
pub mod presets;

pub use accelerator::Accelerator;
pub use cores::Core;
pub use memory_hierarchy::MemoryHierarchy;
pub use memory_instance::MemoryInstance;
pub use memory_level::{MemoryLevel, ServedDimensions};
pub use memory_port::{DataDirection, MemoryPort, PortAllocation};
pub use operational_array::OperationalArray;

use crate::common::{MemoryOperand, OaDim};

#[derive(thiserror::Error, Debug)]
pub enum HardwareError {
    #[error("Operational array has no dimensions")]
    EmptyOperationalArray,
    #[error("Operational array dimension {0} has size 0")]
    ZeroSizedOaDim(OaDim),
    #[error("Memory {0} has no ports")]
    NoPorts(String),
    #[error("Memory {0} has a zero bandwidth or granularity")]
    ZeroBandwidth(String),
    #[error("Memory {0} has a minimum access granularity above its bandwidth")]
    GranularityAboveBandwidth(String),
    #[error("Memory {0} stores no operand")]
    NoOperands(String),
    #[error("Memory {memory} lists operand {mem_op} twice")]
    DuplicateOperand { memory: String, mem_op: MemoryOperand },
    #[error("Memory {memory} serves {dim}, which is not an operational array dimension")]
    UnknownServedDimension { memory: String, dim: OaDim },
    #[error("Memory {memory} serves {dim} more than once")]
    DuplicateServedDimension { memory: String, dim: OaDim },
    #[error("Memory {memory}: no port allocation for operand {mem_op}")]
    MissingPortAllocation { memory: String, mem_op: MemoryOperand },
    #[error("Memory {memory}: port allocation given for operand {mem_op}, which it does not store")]
    UnheldOperand { memory: String, mem_op: MemoryOperand },
    #[error("Memory {memory}: '{port}' is not a valid port name")]
    InvalidPortName { memory: String, port: String },
    #[error("Memory {memory} has no port named {port}")]
    UnknownPort { memory: String, port: String },
    #[error("'{0}' is not a data direction; expected fh, fl, th or tl")]
    InvalidDirection(String),
    #[error("Memory {0} asks for automatic cost extraction but no extractor is available")]
    NoCostExtractor(String),
    #[error("Core {0} has no memories")]
    EmptyHierarchy(usize),
    #[error("Accelerator {0} has no cores")]
    NoCores(String),
    #[error("Core id {0} appears more than once")]
    DuplicateCore(usize),
    #[error("No core with id {0}")]
    UnknownCore(usize),
    #[error("Unknown built-in accelerator '{0}'")]
    UnknownPreset(String),
    #[error("Could not read accelerator: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse accelerator: {0}")]
    Json(#[from] serde_json::Error),
}
