use crate::common::{MemoryOperand, OaDim};
use crate::hardware::memory_instance::MemoryInstance;
use crate::hardware::memory_port::{DataDirection, MemoryPort, PortAllocation};
use crate::hardware::operational_array::OperationalArray;
use crate::hardware::HardwareError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The operational array dimensions across which one memory instance broadcasts (or, for the
/// output, reduces) a word.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "ServedDimensionsRepr", into = "ServedDimensionsRepr")]
pub enum ServedDimensions {
    All,
    Dims(Vec<OaDim>),
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum ServedDimensionsRepr {
    Word(String),
    List(Vec<OaDim>),
}

impl TryFrom<ServedDimensionsRepr> for ServedDimensions {
    type Error = String;

    fn try_from(value: ServedDimensionsRepr) -> Result<Self, Self::Error> {
        match value {
            ServedDimensionsRepr::Word(w) if w == "all" => Ok(ServedDimensions::All),
            ServedDimensionsRepr::Word(w) => {
                Err(format!("expected \"all\" or a list of dimensions, got \"{w}\""))
            }
            ServedDimensionsRepr::List(dims) => Ok(ServedDimensions::Dims(dims)),
        }
    }
}

impl From<ServedDimensions> for ServedDimensionsRepr {
    fn from(value: ServedDimensions) -> Self {
        match value {
            ServedDimensions::All => ServedDimensionsRepr::Word("all".to_owned()),
            ServedDimensions::Dims(dims) => ServedDimensionsRepr::List(dims),
        }
    }
}

impl ServedDimensions {
    pub fn none() -> Self {
        ServedDimensions::Dims(Vec::new())
    }

    pub fn dims(names: &[&str]) -> Self {
        ServedDimensions::Dims(names.iter().map(|d| OaDim::new(d)).collect())
    }

    fn resolve(&self, memory: &str, array: &OperationalArray) -> Result<Vec<OaDim>, HardwareError> {
        match self {
            ServedDimensions::All => Ok(array.dimensions.keys().cloned().collect()),
            ServedDimensions::Dims(dims) => {
                let mut out: Vec<OaDim> = Vec::with_capacity(dims.len());
                for dim in dims {
                    if !array.dimensions.contains_key(dim) {
                        return Err(HardwareError::UnknownServedDimension {
                            memory: memory.to_owned(),
                            dim: dim.clone(),
                        });
                    }
                    if out.contains(dim) {
                        return Err(HardwareError::DuplicateServedDimension {
                            memory: memory.to_owned(),
                            dim: dim.clone(),
                        });
                    }
                    out.push(dim.clone());
                }
                Ok(out)
            }
        }
    }
}

/// A memory instance placed in a hierarchy: the operands it holds, at which level of each
/// operand, its ports and the array dimensions it serves.
#[derive(Debug, Clone)]
pub struct MemoryLevel {
    pub id: usize,
    pub instance: MemoryInstance,
    pub operands: Vec<MemoryOperand>,
    /// For each operand held, how many levels of that operand lie below this one.
    pub mem_level_of_operands: IndexMap<MemoryOperand, usize>,
    pub port_alloc: PortAllocation,
    pub served_dimensions: Vec<OaDim>,
    pub ports: Vec<MemoryPort>,
    /// Number of copies of this memory needed to cover the operational array: the product of
    /// the array dimensions it does not serve.
    pub unroll_count: u64,
}

impl MemoryLevel {
    pub(crate) fn new(
        id: usize,
        instance: MemoryInstance,
        mem_level_of_operands: IndexMap<MemoryOperand, usize>,
        port_alloc: PortAllocation,
        served_dimensions: &ServedDimensions,
        array: &OperationalArray,
    ) -> Result<Self, HardwareError> {
        instance.validate()?;
        let served_dimensions = served_dimensions.resolve(&instance.name, array)?;
        let operands: Vec<MemoryOperand> = mem_level_of_operands.keys().copied().collect();

        let mut ports = MemoryPort::ports_of(&instance);
        port_alloc.validate(&instance.name, &operands, &ports)?;
        for (&mem_op, &lv) in &mem_level_of_operands {
            for dir in DataDirection::ALL {
                let Some(port_name) = port_alloc.get(mem_op, dir) else {
                    continue;
                };
                if let Some(port) = ports.iter_mut().find(|p| p.name == port_name) {
                    port.served.push((mem_op, lv, dir));
                }
            }
        }

        let unroll_count = array
            .dimensions
            .iter()
            .filter(|(d, _)| !served_dimensions.contains(d))
            .map(|(_, &s)| s)
            .product();

        Ok(MemoryLevel {
            id,
            instance,
            operands,
            mem_level_of_operands,
            port_alloc,
            served_dimensions,
            ports,
            unroll_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }

    pub fn holds(&self, mem_op: MemoryOperand) -> bool {
        self.mem_level_of_operands.contains_key(&mem_op)
    }

    /// The level of `mem_op` this memory is, if it holds `mem_op`.
    pub fn level_of(&self, mem_op: MemoryOperand) -> Option<usize> {
        self.mem_level_of_operands.get(&mem_op).copied()
    }

    /// Whether more than one operand is stored here.
    pub fn is_shared(&self) -> bool {
        self.mem_level_of_operands.len() > 1
    }

    /// The number of array units one instance of this memory serves.
    pub fn total_fanout(&self, array: &OperationalArray) -> u64 {
        self.served_dimensions
            .iter()
            .filter_map(|d| array.size_of(d))
            .product()
    }

    pub fn port_serving(&self, mem_op: MemoryOperand, dir: DataDirection) -> Option<&MemoryPort> {
        let lv = self.level_of(mem_op)?;
        self.ports.iter().find(|p| p.serves(mem_op, lv, dir))
    }
}

impl fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryLevel({}, {:?}, served {:?})", self.name(), self.operands, self.served_dimensions)
    }
}
