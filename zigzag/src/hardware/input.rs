//! JSON descriptions of accelerators.

use crate::common::{MemoryOperand, OaDim};
use crate::hardware::accelerator::Accelerator;
use crate::hardware::cores::Core;
use crate::hardware::memory_hierarchy::MemoryHierarchy;
use crate::hardware::memory_instance::{MemoryCostExtractor, MemoryInstance};
use crate::hardware::memory_level::ServedDimensions;
use crate::hardware::memory_port::PortAllocation;
use crate::hardware::operational_array::OperationalArray;
use crate::hardware::HardwareError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcceleratorDescriptor {
    pub name: String,
    pub cores: Vec<CoreDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreDescriptor {
    pub id: usize,
    pub operational_array: OperationalArrayDescriptor,
    /// Memories from the lowest to the highest level.
    pub memories: Vec<MemoryDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperationalArrayDescriptor {
    pub unit_energy: f64,
    pub unit_area: f64,
    #[serde(default)]
    pub input_precision: Vec<u32>,
    pub dimensions: IndexMap<OaDim, u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryDescriptor {
    pub memory_instance: MemoryInstance,
    pub operands: Vec<MemoryOperand>,
    #[serde(default = "ServedDimensions::none")]
    pub served_dimensions: ServedDimensions,
    #[serde(default)]
    pub port_allocation: Option<PortAllocation>,
}

impl AcceleratorDescriptor {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HardwareError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Builds the accelerator. Memories asking for automatic cost extraction get their costs
    /// from `extractor`.
    pub fn build(
        self,
        extractor: Option<&dyn MemoryCostExtractor>,
    ) -> Result<Accelerator, HardwareError> {
        let cores = self
            .cores
            .into_iter()
            .map(|c| c.build(&self.name, extractor))
            .collect::<Result<Vec<_>, _>>()?;
        Accelerator::new(&self.name, cores)
    }
}

impl CoreDescriptor {
    fn build(
        self,
        accelerator: &str,
        extractor: Option<&dyn MemoryCostExtractor>,
    ) -> Result<Core, HardwareError> {
        let oa = self.operational_array;
        let array = OperationalArray::new(
            oa.unit_energy,
            oa.unit_area,
            oa.input_precision,
            oa.dimensions,
        )?;
        let mut hierarchy = MemoryHierarchy::new(&format!("{accelerator} core {}", self.id));
        for mut memory in self.memories {
            memory.memory_instance.extract_costs(extractor)?;
            hierarchy.add_memory(
                memory.memory_instance,
                &memory.operands,
                memory.port_allocation,
                &memory.served_dimensions,
                &array,
            )?;
        }
        Core::new(self.id, array, hierarchy)
    }
}
