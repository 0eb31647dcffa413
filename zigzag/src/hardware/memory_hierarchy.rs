use crate::common::{MemoryOperand, OaDim};
use crate::hardware::memory_instance::MemoryInstance;
use crate::hardware::memory_level::{MemoryLevel, ServedDimensions};
use crate::hardware::memory_port::PortAllocation;
use crate::hardware::operational_array::OperationalArray;
use crate::hardware::HardwareError;
use indexmap::IndexMap;
use log::debug;

/// The memories attached to an operational array, stored lowest level first.
///
/// Each memory operand sees its own chain of levels; a memory holding several operands is a
/// shared level in each of their chains. Memories must be added bottom-up for every operand.
#[derive(Debug, Clone)]
pub struct MemoryHierarchy {
    pub name: String,
    levels: Vec<MemoryLevel>,
    nb_levels: IndexMap<MemoryOperand, usize>,
}

impl MemoryHierarchy {
    pub fn new(name: &str) -> Self {
        MemoryHierarchy {
            name: name.to_owned(),
            levels: Vec::new(),
            nb_levels: IndexMap::new(),
        }
    }

    /// Adds a memory above every memory already holding one of `operands`. Without a port
    /// allocation, [PortAllocation::default_for] is used.
    pub fn add_memory(
        &mut self,
        instance: MemoryInstance,
        operands: &[MemoryOperand],
        port_alloc: Option<PortAllocation>,
        served_dimensions: &ServedDimensions,
        array: &OperationalArray,
    ) -> Result<(), HardwareError> {
        if operands.is_empty() {
            return Err(HardwareError::NoOperands(instance.name));
        }
        let mut mem_level_of_operands = IndexMap::new();
        for &mem_op in operands {
            if mem_level_of_operands.contains_key(&mem_op) {
                return Err(HardwareError::DuplicateOperand {
                    memory: instance.name,
                    mem_op,
                });
            }
            mem_level_of_operands.insert(mem_op, self.nb_levels(mem_op));
        }
        let port_alloc =
            port_alloc.unwrap_or_else(|| PortAllocation::default_for(operands, &instance));
        let level = MemoryLevel::new(
            self.levels.len(),
            instance,
            mem_level_of_operands,
            port_alloc,
            served_dimensions,
            array,
        )?;
        for &mem_op in operands {
            *self.nb_levels.entry(mem_op).or_insert(0) += 1;
        }
        self.levels.push(level);
        Ok(())
    }

    pub fn levels(&self) -> &[MemoryLevel] {
        &self.levels
    }

    pub fn operands(&self) -> impl Iterator<Item = MemoryOperand> + '_ {
        self.nb_levels.keys().copied()
    }

    pub fn nb_levels(&self, mem_op: MemoryOperand) -> usize {
        self.nb_levels.get(&mem_op).copied().unwrap_or(0)
    }

    /// The levels holding `mem_op`, lowest first.
    pub fn levels_of(&self, mem_op: MemoryOperand) -> impl Iterator<Item = &MemoryLevel> {
        self.levels.iter().filter(move |l| l.holds(mem_op))
    }

    pub fn level(&self, mem_op: MemoryOperand, lv: usize) -> Option<&MemoryLevel> {
        self.levels_of(mem_op).nth(lv)
    }

    /// The memories with no other memory below them for any of their operands.
    pub fn inner_memories(&self) -> impl Iterator<Item = &MemoryLevel> {
        self.levels
            .iter()
            .filter(|l| l.mem_level_of_operands.values().all(|&lv| lv == 0))
    }

    pub fn top_level(&self, mem_op: MemoryOperand) -> Option<&MemoryLevel> {
        self.levels_of(mem_op).last()
    }

    pub fn size_at(&self, mem_op: MemoryOperand, lv: usize) -> Option<u64> {
        self.level(mem_op, lv).map(|l| l.instance.size)
    }

    pub fn served_dims(&self, mem_op: MemoryOperand, lv: usize) -> Option<&[OaDim]> {
        self.level(mem_op, lv).map(|l| l.served_dimensions.as_slice())
    }

    /// A copy of this hierarchy where each operand in `top_levels` is kept only in the memories
    /// up to the given index into [MemoryHierarchy::levels]. Other operands keep all their
    /// levels. Memories left without operands are dropped.
    pub fn with_top_levels(
        &self,
        top_levels: &IndexMap<MemoryOperand, usize>,
        array: &OperationalArray,
    ) -> Result<MemoryHierarchy, HardwareError> {
        self.rebuild(
            &format!("{}-without-unused-memory", self.name),
            array,
            |level, op| top_levels.get(&op).map_or(true, |&top| level.id <= top),
        )
    }

    /// The same memories placed over another operational array with the same dimension names.
    /// Unroll counts follow the new array sizes.
    pub fn for_array(&self, array: &OperationalArray) -> Result<MemoryHierarchy, HardwareError> {
        self.rebuild(&format!("{}-scaled", self.name), array, |_, _| true)
    }

    fn rebuild(
        &self,
        name: &str,
        array: &OperationalArray,
        keep: impl Fn(&MemoryLevel, MemoryOperand) -> bool,
    ) -> Result<MemoryHierarchy, HardwareError> {
        let mut rebuilt = MemoryHierarchy::new(name);
        for level in &self.levels {
            let operands: Vec<MemoryOperand> = level
                .operands
                .iter()
                .copied()
                .filter(|&op| keep(level, op))
                .collect();
            if operands.is_empty() {
                debug!("Removing unused memory {} from {}", level.name(), self.name);
                continue;
            }
            rebuilt.add_memory(
                level.instance.clone(),
                &operands,
                Some(level.port_alloc.restricted_to(&operands)),
                &ServedDimensions::Dims(level.served_dimensions.clone()),
                array,
            )?;
        }
        Ok(rebuilt)
    }
}
