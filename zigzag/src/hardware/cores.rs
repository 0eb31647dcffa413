use crate::common::MemoryOperand;
use crate::hardware::memory_hierarchy::MemoryHierarchy;
use crate::hardware::memory_level::MemoryLevel;
use crate::hardware::operational_array::OperationalArray;
use crate::hardware::HardwareError;
use indexmap::IndexMap;
use std::fmt;

/// An operational array with its memory hierarchy.
#[derive(Debug, Clone)]
pub struct Core {
    pub id: usize,
    pub operational_array: OperationalArray,
    pub memory_hierarchy: MemoryHierarchy,
    mem_sharing_list: Vec<IndexMap<MemoryOperand, usize>>,
}

impl Core {
    pub fn new(
        id: usize,
        operational_array: OperationalArray,
        memory_hierarchy: MemoryHierarchy,
    ) -> Result<Self, HardwareError> {
        if memory_hierarchy.levels().is_empty() {
            return Err(HardwareError::EmptyHierarchy(id));
        }
        let mut mem_sharing_list: Vec<IndexMap<MemoryOperand, usize>> = Vec::new();
        for level in memory_hierarchy.levels() {
            if level.is_shared() && !mem_sharing_list.contains(&level.mem_level_of_operands) {
                mem_sharing_list.push(level.mem_level_of_operands.clone());
            }
        }
        Ok(Core {
            id,
            operational_array,
            memory_hierarchy,
            mem_sharing_list,
        })
    }

    /// The same core with a different memory hierarchy.
    pub fn with_hierarchy(&self, memory_hierarchy: MemoryHierarchy) -> Result<Self, HardwareError> {
        Core::new(self.id, self.operational_array.clone(), memory_hierarchy)
    }

    /// The same core on an operational array scaled by `factor` in every dimension.
    pub fn scaled(&self, factor: f64) -> Result<Self, HardwareError> {
        let array = self.operational_array.scaled(factor)?;
        let hierarchy = self.memory_hierarchy.for_array(&array)?;
        Core::new(self.id, array, hierarchy)
    }

    pub fn mem_levels(&self, mem_op: MemoryOperand) -> Vec<&MemoryLevel> {
        self.memory_hierarchy.levels_of(mem_op).collect()
    }

    pub fn get_memory_level(&self, mem_op: MemoryOperand, lv: usize) -> Option<&MemoryLevel> {
        self.memory_hierarchy.level(mem_op, lv)
    }

    pub fn mem_sizes(&self, mem_op: MemoryOperand) -> Vec<u64> {
        self.per_level(mem_op, |l| l.instance.size)
    }

    pub fn r_bw(&self, mem_op: MemoryOperand) -> Vec<u64> {
        self.per_level(mem_op, |l| l.instance.r_bw)
    }

    pub fn w_bw(&self, mem_op: MemoryOperand) -> Vec<u64> {
        self.per_level(mem_op, |l| l.instance.w_bw)
    }

    pub fn r_bw_min(&self, mem_op: MemoryOperand) -> Vec<u64> {
        self.per_level(mem_op, |l| l.instance.r_bw_min())
    }

    pub fn w_bw_min(&self, mem_op: MemoryOperand) -> Vec<u64> {
        self.per_level(mem_op, |l| l.instance.w_bw_min())
    }

    /// Groups of `(operand, level)` that live in the same physical memory, one entry per shared
    /// memory.
    pub fn mem_sharing_list(&self) -> &[IndexMap<MemoryOperand, usize>] {
        &self.mem_sharing_list
    }

    fn per_level<T>(&self, mem_op: MemoryOperand, f: impl Fn(&MemoryLevel) -> T) -> Vec<T> {
        self.memory_hierarchy.levels_of(mem_op).map(f).collect()
    }
}

impl fmt::Display for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Core({})", self.id)
    }
}
