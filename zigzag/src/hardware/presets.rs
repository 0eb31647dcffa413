//! Built-in accelerators and their default mappings.

use crate::common::{MemoryOperand, OaDim};
use crate::hardware::accelerator::Accelerator;
use crate::hardware::cores::Core;
use crate::hardware::memory_hierarchy::MemoryHierarchy;
use crate::hardware::memory_instance::MemoryInstance;
use crate::hardware::memory_level::ServedDimensions;
use crate::hardware::memory_port::PortAllocation;
use crate::hardware::operational_array::OperationalArray;
use crate::hardware::HardwareError;
use crate::workload::input::{MappingDescriptor, MappingEntry};
use indexmap::IndexMap;

pub const PRESET_NAMES: [&str; 2] = ["gemm_l1", "ascend_like"];

pub fn by_name(name: &str) -> Result<Accelerator, HardwareError> {
    match name {
        "gemm_l1" => gemm_l1(),
        "ascend_like" => ascend_like(),
        _ => Err(HardwareError::UnknownPreset(name.to_owned())),
    }
}

/// The mapping the named preset is meant to be used with.
pub fn default_mapping(name: &str) -> Result<MappingDescriptor, HardwareError> {
    let (sm, links): (&[(&str, &str, f64)], &[(&str, MemoryOperand)]) = match name {
        "gemm_l1" => (
            &[("D1", "M", 8.0), ("D2", "N", 8.0), ("D3", "K", 8.0)],
            &[
                ("O", MemoryOperand::O),
                ("B", MemoryOperand::I2),
                ("A", MemoryOperand::I1),
            ],
        ),
        "ascend_like" => (
            &[
                ("D1", "K", 16.0),
                ("D2", "C", 16.0),
                ("D3", "OX", 2.0),
                ("D4", "OY", 2.0),
            ],
            &[
                ("O", MemoryOperand::O),
                ("W", MemoryOperand::I2),
                ("I", MemoryOperand::I1),
            ],
        ),
        _ => return Err(HardwareError::UnknownPreset(name.to_owned())),
    };
    let entry = MappingEntry {
        core_allocation: Some(vec![1]),
        spatial_mapping: Some(
            sm.iter()
                .map(|(oa, dim, f)| {
                    (
                        OaDim::new(oa),
                        [(dim.to_string(), *f)].into_iter().collect(),
                    )
                })
                .collect(),
        ),
        memory_operand_links: Some(links.iter().map(|(o, m)| (o.to_string(), *m)).collect()),
        ..Default::default()
    };
    Ok(MappingDescriptor::new(
        [(MappingDescriptor::DEFAULT_KEY.to_owned(), entry)]
            .into_iter()
            .collect(),
    ))
}

fn oa_dims(entries: &[(&str, u64)]) -> IndexMap<OaDim, u64> {
    entries.iter().map(|(d, s)| (OaDim::new(d), *s)).collect()
}

fn register_port_allocation(mem_op: MemoryOperand) -> Result<PortAllocation, HardwareError> {
    PortAllocation::from_short_names([(
        mem_op,
        vec![
            ("fh", "w_port_1"),
            ("tl", "r_port_1"),
            ("fl", "w_port_2"),
            ("th", "r_port_2"),
        ],
    )])
}

/// An 8x8x8 MAC array with an output register per column, a shared L1 and an off-chip L3.
pub fn gemm_l1() -> Result<Accelerator, HardwareError> {
    use MemoryOperand::*;
    let array = OperationalArray::new(
        0.04,
        1.0,
        vec![8, 8],
        oa_dims(&[("D1", 8), ("D2", 8), ("D3", 8)]),
    )?;

    let reg_o = MemoryInstance::new("reg_O", 32, 32, 32, 0.02, 0.02, 0.0).with_ports(2, 2, 0);
    let l1 = MemoryInstance::new("l1", 32 * 128 * 64, 2048, 2048, 22.9, 52.01, 0.0)
        .with_ports(0, 0, 1)
        .with_min_granularity(64, 64);
    let l3 = MemoryInstance::new("l3", 10_000_000_000, 512, 512, 700.0, 750.0, 0.0)
        .with_ports(0, 0, 1);

    let mut hierarchy = MemoryHierarchy::new("gemm_l1");
    hierarchy.add_memory(
        reg_o,
        &[O],
        Some(register_port_allocation(O)?),
        &ServedDimensions::dims(&["D3"]),
        &array,
    )?;
    hierarchy.add_memory(l1, &[I1, I2, O], None, &ServedDimensions::All, &array)?;
    hierarchy.add_memory(l3, &[I1, I2, O], None, &ServedDimensions::All, &array)?;

    Accelerator::new("gemm_l1", vec![Core::new(1, array, hierarchy)?])
}

/// A 16x16x2x2 array with weight and output register files, per-operand local SRAMs, a shared
/// activation buffer and DRAM.
pub fn ascend_like() -> Result<Accelerator, HardwareError> {
    use MemoryOperand::*;
    let array = OperationalArray::new(
        0.04,
        1.0,
        vec![8, 8],
        oa_dims(&[("D1", 16), ("D2", 16), ("D3", 2), ("D4", 2)]),
    )?;

    let reg_w = MemoryInstance::new("rf_1B", 8, 8, 8, 0.01, 0.01, 0.0);
    let reg_o = MemoryInstance::new("rf_2B", 16, 16, 16, 0.02, 0.02, 0.0).with_ports(2, 2, 0);
    let sram_w_local = MemoryInstance::new(
        "sram_64KB_W",
        8192 * 8,
        256 * 8,
        256 * 8,
        6.27 * 8.0,
        13.5 * 8.0,
        0.0,
    )
    .with_min_granularity(64, 64);
    let sram_i_local = MemoryInstance::new(
        "sram_64KB_I",
        8192 * 8,
        64 * 8,
        64 * 8,
        3.32 * 8.0,
        3.84 * 8.0,
        0.0,
    )
    .with_min_granularity(64, 64);
    let sram_o = MemoryInstance::new(
        "sram_256KB_O",
        32768 * 8 * 8,
        256 * 8,
        256 * 8,
        15.4 * 8.0,
        26.6 * 8.0,
        0.0,
    )
    .with_min_granularity(64, 64);
    let sram_w = MemoryInstance::new(
        "sram_1MB_W",
        131072 * 8 * 8,
        512 * 8,
        512 * 8,
        58.2 * 8.0,
        103.2 * 8.0,
        0.0,
    )
    .with_min_granularity(64, 64);
    let sram_a = MemoryInstance::new(
        "sram_1MB_A",
        131072 * 8 * 8,
        512 * 8,
        512 * 8,
        58.2 * 8.0,
        103.2 * 8.0,
        0.0,
    )
    .with_min_granularity(64, 64);
    let dram =
        MemoryInstance::new("dram", 10_000_000_000, 64, 64, 700.0, 750.0, 0.0).with_ports(0, 0, 1);

    let mut hierarchy = MemoryHierarchy::new("ascend_like");
    let all = ServedDimensions::All;
    hierarchy.add_memory(reg_w, &[I2], None, &ServedDimensions::dims(&["D3", "D4"]), &array)?;
    hierarchy.add_memory(
        reg_o,
        &[O],
        Some(register_port_allocation(O)?),
        &ServedDimensions::dims(&["D2"]),
        &array,
    )?;
    hierarchy.add_memory(sram_w_local, &[I2], None, &all, &array)?;
    hierarchy.add_memory(sram_i_local, &[I1], None, &all, &array)?;
    hierarchy.add_memory(sram_o, &[O], None, &all, &array)?;
    hierarchy.add_memory(sram_w, &[I2], None, &all, &array)?;
    hierarchy.add_memory(sram_a, &[I1, O], None, &all, &array)?;
    hierarchy.add_memory(dram, &[I1, I2, O], None, &all, &array)?;

    Accelerator::new("ascend_like", vec![Core::new(1, array, hierarchy)?])
}
