use crate::common::MemoryOperand;
use crate::hardware::memory_instance::MemoryInstance;
use crate::hardware::HardwareError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PortKind {
    Read,
    Write,
    ReadWrite,
}

/// A direction of data movement at a memory level, seen from that level.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum DataDirection {
    /// Read out towards the level below (or the operational array).
    #[strum(serialize = "tl")]
    #[serde(rename = "tl")]
    RdOutToLow,
    /// Written in by the level below, e.g. partial sums.
    #[strum(serialize = "fl")]
    #[serde(rename = "fl")]
    WrInByLow,
    /// Read out towards the level above.
    #[strum(serialize = "th")]
    #[serde(rename = "th")]
    RdOutToHigh,
    /// Written in by the level above (refills).
    #[strum(serialize = "fh")]
    #[serde(rename = "fh")]
    WrInByHigh,
}

impl DataDirection {
    pub const ALL: [DataDirection; 4] = [
        DataDirection::RdOutToLow,
        DataDirection::WrInByLow,
        DataDirection::RdOutToHigh,
        DataDirection::WrInByHigh,
    ];

    pub fn is_write(self) -> bool {
        matches!(self, DataDirection::WrInByLow | DataDirection::WrInByHigh)
    }

    pub fn is_read(self) -> bool {
        !self.is_write()
    }

    /// Whether the other end of the transfer is the level below.
    pub fn faces_low(self) -> bool {
        matches!(self, DataDirection::RdOutToLow | DataDirection::WrInByLow)
    }
}

/// A physical port of a memory level, and the data movements allocated to it.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPort {
    pub name: String,
    pub kind: PortKind,
    pub bw: u64,
    pub bw_min: u64,
    /// `(operand, level of the operand, direction)` triples this port carries.
    pub served: Vec<(MemoryOperand, usize, DataDirection)>,
}

impl MemoryPort {
    /// The ports of an instance: read ports first, then write ports, then read-write ports.
    /// Read-write ports read and write with the read bandwidth.
    pub fn ports_of(instance: &MemoryInstance) -> Vec<MemoryPort> {
        let mut ports = Vec::with_capacity(instance.port_count() as usize);
        let mut push = |prefix: &str, count: u32, kind, bw, bw_min| {
            for i in 1..=count {
                ports.push(MemoryPort {
                    name: format!("{prefix}_port_{i}"),
                    kind,
                    bw,
                    bw_min,
                    served: Vec::new(),
                });
            }
        };
        push(
            "r",
            instance.r_port,
            PortKind::Read,
            instance.r_bw,
            instance.r_bw_min(),
        );
        push(
            "w",
            instance.w_port,
            PortKind::Write,
            instance.w_bw,
            instance.w_bw_min(),
        );
        push(
            "rw",
            instance.rw_port,
            PortKind::ReadWrite,
            instance.r_bw,
            instance.r_bw_min(),
        );
        ports
    }

    pub fn serves(&self, mem_op: MemoryOperand, level: usize, direction: DataDirection) -> bool {
        self.served.contains(&(mem_op, level, direction))
    }
}

impl fmt::Display for MemoryPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Checks a name against `r_port_N`, `w_port_N` and `rw_port_N`.
fn is_valid_port_name(name: &str) -> bool {
    let rest = name
        .strip_prefix("rw")
        .or_else(|| name.strip_prefix('r'))
        .or_else(|| name.strip_prefix('w'))
        .unwrap_or(name);
    let Some(index) = rest.strip_prefix("_port_") else {
        return false;
    };
    !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
}

/// Which physical port carries each data movement, per memory operand. A direction without a
/// port is not used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PortAllocation(IndexMap<MemoryOperand, IndexMap<DataDirection, String>>);

impl PortAllocation {
    pub fn new(data: IndexMap<MemoryOperand, IndexMap<DataDirection, String>>) -> Self {
        PortAllocation(data)
    }

    /// Parses per-operand maps keyed by the short direction names (`fh`, `fl`, `th`, `tl`).
    pub fn from_short_names<'a>(
        entries: impl IntoIterator<Item = (MemoryOperand, Vec<(&'a str, &'a str)>)>,
    ) -> Result<Self, HardwareError> {
        let mut data = IndexMap::new();
        for (mem_op, dirs) in entries {
            let mut per_op = IndexMap::new();
            for (dir, port) in dirs {
                let dir: DataDirection = dir
                    .parse()
                    .map_err(|_| HardwareError::InvalidDirection(dir.to_owned()))?;
                per_op.insert(dir, port.to_owned());
            }
            data.insert(mem_op, per_op);
        }
        Ok(PortAllocation(data))
    }

    /// The allocation used when none is given. An instance with only read-write ports moves
    /// everything through `rw_port_1`; otherwise writes go through `w_port_1` and reads
    /// through `r_port_1`, and only the output moves data upwards.
    pub fn default_for(operands: &[MemoryOperand], instance: &MemoryInstance) -> Self {
        let rw_only = instance.r_port == 0 && instance.w_port == 0 && instance.rw_port > 0;
        let mut data = IndexMap::new();
        for &mem_op in operands {
            let dirs: &[DataDirection] = if mem_op.is_output() {
                &DataDirection::ALL
            } else {
                &[DataDirection::WrInByHigh, DataDirection::RdOutToLow]
            };
            let per_op = dirs
                .iter()
                .map(|&dir| {
                    let port = if rw_only {
                        "rw_port_1"
                    } else if dir.is_write() {
                        "w_port_1"
                    } else {
                        "r_port_1"
                    };
                    (dir, port.to_owned())
                })
                .collect();
            data.insert(mem_op, per_op);
        }
        PortAllocation(data)
    }

    pub fn get(&self, mem_op: MemoryOperand, dir: DataDirection) -> Option<&str> {
        self.0.get(&mem_op).and_then(|m| m.get(&dir)).map(String::as_str)
    }

    pub fn operands(&self) -> impl Iterator<Item = MemoryOperand> + '_ {
        self.0.keys().copied()
    }

    /// Keeps only the given operands.
    pub fn restricted_to(&self, operands: &[MemoryOperand]) -> Self {
        PortAllocation(
            self.0
                .iter()
                .filter(|(op, _)| operands.contains(op))
                .map(|(op, m)| (*op, m.clone()))
                .collect(),
        )
    }

    /// Checks that every operand held has an entry and that every named port exists.
    pub(crate) fn validate(
        &self,
        memory: &str,
        operands: &[MemoryOperand],
        ports: &[MemoryPort],
    ) -> Result<(), HardwareError> {
        for mem_op in operands {
            if !self.0.contains_key(mem_op) {
                return Err(HardwareError::MissingPortAllocation {
                    memory: memory.to_owned(),
                    mem_op: *mem_op,
                });
            }
        }
        for (mem_op, per_op) in &self.0 {
            if !operands.contains(mem_op) {
                return Err(HardwareError::UnheldOperand {
                    memory: memory.to_owned(),
                    mem_op: *mem_op,
                });
            }
            for port in per_op.values() {
                if !is_valid_port_name(port) {
                    return Err(HardwareError::InvalidPortName {
                        memory: memory.to_owned(),
                        port: port.clone(),
                    });
                }
                if !ports.iter().any(|p| &p.name == port) {
                    return Err(HardwareError::UnknownPort {
                        memory: memory.to_owned(),
                        port: port.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_names() {
        assert!(is_valid_port_name("r_port_1"));
        assert!(is_valid_port_name("rw_port_12"));
        assert!(is_valid_port_name("_port_3"));
        assert!(!is_valid_port_name("rw_port_"));
        assert!(!is_valid_port_name("x_port_1"));
        assert!(!is_valid_port_name("r_port_1a"));
    }

    #[test]
    fn test_ports_of_instance() {
        let m = MemoryInstance::new("m", 64, 16, 8, 0.0, 0.0, 0.0)
            .with_ports(2, 1, 1)
            .with_min_granularity(4, 2);
        let ports = MemoryPort::ports_of(&m);
        let names: Vec<_> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["r_port_1", "r_port_2", "w_port_1", "rw_port_1"]);
        assert_eq!((ports[2].bw, ports[2].bw_min), (8, 2));
        assert_eq!((ports[3].bw, ports[3].bw_min), (16, 4));
    }

    #[test]
    fn test_default_allocation() {
        let sram = MemoryInstance::new("sram", 64, 16, 16, 0.0, 0.0, 0.0);
        let alloc = PortAllocation::default_for(&[MemoryOperand::I1, MemoryOperand::O], &sram);
        assert_eq!(alloc.get(MemoryOperand::I1, DataDirection::WrInByHigh), Some("w_port_1"));
        assert_eq!(alloc.get(MemoryOperand::I1, DataDirection::RdOutToHigh), None);
        assert_eq!(alloc.get(MemoryOperand::O, DataDirection::WrInByLow), Some("w_port_1"));
        assert_eq!(alloc.get(MemoryOperand::O, DataDirection::RdOutToHigh), Some("r_port_1"));

        let dram = MemoryInstance::new("dram", 64, 16, 16, 0.0, 0.0, 0.0).with_ports(0, 0, 1);
        let alloc = PortAllocation::default_for(&[MemoryOperand::O], &dram);
        assert!(DataDirection::ALL
            .iter()
            .all(|&d| alloc.get(MemoryOperand::O, d) == Some("rw_port_1")));
    }

    #[test]
    fn test_short_names_and_validation() {
        let m = MemoryInstance::new("m", 64, 16, 16, 0.0, 0.0, 0.0);
        let ports = MemoryPort::ports_of(&m);
        let alloc = PortAllocation::from_short_names([(
            MemoryOperand::I2,
            vec![("fh", "w_port_1"), ("tl", "r_port_1")],
        )])
        .unwrap();
        alloc.validate("m", &[MemoryOperand::I2], &ports).unwrap();
        assert!(matches!(
            alloc.validate("m", &[MemoryOperand::I2, MemoryOperand::O], &ports),
            Err(HardwareError::MissingPortAllocation { .. })
        ));

        let bad = PortAllocation::from_short_names([(MemoryOperand::I2, vec![("fh", "w_port_2")])])
            .unwrap();
        assert!(matches!(
            bad.validate("m", &[MemoryOperand::I2], &ports),
            Err(HardwareError::UnknownPort { .. })
        ));
        assert!(matches!(
            PortAllocation::from_short_names([(MemoryOperand::O, vec![("up", "r_port_1")])]),
            Err(HardwareError::InvalidDirection(_))
        ));
    }
}
