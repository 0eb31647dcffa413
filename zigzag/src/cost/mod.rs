//! Cost model: memory word accesses, energy and latency of one mapped layer, and their sums
//! over several layers.

pub mod cumulative;
pub mod evaluation;
pub mod port_activity;
pub mod report;

pub use cumulative::{Cme, CumulativeCme};
pub use evaluation::CostModelEvaluation;
pub use port_activity::{PortActivity, PortStall};

use crate::common::LayerOperand;
use crate::hardware::HardwareError;
use crate::mapping::{FourWay, MappingError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::ops::Add;

#[derive(thiserror::Error, Debug)]
pub enum CostError {
    #[error("Layer {layer}: operand {operand} is not linked to a memory operand")]
    UnlinkedOperand { layer: String, operand: LayerOperand },
    #[error("Layer {layer}: operand {operand} is mapped to {mapped} memory levels, the core has {available}")]
    TooManyLevels {
        layer: String,
        operand: LayerOperand,
        mapped: usize,
        available: usize,
    },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Cycle counts of a layer (or a sum of layers).
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct Latency {
    /// Cycles with every MAC unit busy all the time.
    pub ideal_cycle: u64,
    /// Cycles of the temporal mapping given the (possibly under-utilizing) spatial mapping.
    pub ideal_temporal_cycle: u64,
    pub spatial_stall: u64,
    /// Combined stall of the busiest memory port.
    pub temporal_stall: u64,
    pub data_loading_cycle: u64,
    pub data_offloading_cycle: u64,
    pub latency_total0: u64,
    pub latency_total1: u64,
    pub latency_total2: u64,
}

impl Latency {
    pub fn new(
        ideal_cycle: u64,
        ideal_temporal_cycle: u64,
        temporal_stall: u64,
        data_loading_cycle: u64,
        data_offloading_cycle: u64,
    ) -> Self {
        let latency_total0 = ideal_temporal_cycle + temporal_stall;
        let latency_total1 = latency_total0 + data_loading_cycle;
        Latency {
            ideal_cycle,
            ideal_temporal_cycle,
            spatial_stall: ideal_temporal_cycle.saturating_sub(ideal_cycle),
            temporal_stall,
            data_loading_cycle,
            data_offloading_cycle,
            latency_total0,
            latency_total1,
            latency_total2: latency_total1 + data_offloading_cycle,
        }
    }

    pub fn mac_spatial_utilization(&self) -> f64 {
        ratio(self.ideal_cycle, self.ideal_temporal_cycle)
    }

    /// MAC utilization without loading and offloading.
    pub fn mac_utilization0(&self) -> f64 {
        ratio(self.ideal_cycle, self.latency_total0)
    }

    pub fn mac_utilization1(&self) -> f64 {
        ratio(self.ideal_cycle, self.latency_total1)
    }

    pub fn mac_utilization2(&self) -> f64 {
        ratio(self.ideal_cycle, self.latency_total2)
    }
}

impl Add for Latency {
    type Output = Latency;

    fn add(self, rhs: Self) -> Self::Output {
        Latency {
            ideal_cycle: self.ideal_cycle + rhs.ideal_cycle,
            ideal_temporal_cycle: self.ideal_temporal_cycle + rhs.ideal_temporal_cycle,
            spatial_stall: self.spatial_stall + rhs.spatial_stall,
            temporal_stall: self.temporal_stall + rhs.temporal_stall,
            data_loading_cycle: self.data_loading_cycle + rhs.data_loading_cycle,
            data_offloading_cycle: self.data_offloading_cycle + rhs.data_offloading_cycle,
            latency_total0: self.latency_total0 + rhs.latency_total0,
            latency_total1: self.latency_total1 + rhs.latency_total1,
            latency_total2: self.latency_total2 + rhs.latency_total2,
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// The additive part of a cost model result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CostTotals {
    pub mac_count: u64,
    pub mac_energy: f64,
    pub mem_energy: f64,
    pub energy_total: f64,
    /// Energy per operand and memory level.
    pub mem_energy_breakdown: IndexMap<LayerOperand, Vec<f64>>,
    /// [Self::mem_energy_breakdown] split per data direction.
    pub mem_energy_breakdown_further: IndexMap<LayerOperand, Vec<FourWay<f64>>>,
    /// Physical memory word accesses per operand and memory level.
    pub memory_word_access: IndexMap<LayerOperand, Vec<FourWay<f64>>>,
    pub latency: Latency,
}

impl CostTotals {
    pub fn edp(&self) -> f64 {
        self.energy_total * self.latency.latency_total2 as f64
    }

    /// Checks that the MAC energy plus every per-direction memory energy adds up to the reported
    /// total. Panics in debug builds.
    pub fn check_energy_sum(&self) -> bool {
        let summed: f64 = self.mac_energy
            + self
                .mem_energy_breakdown_further
                .values()
                .flatten()
                .map(FourWay::total)
                .sum::<f64>();
        let tolerance = 1e-9 * self.energy_total.abs().max(1.0);
        let ok = (summed - self.energy_total).abs() <= tolerance;
        debug_assert!(
            ok,
            "energy breakdown sums to {summed}, total is {}",
            self.energy_total
        );
        if !ok {
            log::error!(
                "Energy breakdown sums to {summed} but the total is {}; keeping the total",
                self.energy_total
            );
        }
        ok
    }
}

/// Adds per-level lists elementwise; the longer list keeps its tail.
fn add_levels<T: Copy + Add<Output = T>>(
    lhs: &IndexMap<LayerOperand, Vec<T>>,
    rhs: &IndexMap<LayerOperand, Vec<T>>,
) -> IndexMap<LayerOperand, Vec<T>> {
    let mut out = lhs.clone();
    for (op, theirs) in rhs {
        match out.get_mut(op) {
            Some(ours) => {
                for (i, v) in theirs.iter().enumerate() {
                    match ours.get_mut(i) {
                        Some(o) => *o = *o + *v,
                        None => ours.push(*v),
                    }
                }
            }
            None => {
                out.insert(op.clone(), theirs.clone());
            }
        }
    }
    out
}

impl Add for &CostTotals {
    type Output = CostTotals;

    fn add(self, rhs: Self) -> Self::Output {
        CostTotals {
            mac_count: self.mac_count + rhs.mac_count,
            mac_energy: self.mac_energy + rhs.mac_energy,
            mem_energy: self.mem_energy + rhs.mem_energy,
            energy_total: self.energy_total + rhs.energy_total,
            mem_energy_breakdown: add_levels(&self.mem_energy_breakdown, &rhs.mem_energy_breakdown),
            mem_energy_breakdown_further: add_levels(
                &self.mem_energy_breakdown_further,
                &rhs.mem_energy_breakdown_further,
            ),
            memory_word_access: add_levels(&self.memory_word_access, &rhs.memory_word_access),
            latency: self.latency + rhs.latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(op: &str, levels: &[f64], cycles: u64) -> CostTotals {
        let op = LayerOperand::new(op);
        let further: Vec<FourWay<f64>> = levels.iter().map(|&e| FourWay::new(e, 0.0, 0.0, 0.0)).collect();
        let mem_energy = levels.iter().sum::<f64>();
        CostTotals {
            mac_count: 100,
            mac_energy: 4.0,
            mem_energy,
            energy_total: mem_energy + 4.0,
            mem_energy_breakdown: [(op.clone(), levels.to_vec())].into_iter().collect(),
            mem_energy_breakdown_further: [(op.clone(), further.clone())].into_iter().collect(),
            memory_word_access: [(op, further)].into_iter().collect(),
            latency: Latency::new(cycles, cycles, 0, 1, 1),
        }
    }

    #[test]
    fn test_latency_chain() {
        let l = Latency::new(10, 16, 3, 5, 2);
        assert_eq!(l.spatial_stall, 6);
        assert_eq!(l.latency_total0, 19);
        assert_eq!(l.latency_total1, 24);
        assert_eq!(l.latency_total2, 26);
        assert_eq!(l.mac_spatial_utilization(), 10.0 / 16.0);
    }

    #[test]
    fn test_add_extends_shorter_level_lists() {
        let a = totals("W", &[1.0, 2.0], 10);
        let b = totals("W", &[10.0, 20.0, 30.0], 20);
        let c = totals("I", &[5.0], 5);
        let sum = &(&a + &b) + &c;
        assert_eq!(sum.mem_energy_breakdown[&LayerOperand::new("W")], [11.0, 22.0, 30.0]);
        assert_eq!(sum.mem_energy_breakdown[&LayerOperand::new("I")], [5.0]);
        assert_eq!(sum.mac_count, 300);
        assert_eq!(sum.latency.latency_total2, 12 + 22 + 7);
        assert!(sum.check_energy_sum());
    }
}
