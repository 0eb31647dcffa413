//! Periodic data transfers on physical memory ports and how they add up to stalls.

use crate::common::LayerOperand;
use crate::hardware::memory_port::DataDirection;
use serde::{Deserialize, Serialize};

/// One periodic data transfer link (operand, memory level, direction) mapped onto a port.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PortActivity {
    pub operand: LayerOperand,
    pub mem_level: usize,
    pub direction: DataDirection,
    /// Cycles the transfer takes per period at the port's bandwidth.
    pub real_cycle: i64,
    /// Cycles per period in which the transfer may happen without stalling the array.
    pub allowed_cycle: i64,
    pub period: i64,
    pub period_count: i64,
}

impl PortActivity {
    pub fn new(
        operand: LayerOperand,
        mem_level: usize,
        direction: DataDirection,
        real_cycle: u64,
        allowed_cycle: u64,
        period: u64,
        period_count: u64,
    ) -> Self {
        PortActivity {
            operand,
            mem_level,
            direction,
            real_cycle: real_cycle as i64,
            allowed_cycle: allowed_cycle as i64,
            period: period as i64,
            period_count: period_count as i64,
        }
    }

    /// Stall (positive) or slack (negative) cycles in one period.
    pub fn ss_per_period(&self) -> i64 {
        self.real_cycle - self.allowed_cycle
    }

    /// Stall or slack over the whole layer. The first period overlaps with data loading.
    pub fn ss(&self) -> i64 {
        self.ss_per_period() * (self.period_count - 1)
    }

    /// Memory updating window: the total cycles allowed for this transfer.
    pub fn muw(&self) -> i64 {
        self.allowed_cycle * (self.period_count - 1)
    }
}

/// The combined stall of the transfers sharing one port, with the union of their updating
/// windows.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PortStall {
    pub memory: String,
    pub port: String,
    pub activities: Vec<PortActivity>,
    pub muw_union: i64,
    /// Combined stall (positive) or slack (negative).
    pub ss_comb: i64,
}

impl PortStall {
    pub fn new(memory: &str, port: &str, activities: Vec<PortActivity>) -> Self {
        let (muw_union, ss_comb) = match activities.as_slice() {
            [] => (0, 0),
            [single] => (single.allowed_cycle, single.ss()),
            many => {
                let union = muw_union(many);
                let positive: i64 = many.iter().map(PortActivity::ss).filter(|s| *s > 0).sum();
                let negative: i64 = many.iter().map(PortActivity::ss).filter(|s| *s <= 0).sum();
                let muw_sum: i64 = many.iter().map(PortActivity::muw).sum();
                // Slack only helps as far as the windows do not overlap.
                (union, positive + (negative + muw_sum - union).max(0))
            }
        };
        PortStall {
            memory: memory.to_owned(),
            port: port.to_owned(),
            activities,
            muw_union,
            ss_comb,
        }
    }
}

/// Length of the union of the periodic updating windows of several transfers over the whole
/// layer. A window `[0, allowed)` repeats every `period` cycles; the pattern is evaluated over
/// the longest period and scaled by that transfer's period count.
pub fn muw_union(activities: &[PortActivity]) -> i64 {
    if let Some(full) = activities.iter().find(|a| a.period == a.allowed_cycle) {
        return full.period * full.period_count;
    }
    let Some(longest) = activities
        .iter()
        .reduce(|best, a| if a.period > best.period { a } else { best })
    else {
        return 0;
    };
    let used = (0..longest.period)
        .filter(|&t| {
            activities
                .iter()
                .any(|a| a.period > 0 && t % a.period < a.allowed_cycle)
        })
        .count() as i64;
    used * longest.period_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(real: u64, allowed: u64, period: u64, count: u64) -> PortActivity {
        PortActivity::new(
            LayerOperand::new("O"),
            0,
            DataDirection::WrInByLow,
            real,
            allowed,
            period,
            count,
        )
    }

    #[test]
    fn test_single_activity() {
        let a = activity(5, 3, 4, 9);
        assert_eq!(a.ss_per_period(), 2);
        assert_eq!(a.ss(), 16);
        assert_eq!(a.muw(), 24);
        let port = PortStall::new("l1", "rw_port_1", vec![a]);
        assert_eq!(port.ss_comb, 16);
        assert_eq!(port.muw_union, 3);
    }

    #[test]
    fn test_muw_union_of_nested_periods() {
        // Windows [0,1) every 3, [0,2) every 6, [0,4) every 12 over 24 cycles.
        let acts = [activity(0, 1, 3, 8), activity(0, 2, 6, 4), activity(0, 4, 12, 2)];
        // In 12 cycles: t = 0, 1, 2, 3, 6, 7, 9 are covered.
        assert_eq!(muw_union(&acts), 7 * 2);
    }

    #[test]
    fn test_full_window_covers_everything() {
        let acts = [activity(0, 1, 3, 8), activity(0, 6, 6, 4)];
        assert_eq!(muw_union(&acts), 24);
    }

    #[test]
    fn test_slack_absorbs_stall_only_outside_overlap() {
        // Two transfers, one stalling and one with slack, on one port.
        let stalling = activity(4, 2, 4, 5);
        let slacking = activity(1, 2, 4, 5);
        let port = PortStall::new("sram", "r_port_1", vec![stalling, slacking]);
        // Both windows are [0, 2) every 4: union 2 * 5 = 10, summed windows 16.
        assert_eq!(port.muw_union, 10);
        // 8 stall cycles, -4 slack, +6 overlap.
        assert_eq!(port.ss_comb, 8 + (-4 + 16 - 10));
    }
}
