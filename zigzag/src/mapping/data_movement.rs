use crate::hardware::memory_port::DataDirection;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul};

/// One value per [DataDirection] of a memory level.
#[derive(Debug, Copy, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FourWay<T> {
    pub rd_out_to_low: T,
    pub wr_in_by_low: T,
    pub rd_out_to_high: T,
    pub wr_in_by_high: T,
}

impl<T: Copy> FourWay<T> {
    pub fn new(rd_out_to_low: T, wr_in_by_low: T, rd_out_to_high: T, wr_in_by_high: T) -> Self {
        FourWay {
            rd_out_to_low,
            wr_in_by_low,
            rd_out_to_high,
            wr_in_by_high,
        }
    }

    pub fn splat(value: T) -> Self {
        FourWay::new(value, value, value, value)
    }

    pub fn get(&self, direction: DataDirection) -> T {
        match direction {
            DataDirection::RdOutToLow => self.rd_out_to_low,
            DataDirection::WrInByLow => self.wr_in_by_low,
            DataDirection::RdOutToHigh => self.rd_out_to_high,
            DataDirection::WrInByHigh => self.wr_in_by_high,
        }
    }

    pub fn get_mut(&mut self, direction: DataDirection) -> &mut T {
        match direction {
            DataDirection::RdOutToLow => &mut self.rd_out_to_low,
            DataDirection::WrInByLow => &mut self.wr_in_by_low,
            DataDirection::RdOutToHigh => &mut self.rd_out_to_high,
            DataDirection::WrInByHigh => &mut self.wr_in_by_high,
        }
    }

    pub fn set(&mut self, direction: DataDirection, value: T) {
        *self.get_mut(direction) = value;
    }

    pub fn map<U: Copy>(&self, mut f: impl FnMut(DataDirection, T) -> U) -> FourWay<U> {
        FourWay::new(
            f(DataDirection::RdOutToLow, self.rd_out_to_low),
            f(DataDirection::WrInByLow, self.wr_in_by_low),
            f(DataDirection::RdOutToHigh, self.rd_out_to_high),
            f(DataDirection::WrInByHigh, self.wr_in_by_high),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (DataDirection, T)> + '_ {
        DataDirection::ALL.into_iter().map(|d| (d, self.get(d)))
    }
}

impl<T: Copy + Add<Output = T>> FourWay<T> {
    pub fn total(&self) -> T {
        self.rd_out_to_low + self.wr_in_by_low + self.rd_out_to_high + self.wr_in_by_high
    }

    pub fn total_reads(&self) -> T {
        self.rd_out_to_low + self.rd_out_to_high
    }

    pub fn total_writes(&self) -> T {
        self.wr_in_by_low + self.wr_in_by_high
    }
}

impl<T: Copy + Add<Output = T>> Add for FourWay<T> {
    type Output = FourWay<T>;

    fn add(self, rhs: Self) -> Self::Output {
        FourWay::new(
            self.rd_out_to_low + rhs.rd_out_to_low,
            self.wr_in_by_low + rhs.wr_in_by_low,
            self.rd_out_to_high + rhs.rd_out_to_high,
            self.wr_in_by_high + rhs.wr_in_by_high,
        )
    }
}

impl<T: Copy + Add<Output = T>> AddAssign for FourWay<T> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<T: Copy + Mul<Output = T>> Mul<T> for FourWay<T> {
    type Output = FourWay<T>;

    fn mul(self, rhs: T) -> Self::Output {
        self.map(|_, v| v * rhs)
    }
}

/// Data movement of one operand at one memory level, as implied by a mapping alone (no hardware
/// costs or bandwidths).
///
/// All quantities are per unrolled memory instance unless noted otherwise.
#[derive(Debug, Copy, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DataMovePattern {
    /// Number of data elements moved (total over all unrolled instances).
    pub data_elem_move_count: FourWay<u64>,
    /// Bits per moved element.
    pub data_precision: FourWay<u64>,
    /// Elements per cycle needed on average to avoid stalls.
    pub req_mem_bw_aver: FourWay<u64>,
    /// Elements per cycle needed when the transfer is squeezed into its instant window.
    pub req_mem_bw_inst: FourWay<u64>,
    /// Cycles between two transfers.
    pub data_trans_period: FourWay<u64>,
    /// Number of transfer periods in the whole layer.
    pub data_trans_period_count: FourWay<u64>,
    /// Elements moved in each period.
    pub data_trans_amount_per_period: FourWay<u64>,
    /// Cycles available to complete a transfer without double buffering.
    pub inst_data_trans_window: FourWay<u64>,
}

impl DataMovePattern {
    /// Zeroes every attribute in one direction.
    pub fn clear_direction(&mut self, direction: DataDirection) {
        for field in [
            &mut self.data_elem_move_count,
            &mut self.data_precision,
            &mut self.req_mem_bw_aver,
            &mut self.req_mem_bw_inst,
            &mut self.data_trans_period,
            &mut self.data_trans_period_count,
            &mut self.data_trans_amount_per_period,
            &mut self.inst_data_trans_window,
        ] {
            field.set(direction, 0);
        }
    }

    /// Whether anything moves in `direction`.
    pub fn is_active(&self, direction: DataDirection) -> bool {
        self.data_elem_move_count.get(direction) != 0 && self.data_precision.get(direction) != 0
    }
}
