use crate::hardware::HardwareError;
use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A physical memory module, without any information about where it sits in a hierarchy.
///
/// Sizes and bandwidths are in bits (per cycle for bandwidths); costs are energies per access
/// of one full-bandwidth word.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MemoryInstance {
    pub name: String,
    pub size: u64,
    pub r_bw: u64,
    pub w_bw: u64,
    #[serde(default)]
    pub r_cost: f64,
    #[serde(default)]
    pub w_cost: f64,
    #[serde(default)]
    pub area: f64,
    #[serde(default = "one")]
    pub r_port: u32,
    #[serde(default = "one")]
    pub w_port: u32,
    #[serde(default)]
    pub rw_port: u32,
    #[serde(default = "one_cycle")]
    pub latency: u64,
    /// The smallest read a port can do without paying for a full-bandwidth access. Defaults to
    /// the read bandwidth.
    #[serde(default)]
    pub min_r_granularity: Option<u64>,
    #[serde(default)]
    pub min_w_granularity: Option<u64>,
    #[serde(default)]
    pub double_buffering_support: bool,
    /// Costs and area are to be filled in by a [MemoryCostExtractor] when the accelerator is
    /// built.
    #[serde(default)]
    pub auto_cost_extraction: bool,
}

fn one() -> u32 {
    1
}

fn one_cycle() -> u64 {
    1
}

/// Energy per access and area of a memory, as produced by a [MemoryCostExtractor].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryCost {
    pub r_cost: f64,
    pub w_cost: f64,
    pub area: f64,
}

/// A source of memory access energies and areas, such as a CACTI run.
#[auto_impl(&, Box, Arc)]
pub trait MemoryCostExtractor {
    fn extract(&self, instance: &MemoryInstance) -> Result<MemoryCost, HardwareError>;
}

impl MemoryInstance {
    /// A single-read-port, single-write-port memory with a latency of one cycle.
    pub fn new(
        name: &str,
        size: u64,
        r_bw: u64,
        w_bw: u64,
        r_cost: f64,
        w_cost: f64,
        area: f64,
    ) -> Self {
        MemoryInstance {
            name: name.to_owned(),
            size,
            r_bw,
            w_bw,
            r_cost,
            w_cost,
            area,
            r_port: 1,
            w_port: 1,
            rw_port: 0,
            latency: 1,
            min_r_granularity: None,
            min_w_granularity: None,
            double_buffering_support: false,
            auto_cost_extraction: false,
        }
    }

    pub fn with_ports(mut self, r_port: u32, w_port: u32, rw_port: u32) -> Self {
        self.r_port = r_port;
        self.w_port = w_port;
        self.rw_port = rw_port;
        self
    }

    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_min_granularity(mut self, r: u64, w: u64) -> Self {
        self.min_r_granularity = Some(r);
        self.min_w_granularity = Some(w);
        self
    }

    pub fn with_double_buffering(mut self, support: bool) -> Self {
        self.double_buffering_support = support;
        self
    }

    pub fn r_bw_min(&self) -> u64 {
        self.min_r_granularity.unwrap_or(self.r_bw)
    }

    pub fn w_bw_min(&self) -> u64 {
        self.min_w_granularity.unwrap_or(self.w_bw)
    }

    pub fn port_count(&self) -> u32 {
        self.r_port + self.w_port + self.rw_port
    }

    /// Replaces costs and area with those from `extractor` if this instance asks for
    /// extraction.
    pub fn extract_costs(
        &mut self,
        extractor: Option<&dyn MemoryCostExtractor>,
    ) -> Result<(), HardwareError> {
        if !self.auto_cost_extraction {
            return Ok(());
        }
        let Some(extractor) = extractor else {
            return Err(HardwareError::NoCostExtractor(self.name.clone()));
        };
        let cost = extractor.extract(self)?;
        log::debug!(
            "Extracted costs for {}: read {} write {} area {}",
            self.name,
            cost.r_cost,
            cost.w_cost,
            cost.area
        );
        self.r_cost = cost.r_cost;
        self.w_cost = cost.w_cost;
        self.area = cost.area;
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), HardwareError> {
        if self.port_count() == 0 {
            return Err(HardwareError::NoPorts(self.name.clone()));
        }
        if self.r_bw == 0 || self.w_bw == 0 || self.r_bw_min() == 0 || self.w_bw_min() == 0 {
            return Err(HardwareError::ZeroBandwidth(self.name.clone()));
        }
        if self.r_bw_min() > self.r_bw || self.w_bw_min() > self.w_bw {
            return Err(HardwareError::GranularityAboveBandwidth(self.name.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for MemoryInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCost;

    impl MemoryCostExtractor for FixedCost {
        fn extract(&self, instance: &MemoryInstance) -> Result<MemoryCost, HardwareError> {
            Ok(MemoryCost {
                r_cost: instance.size as f64 / 1024.0,
                w_cost: 2.0,
                area: 3.0,
            })
        }
    }

    #[test]
    fn test_granularity_defaults_to_bandwidth() {
        let m = MemoryInstance::new("sram", 1024, 64, 32, 1.0, 1.0, 0.0);
        assert_eq!(m.r_bw_min(), 64);
        assert_eq!(m.w_bw_min(), 32);
        let m = m.with_min_granularity(8, 8);
        assert_eq!(m.r_bw_min(), 8);
    }

    #[test]
    fn test_json_defaults() {
        let m: MemoryInstance =
            serde_json::from_str(r#"{"name": "rf", "size": 8, "r_bw": 8, "w_bw": 8}"#).unwrap();
        assert_eq!((m.r_port, m.w_port, m.rw_port, m.latency), (1, 1, 0, 1));
        assert!(!m.double_buffering_support);
    }

    #[test]
    fn test_cost_extraction() {
        let mut m = MemoryInstance::new("sram", 4096, 64, 64, 0.0, 0.0, 0.0);
        m.extract_costs(Some(&FixedCost)).unwrap();
        assert_eq!(m.r_cost, 0.0);

        m.auto_cost_extraction = true;
        assert!(matches!(
            m.extract_costs(None),
            Err(HardwareError::NoCostExtractor(_))
        ));
        m.extract_costs(Some(&FixedCost)).unwrap();
        assert_eq!((m.r_cost, m.w_cost, m.area), (4.0, 2.0, 3.0));
    }

    #[test]
    fn test_memory_without_ports_is_invalid() {
        let m = MemoryInstance::new("x", 8, 8, 8, 0.0, 0.0, 0.0).with_ports(0, 0, 0);
        assert!(matches!(m.validate(), Err(HardwareError::NoPorts(_))));
    }
}
