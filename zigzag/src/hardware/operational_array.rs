use crate::common::OaDim;
use crate::hardware::HardwareError;
use auto_impl::auto_impl;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Energy and area of the operational array. Analog or digital in-memory compute arrays plug
/// in here; the default is a plain digital MAC array.
#[auto_impl(&, Box, Arc)]
pub trait MacCostModel: fmt::Debug + Send + Sync {
    fn mac_energy(&self, array: &OperationalArray, mac_count: u64) -> f64;

    fn area(&self, array: &OperationalArray) -> f64 {
        array.unit_area * array.total_unit_count() as f64
    }
}

/// `unit_energy` per MAC, nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigitalMac;

impl MacCostModel for DigitalMac {
    fn mac_energy(&self, array: &OperationalArray, mac_count: u64) -> f64 {
        array.unit_energy * mac_count as f64
    }
}

/// A multi-dimensional array of identical MAC units.
#[derive(Debug, Clone)]
pub struct OperationalArray {
    pub unit_energy: f64,
    pub unit_area: f64,
    pub input_precision: Vec<u32>,
    pub dimensions: IndexMap<OaDim, u64>,
    cost_model: Arc<dyn MacCostModel>,
}

impl OperationalArray {
    pub fn new(
        unit_energy: f64,
        unit_area: f64,
        input_precision: Vec<u32>,
        dimensions: IndexMap<OaDim, u64>,
    ) -> Result<Self, HardwareError> {
        if dimensions.is_empty() {
            return Err(HardwareError::EmptyOperationalArray);
        }
        if let Some((dim, _)) = dimensions.iter().find(|(_, &s)| s == 0) {
            return Err(HardwareError::ZeroSizedOaDim(dim.clone()));
        }
        Ok(OperationalArray {
            unit_energy,
            unit_area,
            input_precision,
            dimensions,
            cost_model: Arc::new(DigitalMac),
        })
    }

    pub fn with_cost_model(mut self, cost_model: Arc<dyn MacCostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// The same array with every dimension scaled by `factor`, rounded up.
    pub fn scaled(&self, factor: f64) -> Result<Self, HardwareError> {
        let dimensions = self
            .dimensions
            .iter()
            .map(|(dim, &size)| (dim.clone(), (size as f64 * factor).ceil() as u64))
            .collect();
        Ok(OperationalArray::new(
            self.unit_energy,
            self.unit_area,
            self.input_precision.clone(),
            dimensions,
        )?
        .with_cost_model(self.cost_model.clone()))
    }

    pub fn total_unit_count(&self) -> u64 {
        self.dimensions.values().product()
    }

    pub fn size_of(&self, dim: &OaDim) -> Option<u64> {
        self.dimensions.get(dim).copied()
    }

    pub fn mac_energy(&self, mac_count: u64) -> f64 {
        self.cost_model.mac_energy(self, mac_count)
    }

    pub fn total_area(&self) -> f64 {
        self.cost_model.area(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct BitSerial(u32);

    impl MacCostModel for BitSerial {
        fn mac_energy(&self, array: &OperationalArray, mac_count: u64) -> f64 {
            array.unit_energy * f64::from(self.0) * mac_count as f64
        }
    }

    fn dims(entries: &[(&str, u64)]) -> IndexMap<OaDim, u64> {
        entries.iter().map(|(d, s)| (OaDim::new(d), *s)).collect()
    }

    #[test]
    fn test_digital_array() {
        let oa = OperationalArray::new(0.04, 1.0, vec![8, 8], dims(&[("D1", 8), ("D2", 4)]))
            .unwrap();
        assert_eq!(oa.total_unit_count(), 32);
        assert_eq!(oa.total_area(), 32.0);
        assert!((oa.mac_energy(100) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_pluggable_cost_model() {
        let oa = OperationalArray::new(0.5, 1.0, vec![8, 8], dims(&[("D1", 2)]))
            .unwrap()
            .with_cost_model(Arc::new(BitSerial(8)));
        assert_eq!(oa.mac_energy(2), 8.0);
    }

    #[test]
    fn test_scaling_keeps_the_cost_model() {
        let oa = OperationalArray::new(0.5, 1.0, vec![8, 8], dims(&[("D1", 4), ("D2", 3)]))
            .unwrap()
            .with_cost_model(Arc::new(BitSerial(8)));
        let half = oa.scaled(0.5).unwrap();
        assert_eq!(half.dimensions, dims(&[("D1", 2), ("D2", 2)]));
        assert_eq!(half.mac_energy(2), 8.0);
        assert_eq!(oa.scaled(4.0).unwrap().total_unit_count(), 192);
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(matches!(
            OperationalArray::new(0.0, 0.0, vec![], IndexMap::new()),
            Err(HardwareError::EmptyOperationalArray)
        ));
        assert!(matches!(
            OperationalArray::new(0.0, 0.0, vec![], dims(&[("D1", 0)])),
            Err(HardwareError::ZeroSizedOaDim(_))
        ));
    }
}
