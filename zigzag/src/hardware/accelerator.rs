use crate::hardware::cores::Core;
use crate::hardware::HardwareError;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Accelerator {
    pub name: String,
    cores: Vec<Arc<Core>>,
}

impl Accelerator {
    pub fn new(name: &str, cores: Vec<Core>) -> Result<Self, HardwareError> {
        if cores.is_empty() {
            return Err(HardwareError::NoCores(name.to_owned()));
        }
        for (i, core) in cores.iter().enumerate() {
            if cores[..i].iter().any(|c| c.id == core.id) {
                return Err(HardwareError::DuplicateCore(core.id));
            }
        }
        Ok(Accelerator {
            name: name.to_owned(),
            cores: cores.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn cores(&self) -> &[Arc<Core>] {
        &self.cores
    }

    /// Every core's operational array scaled by `factor`; the name gets a `-scaled` suffix.
    pub fn scaled(&self, factor: f64) -> Result<Self, HardwareError> {
        let cores = self
            .cores
            .iter()
            .map(|c| c.scaled(factor))
            .collect::<Result<Vec<_>, _>>()?;
        Accelerator::new(&format!("{}-scaled", self.name), cores)
    }

    pub fn get_core(&self, id: usize) -> Result<&Arc<Core>, HardwareError> {
        self.cores
            .iter()
            .find(|c| c.id == id)
            .ok_or(HardwareError::UnknownCore(id))
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
