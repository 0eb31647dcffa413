use crate::cost::evaluation::CostModelEvaluation;
use crate::cost::CostTotals;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The sum of the cost model results of several layers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CumulativeCme {
    pub layer_ids: Vec<usize>,
    pub core_ids: Vec<usize>,
    /// Kept only while every summed result ran on accelerators whose names are prefixes of one
    /// another (as after removing unused memories).
    pub accelerator: Option<String>,
    pub totals: CostTotals,
}

/// A cost model result: one layer, or the sum of several.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Cme {
    Layer(Box<CostModelEvaluation>),
    Cumulative(CumulativeCme),
}

impl From<CostModelEvaluation> for Cme {
    fn from(value: CostModelEvaluation) -> Self {
        Cme::Layer(Box::new(value))
    }
}

impl Cme {
    pub fn totals(&self) -> &CostTotals {
        match self {
            Cme::Layer(cme) => &cme.totals,
            Cme::Cumulative(cme) => &cme.totals,
        }
    }

    pub fn energy_total(&self) -> f64 {
        self.totals().energy_total
    }

    pub fn latency_total(&self) -> u64 {
        self.totals().latency.latency_total2
    }

    pub fn edp(&self) -> f64 {
        self.totals().edp()
    }

    pub fn layer_ids(&self) -> Vec<usize> {
        match self {
            Cme::Layer(cme) => vec![cme.layer.id],
            Cme::Cumulative(cme) => cme.layer_ids.clone(),
        }
    }

    pub fn core_ids(&self) -> Vec<usize> {
        match self {
            Cme::Layer(cme) => vec![cme.core_id],
            Cme::Cumulative(cme) => cme.core_ids.clone(),
        }
    }

    pub fn accelerator(&self) -> Option<&str> {
        match self {
            Cme::Layer(cme) => Some(cme.accelerator.as_str()),
            Cme::Cumulative(cme) => cme.accelerator.as_deref(),
        }
    }

    /// The layer name, for single-layer results.
    pub fn layer_name(&self) -> Option<&str> {
        match self {
            Cme::Layer(cme) => Some(cme.layer.name.as_str()),
            Cme::Cumulative(_) => None,
        }
    }

    pub fn as_layer(&self) -> Option<&CostModelEvaluation> {
        match self {
            Cme::Layer(cme) => Some(&**cme),
            Cme::Cumulative(_) => None,
        }
    }

    /// The same totals as a sum over layers, so that a sum of one layer still reports as one.
    pub fn to_cumulative(&self) -> Cme {
        Cme::Cumulative(CumulativeCme {
            layer_ids: self.layer_ids(),
            core_ids: self.core_ids(),
            accelerator: self.accelerator().map(str::to_owned),
            totals: self.totals().clone(),
        })
    }

    /// Sums two results. Energies, cycle counts, MAC counts and per-level accesses add up; the
    /// layer and core lists concatenate.
    pub fn combine(&self, other: &Cme) -> Cme {
        let accelerator = match (self.accelerator(), other.accelerator()) {
            (Some(a), Some(b)) if a.starts_with(b) => Some(b.to_owned()),
            (Some(a), Some(b)) if b.starts_with(a) => Some(a.to_owned()),
            _ => None,
        };
        let mut layer_ids = self.layer_ids();
        layer_ids.extend(other.layer_ids());
        let mut core_ids = self.core_ids();
        core_ids.extend(other.core_ids());
        Cme::Cumulative(CumulativeCme {
            layer_ids,
            core_ids,
            accelerator,
            totals: self.totals() + other.totals(),
        })
    }
}

impl fmt::Display for Cme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cme::Layer(cme) => write!(f, "CostModelEvaluation({}, core {})", cme.layer.name, cme.core_id),
            Cme::Cumulative(cme) => write!(f, "CumulativeCme(layers {:?})", cme.layer_ids),
        }
    }
}
