//! User-facing spatial mappings: which layer dimensions are unrolled over which operational
//! array dimensions, and by how much.

use crate::common::{LayerDim, OaDim, UnrollFactor};
use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The maximum unrolling allowed for each layer dimension in each operational array dimension.
pub type MaxUnrollings = IndexMap<OaDim, IndexMap<LayerDim, u64>>;

/// Unrollings assigned to one operational array dimension.
pub type OaDimMapping = IndexMap<LayerDim, UnrollFactor>;

/// A spatial mapping keyed by operational array dimension. Each array dimension may unroll
/// several layer dimensions ("mixed" mapping); their factors multiply to its utilization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SpatialMapping(IndexMap<OaDim, OaDimMapping>);

impl SpatialMapping {
    pub fn new(data: IndexMap<OaDim, OaDimMapping>) -> Self {
        SpatialMapping(data)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn oa_dims(&self) -> impl Iterator<Item = &OaDim> {
        self.0.keys()
    }

    pub fn contains_oa_dim(&self, oa_dim: &OaDim) -> bool {
        self.0.contains_key(oa_dim)
    }

    pub fn get(&self, oa_dim: &OaDim) -> Option<&OaDimMapping> {
        self.0.get(oa_dim)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OaDim, &OaDimMapping)> {
        self.0.iter()
    }

    pub fn insert(&mut self, oa_dim: OaDim, mapping: OaDimMapping) {
        self.0.insert(oa_dim, mapping);
    }

    /// The product of all factors unrolled over `oa_dim`.
    pub fn utilization(&self, oa_dim: &OaDim) -> UnrollFactor {
        self.0
            .get(oa_dim)
            .map_or(1.0, |m| m.values().product::<f64>())
    }

    /// The product of all utilizations, truncated to an integer.
    pub fn hw_utilization(&self) -> u64 {
        self.0.keys().map(|d| self.utilization(d)).product::<f64>() as u64
    }

    /// All `(dim, factor)` pairs, array dimension by array dimension.
    pub fn flatten(&self) -> impl Iterator<Item = (&LayerDim, UnrollFactor)> {
        self.0
            .values()
            .flat_map(|m| m.iter().map(|(d, f)| (d, *f)))
    }

    pub fn contained_layer_dims(&self) -> Vec<LayerDim> {
        let mut out: Vec<LayerDim> = Vec::new();
        for (d, _) in self.flatten() {
            if !out.contains(d) {
                out.push(d.clone());
            }
        }
        out
    }

    /// The total unrolling of `dim` over all array dimensions.
    pub fn total_unrolling_of(&self, dim: &LayerDim) -> UnrollFactor {
        self.flatten()
            .filter(|(d, _)| *d == dim)
            .map(|(_, f)| f)
            .product()
    }

    /// Every unrolling other than 1 multiplied by `factor`, for an array scaled by the same.
    pub fn scaled(&self, factor: f64) -> SpatialMapping {
        SpatialMapping(
            self.0
                .iter()
                .map(|(oa, m)| {
                    let m = m
                        .iter()
                        .map(|(d, &f)| (d.clone(), if f == 1.0 { f } else { f * factor }))
                        .collect();
                    (oa.clone(), m)
                })
                .collect(),
        )
    }

    pub fn delete_layer_dim(&mut self, dim: &LayerDim) {
        for m in self.0.values_mut() {
            m.shift_remove(dim);
        }
    }

    /// Estimates how well this mapping will perform relative to other valid mappings. Higher is
    /// better: array utilization dominates, and spreading the unrolling over several layer
    /// dimensions breaks ties.
    pub fn performance_indicator(&self) -> f64 {
        let hw_utilization = self.hw_utilization() as f64;
        let max_unrolling = self
            .contained_layer_dims()
            .iter()
            .map(|d| self.total_unrolling_of(d))
            .fold(1.0, f64::max);
        hw_utilization + (hw_utilization / max_unrolling - 1.0)
    }

    /// Checks that every unrolled dimension is bounded by `max_unrollings`, no array dimension is
    /// over-utilized, and no layer dimension is unrolled beyond its size.
    pub fn is_valid(
        &self,
        max_unrollings: &MaxUnrollings,
        oa_dim_sizes: &IndexMap<OaDim, u64>,
        layer_dim_sizes: &IndexMap<LayerDim, u64>,
    ) -> bool {
        for (oa_dim, mapping) in &self.0 {
            let Some(size) = oa_dim_sizes.get(oa_dim) else {
                return false;
            };
            for (dim, factor) in mapping {
                match max_unrollings.get(oa_dim).and_then(|m| m.get(dim)) {
                    Some(&max) if *factor <= max as f64 => {}
                    _ => return false,
                }
            }
            if self.utilization(oa_dim) > *size as f64 {
                return false;
            }
        }
        if !self
            .contained_layer_dims()
            .iter()
            .all(|d| layer_dim_sizes.contains_key(d))
        {
            return false;
        }
        layer_dim_sizes
            .iter()
            .all(|(d, &size)| self.total_unrolling_of(d) <= size as f64)
    }

    /// Reduces a user-provided mapping until it fits the layer and the array, warning about each
    /// reduction: unknown dimensions are dropped, factors are clipped to `max_unrollings`, and
    /// unrollings are removed from over-utilized array dimensions and over-unrolled layer
    /// dimensions.
    pub fn check_and_reduce(
        &mut self,
        max_unrollings: &MaxUnrollings,
        oa_dim_sizes: &IndexMap<OaDim, u64>,
        layer_dim_sizes: &IndexMap<LayerDim, u64>,
    ) {
        for dim in self.contained_layer_dims() {
            if !layer_dim_sizes.contains_key(&dim) {
                warn!("User provided spatial unrolling {dim} is not a dimension of the layer; removing it");
                self.delete_layer_dim(&dim);
            }
        }

        for (oa_dim, mapping) in self.0.iter_mut() {
            for (dim, factor) in mapping.iter_mut() {
                let max = max_unrollings
                    .get(oa_dim)
                    .and_then(|m| m.get(dim))
                    .copied()
                    .unwrap_or(1) as f64;
                if *factor > max {
                    warn!(
                        "User provided spatial unrolling ({dim}:{factor}) in {oa_dim} exceeds the maximal \
                         unrolling {max}; reducing it"
                    );
                    *factor = max;
                }
            }
            let size = oa_dim_sizes.get(oa_dim).copied().unwrap_or(1) as f64;
            while mapping.values().product::<f64>() > size {
                warn!("User provided spatial unrolling over {oa_dim} exceeds its size {size}; dropping a loop");
                mapping.shift_remove_index(0);
            }
        }

        for dim in self.contained_layer_dims() {
            let Some(&layer_size) = layer_dim_sizes.get(&dim) else {
                continue;
            };
            while self.total_unrolling_of(&dim) > layer_size as f64 {
                warn!("User provided spatial unrolling of {dim} exceeds the layer size {layer_size}; dropping a loop");
                let Some(mapping) = self.0.values_mut().find(|m| m.contains_key(&dim)) else {
                    break;
                };
                mapping.shift_remove(&dim);
            }
        }
    }
}

impl fmt::Display for SpatialMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (oa_dim, mapping)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{oa_dim}: {{")?;
            for (j, (dim, factor)) in mapping.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{dim}: {factor}")?;
            }
            write!(f, "}}")?;
        }
        write!(f, "}}")
    }
}

/// The layer dimensions a user allows to be unrolled over each array dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SpatialMappingHint(IndexMap<OaDim, Vec<LayerDim>>);

impl SpatialMappingHint {
    pub fn new(data: IndexMap<OaDim, Vec<LayerDim>>) -> Self {
        SpatialMappingHint(data)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, oa_dim: &OaDim) -> Option<&[LayerDim]> {
        self.0.get(oa_dim).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OaDim, &Vec<LayerDim>)> {
        self.0.iter()
    }

    /// Drops hints for array dimensions that name no dimension of the layer.
    pub fn clear_invalid(&mut self, layer_dims: &[LayerDim]) {
        self.0.retain(|oa_dim, hints| {
            let keep = hints.iter().any(|d| layer_dims.contains(d));
            if !keep {
                warn!(
                    "Spatial mapping hint {hints:?} for {oa_dim} names no dimension of this layer; \
                     ignoring it"
                );
            }
            keep
        });
    }

    /// Allows every layer dimension on each array dimension without a hint.
    pub fn complete_with_defaults<'a>(
        &mut self,
        oa_dims: impl IntoIterator<Item = &'a OaDim>,
        layer_dims: &[LayerDim],
    ) {
        for oa_dim in oa_dims {
            if !self.0.contains_key(oa_dim) {
                self.0.insert(oa_dim.clone(), layer_dims.to_vec());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sm(entries: &[(&str, &[(&str, f64)])]) -> SpatialMapping {
        SpatialMapping::new(
            entries
                .iter()
                .map(|(oa, m)| {
                    (
                        OaDim::new(oa),
                        m.iter().map(|(d, f)| (LayerDim::new(d), *f)).collect(),
                    )
                })
                .collect(),
        )
    }

    fn sizes(entries: &[(&str, u64)]) -> IndexMap<LayerDim, u64> {
        entries.iter().map(|(d, s)| (LayerDim::new(d), *s)).collect()
    }

    fn oa_sizes() -> IndexMap<OaDim, u64> {
        [(OaDim::new("D1"), 8), (OaDim::new("D2"), 8)]
            .into_iter()
            .collect()
    }

    fn max_unrollings(layer: &IndexMap<LayerDim, u64>) -> MaxUnrollings {
        oa_sizes()
            .iter()
            .map(|(oa, &s)| {
                (
                    oa.clone(),
                    layer.iter().map(|(d, &l)| (d.clone(), l.min(s))).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_utilization_and_totals() {
        let m = sm(&[("D1", &[("K", 4.0), ("C", 2.0)]), ("D2", &[("K", 2.0)])]);
        assert_eq!(m.utilization(&OaDim::new("D1")), 8.0);
        assert_eq!(m.total_unrolling_of(&LayerDim::new("K")), 8.0);
        assert_eq!(m.hw_utilization(), 16);
        assert_eq!(m.contained_layer_dims().len(), 2);
    }

    #[test]
    fn test_scaling_leaves_unit_factors() {
        let m = sm(&[("D1", &[("K", 4.0), ("C", 1.0)]), ("D2", &[("K", 2.0)])]);
        let doubled = m.scaled(2.0);
        assert_eq!(doubled.utilization(&OaDim::new("D1")), 8.0);
        assert_eq!(doubled.get(&OaDim::new("D1")).unwrap()[&LayerDim::new("C")], 1.0);
        assert_eq!(doubled.total_unrolling_of(&LayerDim::new("K")), 32.0);
    }

    #[test]
    fn test_performance_indicator_prefers_diversity() {
        let spread = sm(&[("D1", &[("K", 8.0)]), ("D2", &[("C", 8.0)])]);
        let same = sm(&[("D1", &[("K", 8.0)]), ("D2", &[("K", 8.0)])]);
        assert!(spread.performance_indicator() > same.performance_indicator());
    }

    #[test]
    fn test_check_and_reduce_fixes_invalid_mapping() {
        let layer = sizes(&[("K", 16), ("C", 4)]);
        let max = max_unrollings(&layer);
        let mut m = sm(&[("D1", &[("K", 16.0), ("X", 2.0)]), ("D2", &[("C", 4.0), ("K", 4.0)])]);
        assert!(!m.is_valid(&max, &oa_sizes(), &layer));
        m.check_and_reduce(&max, &oa_sizes(), &layer);
        assert!(m.is_valid(&max, &oa_sizes(), &layer));
        assert!(!m.contained_layer_dims().contains(&LayerDim::new("X")));
    }

    #[test]
    fn test_hint_clear_and_complete() {
        let mut hint = SpatialMappingHint::new(
            [
                (OaDim::new("D1"), vec![LayerDim::new("K")]),
                (OaDim::new("D2"), vec![LayerDim::new("Z")]),
            ]
            .into_iter()
            .collect(),
        );
        let dims = vec![LayerDim::new("K"), LayerDim::new("C")];
        hint.clear_invalid(&dims);
        assert!(hint.get(&OaDim::new("D2")).is_none());
        hint.complete_with_defaults(oa_sizes().keys(), &dims);
        assert_eq!(hint.get(&OaDim::new("D2")), Some(dims.as_slice()));
        assert_eq!(hint.get(&OaDim::new("D1")).map(|h| h.len()), Some(1));
    }
}
