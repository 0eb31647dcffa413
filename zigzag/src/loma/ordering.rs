use crate::common::{LayerDim, Loop};
use crate::loma::multipermute::PermutationConstraint;
use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};

/// The marker separating loops pinned from the innermost position from loops pinned from the
/// outermost position.
pub const UNKNOWN_DIM_MARKER: &str = "*";

/// A user-defined temporal loop ordering, innermost loop first.
///
/// A `None` size means the size is left open: "all remaining" when converted directly, or a
/// position-only pin when used as a constraint on loma.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TemporalOrdering(Vec<(LayerDim, Option<u64>)>);

impl TemporalOrdering {
    pub fn new(entries: Vec<(LayerDim, Option<u64>)>) -> Self {
        TemporalOrdering(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[(LayerDim, Option<u64>)] {
        &self.0
    }

    fn is_marker(dim: &LayerDim) -> bool {
        dim.as_str() == UNKNOWN_DIM_MARKER
    }

    /// True if every loop has a size and, per dimension, the sizes multiply to exactly the given
    /// temporal loop sizes (ignoring size-1 loops).
    pub fn is_complete(&self, temporal_loop_sizes: &IndexMap<LayerDim, u64>) -> bool {
        let mut all_loops: IndexMap<LayerDim, u64> = IndexMap::new();
        for (dim, factor) in &self.0 {
            let Some(factor) = factor else {
                return false;
            };
            *all_loops.entry(dim.clone()).or_insert(1) *= factor;
        }
        all_loops.retain(|_, size| *size != 1);
        all_loops.len() == temporal_loop_sizes.len()
            && all_loops
                .iter()
                .all(|(d, s)| temporal_loop_sizes.get(d) == Some(s))
    }

    /// Removes loops over dimensions the layer does not have.
    pub fn remove_invalid_layer_dims(&mut self, layer_dims: &[LayerDim], layer_name: &str) {
        self.0.retain(|(dim, factor)| {
            let keep = Self::is_marker(dim) || layer_dims.contains(dim);
            if !keep {
                warn!(
                    "Supplied temporal ordering ({dim}, {factor:?}) for layer {layer_name} \
                     thrown out because the dimension is not present in the layer"
                );
            }
            keep
        });
    }

    /// The ordering as concrete loops, innermost first. An open size takes whatever remains of
    /// the dimension once the loops before it and `spatial_loops` are accounted for.
    pub fn resolve(
        &self,
        loop_dim_size: &IndexMap<LayerDim, u64>,
        spatial_loops: &[Loop],
    ) -> Vec<Loop> {
        let mut loops: Vec<Loop> = Vec::with_capacity(self.0.len());
        for (dim, factor) in &self.0 {
            if Self::is_marker(dim) {
                continue;
            }
            let size = match factor {
                Some(size) => *size as f64,
                None => {
                    let total = loop_dim_size.get(dim).copied().unwrap_or(1) as f64;
                    let already: f64 = loops
                        .iter()
                        .chain(spatial_loops)
                        .filter(|(d, _)| d == dim)
                        .map(|(_, s)| s)
                        .product();
                    (total / already).floor()
                }
            };
            loops.push((dim.clone(), size));
        }
        loops
    }

    /// Converts the ordering into loma permutation constraints. Entries after the marker are
    /// pinned relative to the outermost loop.
    pub fn constraints(&self) -> Vec<PermutationConstraint> {
        let mut positions = IndexMap::new();
        let mut positions_and_sizes = IndexMap::new();
        let mut outer = false;
        let len = self.0.len() as isize;
        for (count, (dim, factor)) in self.0.iter().enumerate() {
            let count = count as isize;
            if Self::is_marker(dim) && factor.is_none() {
                outer = true;
                continue;
            }
            let index = if outer { count - len } else { count };
            match factor {
                None => {
                    positions.insert(index, dim.clone());
                }
                Some(size) => {
                    positions_and_sizes.insert(index, (dim.clone(), *size));
                }
            }
        }
        vec![
            PermutationConstraint::StaticPositions(positions),
            PermutationConstraint::StaticPositionsAndSizes(positions_and_sizes),
        ]
    }
}
