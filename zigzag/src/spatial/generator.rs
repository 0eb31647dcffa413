use crate::common::{divisors, LayerDim, OaDim};
use crate::hardware::cores::Core;
use crate::mapping::spatial::{MaxUnrollings, OaDimMapping, SpatialMapping, SpatialMappingHint};
use crate::spatial::SpatialMappingError;
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, warn};

/// Produces the spatial mappings to evaluate for one layer on one core.
///
/// Array dimensions the layer's own spatial mapping leaves open are filled with every
/// combination of hinted unrollings; the best few, by [SpatialMapping::performance_indicator],
/// are kept. Unrollings are bounded by the layer, the array and the bandwidth and capacity of the
/// innermost memories.
pub struct SpatialMappingGenerator<'a> {
    layer: &'a LayerNode,
    core: &'a Core,
    provided: SpatialMapping,
    hint: SpatialMappingHint,
    enable_mix: bool,
    nb_mappings: usize,
}

impl<'a> SpatialMappingGenerator<'a> {
    pub fn new(layer: &'a LayerNode, core: &'a Core, enable_mix: bool, nb_mappings: usize) -> Self {
        let dims = layer.layer_dims();
        let mut hint = layer.spatial_mapping_hint.clone();
        hint.clear_invalid(&dims);
        hint.complete_with_defaults(core.operational_array.dimensions.keys(), &dims);
        SpatialMappingGenerator {
            layer,
            core,
            provided: layer.spatial_mapping.clone().unwrap_or_default(),
            hint,
            enable_mix,
            nb_mappings: nb_mappings.max(1),
        }
    }

    pub fn generate(&self) -> Result<Vec<SpatialMapping>, SpatialMappingError> {
        let max_unrollings = self.max_unrollings();
        let oa_dim_sizes = &self.core.operational_array.dimensions;
        let layer_dim_sizes = &self.layer.loop_dim_size;

        let mut template = self.provided.clone();
        template.check_and_reduce(&max_unrollings, oa_dim_sizes, layer_dim_sizes);
        let to_fill: Vec<&OaDim> = oa_dim_sizes
            .keys()
            .filter(|d| !template.contains_oa_dim(d))
            .collect();

        if to_fill.is_empty() {
            if !template.is_valid(&max_unrollings, oa_dim_sizes, layer_dim_sizes) {
                return Err(SpatialMappingError::InvalidUserMapping {
                    layer: self.layer.name.clone(),
                });
            }
            return Ok(vec![self.limit_unrolling_to_mem_capacity(&template)]);
        }

        let per_oa_dim: Vec<Vec<OaDimMapping>> = to_fill
            .iter()
            .map(|&oa_dim| {
                self.single_oa_dim_candidates(
                    self.hint.get(oa_dim).unwrap_or(&[]),
                    &max_unrollings.get(oa_dim).cloned().unwrap_or_default(),
                    oa_dim_sizes.get(oa_dim).copied().unwrap_or(1),
                )
            })
            .collect();

        let mut candidates: Vec<(f64, SpatialMapping)> = per_oa_dim
            .into_iter()
            .multi_cartesian_product()
            .filter_map(|combination| {
                let mut candidate = template.clone();
                for (&oa_dim, mapping) in to_fill.iter().zip(combination) {
                    candidate.insert(oa_dim.clone(), mapping);
                }
                candidate
                    .is_valid(&max_unrollings, oa_dim_sizes, layer_dim_sizes)
                    .then(|| (candidate.performance_indicator(), candidate))
            })
            .collect();
        if candidates.is_empty() {
            return Err(SpatialMappingError::NoValidSpatialMapping {
                layer: self.layer.name.clone(),
            });
        }
        debug!("{}: {} valid spatial mappings", self.layer, candidates.len());

        // Stable: equally promising mappings keep their enumeration order.
        candidates.sort_by(|(a, _), (b, _)| b.total_cmp(a));
        Ok(candidates
            .into_iter()
            .take(self.nb_mappings)
            .map(|(_, c)| self.limit_unrolling_to_mem_capacity(&c))
            .collect())
    }

    /// The largest unrolling of each layer dimension over each array dimension.
    pub fn max_unrollings(&self) -> MaxUnrollings {
        let mut max: MaxUnrollings = self
            .core
            .operational_array
            .dimensions
            .iter()
            .map(|(oa_dim, &oa_size)| {
                let per_dim = self
                    .layer
                    .loop_dim_size
                    .iter()
                    .map(|(dim, &size)| (dim.clone(), size.min(oa_size)))
                    .collect();
                (oa_dim.clone(), per_dim)
            })
            .collect();
        self.limit_unrolling_to_mem_bandwidth(&mut max);
        max
    }

    /// An innermost memory can send (or, for the output, receive) only `bandwidth / precision`
    /// distinct elements per cycle, which bounds the unrolling of the dimensions indexing its
    /// operand over the array dimensions it serves.
    fn limit_unrolling_to_mem_bandwidth(&self, max: &mut MaxUnrollings) {
        for level in self.core.memory_hierarchy.inner_memories() {
            for &mem_op in &level.operands {
                let Some(op) = self.layer.layer_operand(mem_op) else {
                    continue;
                };
                let precision = u64::from(self.layer.precision(op));
                if precision == 0 {
                    continue;
                }
                let bandwidth = if self.layer.is_output(op) {
                    level.instance.w_bw
                } else {
                    level.instance.r_bw
                };
                let max_multicast = bandwidth / precision;
                let irrelevant = self.layer.relevancy.ir_dims(op);
                for oa_dim in &level.served_dimensions {
                    let Some(per_dim) = max.get_mut(oa_dim) else {
                        continue;
                    };
                    for (dim, size) in per_dim.iter_mut() {
                        if irrelevant.contains(dim) || max_multicast >= *size {
                            continue;
                        }
                        // Quiet for dimensions the layer's own mapping does not put here anyway.
                        let user_skips = self
                            .provided
                            .get(oa_dim)
                            .is_some_and(|m| !m.contains_key(dim));
                        if !user_skips {
                            warn!(
                                "Maximal spatial unrolling of {dim} at {oa_dim} limited to {max_multicast} \
                                 due to the bandwidth of {}",
                                level.name()
                            );
                        }
                        *size = max_multicast;
                    }
                }
            }
        }
    }

    /// Lowers unrollings until the distinct elements they need fit in the innermost memories.
    fn limit_unrolling_to_mem_capacity(&self, mapping: &SpatialMapping) -> SpatialMapping {
        let mut data: IndexMap<OaDim, OaDimMapping> =
            mapping.iter().map(|(d, m)| (d.clone(), m.clone())).collect();
        for level in self.core.memory_hierarchy.inner_memories() {
            for &mem_op in &level.operands {
                let Some(op) = self.layer.layer_operand(mem_op) else {
                    continue;
                };
                let precision = self.layer.precision(op);
                if precision == 0 {
                    continue;
                }
                let irrelevant = self.layer.relevancy.ir_dims(op);
                let slots: Vec<(OaDim, LayerDim)> = level
                    .served_dimensions
                    .iter()
                    .filter_map(|oa_dim| data.get(oa_dim).map(|m| (oa_dim, m)))
                    .flat_map(|(oa_dim, m)| {
                        m.keys()
                            .filter(move |d| !irrelevant.contains(d))
                            .map(move |d| (oa_dim.clone(), d.clone()))
                    })
                    .collect();
                let factor_of = |data: &IndexMap<OaDim, OaDimMapping>, (oa, d): &(OaDim, LayerDim)| {
                    data.get(oa).and_then(|m| m.get(d)).copied().unwrap_or(1.0)
                };
                let mut factors: Vec<f64> = slots.iter().map(|s| factor_of(&data, s)).collect();
                let max_stored = level.instance.size as f64 / f64::from(precision);
                if factors.iter().product::<f64>() <= max_stored {
                    continue;
                }
                warn!(
                    "Maximal spatial unrolling limited to {} due to the capacity {} of {}",
                    max_stored,
                    level.instance.size,
                    level.name()
                );
                while factors.iter().product::<f64>() > max_stored {
                    let Some((i, &largest)) = factors
                        .iter()
                        .enumerate()
                        .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })
                    else {
                        break;
                    };
                    if largest <= 1.0 {
                        break;
                    }
                    factors[i] = largest - 1.0;
                }
                for ((oa_dim, dim), factor) in slots.iter().zip(factors) {
                    if let Some(f) = data.get_mut(oa_dim).and_then(|m| m.get_mut(dim)) {
                        *f = factor;
                    }
                }
            }
        }
        SpatialMapping::new(data)
    }

    /// Candidate unrollings of one array dimension: each hinted layer dimension alone with every
    /// divisor of its maximal unrolling (largest first) and, when enabled, combinations of
    /// several hinted dimensions that fit the array dimension.
    fn single_oa_dim_candidates(
        &self,
        hints: &[LayerDim],
        max_unrollings: &IndexMap<LayerDim, u64>,
        oa_dim_size: u64,
    ) -> Vec<OaDimMapping> {
        let mut out: Vec<OaDimMapping> = Vec::new();
        for dim in hints {
            if let Some(&max) = max_unrollings.get(dim) {
                for factor in divisors(max).into_iter().rev() {
                    out.push([(dim.clone(), factor as f64)].into_iter().collect());
                }
            }
        }
        if !self.enable_mix {
            return out;
        }

        let pool: Vec<(&LayerDim, Vec<u64>)> = hints
            .iter()
            .filter_map(|dim| {
                let &max = max_unrollings.get(dim)?;
                Some((dim, divisors(max).into_iter().filter(|&f| f > 1).collect()))
            })
            .collect();
        for len in 2..=pool.len() {
            for mix in pool.iter().combinations(len) {
                for factors in mix
                    .iter()
                    .map(|(_, f)| f.iter().copied())
                    .multi_cartesian_product()
                {
                    if factors.iter().product::<u64>() > oa_dim_size {
                        continue;
                    }
                    out.push(
                        mix.iter()
                            .zip(&factors)
                            .map(|((dim, _), &f)| (LayerDim::clone(dim), f as f64))
                            .collect(),
                    );
                }
            }
        }
        out
    }
}
