use crate::common::{LayerDim, MappingDict, OaDim, UnrollFactor};
use crate::hardware::cores::Core;
use crate::mapping::spatial::{OaDimMapping, SpatialMapping};
use crate::mapping::spatial_internal::SpatialMappingInternal;
use crate::spatial::SpatialMappingError;
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;
use log::{debug, warn};

/// A spatial mapping in the two forms the cost model needs.
#[derive(Debug, Clone)]
pub struct ConvertedSpatialMapping {
    /// Factors may be fractional so that every temporal remainder is an integer. Used for
    /// energy and data sizes.
    pub fractional: SpatialMappingInternal,
    /// Factors truncated to integers, as the hardware really unrolls them. Used for transfer
    /// periods and latency.
    pub integer: SpatialMappingInternal,
}

/// Converts a spatial mapping over the array dimensions of `core` into its per-memory-level form.
pub fn convert(
    user: &SpatialMapping,
    layer: &LayerNode,
    core: &Core,
) -> Result<ConvertedSpatialMapping, SpatialMappingError> {
    let oa_dim_sizes = &core.operational_array.dimensions;
    let fractional = limit(user, layer, oa_dim_sizes, true);
    let integer = limit(user, layer, oa_dim_sizes, false);
    debug!("{layer}: spatial mapping {user} converted to {fractional}");

    let fractional = SpatialMappingInternal::new(per_memory_level(&fractional, layer, core)?, layer)?;
    let integer = SpatialMappingInternal::new(per_memory_level(&integer, layer, core)?, layer)?;
    Ok(ConvertedSpatialMapping {
        fractional,
        integer,
    })
}

/// Clips every unrolling to its array dimension and the layer, and adjusts the largest unrolling
/// of each layer dimension so that the temporal remainder divides evenly. With
/// `allow_fractional` unset, the adjusted factors are truncated.
fn limit(
    user: &SpatialMapping,
    layer: &LayerNode,
    oa_dim_sizes: &IndexMap<OaDim, u64>,
    allow_fractional: bool,
) -> SpatialMapping {
    let mut limited = SpatialMapping::default();
    for (oa_dim, mapping) in user.iter() {
        let mut limited_here = OaDimMapping::new();
        for (dim, &factor) in mapping {
            let Some(&layer_size) = layer.loop_dim_size.get(dim) else {
                continue;
            };
            let mut factor = factor;
            if let Some(&oa_size) = oa_dim_sizes.get(oa_dim) {
                if factor > oa_size as f64 {
                    warn!(
                        "Provided unrolling ({dim}:{factor}) exceeds the size of {oa_dim} ({oa_size}); \
                         reducing it to {oa_size}"
                    );
                    factor = oa_size as f64;
                }
            }
            factor = factor.min(layer_size as f64);

            if is_first_max(user, oa_dim, dim) {
                let early = unrolled_before(&limited, oa_dim, dim);
                let remainder = (layer_size as f64 / (factor * early)).ceil();
                let adjusted = layer_size as f64 / remainder / early;
                factor = if allow_fractional {
                    adjusted
                } else {
                    adjusted.trunc().max(1.0)
                };
            }
            limited_here.insert(dim.clone(), factor);
        }
        if !limited_here.is_empty() {
            limited.insert(oa_dim.clone(), limited_here);
        }
    }
    limited
}

/// Whether `oa_dim` is the first array dimension holding the largest unrolling of `dim`. Only
/// that unrolling absorbs the rounding of a non-divisible layer dimension.
fn is_first_max(user: &SpatialMapping, oa_dim: &OaDim, dim: &LayerDim) -> bool {
    let max = user
        .iter()
        .filter_map(|(_, m)| m.get(dim).copied())
        .fold(0.0, f64::max);
    user.iter()
        .find(|(_, m)| m.get(dim) == Some(&max))
        .is_some_and(|(d, _)| d == oa_dim)
}

/// The unrolling of `dim` already placed on array dimensions before `oa_dim`.
fn unrolled_before(limited: &SpatialMapping, oa_dim: &OaDim, dim: &LayerDim) -> UnrollFactor {
    limited
        .iter()
        .take_while(|(d, _)| *d != oa_dim)
        .filter_map(|(_, m)| m.get(dim))
        .product()
}

/// Attaches each array dimension's unrollings to the lowest memory level serving it, per operand.
/// Unrollings over dimensions no memory serves go to an extra top entry.
fn per_memory_level(
    sm: &SpatialMapping,
    layer: &LayerNode,
    core: &Core,
) -> Result<MappingDict, SpatialMappingError> {
    let mut out = MappingDict::new();
    for op in layer.layer_operands() {
        let mem_op = layer
            .memory_operand(op)
            .ok_or_else(|| SpatialMappingError::UnlinkedOperand {
                layer: layer.name.clone(),
                operand: op.clone(),
            })?;
        let levels = core.mem_levels(mem_op);
        if levels.is_empty() {
            return Err(SpatialMappingError::UnservedOperand {
                layer: layer.name.clone(),
                mem_op,
            });
        }

        let mut remaining: IndexMap<&OaDim, &OaDimMapping> = sm.iter().collect();
        let mut per_level = Vec::with_capacity(levels.len() + 1);
        for level in levels {
            let mut merged = OaDimMapping::new();
            for oa_dim in &level.served_dimensions {
                if let Some(mapping) = remaining.shift_remove(oa_dim) {
                    merge_into(&mut merged, mapping);
                }
            }
            per_level.push(merged.into_iter().collect());
        }
        let mut top = OaDimMapping::new();
        for mapping in remaining.values() {
            merge_into(&mut top, mapping);
        }
        per_level.push(top.into_iter().collect());
        out.insert(op.clone(), per_level);
    }
    Ok(out)
}

fn merge_into(merged: &mut OaDimMapping, mapping: &OaDimMapping) {
    for (dim, factor) in mapping {
        *merged.entry(dim.clone()).or_insert(1.0) *= factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LayerOperand;
    use crate::hardware::presets;
    use crate::mapping::spatial_internal::tests::gemm_sm;
    use crate::workload::layer::tests::gemm_attrs;

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

    #[test]
    fn test_gemm_levels_follow_served_dimensions() {
        let acc = presets::gemm_l1().unwrap();
        let core = acc.get_core(1).unwrap();
        let layer = LayerNode::new(0, "gemm", gemm_attrs(16, 16, 16)).unwrap();
        let user = sm(&[("D1", &[("M", 8.0)]), ("D2", &[("N", 8.0)]), ("D3", &[("K", 8.0)])]);
        let converted = convert(&user, &layer, core).unwrap();
        // reg_O serves D3 only; l1 picks up the rest.
        assert_eq!(converted.fractional.mapping, gemm_sm());
        assert_eq!(converted.integer.mapping, gemm_sm());
        assert_eq!(converted.fractional.mac_unit_count(), 512);
    }

    #[test]
    fn test_non_divisible_unrolling_is_adjusted() {
        let acc = presets::gemm_l1().unwrap();
        let core = acc.get_core(1).unwrap();
        let layer = LayerNode::new(0, "gemm", gemm_attrs(20, 16, 16)).unwrap();
        let user = sm(&[("D1", &[("M", 8.0)]), ("D2", &[("N", 8.0)]), ("D3", &[("K", 8.0)])]);
        let converted = convert(&user, &layer, core).unwrap();
        let a = LayerOperand::new("A");
        let m_factor = |internal: &SpatialMappingInternal| {
            internal.mapping[&a][0]
                .iter()
                .find(|(d, _)| d.as_str() == "M")
                .map(|(_, f)| *f)
        };
        // M = 20 takes 3 temporal iterations, so each covers 20/3 rows.
        assert!((m_factor(&converted.fractional).unwrap() - 20.0 / 3.0).abs() < 1e-9);
        assert_eq!(m_factor(&converted.integer), Some(6.0));
    }

    #[test]
    fn test_only_first_largest_unrolling_is_adjusted() {
        let user = sm(&[("D1", &[("M", 2.0)]), ("D2", &[("M", 8.0)]), ("D3", &[("M", 8.0)])]);
        let m = LayerDim::new("M");
        assert!(!is_first_max(&user, &OaDim::new("D1"), &m));
        assert!(is_first_max(&user, &OaDim::new("D2"), &m));
        assert!(!is_first_max(&user, &OaDim::new("D3"), &m));
        assert_eq!(unrolled_before(&user, &OaDim::new("D3"), &m), 16.0);
    }

    #[test]
    fn test_unknown_layer_dims_are_dropped() {
        let acc = presets::gemm_l1().unwrap();
        let core = acc.get_core(1).unwrap();
        let layer = LayerNode::new(0, "gemm", gemm_attrs(16, 16, 16)).unwrap();
        let user = sm(&[("D1", &[("M", 8.0), ("OX", 4.0)]), ("D2", &[("N", 8.0)])]);
        let converted = convert(&user, &layer, core).unwrap();
        assert_eq!(converted.fractional.mac_unit_count(), 64);
        let dims: Vec<&str> = converted
            .fractional
            .spatial_loop_dim_size
            .iter()
            .map(|(d, _)| d.as_str())
            .collect();
        assert_eq!(dims, ["M", "N"]);
    }
}
