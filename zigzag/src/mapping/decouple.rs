//! Rewriting of partially relevant loops into relevant and irrelevant virtual loops.
//!
//! A loop over `OX` contributes to the size of `I`'s `IX` dimension only partly: with a filter
//! loop below, consecutive output positions share input pixels. For per-level data size and
//! reuse computations every such loop is replaced by an `IX_r` loop carrying the growth of the
//! `IX` extent and an `IX_ir` loop carrying the remaining (reuse) factor. The two factors always
//! multiply back to the original loop size.

use crate::common::{LayerDim, LayerOperand, LevelLoops, LoopSizes, MappingDict};
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;

/// Decouples the partially relevant loops of every operand of `mapping`.
pub fn decouple_pr_loops(mapping: &MappingDict, layer: &LayerNode) -> MappingDict {
    mapping
        .iter()
        .map(|(op, levels)| {
            let reformed = match layer.relevancy.pr_dims(op) {
                Some(pr) => decouple_operand(op, levels, pr, layer),
                None => levels.clone(),
            };
            (op.clone(), reformed)
        })
        .collect()
}

fn decouple_operand(
    op: &LayerOperand,
    levels: &LevelLoops,
    pr: &IndexMap<LayerDim, [LayerDim; 2]>,
    layer: &LayerNode,
) -> LevelLoops {
    // Sizes of the loops feeding each pr dimension, accumulated from the innermost level up.
    let mut below: IndexMap<&LayerDim, LoopSizes> = pr
        .iter()
        .map(|(dim, pair)| (dim, pair.iter().map(|d| (d.clone(), 1.0)).collect()))
        .collect();
    // (data size, reuse) reached after the previous loop of each pr dimension.
    let mut reached: IndexMap<&LayerDim, (f64, f64)> =
        pr.keys().map(|dim| (dim, (1.0, 1.0))).collect();

    levels
        .iter()
        .map(|loops| {
            let mut out = Vec::with_capacity(loops.len());
            for (dim, size) in loops {
                let owner = if layer.relevancy.is_r(op, dim) || layer.relevancy.is_ir(op, dim) {
                    None
                } else {
                    pr.iter().find(|(_, pair)| pair.contains(dim)).map(|(d, _)| d)
                };
                let (Some(pr_dim), Some(sizes)) = (owner, owner.and_then(|d| below.get_mut(d)))
                else {
                    out.push((dim.clone(), *size));
                    continue;
                };
                if let Some(s) = sizes.get_mut(dim) {
                    *s *= size;
                }
                let data = layer.calc_tensor_dim(pr_dim, sizes);
                let reuse = sizes.values().product::<f64>() / data;
                let (prev_data, prev_reuse) = reached.get(pr_dim).copied().unwrap_or((1.0, 1.0));
                out.push((pr_dim.r_version(), data / prev_data));
                out.push((pr_dim.ir_version(), reuse / prev_reuse));
                reached.insert(pr_dim, (data, reuse));
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::layer::tests::conv_attrs;
    use crate::workload::layer::LayerAttributes;
    use proptest::prelude::*;

    fn conv() -> LayerNode {
        LayerNode::new(0, "conv", conv_attrs(8, 4, 6, 6, 3, 3)).unwrap()
    }

    fn single(op: &str, levels: &[&[(&str, f64)]]) -> MappingDict {
        [(
            LayerOperand::new(op),
            levels
                .iter()
                .map(|l| l.iter().map(|(d, s)| (LayerDim::new(d), *s)).collect())
                .collect(),
        )]
        .into_iter()
        .collect()
    }

    fn dims(loops: &[(LayerDim, f64)]) -> Vec<&str> {
        loops.iter().map(|(d, _)| d.as_str()).collect()
    }

    #[test]
    fn test_input_pr_loops_are_split() {
        let layer = conv();
        let mapping = single("I", &[&[("FX", 3.0), ("C", 4.0)], &[("OX", 6.0)]]);
        let out = decouple_pr_loops(&mapping, &layer);
        let levels = &out[&LayerOperand::new("I")];
        assert_eq!(dims(&levels[0]), ["IX_r", "IX_ir", "C"]);
        assert_eq!(dims(&levels[1]), ["IX_r", "IX_ir"]);
        // FX alone spans 3 input columns without reuse.
        assert_eq!(levels[0][0].1, 3.0);
        assert_eq!(levels[0][1].1, 1.0);
        // Adding OX = 6 grows IX to 8 columns: 8/3 new data, the rest is reuse.
        assert!((levels[1][0].1 - 8.0 / 3.0).abs() < 1e-9);
        assert!((levels[1][0].1 * levels[1][1].1 - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_operands_without_pr_dims_are_untouched() {
        let layer = conv();
        let mapping = single("W", &[&[("FX", 3.0), ("OX", 6.0)], &[("K", 8.0)]]);
        assert_eq!(decouple_pr_loops(&mapping, &layer), mapping);
    }

    proptest! {
        #[test]
        fn test_split_factors_multiply_back(
            fx in 1u64..5, ox in 1u64..9, split in 1u64..3
        ) {
            let attrs: LayerAttributes = conv_attrs(2, 2, 2, ox, 1, fx);
            let layer = LayerNode::new(0, "conv", attrs).unwrap();
            let inner = if split == 1 { vec![("FX", fx as f64)] } else { vec![("OX", ox as f64)] };
            let outer = if split == 1 { vec![("OX", ox as f64)] } else { vec![("FX", fx as f64)] };
            let mapping = single("I", &[&inner, &outer]);
            let out = decouple_pr_loops(&mapping, &layer);
            let product: f64 = out[&LayerOperand::new("I")]
                .iter()
                .flatten()
                .map(|(_, s)| s)
                .product();
            prop_assert!((product - (fx * ox) as f64).abs() < 1e-6);
        }
    }
}
