use crate::common::{factorial, prime_factors, LayerDim, Loop};
use crate::hardware::cores::Core;
use crate::loma::allocator::MemoryAllocator;
use crate::loma::multipermute::{constrained_permutations, Lpf, PermutationConstraint};
use crate::loma::LomaError;
use crate::mapping::spatial_internal::SpatialMappingInternal;
use crate::mapping::temporal::TemporalMapping;
use crate::workload::layer::LayerNode;
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::sync::Arc;

/// Distinct prime factors of one dimension with their multiplicities, ascending.
type FactorCounts = Vec<(u64, usize)>;

/// Enumerates temporal mappings of a layer for a fixed spatial mapping.
///
/// The temporal loops left after spatial unrolling are split into loop prime factors (LPFs).
/// Every distinct ordering of the LPFs is handed to the [MemoryAllocator]; orderings whose
/// tiles overflow a memory are skipped. The engine shares ownership of its inputs so that
/// [LomaEngine::run] can hand out mappings for as long as the caller wants them.
pub struct LomaEngine {
    layer: Arc<LayerNode>,
    core: Arc<Core>,
    spatial: Arc<SpatialMappingInternal>,
    constraints: Vec<PermutationConstraint>,
    show_progress: bool,
    temporal_loop_sizes: IndexMap<LayerDim, u64>,
    factors: IndexMap<LayerDim, FactorCounts>,
    lpf_limit: usize,
}

impl LomaEngine {
    pub fn new(
        layer: Arc<LayerNode>,
        core: Arc<Core>,
        spatial: Arc<SpatialMappingInternal>,
        lpf_limit: usize,
    ) -> Self {
        let temporal_loop_sizes = temporal_loop_sizes(&layer, &spatial);
        let mut lpf_limit = lpf_limit;
        if lpf_limit < temporal_loop_sizes.len() {
            debug!(
                "Raised the lpf limit of layer {layer} from {lpf_limit} to {}",
                temporal_loop_sizes.len()
            );
            lpf_limit = temporal_loop_sizes.len();
        }

        let mut factors: IndexMap<LayerDim, FactorCounts> = temporal_loop_sizes
            .iter()
            .map(|(dim, &size)| {
                let mut counts: FactorCounts = Vec::new();
                for pf in prime_factors(size) {
                    match counts.last_mut() {
                        Some((last, count)) if *last == pf => *count += 1,
                        _ => counts.push((pf, 1)),
                    }
                }
                (dim.clone(), counts)
            })
            .collect();
        // Fully unrolled layers still get one temporal loop of size 1.
        if factors.values().all(Vec::is_empty) {
            factors.clear();
            if let Some(dim) = layer.loop_dim_size.keys().next() {
                factors.insert(dim.clone(), vec![(1, 1)]);
            }
        }
        limit_lpfs(&mut factors, lpf_limit);

        let engine = LomaEngine {
            layer,
            core,
            spatial,
            constraints: Vec::new(),
            show_progress: false,
            temporal_loop_sizes,
            factors,
            lpf_limit,
        };
        debug!(
            "Layer {}: {} LPFs, {} loop orderings",
            engine.layer,
            engine.lpfs().len(),
            engine.nb_permutations()
        );
        engine
    }

    /// Only orderings satisfying every non-empty constraint are allocated.
    pub fn with_constraints(mut self, constraints: Vec<PermutationConstraint>) -> Self {
        self.constraints = constraints.into_iter().filter(|c| !c.is_empty()).collect();
        self
    }

    /// Draws a progress bar over the orderings on stderr.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// The loop sizes left to iterate temporally, without size-1 loops.
    pub fn temporal_loop_sizes(&self) -> &IndexMap<LayerDim, u64> {
        &self.temporal_loop_sizes
    }

    pub fn lpf_limit(&self) -> usize {
        self.lpf_limit
    }

    /// The loop prime factors, grouped by dimension.
    pub fn lpfs(&self) -> Vec<Lpf> {
        self.factors
            .iter()
            .flat_map(|(dim, counts)| {
                counts
                    .iter()
                    .flat_map(move |&(pf, count)| std::iter::repeat((dim.clone(), pf)).take(count))
            })
            .collect()
    }

    /// The number of distinct LPF orderings, before constraints.
    pub fn nb_permutations(&self) -> u128 {
        let total: usize = self.factors.values().flatten().map(|(_, c)| c).sum();
        self.factors
            .values()
            .flatten()
            .fold(factorial(total as u64), |acc, &(_, c)| acc / factorial(c as u64))
    }

    /// Lazily allocates every ordering. Ends with [LomaError::NoValidLoopOrdering] if no
    /// ordering fit the hierarchy.
    pub fn run(self) -> LomaMappings {
        let progress = if self.show_progress {
            let bar = ProgressBar::new(u64::try_from(self.nb_permutations()).unwrap_or(u64::MAX));
            if let Ok(style) =
                ProgressStyle::with_template("{msg} [{elapsed_precise}] {wide_bar} {pos}/{len}")
            {
                bar.set_style(style);
            }
            bar.set_message(format!("Layer {}", self.layer));
            bar
        } else {
            ProgressBar::hidden()
        };
        LomaMappings {
            orderings: Box::new(constrained_permutations(
                self.lpfs(),
                self.constraints.clone(),
            )),
            engine: self,
            progress,
            yielded: false,
            done: false,
        }
    }
}

/// Iterator returned by [LomaEngine::run].
pub struct LomaMappings {
    engine: LomaEngine,
    orderings: Box<dyn Iterator<Item = Vec<Lpf>>>,
    progress: ProgressBar,
    yielded: bool,
    done: bool,
}

impl LomaMappings {
    /// How many orderings have been tried so far.
    pub fn orderings_visited(&self) -> u64 {
        self.progress.position()
    }
}

impl Iterator for LomaMappings {
    type Item = Result<TemporalMapping, LomaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(ordering) = self.orderings.next() {
            self.progress.inc(1);
            let loops: Vec<Loop> = ordering
                .into_iter()
                .map(|(dim, size)| (dim, size as f64))
                .collect();
            let engine = &self.engine;
            match MemoryAllocator::new(&engine.layer, &engine.core, &engine.spatial, &loops).run() {
                Ok(tm) => {
                    self.yielded = true;
                    return Some(Ok(tm));
                }
                Err(e) if e.is_capacity() => debug!("Skipping loop ordering: {e}"),
                Err(e) => return Some(Err(e)),
            }
        }
        self.done = true;
        self.progress.finish_and_clear();
        if self.yielded {
            None
        } else {
            Some(Err(LomaError::NoValidLoopOrdering {
                layer: self.engine.layer.name.clone(),
            }))
        }
    }
}

/// The layer sizes divided by their spatial unrolling, rounded up so a non-divisible dimension
/// gets one extra iteration.
fn temporal_loop_sizes(
    layer: &LayerNode,
    spatial: &SpatialMappingInternal,
) -> IndexMap<LayerDim, u64> {
    let mut sizes = layer.loop_dim_size.clone();
    for (dim, factor) in &spatial.spatial_loop_dim_size {
        let Some(size) = sizes.get(dim).copied() else {
            continue;
        };
        let q = (size as f64 / factor).ceil() as u64;
        if q <= 1 {
            sizes.shift_remove(dim);
        } else {
            sizes.insert(dim.clone(), q);
        }
    }
    sizes.retain(|_, s| *s > 1);
    sizes
}

/// Merges prime factors until at most `limit` remain. Each step takes the dimension with the most
/// factors and multiplies its two smallest.
fn limit_lpfs(factors: &mut IndexMap<LayerDim, FactorCounts>, limit: usize) {
    let count = |counts: &FactorCounts| counts.iter().map(|(_, c)| c).sum::<usize>();
    let mut n = factors.values().map(count).sum::<usize>();
    while n > limit {
        let Some((_, counts)) = factors
            .iter_mut()
            .reduce(|best, cur| if count(&*cur.1) > count(&*best.1) { cur } else { best })
        else {
            return;
        };
        if count(&*counts) < 2 {
            return;
        }
        let merged = if counts[0].1 == 1 {
            let m = counts[0].0 * counts[1].0;
            counts[0].1 -= 1;
            counts[1].1 -= 1;
            m
        } else {
            counts[0].1 -= 2;
            counts[0].0 * counts[0].0
        };
        match counts.iter_mut().find(|(pf, _)| *pf == merged) {
            Some((_, c)) => *c += 1,
            None => {
                let at = counts.iter().filter(|(pf, _)| *pf < merged).count();
                counts.insert(at, (merged, 1));
            }
        }
        counts.retain(|(_, c)| *c > 0);
        n -= 1;
    }
}
