//! Simulated annealing over temporal loop orderings, for layers whose orderings are too many to
//! enumerate.
//!
//! A chain starts from a random ordering of the loop prime factors and repeatedly swaps two of
//! them. Each ordering is allocated bottom-up like loma's and then evaluated; a worse ordering
//! is accepted with a probability that shrinks as the temperature cools.

use crate::common::Loop;
use crate::config::{Opt, SalsaConfig};
use crate::cost::{CostError, CostModelEvaluation, CostTotals};
use crate::hardware::Core;
use crate::loma::{LomaEngine, LomaError, Lpf, MemoryAllocator};
use crate::mapping::TemporalMapping;
use crate::spatial::ConvertedSpatialMapping;
use crate::workload::LayerNode;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;

const COOLING: f64 = 0.995;

#[derive(thiserror::Error, Debug)]
pub enum SalsaError {
    #[error(transparent)]
    Loma(#[from] LomaError),
    #[error(transparent)]
    Cost(#[from] CostError),
}

/// An ordering with its allocation and cost.
#[derive(Debug, Clone)]
struct State {
    ordering: Vec<Lpf>,
    temporal: TemporalMapping,
    totals: CostTotals,
    score: f64,
}

/// The best temporal mapping a run found.
#[derive(Debug, Clone)]
pub struct Annealed {
    pub temporal_mapping: TemporalMapping,
    pub totals: CostTotals,
    /// Orderings allocated and evaluated, over all chains.
    pub evaluations: usize,
}

pub struct SalsaEngine {
    layer: Arc<LayerNode>,
    core: Arc<Core>,
    spatial: Arc<ConvertedSpatialMapping>,
    accelerator: String,
    lpfs: Vec<Lpf>,
    settings: SalsaConfig,
    same_data_no_access: bool,
}

impl SalsaEngine {
    /// Splits the temporal loops into LPFs exactly as loma does with the same `lpf_limit`.
    pub fn new(
        accelerator: &str,
        layer: Arc<LayerNode>,
        core: Arc<Core>,
        spatial: Arc<ConvertedSpatialMapping>,
        lpf_limit: usize,
        settings: SalsaConfig,
    ) -> Self {
        let lpfs = LomaEngine::new(
            layer.clone(),
            core.clone(),
            Arc::new(spatial.fractional.clone()),
            lpf_limit,
        )
        .lpfs();
        SalsaEngine {
            layer,
            core,
            spatial,
            accelerator: accelerator.to_owned(),
            lpfs,
            settings,
            same_data_no_access: true,
        }
    }

    pub fn with_same_data_no_access(mut self, same_data_no_access: bool) -> Self {
        self.same_data_no_access = same_data_no_access;
        self
    }

    pub fn lpfs(&self) -> &[Lpf] {
        &self.lpfs
    }

    /// Runs every chain and keeps the best result. Fails with
    /// [LomaError::NoValidLoopOrdering] if no chain found an ordering that fits the hierarchy.
    pub fn run(&self) -> Result<Annealed, SalsaError> {
        let chains = (0..self.settings.chains)
            .into_par_iter()
            .map(|chain| {
                let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(chain as u64));
                self.anneal(&mut rng)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let evaluations = chains.iter().map(|(_, n)| n).sum();
        let best = chains
            .into_iter()
            .filter_map(|(state, _)| state)
            .reduce(|best, s| {
                if self.compare(&s, &best) == Ordering::Less {
                    s
                } else {
                    best
                }
            });
        let Some(best) = best else {
            return Err(LomaError::NoValidLoopOrdering {
                layer: self.layer.name.clone(),
            }
            .into());
        };
        debug!(
            "{}: best {} {:.4e} after {evaluations} evaluations",
            self.layer, self.settings.opt, best.score
        );
        Ok(Annealed {
            temporal_mapping: best.temporal,
            totals: best.totals,
            evaluations,
        })
    }

    /// One chain. Returns its best state, if it found a feasible start, and how many orderings
    /// it evaluated.
    fn anneal(&self, rng: &mut StdRng) -> Result<(Option<State>, usize), SalsaError> {
        let mut evaluations = 0;
        let mut start = self.lpfs.clone();
        let mut current = None;
        for _ in 0..self.settings.iterations {
            start.shuffle(rng);
            evaluations += 1;
            if let Some(state) = self.evaluate(start.clone())? {
                current = Some(state);
                break;
            }
        }
        let Some(mut current) = current else {
            return Ok((None, evaluations));
        };
        let mut best = current.clone();
        let n = current.ordering.len();
        if n < 2 {
            return Ok((Some(best), evaluations));
        }

        for it in 0..self.settings.iterations {
            let temperature = self.settings.start_temperature * COOLING.powf(it as f64);
            let (i, j) = (rng.gen_range(0..n), rng.gen_range(0..n));
            if current.ordering[i] == current.ordering[j] {
                continue;
            }
            let mut ordering = current.ordering.clone();
            ordering.swap(i, j);
            evaluations += 1;
            let Some(next) = self.evaluate(ordering)? else {
                continue;
            };
            let acceptance = ((current.score / next.score - 1.0) / temperature).exp();
            if rng.gen::<f64>() < acceptance {
                current = next;
                if self.compare(&current, &best) == Ordering::Less {
                    best = current.clone();
                }
            }
        }
        Ok((Some(best), evaluations))
    }

    /// Allocates and evaluates an ordering. `None` if its tiles overflow a memory.
    fn evaluate(&self, ordering: Vec<Lpf>) -> Result<Option<State>, SalsaError> {
        let loops: Vec<Loop> = ordering
            .iter()
            .map(|(dim, size)| (dim.clone(), *size as f64))
            .collect();
        let allocator =
            MemoryAllocator::new(&self.layer, &self.core, &self.spatial.fractional, &loops);
        let temporal = match allocator.run() {
            Ok(tm) => tm,
            Err(e) if e.is_capacity() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cme = CostModelEvaluation::new(
            &self.accelerator,
            &self.core,
            &self.layer,
            &self.spatial,
            &temporal,
            self.same_data_no_access,
        )?;
        let score = score(self.settings.opt, &cme.totals);
        Ok(Some(State {
            ordering,
            temporal,
            totals: cme.totals,
            score,
        }))
    }

    /// Lower score first; for energy and latency the other metric breaks ties.
    fn compare(&self, a: &State, b: &State) -> Ordering {
        let tie = match self.settings.opt {
            Opt::Energy => a
                .totals
                .latency
                .latency_total2
                .cmp(&b.totals.latency.latency_total2),
            Opt::Latency => a.totals.energy_total.total_cmp(&b.totals.energy_total),
            Opt::Edp => Ordering::Equal,
        };
        a.score.total_cmp(&b.score).then(tie)
    }
}

fn score(opt: Opt, totals: &CostTotals) -> f64 {
    match opt {
        Opt::Energy => totals.energy_total,
        Opt::Latency => totals.latency.latency_total2 as f64,
        Opt::Edp => totals.edp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::presets;
    use crate::pipeline::stage::tests::mapped_gemm;
    use crate::spatial::conversion::convert;
    use crate::workload::Workload;

    fn engine(size: u64, settings: SalsaConfig) -> SalsaEngine {
        let acc = presets::gemm_l1().unwrap();
        let core = acc.get_core(1).unwrap().clone();
        let workload = Workload::from_layers([mapped_gemm(0, "gemm", size, size, size)]).unwrap();
        let layer = workload.layers()[0].clone();
        let user = layer.spatial_mapping.clone().unwrap();
        let spatial = convert(&user, &layer, &core).unwrap();
        SalsaEngine::new(&acc.name, layer, core, Arc::new(spatial), 6, settings)
    }

    #[test]
    fn test_annealing_is_reproducible() {
        let settings = SalsaConfig {
            iterations: 50,
            chains: 2,
            seed: 7,
            ..SalsaConfig::default()
        };
        let first = engine(64, settings.clone()).run().unwrap();
        let second = engine(64, settings).run().unwrap();
        assert_eq!(first.totals, second.totals);
        assert_eq!(first.temporal_mapping.mapping, second.temporal_mapping.mapping);
        assert!(first.totals.check_energy_sum());
        assert_eq!(first.totals.mac_count, 64 * 64 * 64);
    }

    #[test]
    fn test_annealing_never_beats_exhaustive_search() {
        let settings = SalsaConfig {
            iterations: 100,
            ..SalsaConfig::default()
        };
        let salsa = engine(32, settings);
        let annealed = salsa.run().unwrap();

        // 4 temporal iterations left per dimension: few enough to try them all.
        let mut best = f64::INFINITY;
        for tm in LomaEngine::new(
            salsa.layer.clone(),
            salsa.core.clone(),
            Arc::new(salsa.spatial.fractional.clone()),
            6,
        )
        .run()
        {
            let tm = tm.unwrap();
            let cme = CostModelEvaluation::new(
                "gemm_l1",
                &salsa.core,
                &salsa.layer,
                &salsa.spatial,
                &tm,
                true,
            )
            .unwrap();
            best = best.min(cme.totals.energy_total);
        }
        assert!(annealed.totals.energy_total >= best * (1.0 - 1e-9));
        assert!(annealed.evaluations >= 1);
    }

    #[test]
    fn test_more_chains_never_hurt() {
        let one = engine(
            64,
            SalsaConfig {
                iterations: 30,
                ..SalsaConfig::default()
            },
        )
        .run()
        .unwrap();
        let four = engine(
            64,
            SalsaConfig {
                iterations: 30,
                chains: 4,
                ..SalsaConfig::default()
            },
        )
        .run()
        .unwrap();
        // Chain 0 is the same in both runs.
        assert!(four.totals.energy_total <= one.totals.energy_total);
    }
}
