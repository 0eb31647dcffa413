use crate::config::Opt;
use crate::cost::Cme;
use crate::pipeline::stage::{run_next, ExtraInfo, Stage, StageContext, StageIter, StageOutput};
use crate::pipeline::PipelineError;
use std::iter;

/// Keeps the result with the lowest energy; latency breaks ties.
#[derive(Debug, Default)]
pub struct MinimalEnergyStage;

/// Keeps the result with the lowest latency; energy breaks ties.
#[derive(Debug, Default)]
pub struct MinimalLatencyStage;

/// Keeps the result with the lowest energy-delay product.
#[derive(Debug, Default)]
pub struct MinimalEdpStage;

/// Adds up every result. Emits the sum once, with the summed results as extra info.
#[derive(Debug, Default)]
pub struct SumStage;

/// The reducer for an optimization criterion.
pub fn minimal_stage(opt: Opt) -> Box<dyn Stage> {
    match opt {
        Opt::Energy => Box::new(MinimalEnergyStage),
        Opt::Latency => Box::new(MinimalLatencyStage),
        Opt::Edp => Box::new(MinimalEdpStage),
    }
}

fn energy_first(new: &Cme, best: &Cme) -> bool {
    new.energy_total() < best.energy_total()
        || (new.energy_total() == best.energy_total() && new.latency_total() < best.latency_total())
}

fn latency_first(new: &Cme, best: &Cme) -> bool {
    new.latency_total() < best.latency_total()
        || (new.latency_total() == best.latency_total() && new.energy_total() < best.energy_total())
}

fn edp(new: &Cme, best: &Cme) -> bool {
    new.edp() < best.edp()
}

/// Drains `results` and returns the first result no later one beats. `None` if there were no
/// results; the first error ends the search.
fn keep_best(
    results: StageIter<'_>,
    better: fn(&Cme, &Cme) -> bool,
) -> Option<Result<StageOutput, PipelineError>> {
    let mut best: Option<StageOutput> = None;
    for result in results {
        let (cme, extra) = match result {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        match &best {
            Some((b, _)) if !better(&cme, b) => {}
            _ => best = Some((cme, extra)),
        }
    }
    best.map(Ok)
}

fn reducing<'s>(
    stage: &dyn Stage,
    ctx: StageContext,
    downstream: &'s [Box<dyn Stage>],
    better: fn(&Cme, &Cme) -> bool,
) -> Result<StageIter<'s>, PipelineError> {
    let results = run_next(stage, ctx, downstream)?;
    Ok(Box::new(
        iter::once_with(move || keep_best(results, better)).flatten(),
    ))
}

impl Stage for MinimalEnergyStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        reducing(self, ctx, downstream, energy_first)
    }
}

impl Stage for MinimalLatencyStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        reducing(self, ctx, downstream, latency_first)
    }
}

impl Stage for MinimalEdpStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        reducing(self, ctx, downstream, edp)
    }
}

fn sum(results: StageIter<'_>) -> Option<Result<StageOutput, PipelineError>> {
    let mut total: Option<Cme> = None;
    let mut parts = Vec::new();
    for result in results {
        let (cme, extra) = match result {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        total = Some(match total {
            Some(t) => t.combine(&cme),
            None => cme.to_cumulative(),
        });
        parts.push((cme, extra));
    }
    total.map(|t| Ok((t, ExtraInfo::Results(parts))))
}

impl Stage for SumStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let results = run_next(self, ctx, downstream)?;
        Ok(Box::new(iter::once_with(move || sum(results)).flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::run_chain;
    use crate::pipeline::stage::tests::{cme_with, gemm_ctx, FixedResults};
    use proptest::prelude::*;

    fn reduce(opt: Opt, results: &[(f64, u64)]) -> Vec<Cme> {
        let leaf = FixedResults::new(results.iter().map(|&(e, l)| Ok(cme_with(e, l))).collect());
        let chain: Vec<Box<dyn Stage>> = vec![minimal_stage(opt), Box::new(leaf)];
        run_chain(&chain, gemm_ctx())
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect()
    }

    #[test]
    fn test_ties_are_broken_by_the_other_metric() {
        let results = [(5.0, 10), (3.0, 10), (3.0, 8), (9.0, 7)];
        let best = reduce(Opt::Energy, &results);
        assert_eq!(best.len(), 1);
        assert_eq!((best[0].energy_total(), best[0].latency_total()), (3.0, 8));

        let best = reduce(Opt::Latency, &[(5.0, 7), (3.0, 10), (4.0, 7)]);
        assert_eq!((best[0].energy_total(), best[0].latency_total()), (4.0, 7));
    }

    #[test]
    fn test_edp_keeps_the_first_of_equals() {
        let best = reduce(Opt::Edp, &[(2.0, 10), (4.0, 5), (1.0, 30)]);
        assert_eq!((best[0].energy_total(), best[0].latency_total()), (2.0, 10));
    }

    #[test]
    fn test_no_input_means_no_output() {
        assert!(reduce(Opt::Latency, &[]).is_empty());
        let chain: Vec<Box<dyn Stage>> = vec![Box::new(SumStage), Box::new(FixedResults::new(vec![]))];
        assert_eq!(run_chain(&chain, gemm_ctx()).unwrap().count(), 0);
    }

    #[test]
    fn test_errors_end_the_reduction() {
        let leaf = FixedResults::new(vec![Ok(cme_with(1.0, 1)), Err("gemm".to_owned())]);
        let chain: Vec<Box<dyn Stage>> = vec![Box::new(MinimalEnergyStage), Box::new(leaf)];
        let out: Vec<_> = run_chain(&chain, gemm_ctx()).unwrap().collect();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(PipelineError::Loma(_))));
    }

    #[test]
    fn test_sum_keeps_the_parts() {
        let leaf = FixedResults::new(vec![Ok(cme_with(1.0, 10)), Ok(cme_with(2.0, 20))]);
        let chain: Vec<Box<dyn Stage>> = vec![Box::new(SumStage), Box::new(leaf)];
        let out: Vec<_> = run_chain(&chain, gemm_ctx()).unwrap().map(Result::unwrap).collect();
        assert_eq!(out.len(), 1);
        let (total, extra) = &out[0];
        assert_eq!(total.energy_total(), 3.0);
        assert_eq!(total.latency_total(), 30);
        assert_eq!(extra.results().len(), 2);
        assert_eq!(extra.results()[1].0.energy_total(), 2.0);
    }

    #[test]
    fn test_sum_of_one_is_cumulative() {
        let leaf = FixedResults::new(vec![Ok(cme_with(1.0, 10))]);
        let chain: Vec<Box<dyn Stage>> = vec![Box::new(SumStage), Box::new(leaf)];
        let out: Vec<_> = run_chain(&chain, gemm_ctx()).unwrap().map(Result::unwrap).collect();
        let (total, _) = &out[0];
        assert!(matches!(total, Cme::Cumulative(_)));
        assert_eq!(total.layer_name(), None);
        assert_eq!(total.energy_total(), 1.0);
    }

    proptest! {
        #[test]
        fn test_reducers_pick_a_minimum(
            opt in any::<Opt>(),
            results in prop::collection::vec((1u32..50, 1u64..50), 1..12),
        ) {
            let results: Vec<(f64, u64)> = results.into_iter().map(|(e, l)| (e as f64, l)).collect();
            let best = reduce(opt, &results);
            prop_assert_eq!(best.len(), 1);
            let (e, l) = (best[0].energy_total(), best[0].latency_total());
            for &(oe, ol) in &results {
                match opt {
                    Opt::Energy => prop_assert!(e < oe || (e == oe && l <= ol)),
                    Opt::Latency => prop_assert!(l < ol || (l == ol && e <= oe)),
                    Opt::Edp => prop_assert!(e * l as f64 <= oe * ol as f64),
                }
            }
        }
    }
}
