use crate::pipeline::stage::{run_next, ExtraInfo, Stage, StageContext, StageIter, StageOutput};
use crate::pipeline::PipelineError;
use log::info;
use std::iter;
use std::path::PathBuf;

/// Forgets how results came about.
#[derive(Debug, Default)]
pub struct RemoveExtraInfoStage;

impl Stage for RemoveExtraInfoStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let results = run_next(self, ctx, downstream)?;
        Ok(Box::new(
            results.map(|r| r.map(|(cme, _)| (cme, ExtraInfo::None))),
        ))
    }
}

/// Runs everything below to completion before handing on the first result.
#[derive(Debug, Default)]
pub struct CacheBeforeYieldStage;

impl Stage for CacheBeforeYieldStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let results = run_next(self, ctx, downstream)?;
        Ok(Box::new(
            iter::once_with(move || results.collect::<Result<Vec<StageOutput>, _>>()).flat_map(
                |cached| -> Box<dyn Iterator<Item = Result<StageOutput, PipelineError>>> {
                    match cached {
                        Ok(v) => Box::new(v.into_iter().map(Ok)),
                        Err(e) => Box::new(iter::once(Err(e))),
                    }
                },
            ),
        ))
    }
}

/// Skips the layer in the context if its complete dump already exists.
#[derive(Debug)]
pub struct SkipIfDumpExistsStage {
    pub pattern: PathBuf,
}

impl SkipIfDumpExistsStage {
    pub fn new(pattern: impl Into<PathBuf>) -> Self {
        SkipIfDumpExistsStage {
            pattern: pattern.into(),
        }
    }
}

impl Stage for SkipIfDumpExistsStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let layer = ctx.layer()?;
        let path = PathBuf::from(
            self.pattern
                .to_string_lossy()
                .replace('?', &format!("{}_complete", layer.name)),
        );
        if path.exists() {
            info!("{layer}: {} exists, skipping", path.display());
            return Ok(Box::new(iter::empty()));
        }
        run_next(self, ctx, downstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::run_chain;
    use crate::pipeline::stage::tests::{cme_with, gemm_ctx, mapped_gemm, FixedResults};
    use std::sync::Arc;

    #[test]
    fn test_remove_extra_info() {
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(RemoveExtraInfoStage),
            Box::new(crate::pipeline::reduce::SumStage),
            Box::new(FixedResults::new(vec![Ok(cme_with(1.0, 1))])),
        ];
        let out: Vec<_> = run_chain(&chain, gemm_ctx()).unwrap().map(Result::unwrap).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, ExtraInfo::None);
    }

    #[test]
    fn test_cache_keeps_order_and_errors() {
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(CacheBeforeYieldStage),
            Box::new(FixedResults::new(vec![Ok(cme_with(1.0, 1)), Ok(cme_with(2.0, 2))])),
        ];
        let energies: Vec<f64> = run_chain(&chain, gemm_ctx())
            .unwrap()
            .map(|r| r.unwrap().0.energy_total())
            .collect();
        assert_eq!(energies, [1.0, 2.0]);

        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(CacheBeforeYieldStage),
            Box::new(FixedResults::new(vec![Ok(cme_with(1.0, 1)), Err("gemm".to_owned())])),
        ];
        let out: Vec<_> = run_chain(&chain, gemm_ctx()).unwrap().collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }

    #[test]
    fn test_skip_if_dump_exists() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("?.json");
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SkipIfDumpExistsStage::new(&pattern)),
            Box::new(FixedResults::new(vec![Ok(cme_with(1.0, 1))])),
        ];
        let ctx = gemm_ctx().with_layer(Arc::new(mapped_gemm(0, "gemm", 16, 16, 16)));
        assert_eq!(run_chain(&chain, ctx.clone()).unwrap().count(), 1);

        std::fs::write(dir.path().join("gemm_complete.json"), "{}").unwrap();
        assert_eq!(run_chain(&chain, ctx).unwrap().count(), 0);
    }
}
