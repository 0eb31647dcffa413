use crate::cost::report::{complete_json, simple_json};
use crate::cost::Cme;
use crate::pipeline::stage::{run_next, Stage, StageContext, StageIter, StageOutput};
use crate::pipeline::PipelineError;
use log::info;
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// The file a result is dumped to: `?` in `pattern` becomes the layer name (or `overall` for a
/// sum of layers) followed by `_<kind>`.
pub fn dump_path(pattern: &Path, cme: &Cme, kind: &str) -> PathBuf {
    let name = match cme.layer_name() {
        Some(layer) => format!("{layer}_{kind}"),
        None => format!("overall_{kind}"),
    };
    PathBuf::from(pattern.to_string_lossy().replace('?', &name))
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Writes every result passing through as complete JSON.
#[derive(Debug)]
pub struct CompleteSaveStage {
    pub pattern: PathBuf,
}

/// Writes the energy and latency totals of every result passing through.
#[derive(Debug)]
pub struct SimpleSaveStage {
    pub pattern: PathBuf,
}

impl CompleteSaveStage {
    pub fn new(pattern: impl Into<PathBuf>) -> Self {
        CompleteSaveStage {
            pattern: pattern.into(),
        }
    }
}

impl SimpleSaveStage {
    pub fn new(pattern: impl Into<PathBuf>) -> Self {
        SimpleSaveStage {
            pattern: pattern.into(),
        }
    }
}

fn saving<'s>(
    results: StageIter<'s>,
    pattern: &'s Path,
    kind: &'static str,
    render: fn(&Cme) -> Result<String, serde_json::Error>,
) -> StageIter<'s> {
    Box::new(results.map(move |result| -> Result<StageOutput, PipelineError> {
        let (cme, extra) = result?;
        let path = dump_path(pattern, &cme, kind);
        write_file(&path, render(&cme)?.as_bytes())?;
        info!(
            "Saved {cme} with energy {:.3e} and latency {:.3e} to {}",
            cme.energy_total(),
            cme.latency_total() as f64,
            path.display()
        );
        Ok((cme, extra))
    }))
}

impl Stage for CompleteSaveStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let results = run_next(self, ctx, downstream)?;
        Ok(saving(results, &self.pattern, "complete", complete_json))
    }
}

impl Stage for SimpleSaveStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let results = run_next(self, ctx, downstream)?;
        Ok(saving(results, &self.pattern, "simple", simple_json))
    }
}

/// Once everything has passed through, writes the per-layer results behind the last result
/// (the parts of a sum) as a zstd-compressed bincode list. A result without parts is written
/// on its own.
#[derive(Debug)]
pub struct PickleSaveStage {
    pub path: PathBuf,
}

impl PickleSaveStage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PickleSaveStage { path: path.into() }
    }
}

struct PickleOnExhaustion<'s> {
    inner: StageIter<'s>,
    path: &'s Path,
    last: Option<Vec<Cme>>,
    done: bool,
}

impl Iterator for PickleOnExhaustion<'_> {
    type Item = Result<StageOutput, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok((cme, extra))) => {
                let parts = extra.results();
                self.last = Some(if parts.is_empty() {
                    vec![cme.clone()]
                } else {
                    parts.iter().map(|(c, _)| c.clone()).collect()
                });
                Some(Ok((cme, extra)))
            }
            Some(Err(e)) => Some(Err(e)),
            None => {
                self.done = true;
                let cmes = self.last.take()?;
                match save_cme_list(self.path, &cmes) {
                    Ok(()) => {
                        info!("Saved {} results to {}", cmes.len(), self.path.display());
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }
}

impl Stage for PickleSaveStage {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError> {
        let inner = run_next(self, ctx, downstream)?;
        Ok(Box::new(PickleOnExhaustion {
            inner,
            path: &self.path,
            last: None,
            done: false,
        }))
    }
}

/// Writes `cmes` next to `path` first and moves the file into place once complete, so a
/// reader never sees a truncated list.
pub fn save_cme_list(path: &Path, cmes: &[Cme]) -> Result<(), PipelineError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let file = tempfile::NamedTempFile::new_in(parent)?;
    let mut zstd_writer = zstd::Encoder::new(file, 0)?;
    bincode::serialize_into(&mut zstd_writer, cmes)?;
    let mut file = zstd_writer.finish()?;
    file.flush()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Reads back a list written by [PickleSaveStage].
pub fn load_cme_list(path: impl AsRef<Path>) -> Result<Vec<Cme>, PipelineError> {
    let file = fs::File::open(path)?;
    let mut zstd_reader = zstd::Decoder::new(BufReader::new(file))?;
    Ok(bincode::deserialize_from(&mut zstd_reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::reduce::SumStage;
    use crate::pipeline::stage::run_chain;
    use crate::pipeline::stage::tests::{cme_with, gemm_ctx, FixedResults};

    #[test]
    fn test_dump_path() {
        let layer = cme_with(1.0, 1);
        let pattern = Path::new("out/?.json");
        assert_eq!(dump_path(pattern, &layer, "complete"), Path::new("out/gemm_complete.json"));
        let sum = layer.combine(&layer);
        assert_eq!(dump_path(pattern, &sum, "simple"), Path::new("out/overall_simple.json"));
    }

    #[test]
    fn test_saves_pass_results_through() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("nested").join("?.json");
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(SimpleSaveStage::new(&pattern)),
            Box::new(CompleteSaveStage::new(&pattern)),
            Box::new(FixedResults::new(vec![Ok(cme_with(2.0, 3))])),
        ];
        let out: Vec<_> = run_chain(&chain, gemm_ctx()).unwrap().map(Result::unwrap).collect();
        assert_eq!(out.len(), 1);

        let simple = fs::read_to_string(dir.path().join("nested/gemm_simple.json")).unwrap();
        let simple: serde_json::Value = serde_json::from_str(&simple).unwrap();
        assert_eq!(simple["latency_total2"].as_u64(), Some(3));
        let complete = fs::read_to_string(dir.path().join("nested/gemm_complete.json")).unwrap();
        let back: Cme = serde_json::from_str(&complete).unwrap();
        assert_eq!(back, out[0].0);
    }

    #[test]
    fn test_pickle_holds_the_summed_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmes.bin");
        let parts = vec![Ok(cme_with(1.0, 10)), Ok(cme_with(2.0, 20))];
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(PickleSaveStage::new(&path)),
            Box::new(SumStage),
            Box::new(FixedResults::new(parts)),
        ];
        let out: Vec<_> = run_chain(&chain, gemm_ctx()).unwrap().map(Result::unwrap).collect();
        assert_eq!(out.len(), 1);

        let loaded = load_cme_list(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].energy_total(), 1.0);
        assert_eq!(loaded[1], out[0].1.results()[1].0);
    }

    #[test]
    fn test_pickle_is_not_written_without_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmes.bin");
        let chain: Vec<Box<dyn Stage>> = vec![
            Box::new(PickleSaveStage::new(&path)),
            Box::new(FixedResults::new(vec![])),
        ];
        assert_eq!(run_chain(&chain, gemm_ctx()).unwrap().count(), 0);
        assert!(!path.exists());
    }
}
