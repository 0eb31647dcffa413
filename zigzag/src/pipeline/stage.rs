use crate::config::DseConfig;
use crate::cost::Cme;
use crate::hardware::{Accelerator, Core};
use crate::mapping::{SpatialMapping, TemporalMapping};
use crate::pipeline::PipelineError;
use crate::pipeline::unused_memory::MemoryPlan;
use crate::spatial::ConvertedSpatialMapping;
use crate::workload::{LayerNode, Workload};
use log::Level;
use std::fmt;
use std::sync::Arc;

/// What a stage hands upstream next to a result: how the result came about.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ExtraInfo {
    #[default]
    None,
    /// The result was found for this layer.
    Layer { id: usize, inner: Box<ExtraInfo> },
    /// The result was found with this (generated or user-given) spatial mapping.
    SpatialMapping {
        mapping: SpatialMapping,
        inner: Box<ExtraInfo>,
    },
    /// The results a reducer consumed.
    Results(Vec<StageOutput>),
}

impl ExtraInfo {
    /// The results a summing reducer collected. Empty for anything else.
    pub fn results(&self) -> &[StageOutput] {
        match self {
            ExtraInfo::Results(r) => r,
            _ => &[],
        }
    }
}

pub type StageOutput = (Cme, ExtraInfo);

pub type StageIter<'s> = Box<dyn Iterator<Item = Result<StageOutput, PipelineError>> + 's>;

/// Everything stages pass down the chain. Cloning is cheap; each stage adds what it decided
/// and hands the copy on.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub config: Arc<DseConfig>,
    pub accelerator: Arc<Accelerator>,
    pub workload: Option<Arc<Workload>>,
    pub memory_plan: Option<Arc<MemoryPlan>>,
    pub layer: Option<Arc<LayerNode>>,
    pub spatial_mapping: Option<Arc<ConvertedSpatialMapping>>,
    pub temporal_mapping: Option<Arc<TemporalMapping>>,
}

impl StageContext {
    pub fn new(config: DseConfig, accelerator: Accelerator) -> Self {
        StageContext {
            config: Arc::new(config),
            accelerator: Arc::new(accelerator),
            workload: None,
            memory_plan: None,
            layer: None,
            spatial_mapping: None,
            temporal_mapping: None,
        }
    }

    pub fn with_workload(mut self, workload: Workload) -> Self {
        self.workload = Some(Arc::new(workload));
        self
    }

    pub fn with_memory_plan(&self, plan: MemoryPlan) -> Self {
        StageContext {
            memory_plan: Some(Arc::new(plan)),
            ..self.clone()
        }
    }

    pub fn with_layer(&self, layer: Arc<LayerNode>) -> Self {
        StageContext {
            layer: Some(layer),
            ..self.clone()
        }
    }

    pub fn with_accelerator(&self, accelerator: Accelerator) -> Self {
        StageContext {
            accelerator: Arc::new(accelerator),
            ..self.clone()
        }
    }

    pub fn with_spatial_mapping(&self, spatial: ConvertedSpatialMapping) -> Self {
        StageContext {
            spatial_mapping: Some(Arc::new(spatial)),
            ..self.clone()
        }
    }

    pub fn with_temporal_mapping(&self, temporal: TemporalMapping) -> Self {
        StageContext {
            temporal_mapping: Some(Arc::new(temporal)),
            ..self.clone()
        }
    }

    pub fn workload(&self) -> Result<&Arc<Workload>, PipelineError> {
        self.workload
            .as_ref()
            .ok_or(PipelineError::MissingContext("workload"))
    }

    pub fn memory_plan(&self) -> Result<&Arc<MemoryPlan>, PipelineError> {
        self.memory_plan
            .as_ref()
            .ok_or(PipelineError::MissingContext("memory plan"))
    }

    pub fn layer(&self) -> Result<&Arc<LayerNode>, PipelineError> {
        self.layer.as_ref().ok_or(PipelineError::MissingContext("layer"))
    }

    pub fn spatial_mapping(&self) -> Result<&Arc<ConvertedSpatialMapping>, PipelineError> {
        self.spatial_mapping
            .as_ref()
            .ok_or(PipelineError::MissingContext("spatial mapping"))
    }

    pub fn temporal_mapping(&self) -> Result<&Arc<TemporalMapping>, PipelineError> {
        self.temporal_mapping
            .as_ref()
            .ok_or(PipelineError::MissingContext("temporal mapping"))
    }

    /// The core the current layer is allocated to.
    pub fn core(&self) -> Result<&Arc<Core>, PipelineError> {
        let layer = self.layer()?;
        Ok(self.accelerator.get_core(layer.core_id())?)
    }
}

/// One step of a design space exploration.
///
/// A stage gets the stages below it in the chain and decides how often, and with what context,
/// to run them. The last stage of a chain produces results itself and ignores `downstream`.
pub trait Stage: fmt::Debug + Send + Sync {
    fn run<'s>(
        &'s self,
        ctx: StageContext,
        downstream: &'s [Box<dyn Stage>],
    ) -> Result<StageIter<'s>, PipelineError>;
}

/// Runs the head of `downstream` with the rest of the chain below it.
pub fn run_next<'s>(
    stage: &dyn Stage,
    ctx: StageContext,
    downstream: &'s [Box<dyn Stage>],
) -> Result<StageIter<'s>, PipelineError> {
    let Some((head, tail)) = downstream.split_first() else {
        return Err(PipelineError::MissingDownstream(format!("{stage:?}")));
    };
    head.run(ctx, tail)
}

/// Runs a whole chain.
pub fn run_chain<'s>(
    stages: &'s [Box<dyn Stage>],
    ctx: StageContext,
) -> Result<StageIter<'s>, PipelineError> {
    let Some((head, tail)) = stages.split_first() else {
        return Err(PipelineError::MissingDownstream("empty chain".to_owned()));
    };
    head.run(ctx, tail)
}

/// Drops results rejected for feasibility reasons, logging each at `level`. Any other error is
/// passed on.
///
/// With [SkipInfeasible::failing_when_empty], a stream that produced no result at all ends
/// with [PipelineError::NoFeasibleMapping] for `subject`, so that callers further up learn
/// why nothing came.
pub(crate) struct SkipInfeasible<'s> {
    inner: StageIter<'s>,
    subject: String,
    level: Level,
    fail_when_empty: bool,
    yielded: bool,
    done: bool,
}

impl<'s> SkipInfeasible<'s> {
    pub(crate) fn new(inner: StageIter<'s>, subject: String, level: Level) -> Self {
        SkipInfeasible {
            inner,
            subject,
            level,
            fail_when_empty: false,
            yielded: false,
            done: false,
        }
    }

    pub(crate) fn failing_when_empty(mut self) -> Self {
        self.fail_when_empty = true;
        self
    }
}

impl Iterator for SkipInfeasible<'_> {
    type Item = Result<StageOutput, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(Err(e)) if e.is_feasibility() => {
                    log::log!(self.level, "{}: {e}", self.subject);
                }
                Some(item) => {
                    self.yielded = true;
                    return Some(item);
                }
                None => {
                    self.done = true;
                    if self.fail_when_empty && !self.yielded {
                        return Some(Err(PipelineError::NoFeasibleMapping(
                            self.subject.clone(),
                        )));
                    }
                    return None;
                }
            }
        }
    }
}
