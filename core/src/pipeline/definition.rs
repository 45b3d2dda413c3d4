// benchline/src/pipeline/definition.rs

//! Contains the `PipelineExecutor` struct and its assembly from a
//! `PipelineSpec`: graph validation, component resolution and per-stage
//! policies. Execution lives in `execution.rs`.

use crate::config::PipelineSpec;
use crate::core::{Stage, StageId, StagePolicy};
use crate::error::{BenchError, BenchResult};
use crate::loadgen::LoadScheduler;
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::slots::MAX_QUEUE_DEPTH;
use crate::registry::ComponentRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{event, instrument, Level};

/// A resolved stage together with what the executor needs to drive it.
pub(crate) struct StageEntry {
  pub(crate) name: String,
  pub(crate) component: String,
  pub(crate) stage: Arc<dyn Stage>,
  pub(crate) policy: StagePolicy,
  /// Present when the stage declared a concurrency limit.
  pub(crate) limiter: Option<Arc<Semaphore>>,
  pub(crate) disable_logs: bool,
}

/// One runnable pipeline: its graph, resolved stages and load scheduler.
///
/// Built once from configuration and consumed by `run`.
pub struct PipelineExecutor {
  pub(crate) name: String,
  pub(crate) graph: Arc<PipelineGraph>,
  pub(crate) stages: Arc<BTreeMap<StageId, StageEntry>>,
  pub(crate) scheduler: Box<dyn LoadScheduler>,
  pub(crate) dataset_stage: Option<StageId>,
}

impl PipelineExecutor {
  /// Validates `spec`, builds its graph and resolves every component through
  /// `registry`. All failures are load-time errors qualified with the pipeline name.
  #[instrument(name = "PipelineExecutor::from_spec", skip_all, fields(pipeline = %spec.name), err(Display))]
  pub fn from_spec(spec: &PipelineSpec, registry: &ComponentRegistry) -> BenchResult<Self> {
    Self::assemble(spec, registry).map_err(|e| e.in_pipeline(&spec.name))
  }

  fn assemble(spec: &PipelineSpec, registry: &ComponentRegistry) -> BenchResult<Self> {
    spec.validate()?;
    let graph = PipelineGraph::build(&spec.stages, &spec.inputs, &spec.outputs)?;
    let scheduler = registry.build_scheduler(&spec.loadgen)?;
    if scheduler.queue_depth() == 0 {
      return Err(BenchError::config("loadgen.queue_depth", "scheduler reported a queue depth of 0"));
    }
    if scheduler.queue_depth() > MAX_QUEUE_DEPTH {
      return Err(BenchError::config(
        "loadgen.queue_depth",
        format!(
          "scheduler reported a queue depth of {}, above the limit of {}",
          scheduler.queue_depth(),
          MAX_QUEUE_DEPTH
        ),
      ));
    }

    let mut stages = BTreeMap::new();
    for stage_spec in &spec.stages {
      let stage = registry.build_stage(stage_spec)?;
      let policy = stage.policy();
      let limiter = match policy.concurrency_limit {
        Some(0) => {
          return Err(BenchError::config(
            format!("stages[id={}]", stage_spec.id),
            "stage declared a concurrency limit of 0",
          ))
        }
        // More permits than the queue depth can never be used.
        Some(limit) => Some(Arc::new(Semaphore::new(limit.min(MAX_QUEUE_DEPTH)))),
        None => None,
      };
      event!(
        Level::DEBUG,
        stage_id = stage_spec.id,
        component = %stage_spec.component,
        idempotent = policy.idempotent,
        attempts = policy.attempts(),
        concurrency_limit = ?policy.concurrency_limit,
        "Stage resolved."
      );
      stages.insert(
        stage_spec.id,
        StageEntry {
          name: stage_spec.name.clone(),
          component: stage_spec.component.clone(),
          stage,
          policy,
          limiter,
          disable_logs: stage_spec.disable_logs,
        },
      );
    }

    event!(
      Level::INFO,
      stages = stages.len(),
      entries = ?graph.entry_stages(),
      exits = ?graph.exit_stages(),
      scheduler = scheduler.component(),
      "Pipeline assembled."
    );

    Ok(Self {
      name: spec.name.clone(),
      graph: Arc::new(graph),
      stages: Arc::new(stages),
      scheduler,
      dataset_stage: spec.dataset_stage_id,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn graph(&self) -> &PipelineGraph {
    &self.graph
  }

  pub fn scheduler(&self) -> &dyn LoadScheduler {
    self.scheduler.as_ref()
  }

  /// `(id, name)` of every stage in topological order.
  pub fn stage_names(&self) -> Vec<(StageId, String)> {
    stage_names(&self.graph, &self.stages)
  }

  /// `(id, component)` of every stage in topological order.
  pub fn stage_components(&self) -> Vec<(StageId, String)> {
    self
      .graph
      .order()
      .iter()
      .filter_map(|id| self.stages.get(id).map(|e| (*id, e.component.clone())))
      .collect()
  }
}

pub(crate) fn stage_names(graph: &PipelineGraph, stages: &BTreeMap<StageId, StageEntry>) -> Vec<(StageId, String)> {
  graph
    .order()
    .iter()
    .filter_map(|id| stages.get(id).map(|e| (*id, e.name.clone())))
    .collect()
}

/// Assembles every pipeline in a document, failing on the first invalid one.
pub fn assemble_all(
  doc: &crate::config::BenchDocument,
  registry: &ComponentRegistry,
) -> BenchResult<Vec<PipelineExecutor>> {
  doc
    .pipelines
    .iter()
    .map(|spec| PipelineExecutor::from_spec(spec, registry))
    .collect()
}
