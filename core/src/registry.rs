// benchline/src/registry.rs

//! Defines `ComponentRegistry`, which maps namespaced component ids such as
//! `loadgen.OfflineLoadScheduler` or `stages.self_rag.SQLiteSearch` to the
//! factories that build them. Nothing is discovered by reflection: every
//! component a document may name has to be registered explicitly.

use crate::config::{LoadgenSpec, StageSpec};
use crate::core::Stage;
use crate::error::{BenchError, BenchResult};
use crate::loadgen::offline::OFFLINE_SCHEDULER;
use crate::loadgen::{LoadScheduler, OfflineLoadScheduler};
use crate::stages::passthrough::{Passthrough, PASSTHROUGH};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Builds a stage from its spec. The factory owns validation of `spec.config`.
pub type StageFactory = Arc<dyn Fn(&StageSpec) -> BenchResult<Arc<dyn Stage>> + Send + Sync>;

/// Builds a load scheduler from a pipeline's `loadgen` block.
pub type SchedulerFactory = Arc<dyn Fn(&LoadgenSpec) -> BenchResult<Box<dyn LoadScheduler>> + Send + Sync>;

pub struct ComponentRegistry {
  stages: Mutex<HashMap<String, StageFactory>>,
  schedulers: Mutex<HashMap<String, SchedulerFactory>>,
}

impl ComponentRegistry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self {
      stages: Mutex::new(HashMap::new()),
      schedulers: Mutex::new(HashMap::new()),
    }
  }

  /// Creates a registry with the components shipped in this crate:
  /// `loadgen.OfflineLoadScheduler` and `stages.passthrough.Passthrough`.
  pub fn with_builtins() -> Self {
    let registry = Self::new();
    registry.register_scheduler(OFFLINE_SCHEDULER, |spec: &LoadgenSpec| {
      Ok(Box::new(OfflineLoadScheduler::from_spec(spec)?) as Box<dyn LoadScheduler>)
    });
    registry.register_stage(PASSTHROUGH, |spec: &StageSpec| {
      Ok(Arc::new(Passthrough::from_spec(spec)?) as Arc<dyn Stage>)
    });
    registry
  }

  /// Registers a stage factory, replacing any previous one under the same id.
  pub fn register_stage<F>(&self, component: &str, factory: F)
  where
    F: Fn(&StageSpec) -> BenchResult<Arc<dyn Stage>> + Send + Sync + 'static,
  {
    event!(Level::DEBUG, component, "Registering stage component.");
    if self
      .stages
      .lock()
      .insert(component.to_string(), Arc::new(factory))
      .is_some()
    {
      event!(Level::WARN, component, "Stage component re-registered; previous factory replaced.");
    }
  }

  /// Registers a scheduler factory, replacing any previous one under the same id.
  pub fn register_scheduler<F>(&self, component: &str, factory: F)
  where
    F: Fn(&LoadgenSpec) -> BenchResult<Box<dyn LoadScheduler>> + Send + Sync + 'static,
  {
    event!(Level::DEBUG, component, "Registering scheduler component.");
    if self
      .schedulers
      .lock()
      .insert(component.to_string(), Arc::new(factory))
      .is_some()
    {
      event!(Level::WARN, component, "Scheduler component re-registered; previous factory replaced.");
    }
  }

  /// Resolves and builds the stage described by `spec`.
  #[instrument(name = "ComponentRegistry::build_stage", skip_all, fields(stage_id = spec.id, component = %spec.component), err(Display))]
  pub fn build_stage(&self, spec: &StageSpec) -> BenchResult<Arc<dyn Stage>> {
    // Clone the factory out so user code never runs under the registry lock.
    let factory = self.stages.lock().get(&spec.component).cloned();
    let factory = factory.ok_or_else(|| BenchError::UnknownComponent {
      kind: "stage",
      component: spec.component.clone(),
      needed_by: format!("stage {} ('{}')", spec.id, spec.name),
    })?;
    factory(spec)
  }

  /// Resolves and builds the scheduler described by `spec`.
  #[instrument(name = "ComponentRegistry::build_scheduler", skip_all, fields(component = %spec.component), err(Display))]
  pub fn build_scheduler(&self, spec: &LoadgenSpec) -> BenchResult<Box<dyn LoadScheduler>> {
    let factory = self.schedulers.lock().get(&spec.component).cloned();
    let factory = factory.ok_or_else(|| BenchError::UnknownComponent {
      kind: "scheduler",
      component: spec.component.clone(),
      needed_by: "loadgen".to_string(),
    })?;
    factory(spec)
  }

  pub fn has_stage(&self, component: &str) -> bool {
    self.stages.lock().contains_key(component)
  }

  pub fn has_scheduler(&self, component: &str) -> bool {
    self.schedulers.lock().contains_key(component)
  }

  /// Registered stage component ids, sorted.
  pub fn stage_components(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.stages.lock().keys().cloned().collect();
    ids.sort();
    ids
  }
}

impl Default for ComponentRegistry {
  fn default() -> Self {
    Self::with_builtins()
  }
}
