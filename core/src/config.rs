// benchline/src/config.rs

//! Declarative pipeline documents.
//!
//! A document is a YAML mapping with a `pipelines` list. Each pipeline names its
//! entry and exit stages, a load generator and its stages. Component ids are
//! resolved later by the `ComponentRegistry`; stage and loadgen `config` maps are
//! opaque here and deserialized by the component that owns them.

use crate::core::StageId;
use crate::error::{BenchError, BenchResult};
use crate::pipeline::slots::MAX_QUEUE_DEPTH;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{event, Level};

/// Opaque per-component configuration.
pub type ComponentConfig = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchDocument {
  pub pipelines: Vec<PipelineSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
  pub name: String,
  /// Entry stage ids. Derived from the graph when empty.
  #[serde(default)]
  pub inputs: Vec<StageId>,
  /// Exit stage ids. Derived from the graph when empty.
  #[serde(default)]
  pub outputs: Vec<StageId>,
  /// Stage whose `dataset_len` caps the number of generated queries.
  #[serde(default)]
  pub dataset_stage_id: Option<StageId>,
  pub loadgen: LoadgenSpec,
  pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadgenSpec {
  pub component: String,
  pub queue_depth: i64,
  #[serde(default)]
  pub max_queries: i64,
  /// Per-query timeout in milliseconds.
  pub timeout: i64,
  #[serde(default)]
  pub config: ComponentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
  pub name: String,
  pub id: StageId,
  #[serde(default)]
  pub inputs: Vec<StageId>,
  #[serde(default)]
  pub outputs: Vec<StageId>,
  pub component: String,
  #[serde(default)]
  pub config: ComponentConfig,
  /// Silences the per-query phase events of this stage.
  #[serde(default)]
  pub disable_logs: bool,
}

impl BenchDocument {
  pub fn from_yaml_str(yaml: &str) -> BenchResult<Self> {
    let doc: BenchDocument = serde_yaml::from_str(yaml).map_err(|source| BenchError::Parse { source })?;
    doc.validate()?;
    Ok(doc)
  }

  pub fn from_file(path: impl AsRef<Path>) -> BenchResult<Self> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| BenchError::Io {
      path: path.display().to_string(),
      source,
    })?;
    let doc = Self::from_yaml_str(&content)?;
    event!(Level::INFO, path = %path.display(), pipelines = doc.pipelines.len(), "Pipeline document loaded.");
    Ok(doc)
  }

  /// Document-level checks. Graph shape and component configs are validated
  /// when each pipeline is assembled.
  pub fn validate(&self) -> BenchResult<()> {
    if self.pipelines.is_empty() {
      return Err(BenchError::config("pipelines", "document defines no pipelines"));
    }
    let mut names = HashSet::new();
    for (idx, pipeline) in self.pipelines.iter().enumerate() {
      if pipeline.name.trim().is_empty() {
        return Err(BenchError::config(format!("pipelines[{}].name", idx), "must not be empty"));
      }
      if !names.insert(pipeline.name.as_str()) {
        return Err(BenchError::config(
          format!("pipelines[{}].name", idx),
          format!("duplicate pipeline name '{}'", pipeline.name),
        ));
      }
      pipeline
        .validate()
        .map_err(|e| e.in_pipeline(&format!("pipelines[{}]", idx)))?;
    }
    Ok(())
  }

  pub fn pipeline(&self, name: &str) -> Option<&PipelineSpec> {
    self.pipelines.iter().find(|p| p.name == name)
  }
}

impl PipelineSpec {
  pub fn validate(&self) -> BenchResult<()> {
    if self.stages.is_empty() {
      return Err(BenchError::config("stages", "pipeline defines no stages"));
    }
    for (idx, stage) in self.stages.iter().enumerate() {
      if stage.component.trim().is_empty() {
        return Err(BenchError::config(format!("stages[{}].component", idx), "must not be empty"));
      }
    }
    if let Some(id) = self.dataset_stage_id {
      if self.stage(id).is_none() {
        return Err(BenchError::UnknownId {
          referenced_by: "dataset_stage_id".to_string(),
          id,
        });
      }
    }
    self.loadgen.validate()
  }

  pub fn stage(&self, id: StageId) -> Option<&StageSpec> {
    self.stages.iter().find(|s| s.id == id)
  }
}

impl LoadgenSpec {
  /// Range checks shared by every scheduler implementation.
  pub fn validate(&self) -> BenchResult<()> {
    if self.component.trim().is_empty() {
      return Err(BenchError::config("loadgen.component", "must not be empty"));
    }
    if self.queue_depth <= 0 {
      return Err(BenchError::config(
        "loadgen.queue_depth",
        format!("must be > 0, got {}", self.queue_depth),
      ));
    }
    if self.queue_depth as u64 > MAX_QUEUE_DEPTH as u64 {
      return Err(BenchError::config(
        "loadgen.queue_depth",
        format!("must be <= {}, got {}", MAX_QUEUE_DEPTH, self.queue_depth),
      ));
    }
    if self.max_queries < 0 {
      return Err(BenchError::config(
        "loadgen.max_queries",
        format!("must be >= 0, got {}", self.max_queries),
      ));
    }
    if self.timeout <= 0 {
      return Err(BenchError::config(
        "loadgen.timeout",
        format!("must be > 0 milliseconds, got {}", self.timeout),
      ));
    }
    Ok(())
  }

  pub fn queue_depth(&self) -> usize {
    self.queue_depth.max(0) as usize
  }

  /// `None` means unbounded.
  pub fn max_queries(&self) -> Option<u64> {
    (self.max_queries > 0).then_some(self.max_queries as u64)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout.max(0) as u64)
  }

  /// Deserializes the scheduler-specific `config` map into `T`.
  pub fn typed_config<T: DeserializeOwned>(&self) -> BenchResult<T> {
    decode_config(&self.config, "loadgen.config")
  }
}

impl StageSpec {
  /// Deserializes this stage's `config` map into the implementation's own schema.
  pub fn typed_config<T: DeserializeOwned>(&self) -> BenchResult<T> {
    decode_config(&self.config, &format!("stages[id={}].config", self.id))
  }
}

fn decode_config<T: DeserializeOwned>(config: &ComponentConfig, field: &str) -> BenchResult<T> {
  serde_json::from_value(Value::Object(config.clone())).map_err(|e| BenchError::config(field, e.to_string()))
}
