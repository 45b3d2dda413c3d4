// benchline/src/error.rs

//! Error types for pipeline loading and execution.
//!
//! `BenchError` covers everything the engine itself can report. Failures raised
//! by stage implementations are carried as `StageError`, which wraps an
//! `anyhow::Error` so stages can fail with whatever source they have.

use crate::core::StageId;
use crate::report::RunReport;
use anyhow::Error as AnyhowError;
use std::time::Duration;
use thiserror::Error;

/// Failure returned by a stage's `process` or `prepare` call.
#[derive(Debug, Error)]
pub enum StageError {
  /// The stage observed cancellation of its query and gave up.
  #[error("stage work was cancelled")]
  Cancelled,

  /// Upstream outputs did not have the shape the stage expects.
  #[error("invalid stage input: {0}")]
  InvalidInput(String),

  /// Any other failure from the stage or the external system behind it.
  #[error(transparent)]
  Failed(#[from] AnyhowError),
}

impl StageError {
  /// Convenience constructor for ad-hoc failure messages.
  pub fn msg(message: impl Into<String>) -> Self {
    StageError::Failed(anyhow::anyhow!(message.into()))
  }
}

#[derive(Debug, Error)]
pub enum BenchError {
  /// Malformed or out-of-range configuration. `field` names the offending entry.
  #[error("invalid configuration at '{field}': {message}")]
  Config { field: String, message: String },

  #[error("stage graph contains a cycle through stages {stages:?}")]
  Cycle { stages: Vec<StageId> },

  #[error("{referenced_by} references unknown stage id {id}")]
  UnknownId { referenced_by: String, id: StageId },

  #[error("no {kind} component registered under '{component}' (needed by {needed_by})")]
  UnknownComponent {
    kind: &'static str,
    component: String,
    needed_by: String,
  },

  #[error("stage {stage_id} ('{stage_name}') failed: {source}")]
  Stage {
    stage_id: StageId,
    stage_name: String,
    #[source]
    source: StageError,
  },

  #[error("query {seq} exceeded its deadline of {timeout:?}")]
  Timeout { seq: u64, timeout: Duration },

  #[error("query {seq} was cancelled by executor shutdown")]
  Cancelled { seq: u64 },

  #[error("failed to read pipeline document '{path}': {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse pipeline document: {source}")]
  Parse {
    #[source]
    source: serde_yaml::Error,
  },

  /// The executor stopped early. `partial` holds whatever was aggregated so far.
  #[error("run aborted: {reason}")]
  Aborted { reason: String, partial: Box<RunReport> },

  #[error("Internal benchline error: {0}")]
  Internal(String),
}

impl BenchError {
  pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
    BenchError::Config {
      field: field.into(),
      message: message.into(),
    }
  }

  /// Qualifies a configuration error with the pipeline it came from, so the
  /// operator sees `self_rag.loadgen.timeout` rather than just `loadgen.timeout`.
  pub fn in_pipeline(self, pipeline: &str) -> Self {
    match self {
      BenchError::Config { field, message } => BenchError::Config {
        field: format!("{}.{}", pipeline, field),
        message,
      },
      other => other,
    }
  }

  /// True for errors detected while loading a document, before any query runs.
  pub fn is_load_time(&self) -> bool {
    matches!(
      self,
      BenchError::Config { .. }
        | BenchError::Cycle { .. }
        | BenchError::UnknownId { .. }
        | BenchError::UnknownComponent { .. }
        | BenchError::Io { .. }
        | BenchError::Parse { .. }
    )
  }
}

pub type BenchResult<T, E = BenchError> = std::result::Result<T, E>;
