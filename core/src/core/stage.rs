// benchline/src/core/stage.rs

//! The contract every stage implementation satisfies.
//!
//! Stages are resolved from their namespaced component id through the
//! `ComponentRegistry` and invoked once per query by the executor. The core
//! knows nothing about what a stage does (load a dataset batch, query a store,
//! call a model); it only relies on `process` returning an output or a
//! `StageError`, and on the `StagePolicy` the stage declares.

use crate::core::query::Query;
use crate::error::StageError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Integer id of a stage, unique within its pipeline.
pub type StageId = u32;

/// Opaque value a stage hands to its successors.
pub type StageOutput = serde_json::Value;

/// Outputs of a stage's direct predecessors for the same query, keyed by stage id.
/// Empty for entry stages.
pub type Upstream = BTreeMap<StageId, Arc<StageOutput>>;

/// Execution policy a stage declares for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicy {
  /// Only idempotent stages are retried after a failure.
  pub idempotent: bool,
  /// Extra attempts after the first one. Ignored unless `idempotent`.
  pub max_retries: u32,
  /// Pause between attempts.
  pub retry_backoff: Duration,
  /// Maximum concurrent invocations of this stage across all queries.
  pub concurrency_limit: Option<usize>,
}

impl Default for StagePolicy {
  fn default() -> Self {
    Self {
      idempotent: false,
      max_retries: 0,
      retry_backoff: Duration::from_millis(10),
      concurrency_limit: None,
    }
  }
}

impl StagePolicy {
  /// An idempotent policy allowing `max_retries` extra attempts.
  pub fn idempotent(max_retries: u32) -> Self {
    Self {
      idempotent: true,
      max_retries,
      ..Self::default()
    }
  }

  pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
    self.retry_backoff = backoff;
    self
  }

  pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
    self.concurrency_limit = Some(limit);
    self
  }

  /// Number of attempts the executor may make for one invocation.
  pub fn attempts(&self) -> u32 {
    if self.idempotent {
      self.max_retries.saturating_add(1)
    } else {
      1
    }
  }
}

#[async_trait]
pub trait Stage: Send + Sync {
  /// Processes one query. `cancel` fires when the query times out or the run
  /// shuts down; long-running stages should check it at safe points.
  async fn process(
    &self,
    query: &Query,
    upstream: &Upstream,
    cancel: &CancellationToken,
  ) -> Result<StageOutput, StageError>;

  fn policy(&self) -> StagePolicy {
    StagePolicy::default()
  }

  /// One-time setup before the first query is admitted (preloading a dataset,
  /// opening a store). A failure here aborts the run.
  async fn prepare(&self) -> Result<(), StageError> {
    Ok(())
  }

  /// Number of items a dataset stage can serve, if finite and known.
  fn dataset_len(&self) -> Option<u64> {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn non_idempotent_policy_gets_one_attempt() {
    let policy = StagePolicy {
      max_retries: 5,
      ..StagePolicy::default()
    };
    assert_eq!(policy.attempts(), 1);
  }

  #[test]
  fn idempotent_policy_counts_retries() {
    let policy = StagePolicy::idempotent(2).with_concurrency_limit(4);
    assert_eq!(policy.attempts(), 3);
    assert_eq!(policy.concurrency_limit, Some(4));
  }
}
