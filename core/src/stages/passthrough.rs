// benchline/src/stages/passthrough.rs

//! `stages.passthrough.Passthrough`: forwards its input unchanged.
//!
//! Useful for wiring (a fan-in point that just collects its predecessors) and
//! as the placeholder stage a dataset entry maps to when it only exposes data.

use crate::config::StageSpec;
use crate::core::{Query, Stage, StageOutput, StagePolicy, Upstream};
use crate::error::{BenchResult, StageError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

pub const PASSTHROUGH: &str = "stages.passthrough.Passthrough";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PassthroughConfig {
  /// Caps how many queries may be inside this stage at once.
  pub concurrency_limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct Passthrough {
  config: PassthroughConfig,
}

impl Passthrough {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_spec(spec: &StageSpec) -> BenchResult<Self> {
    Ok(Self {
      config: spec.typed_config()?,
    })
  }
}

#[async_trait]
impl Stage for Passthrough {
  /// Output rules:
  /// - entry stage: `{"seq": <query seq>}`
  /// - one predecessor: that predecessor's output
  /// - several predecessors: an object keyed by predecessor id
  async fn process(
    &self,
    query: &Query,
    upstream: &Upstream,
    cancel: &CancellationToken,
  ) -> Result<StageOutput, StageError> {
    if cancel.is_cancelled() {
      return Err(StageError::Cancelled);
    }
    let output = match upstream.len() {
      0 => json!({ "seq": query.seq() }),
      1 => upstream.values().next().map(|v| (**v).clone()).unwrap_or(Value::Null),
      _ => Value::Object(
        upstream
          .iter()
          .map(|(id, v)| (id.to_string(), (**v).clone()))
          .collect::<Map<String, Value>>(),
      ),
    };
    Ok(output)
  }

  fn policy(&self) -> StagePolicy {
    let policy = StagePolicy::idempotent(1);
    match self.config.concurrency_limit {
      Some(limit) => policy.with_concurrency_limit(limit),
      None => policy,
    }
  }
}
