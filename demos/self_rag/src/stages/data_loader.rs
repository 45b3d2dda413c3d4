// self_rag_bench/src/stages/data_loader.rs

//! `stages.llm_huggingface.MockDataLoader`: serves synthetic instruction
//! prompts in the layout of an alpaca-style dataset, one batch per query.

use super::VOCABULARY;
use async_trait::async_trait;
use benchline::{
  BenchError, BenchResult, CancellationToken, Query, Stage, StageError, StageOutput, StagePolicy, StageSpec, Upstream,
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::{event, Level};

pub const MOCK_DATA_LOADER: &str = "stages.llm_huggingface.MockDataLoader";

const INSTRUCTIONS: &[&str] = &[
  "Explain how",
  "Summarize why",
  "Give an example of how",
  "Describe when",
  "List the trade-offs when",
];

fn default_batch_size() -> usize {
  1
}

fn default_num_samples() -> u64 {
  256
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataLoaderConfig {
  pub dataset_name: String,
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  #[serde(default = "default_num_samples")]
  pub num_samples: u64,
  /// Materialize every sample during `prepare` instead of on demand.
  #[serde(default)]
  pub preload: bool,
  /// Accepted for compatibility with real loader configs; unused here.
  #[serde(default)]
  pub tokenizer: Option<String>,
}

pub struct MockDataLoader {
  config: DataLoaderConfig,
  preloaded: RwLock<Option<Vec<String>>>,
}

impl MockDataLoader {
  pub fn from_spec(spec: &StageSpec) -> BenchResult<Self> {
    let config: DataLoaderConfig = spec.typed_config()?;
    let field = format!("stages[id={}].config", spec.id);
    if config.dataset_name.trim().is_empty() {
      return Err(BenchError::config(format!("{}.dataset_name", field), "must not be empty"));
    }
    if config.batch_size == 0 {
      return Err(BenchError::config(format!("{}.batch_size", field), "must be > 0"));
    }
    if config.num_samples < config.batch_size as u64 {
      return Err(BenchError::config(
        format!("{}.num_samples", field),
        format!(
          "must be at least batch_size ({}), got {}",
          config.batch_size, config.num_samples
        ),
      ));
    }
    Ok(Self {
      config,
      preloaded: RwLock::new(None),
    })
  }

  fn sample(index: u64) -> String {
    let i = index as usize;
    let instruction = INSTRUCTIONS[i % INSTRUCTIONS.len()];
    let a = VOCABULARY[(i * 7) % VOCABULARY.len()];
    let b = VOCABULARY[(i * 13 + 5) % VOCABULARY.len()];
    let c = VOCABULARY[(i * 17 + 11) % VOCABULARY.len()];
    format!("{} {} interacts with {} in a {} system.", instruction, a, b, c)
  }

  fn batch(&self, seq: u64) -> Vec<String> {
    let batch_size = self.config.batch_size as u64;
    let first = (seq * batch_size) % self.config.num_samples;
    let indices = (0..batch_size).map(|k| (first + k) % self.config.num_samples);
    match self.preloaded.read().as_ref() {
      Some(samples) => indices.map(|i| samples[i as usize].clone()).collect(),
      None => indices.map(Self::sample).collect(),
    }
  }
}

#[async_trait]
impl Stage for MockDataLoader {
  async fn process(
    &self,
    query: &Query,
    _upstream: &Upstream,
    cancel: &CancellationToken,
  ) -> Result<StageOutput, StageError> {
    if cancel.is_cancelled() {
      return Err(StageError::Cancelled);
    }
    Ok(json!({
      "dataset": self.config.dataset_name,
      "seq": query.seq(),
      "batch": self.batch(query.seq()),
    }))
  }

  fn policy(&self) -> StagePolicy {
    StagePolicy::idempotent(1)
  }

  async fn prepare(&self) -> Result<(), StageError> {
    if !self.config.preload {
      return Ok(());
    }
    let samples: Vec<String> = (0..self.config.num_samples).map(Self::sample).collect();
    event!(
      Level::INFO,
      dataset = %self.config.dataset_name,
      samples = samples.len(),
      "Dataset preloaded."
    );
    *self.preloaded.write() = Some(samples);
    Ok(())
  }

  /// Number of full batches; a trailing partial batch is dropped.
  fn dataset_len(&self) -> Option<u64> {
    Some(self.config.num_samples / self.config.batch_size as u64)
  }
}
