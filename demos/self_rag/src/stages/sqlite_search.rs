// self_rag_bench/src/stages/sqlite_search.rs

//! `stages.self_rag.SQLiteSearch`: retrieves the `top_k` corpus passages for
//! every prompt in the upstream batch.
//!
//! The corpus is an in-memory table populated in `prepare`; ranking is plain
//! term overlap. Good enough to give the stage realistic CPU cost and output
//! shape.

use super::VOCABULARY;
use async_trait::async_trait;
use benchline::{
  BenchError, BenchResult, CancellationToken, Query, Stage, StageError, StageOutput, StagePolicy, StageSpec, Upstream,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{event, Level};

pub const SQLITE_SEARCH: &str = "stages.self_rag.SQLiteSearch";

fn default_top_k() -> usize {
  3
}

fn default_corpus_size() -> usize {
  512
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
  #[serde(default = "default_top_k")]
  pub top_k: usize,
  #[serde(default = "default_corpus_size")]
  pub corpus_size: usize,
  /// Simulated per-batch database round trip.
  #[serde(default)]
  pub latency_ms: u64,
  /// Path of the backing database. Recorded in the output only.
  #[serde(default)]
  pub db_path: Option<String>,
  #[serde(default)]
  pub concurrency_limit: Option<usize>,
}

#[derive(Debug, Clone)]
struct Passage {
  id: usize,
  text: String,
  terms: HashSet<String>,
}

pub struct SqliteSearch {
  config: SearchConfig,
  corpus: Mutex<Vec<Passage>>,
}

fn terms(text: &str) -> HashSet<String> {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|t| !t.is_empty())
    .map(|t| t.to_lowercase())
    .collect()
}

impl SqliteSearch {
  pub fn from_spec(spec: &StageSpec) -> BenchResult<Self> {
    let config: SearchConfig = spec.typed_config()?;
    if config.top_k == 0 {
      return Err(BenchError::config(format!("stages[id={}].config.top_k", spec.id), "must be > 0"));
    }
    Ok(Self {
      config,
      corpus: Mutex::new(Vec::new()),
    })
  }

  fn passage(id: usize) -> Passage {
    let words: Vec<&str> = (0..6).map(|k| VOCABULARY[(id * 11 + k * 7) % VOCABULARY.len()]).collect();
    let text = format!("Passage {}: {}.", id, words.join(" "));
    Passage {
      id,
      terms: terms(&text),
      text,
    }
  }

  fn search(&self, prompt: &str) -> Vec<Value> {
    let wanted = terms(prompt);
    let corpus = self.corpus.lock();
    let mut scored: Vec<(usize, &Passage)> = corpus
      .iter()
      .map(|p| (p.terms.intersection(&wanted).count(), p))
      .filter(|(score, _)| *score > 0)
      .collect();
    // Highest overlap first; ties keep corpus order.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.id.cmp(&b.1.id)));
    scored
      .into_iter()
      .take(self.config.top_k)
      .map(|(score, p)| json!({ "id": p.id, "score": score, "text": p.text }))
      .collect()
  }
}

/// Collects the prompts of every upstream output carrying a `batch` array.
fn prompts(upstream: &Upstream) -> Result<Vec<String>, StageError> {
  let mut prompts = Vec::new();
  for (id, output) in upstream {
    let batch = output
      .get("batch")
      .and_then(Value::as_array)
      .ok_or_else(|| StageError::InvalidInput(format!("output of stage {} has no 'batch' array", id)))?;
    for item in batch {
      let prompt = item
        .as_str()
        .ok_or_else(|| StageError::InvalidInput(format!("stage {} produced a non-string prompt", id)))?;
      prompts.push(prompt.to_string());
    }
  }
  Ok(prompts)
}

#[async_trait]
impl Stage for SqliteSearch {
  async fn process(
    &self,
    query: &Query,
    upstream: &Upstream,
    cancel: &CancellationToken,
  ) -> Result<StageOutput, StageError> {
    let prompts = prompts(upstream)?;
    if prompts.is_empty() {
      return Err(StageError::InvalidInput(format!("query {} reached search with no prompts", query.seq())));
    }

    if self.config.latency_ms > 0 {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StageError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(self.config.latency_ms)) => {}
      }
    }

    let results: Vec<Value> = prompts
      .iter()
      .map(|prompt| json!({ "prompt": prompt, "passages": self.search(prompt) }))
      .collect();
    Ok(json!({
      "db": self.config.db_path,
      "top_k": self.config.top_k,
      "results": results,
    }))
  }

  fn policy(&self) -> StagePolicy {
    // Read-only lookups are safe to repeat.
    let policy = StagePolicy::idempotent(2);
    match self.config.concurrency_limit {
      Some(limit) => policy.with_concurrency_limit(limit),
      None => policy,
    }
  }

  async fn prepare(&self) -> Result<(), StageError> {
    let passages: Vec<Passage> = (0..self.config.corpus_size).map(Self::passage).collect();
    event!(Level::INFO, passages = passages.len(), "Search corpus populated.");
    *self.corpus.lock() = passages;
    Ok(())
  }
}
