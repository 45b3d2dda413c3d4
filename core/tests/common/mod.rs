// tests/common/mod.rs
#![allow(dead_code)] // Allow unused code in this common test module

use async_trait::async_trait;
use benchline::{
  BenchDocument, CancellationToken, ComponentRegistry, PipelineExecutor, Query, Stage, StageError, StageId,
  StageOutput, StagePolicy, StageSpec, Upstream,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration;
use tracing::Level;

pub const SCRIPTED: &str = "test.Scripted";

// --- Shared observation point for scripted stages ---
#[derive(Debug, Default)]
pub struct Probe {
  /// `(seq, stage id)` in the order `process` was entered.
  pub calls: Mutex<Vec<(u64, StageId)>>,
  /// `(seq, stage id)` in the order `process` returned successfully.
  pub finished: Mutex<Vec<(u64, StageId)>>,
  pub active: AtomicUsize,
  pub peak_active: AtomicUsize,
  pub prepared: AtomicUsize,
}

impl Probe {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn calls_of(&self, stage: StageId) -> usize {
    self.calls.lock().iter().filter(|(_, id)| *id == stage).count()
  }

  pub fn calls_for_query(&self, seq: u64) -> Vec<StageId> {
    self.calls.lock().iter().filter(|(s, _)| *s == seq).map(|(_, id)| *id).collect()
  }

  pub fn finished_for_query(&self, seq: u64) -> Vec<StageId> {
    self.finished.lock().iter().filter(|(s, _)| *s == seq).map(|(_, id)| *id).collect()
  }

  pub fn peak_active(&self) -> usize {
    self.peak_active.load(Ordering::SeqCst)
  }
}

/// Behaviour knobs for `test.Scripted`, read from the stage's `config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptedConfig {
  pub delay_ms: u64,
  /// The first `fail_times` attempts of every query fail.
  pub fail_times: u32,
  /// Marks the stage idempotent with this many retries.
  pub retries: Option<u32>,
  pub concurrency_limit: Option<usize>,
  pub dataset_len: Option<u64>,
  pub fail_prepare: bool,
  /// `process` panics instead of returning.
  pub panic: bool,
}

/// A stage that sleeps, fails and reports on command. Its output records
/// which predecessors it saw.
pub struct ScriptedStage {
  id: StageId,
  config: ScriptedConfig,
  probe: Arc<Probe>,
  attempts: Mutex<HashMap<u64, u32>>,
}

#[async_trait]
impl Stage for ScriptedStage {
  async fn process(
    &self,
    query: &Query,
    upstream: &Upstream,
    cancel: &CancellationToken,
  ) -> Result<StageOutput, StageError> {
    let seq = query.seq();
    self.probe.calls.lock().push((seq, self.id));
    let attempt = {
      let mut attempts = self.attempts.lock();
      let n = attempts.entry(seq).or_insert(0);
      *n += 1;
      *n
    };
    if self.config.panic {
      panic!("scripted panic in stage {} for query {}", self.id, seq);
    }

    let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.probe.peak_active.fetch_max(active, Ordering::SeqCst);
    let slept = if self.config.delay_ms > 0 {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(self.config.delay_ms)) => Ok(()),
      }
    } else {
      Ok(())
    };
    self.probe.active.fetch_sub(1, Ordering::SeqCst);
    slept?;

    if attempt <= self.config.fail_times {
      tracing::warn!(target: "test_stages", stage = self.id, seq, attempt, "scripted failure");
      return Err(StageError::msg(format!("scripted failure {} in stage {}", attempt, self.id)));
    }
    self.probe.finished.lock().push((seq, self.id));
    Ok(json!({
      "stage": self.id,
      "seq": seq,
      "upstream": upstream.keys().collect::<Vec<_>>(),
    }))
  }

  fn policy(&self) -> StagePolicy {
    let policy = match self.config.retries {
      Some(retries) => StagePolicy::idempotent(retries).with_retry_backoff(Duration::from_millis(5)),
      None => StagePolicy::default(),
    };
    match self.config.concurrency_limit {
      Some(limit) => policy.with_concurrency_limit(limit),
      None => policy,
    }
  }

  async fn prepare(&self) -> Result<(), StageError> {
    if self.config.fail_prepare {
      return Err(StageError::msg(format!("stage {} could not prepare", self.id)));
    }
    self.probe.prepared.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn dataset_len(&self) -> Option<u64> {
    self.config.dataset_len
  }
}

/// Built-in components plus `test.Scripted` wired to `probe`.
pub fn registry(probe: &Arc<Probe>) -> ComponentRegistry {
  let registry = ComponentRegistry::with_builtins();
  let probe = Arc::clone(probe);
  registry.register_stage(SCRIPTED, move |spec: &StageSpec| {
    let stage = ScriptedStage {
      id: spec.id,
      config: spec.typed_config()?,
      probe: Arc::clone(&probe),
      attempts: Mutex::new(HashMap::new()),
    };
    Ok(Arc::new(stage) as Arc<dyn Stage>)
  });
  registry
}

// --- Document builder ---
#[derive(Debug, Clone)]
pub struct PipelineDoc {
  pub name: &'static str,
  pub inputs: Vec<StageId>,
  pub outputs: Vec<StageId>,
  pub queue_depth: i64,
  pub max_queries: i64,
  pub timeout_ms: i64,
  pub rate: f64,
  pub arrival: &'static str,
  pub dataset_stage_id: Option<StageId>,
  stages: Vec<String>,
}

impl PipelineDoc {
  /// Defaults mirror the Self RAG benchmark: rate 1, 4 queries, depth 10, 20s timeout.
  pub fn new() -> Self {
    Self {
      name: "test_pipeline",
      inputs: Vec::new(),
      outputs: Vec::new(),
      queue_depth: 10,
      max_queries: 4,
      timeout_ms: 20_000,
      rate: 1.0,
      arrival: "uniform",
      dataset_stage_id: None,
      stages: Vec::new(),
    }
  }

  /// Adds a `test.Scripted` stage. `config` is a YAML flow mapping.
  pub fn scripted(self, id: StageId, outputs: &[StageId], config: &str) -> Self {
    self.stage(id, outputs, SCRIPTED, config)
  }

  pub fn stage(mut self, id: StageId, outputs: &[StageId], component: &str, config: &str) -> Self {
    self.stages.push(format!(
      "      - name: stage_{id}\n        id: {id}\n        outputs: {outputs:?}\n        component: {component}\n        config: {config}\n"
    ));
    self
  }

  /// Sets `disable_logs: true` on stage `id`.
  pub fn quiet(mut self, id: StageId) -> Self {
    let marker = format!("        id: {}\n", id);
    if let Some(stage) = self.stages.iter_mut().find(|s| s.contains(&marker)) {
      stage.push_str("        disable_logs: true\n");
    }
    self
  }

  pub fn yaml(&self) -> String {
    let mut yaml = format!(
      "pipelines:\n  - name: {}\n    inputs: {:?}\n    outputs: {:?}\n",
      self.name, self.inputs, self.outputs
    );
    if let Some(id) = self.dataset_stage_id {
      yaml.push_str(&format!("    dataset_stage_id: {}\n", id));
    }
    yaml.push_str(&format!(
      "    loadgen:\n      component: loadgen.OfflineLoadScheduler\n      queue_depth: {}\n      max_queries: {}\n      timeout: {}\n      config:\n        rate: {:?}\n        arrival: {}\n        seed: 7\n    stages:\n",
      self.queue_depth, self.max_queries, self.timeout_ms, self.rate, self.arrival
    ));
    for stage in &self.stages {
      yaml.push_str(stage);
    }
    yaml
  }

  pub fn executor(&self, registry: &ComponentRegistry) -> PipelineExecutor {
    let doc = BenchDocument::from_yaml_str(&self.yaml()).expect("test document parses");
    PipelineExecutor::from_spec(&doc.pipelines[0], registry).expect("test pipeline assembles")
  }

  pub fn try_executor(&self, registry: &ComponentRegistry) -> benchline::BenchResult<PipelineExecutor> {
    let doc = BenchDocument::from_yaml_str(&self.yaml())?;
    PipelineExecutor::from_spec(&doc.pipelines[0], registry)
  }
}

/// Asserts `actual` is within a few milliseconds of `expected_ms`.
pub fn assert_near(actual: Duration, expected_ms: u64) {
  let expected = Duration::from_millis(expected_ms);
  let slack = Duration::from_millis(5);
  assert!(
    actual + slack >= expected && actual <= expected + slack,
    "expected ~{}ms, got {:?}",
    expected_ms,
    actual
  );
}

// --- Captured log output ---
/// Collects formatted events in memory while the returned guard is alive.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.0.lock().extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

impl LogCapture {
  pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
    let capture = Self::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
      .with_max_level(Level::DEBUG)
      .with_ansi(false)
      .with_writer(move || writer.clone())
      .finish();
    (capture, tracing::subscriber::set_default(subscriber))
  }

  pub fn lines(&self) -> Vec<String> {
    String::from_utf8_lossy(&self.0.lock()).lines().map(str::to_string).collect()
  }

  /// Lines containing every one of `parts`.
  pub fn matching(&self, parts: &[&str]) -> Vec<String> {
    self.lines().into_iter().filter(|l| parts.iter().all(|p| l.contains(p))).collect()
  }
}

// --- Helper for Tracing Setup (call once per test run if needed) ---
use once_cell::sync::Lazy;
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer() // Important for tests to capture output
    .try_init()
    .ok(); // Allow multiple initializations in tests (ok if fails)
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}
