// benchline/src/report.rs

//! Per-query results and the aggregate report of a run.

use crate::core::{QueryStatus, StageId, StageOutput};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

fn as_ms(d: Duration) -> f64 {
  d.as_micros() as f64 / 1000.0
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
  S: Serializer,
{
  serializer.serialize_f64(duration.as_secs_f64())
}

/// Archived record of one query.
///
/// Offsets are measured from the start of the run phase.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
  pub seq: u64,
  pub status: QueryStatus,
  /// When the arrival process scheduled the query.
  pub scheduled_offset: Duration,
  /// When the query got its queue slot.
  pub admitted_offset: Duration,
  /// Admission to terminal state.
  pub latency: Duration,
  /// Output of every stage that finished, also for failed and timed-out
  /// queries.
  pub outputs: BTreeMap<StageId, StageOutput>,
  /// Wall time of every stage that finished, including retries.
  pub stage_latencies: BTreeMap<StageId, Duration>,
  pub error: Option<String>,
}

impl ExecutionResult {
  pub fn admission_delay(&self) -> Duration {
    self.admitted_offset.saturating_sub(self.scheduled_offset)
  }

  pub fn is_completed(&self) -> bool {
    self.status == QueryStatus::Completed
  }
}

/// Latency distribution of completed queries, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
  pub count: usize,
  pub mean_ms: f64,
  pub p50_ms: f64,
  pub p90_ms: f64,
  pub p95_ms: f64,
  pub p99_ms: f64,
  pub max_ms: f64,
}

impl LatencySummary {
  pub fn from_durations(durations: impl IntoIterator<Item = Duration>) -> Self {
    let mut ms: Vec<f64> = durations.into_iter().map(as_ms).collect();
    if ms.is_empty() {
      return Self::default();
    }
    ms.sort_by(|a, b| a.total_cmp(b));
    Self {
      count: ms.len(),
      mean_ms: ms.iter().sum::<f64>() / ms.len() as f64,
      p50_ms: percentile(&ms, 50.0),
      p90_ms: percentile(&ms, 90.0),
      p95_ms: percentile(&ms, 95.0),
      p99_ms: percentile(&ms, 99.0),
      max_ms: ms[ms.len() - 1],
    }
  }
}

/// Nearest-rank percentile over an ascending, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
  let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
  sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
  pub id: StageId,
  pub name: String,
  /// Queries for which this stage finished successfully.
  pub invocations: u64,
  pub mean_latency_ms: f64,
}

/// Aggregate outcome of one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
  pub pipeline: String,
  pub total: u64,
  pub completed: u64,
  pub timed_out: u64,
  pub failed: u64,
  #[serde(serialize_with = "serialize_duration")]
  pub elapsed: Duration,
  /// Completed queries per second of run time.
  pub throughput_qps: f64,
  pub latency: LatencySummary,
  pub timeout_rate: f64,
  pub error_rate: f64,
  pub queue_depth: usize,
  pub peak_in_flight: usize,
  pub mean_admission_delay_ms: f64,
  pub stages: Vec<StageSummary>,
}

impl RunReport {
  /// Aggregates `results`. `stage_names` lists every stage in topological order.
  pub fn from_results(
    pipeline: &str,
    results: &[ExecutionResult],
    stage_names: &[(StageId, String)],
    elapsed: Duration,
    queue_depth: usize,
    peak_in_flight: usize,
  ) -> Self {
    let count = |status: QueryStatus| results.iter().filter(|r| r.status == status).count() as u64;
    let total = results.len() as u64;
    let completed = count(QueryStatus::Completed);
    let timed_out = count(QueryStatus::TimedOut);
    let failed = count(QueryStatus::Failed);

    let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };
    let secs = elapsed.as_secs_f64();

    let mean_admission_delay_ms = if results.is_empty() {
      0.0
    } else {
      results
        .iter()
        .map(|r| as_ms(r.admission_delay()))
        .sum::<f64>()
        / results.len() as f64
    };

    let stages = stage_names
      .iter()
      .map(|(id, name)| {
        let samples: Vec<Duration> = results.iter().filter_map(|r| r.stage_latencies.get(id).copied()).collect();
        let mean_latency_ms = if samples.is_empty() {
          0.0
        } else {
          samples.iter().copied().map(as_ms).sum::<f64>() / samples.len() as f64
        };
        StageSummary {
          id: *id,
          name: name.clone(),
          invocations: samples.len() as u64,
          mean_latency_ms,
        }
      })
      .collect();

    Self {
      pipeline: pipeline.to_string(),
      total,
      completed,
      timed_out,
      failed,
      elapsed,
      throughput_qps: if secs > 0.0 { completed as f64 / secs } else { 0.0 },
      latency: LatencySummary::from_durations(results.iter().filter(|r| r.is_completed()).map(|r| r.latency)),
      timeout_rate: rate(timed_out),
      error_rate: rate(failed),
      queue_depth,
      peak_in_flight,
      mean_admission_delay_ms,
      stages,
    }
  }

  pub fn to_json_pretty(&self) -> serde_json::Result<String> {
    serde_json::to_string_pretty(self)
  }

  pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let json = self.to_json_pretty()?;
    std::fs::write(path.as_ref(), json)?;
    Ok(())
  }
}

impl fmt::Display for RunReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "Pipeline '{}': total={} completed={} timed_out={} failed={} in {:.2}s",
      self.pipeline,
      self.total,
      self.completed,
      self.timed_out,
      self.failed,
      self.elapsed.as_secs_f64()
    )?;
    writeln!(
      f,
      "  throughput: {:.2} q/s, timeout rate: {:.1}%, error rate: {:.1}%, peak in flight: {}/{}",
      self.throughput_qps,
      self.timeout_rate * 100.0,
      self.error_rate * 100.0,
      self.peak_in_flight,
      self.queue_depth
    )?;
    write!(
      f,
      "  latency ms: mean {:.2}, p50 {:.2}, p90 {:.2}, p95 {:.2}, p99 {:.2}, max {:.2}",
      self.latency.mean_ms,
      self.latency.p50_ms,
      self.latency.p90_ms,
      self.latency.p95_ms,
      self.latency.p99_ms,
      self.latency.max_ms
    )?;
    for stage in &self.stages {
      write!(
        f,
        "\n  stage {} '{}': {} runs, mean {:.2} ms",
        stage.id, stage.name, stage.invocations, stage.mean_latency_ms
      )?;
    }
    Ok(())
  }
}
