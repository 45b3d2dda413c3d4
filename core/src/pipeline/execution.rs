// benchline/src/pipeline/execution.rs

//! Contains `PipelineExecutor::run()`: the prepare phase, the admission loop
//! and the per-query graph traversal.
//!
//! Every admitted query runs in its own task. Inside a query, a stage starts
//! as soon as all of its predecessors have produced an output, so independent
//! branches run concurrently and fan-in points wait. A query ends when every
//! exit stage has an output, when a stage fails, when its deadline passes, or
//! when the run is shut down.

use crate::core::{Query, QueryState, QueryStatus, StageId, StageOutput, Upstream};
use crate::error::{BenchError, BenchResult, StageError};
use crate::loadgen::{self, Admission};
use crate::pipeline::definition::{stage_names, PipelineExecutor, StageEntry};
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::slots::QueueSlots;
use crate::report::{ExecutionResult, RunReport};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, span, Instrument, Level};

/// Everything a run produced: the aggregate report and every per-query
/// record, ordered by sequence number.
#[derive(Debug, Clone)]
pub struct RunOutcome {
  pub report: RunReport,
  pub results: Vec<ExecutionResult>,
}

/// Outputs and timings collected while a query traverses the graph.
#[derive(Debug, Default)]
struct QueryTrace {
  outputs: BTreeMap<StageId, Arc<StageOutput>>,
  latencies: BTreeMap<StageId, Duration>,
}

/// Shared, read-only state every query task needs.
struct QueryRunner {
  pipeline: String,
  graph: Arc<PipelineGraph>,
  stages: Arc<BTreeMap<StageId, StageEntry>>,
  run_started: Instant,
  timeout: Duration,
}

impl PipelineExecutor {
  /// Runs the pipeline until the scheduler is exhausted and every admitted
  /// query has resolved, or until `shutdown` fires.
  ///
  /// Stage failures and timeouts are recorded per query and never end the run.
  /// A failing `prepare` is returned as an error before any query is admitted.
  /// If the in-flight accounting turns out inconsistent the run stops early
  /// and `BenchError::Aborted` carries the partial report.
  #[instrument(name = "PipelineExecutor::run", skip_all, fields(pipeline = %self.name), err(Display))]
  pub async fn run(self, shutdown: CancellationToken) -> BenchResult<RunOutcome> {
    let PipelineExecutor {
      name,
      graph,
      stages,
      mut scheduler,
      dataset_stage,
    } = self;

    // --- prepare phase ---
    let phase_started = Instant::now();
    event!(Level::INFO, phase = "prepare", "Phase starting.");
    for &id in graph.order() {
      let entry = &stages[&id];
      let stage_started = Instant::now();
      if !entry.disable_logs {
        event!(Level::DEBUG, phase = "prepare", stage_id = id, stage = %entry.name, "Stage preparing.");
      }
      entry.stage.prepare().await.map_err(|source| BenchError::Stage {
        stage_id: id,
        stage_name: entry.name.clone(),
        source,
      })?;
      if !entry.disable_logs {
        event!(
          Level::DEBUG,
          phase = "prepare",
          stage_id = id,
          stage = %entry.name,
          elapsed_ms = stage_started.elapsed().as_millis() as u64,
          "Stage prepared."
        );
      }
    }
    if let Some(id) = dataset_stage {
      if let Some(len) = stages.get(&id).and_then(|e| e.stage.dataset_len()) {
        scheduler.cap_queries(len);
      }
    }
    event!(
      Level::INFO,
      phase = "prepare",
      elapsed_ms = phase_started.elapsed().as_millis() as u64,
      "Phase finished."
    );

    // --- run phase ---
    let queue_depth = scheduler.queue_depth();
    let slots = QueueSlots::new(queue_depth);
    let run_token = shutdown.child_token();
    let run_started = Instant::now();
    let runner = Arc::new(QueryRunner {
      pipeline: name.clone(),
      graph: Arc::clone(&graph),
      stages: Arc::clone(&stages),
      run_started,
      timeout: scheduler.timeout(),
    });
    event!(
      Level::INFO,
      phase = "run",
      queue_depth,
      max_queries = ?scheduler.max_queries(),
      timeout_ms = scheduler.timeout().as_millis() as u64,
      "Phase starting."
    );

    let mut admissions = loadgen::produce(scheduler, Arc::clone(&slots), run_token.clone());
    let mut tasks: JoinSet<ExecutionResult> = JoinSet::new();
    // Admitted queries without a result yet; whatever is left after a task
    // panicked is recorded as failed at the end.
    let mut pending: BTreeMap<u64, (Duration, Duration)> = BTreeMap::new();
    let mut results: Vec<ExecutionResult> = Vec::new();
    let mut fatal: Option<BenchError> = None;
    let mut emitting = true;

    while emitting || !tasks.is_empty() {
      tokio::select! {
        next = admissions.next(), if emitting => match next {
          Some(Ok(admission)) => {
            let seq = admission.query.seq();
            pending.insert(
              seq,
              (
                admission.query.scheduled_at().saturating_duration_since(run_started),
                admission.query.created_at().saturating_duration_since(run_started),
              ),
            );
            let query_span = span!(Level::DEBUG, "query", seq);
            tasks.spawn(
              Arc::clone(&runner)
                .execute(admission, run_token.clone())
                .instrument(query_span),
            );
          }
          Some(Err(e)) => {
            event!(Level::ERROR, error = %e, "Admission failed; stopping the run.");
            fatal = Some(e);
            run_token.cancel();
            emitting = false;
          }
          None => emitting = false,
        },
        Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
          Ok(result) => {
            pending.remove(&result.seq);
            results.push(result);
          }
          Err(e) => event!(Level::ERROR, error = %e, "Query task ended abnormally."),
        },
        else => break,
      }
    }

    for (seq, (scheduled_offset, admitted_offset)) in pending {
      results.push(ExecutionResult {
        seq,
        status: QueryStatus::Failed,
        scheduled_offset,
        admitted_offset,
        latency: Duration::ZERO,
        outputs: BTreeMap::new(),
        stage_latencies: BTreeMap::new(),
        error: Some("query task panicked".to_string()),
      });
    }
    conclude(
      &name,
      results,
      &stage_names(&graph, &stages),
      run_started.elapsed(),
      &slots,
      fatal,
    )
  }
}

/// Aggregates the drained run. Slots still held at this point mean the
/// accounting broke, which aborts the run with the partial report.
fn conclude(
  pipeline: &str,
  mut results: Vec<ExecutionResult>,
  stage_names: &[(StageId, String)],
  elapsed: Duration,
  slots: &QueueSlots,
  mut fatal: Option<BenchError>,
) -> BenchResult<RunOutcome> {
  results.sort_by_key(|r| r.seq);

  if fatal.is_none() && slots.in_flight() != 0 {
    fatal = Some(BenchError::Internal(format!(
      "queue slots still held by queries {:?} after the run drained",
      slots.in_flight_queries()
    )));
  }

  let report = RunReport::from_results(pipeline, &results, stage_names, elapsed, slots.depth(), slots.peak());
  event!(
    Level::INFO,
    phase = "run",
    total = report.total,
    completed = report.completed,
    timed_out = report.timed_out,
    failed = report.failed,
    elapsed_ms = report.elapsed.as_millis() as u64,
    "Phase finished."
  );

  if let Some(e) = fatal {
    event!(Level::ERROR, partial = %report, "Run aborted; partial results follow.");
    return Err(BenchError::Aborted {
      reason: e.to_string(),
      partial: Box::new(report),
    });
  }
  Ok(RunOutcome { report, results })
}

impl QueryRunner {
  /// Drives one query to a terminal state and archives it. The queue slot is
  /// released when this returns.
  async fn execute(self: Arc<Self>, admission: Admission, shutdown: CancellationToken) -> ExecutionResult {
    let Admission { mut query, slot } = admission;
    let seq = query.seq();
    let cancel = shutdown.child_token();
    let mut trace = QueryTrace::default();

    let outcome: BenchResult<()> = match query.transition(QueryState::InFlight) {
      Err(e) => Err(e),
      Ok(()) => match timeout_at(query.deadline(), self.traverse(&query, &cancel, &mut trace)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(BenchError::Timeout {
          seq,
          timeout: self.timeout,
        }),
      },
    };
    // Stops any stage work still reacting to the token (timeouts, sibling
    // branches of a failed stage). Other queries have their own tokens.
    cancel.cancel();

    let (status, error) = match outcome {
      Ok(()) => (QueryStatus::Completed, None),
      Err(e @ BenchError::Timeout { .. }) => (QueryStatus::TimedOut, Some(e.to_string())),
      Err(e) => (QueryStatus::Failed, Some(e.to_string())),
    };
    if let Err(e) = query.transition(QueryState::Finished(status)) {
      event!(Level::ERROR, error = %e, "Query lifecycle violated.");
    }

    match status {
      QueryStatus::Completed => event!(Level::DEBUG, "Query completed."),
      QueryStatus::TimedOut => event!(Level::WARN, timeout_ms = self.timeout.as_millis() as u64, "Query timed out."),
      QueryStatus::Failed => event!(Level::WARN, error = error.as_deref().unwrap_or_default(), "Query failed."),
    }

    // Every stage that finished keeps its output, also when a later stage
    // failed or the deadline passed.
    let outputs = trace
      .outputs
      .into_iter()
      .map(|(id, output)| (id, Arc::unwrap_or_clone(output)))
      .collect();

    let result = ExecutionResult {
      seq,
      status,
      scheduled_offset: query.scheduled_at().saturating_duration_since(self.run_started),
      admitted_offset: query.created_at().saturating_duration_since(self.run_started),
      latency: query.created_at().elapsed(),
      outputs,
      stage_latencies: trace.latencies,
      error,
    };
    drop(slot);
    result
  }

  /// Runs the stages of one query in dependency order.
  async fn traverse(&self, query: &Query, cancel: &CancellationToken, trace: &mut QueryTrace) -> BenchResult<()> {
    let graph = &self.graph;
    let mut waiting: BTreeMap<StageId, usize> = graph
      .order()
      .iter()
      .map(|&id| (id, graph.predecessors(id).len()))
      .collect();

    let mut running = FuturesUnordered::new();
    for &id in graph.entry_stages() {
      running.push(self.run_stage(id, query, Upstream::new(), cancel));
    }

    while !running.is_empty() {
      let (id, result, elapsed) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(BenchError::Cancelled { seq: query.seq() }),
        Some(done) = running.next() => done,
        else => break,
      };

      let output = result.map_err(|source| BenchError::Stage {
        stage_id: id,
        stage_name: self.stages[&id].name.clone(),
        source,
      })?;
      trace.latencies.insert(id, elapsed);
      trace.outputs.insert(id, Arc::new(output));

      for &succ in graph.successors(id) {
        let Some(left) = waiting.get_mut(&succ) else {
          continue;
        };
        *left -= 1;
        if *left == 0 {
          let upstream: Upstream = graph
            .predecessors(succ)
            .iter()
            .filter_map(|p| trace.outputs.get(p).map(|o| (*p, Arc::clone(o))))
            .collect();
          running.push(self.run_stage(succ, query, upstream, cancel));
        }
      }
    }

    if let Some(missing) = graph.exit_stages().iter().find(|id| !trace.outputs.contains_key(id)) {
      return Err(BenchError::Internal(format!(
        "query {} drained without an output from exit stage {}",
        query.seq(),
        missing
      )));
    }
    Ok(())
  }

  /// Invokes one stage for one query, honouring its concurrency limit and
  /// retrying idempotent stages.
  async fn run_stage(
    &self,
    id: StageId,
    query: &Query,
    upstream: Upstream,
    cancel: &CancellationToken,
  ) -> (StageId, Result<StageOutput, StageError>, Duration) {
    let entry = &self.stages[&id];
    let _permit = match &entry.limiter {
      Some(limiter) => match limiter.acquire().await {
        Ok(permit) => Some(permit),
        Err(_) => return (id, Err(StageError::msg("stage concurrency limiter closed")), Duration::ZERO),
      },
      None => None,
    };

    let started = Instant::now();
    if !entry.disable_logs {
      event!(Level::DEBUG, pipeline = %self.pipeline, stage_id = id, stage = %entry.name, phase = "run", "Stage starting.");
    }

    let attempts = entry.policy.attempts();
    let mut attempt = 1;
    let result = loop {
      match entry.stage.process(query, &upstream, cancel).await {
        Ok(output) => break Ok(output),
        Err(StageError::Cancelled) => break Err(StageError::Cancelled),
        Err(e) if attempt < attempts && !cancel.is_cancelled() => {
          event!(
            Level::WARN,
            stage_id = id,
            attempt,
            attempts,
            error = %e,
            "Idempotent stage failed; retrying."
          );
          attempt += 1;
          tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(StageError::Cancelled),
            _ = sleep(entry.policy.retry_backoff) => {}
          }
        }
        Err(e) => break Err(e),
      }
    };

    let elapsed = started.elapsed();
    if !entry.disable_logs {
      event!(
        Level::DEBUG,
        pipeline = %self.pipeline,
        stage_id = id,
        stage = %entry.name,
        phase = "run",
        ok = result.is_ok(),
        attempts = attempt,
        elapsed_us = elapsed.as_micros() as u64,
        "Stage finished."
      );
    }
    (id, result, elapsed)
  }
}
