// tests/error_handling_tests.rs
mod common;
use benchline::{BenchError, CancellationToken, QueryStatus};
use common::*;
use serial_test::serial;
use std::time::Duration;

#[tokio::test(start_paused = true)]
#[serial]
async fn test_always_failing_stage_fails_every_query() {
  setup_tracing();
  let probe = Probe::new();
  let doc = PipelineDoc::new()
    .scripted(0, &[1], "{}")
    .scripted(1, &[], "{fail_times: 1000}");
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();

  assert_eq!(outcome.report.failed, 4);
  assert_eq!(outcome.report.completed, 0);
  assert_eq!(outcome.report.error_rate, 1.0);
  for result in &outcome.results {
    assert_eq!(result.status, QueryStatus::Failed);
    let error = result.error.as_deref().unwrap();
    assert!(error.contains("stage 1 ('stage_1')"), "{}", error);
    // Stage 0 finished before stage 1 failed.
    assert_eq!(result.outputs.keys().copied().collect::<Vec<_>>(), vec![0]);
  }
  // Non-idempotent: exactly one attempt per query.
  assert_eq!(probe.calls_of(1), 4);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_failure_skips_downstream_stages() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new()
    .scripted(0, &[1], "{fail_times: 1}")
    .scripted(1, &[], "{}");
  doc.max_queries = 1;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();
  assert_eq!(outcome.report.failed, 1);
  assert_eq!(probe.calls_of(1), 0);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_failed_query_keeps_upstream_outputs() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new()
    .scripted(0, &[1], "{}")
    .scripted(1, &[2], "{delay_ms: 5}")
    .scripted(2, &[], "{fail_times: 1}");
  doc.max_queries = 2;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();

  assert_eq!(outcome.report.failed, 2);
  for result in &outcome.results {
    assert_eq!(result.status, QueryStatus::Failed);
    assert_eq!(result.outputs.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(result.outputs[&0]["seq"], result.seq);
    assert_eq!(result.outputs[&1]["upstream"][0], 0);
    assert!(result.stage_latencies.contains_key(&1));
  }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_timed_out_query_keeps_finished_stage_outputs() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new()
    .scripted(0, &[1], "{delay_ms: 10}")
    .scripted(1, &[], "{delay_ms: 500}");
  doc.max_queries = 1;
  doc.timeout_ms = 100;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();

  let result = &outcome.results[0];
  assert_eq!(result.status, QueryStatus::TimedOut);
  assert_eq!(result.outputs.keys().copied().collect::<Vec<_>>(), vec![0]);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_panicking_stage_fails_query_and_frees_slot() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new()
    .scripted(0, &[1], "{}")
    .scripted(1, &[], "{delay_ms: 10, panic: true}");
  doc.queue_depth = 2;
  doc.rate = 100.0;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();

  // Every admission is accounted for even though no task returned.
  assert_eq!(outcome.report.total, 4);
  assert_eq!(outcome.report.failed, 4);
  assert_eq!(outcome.report.completed + outcome.report.timed_out, 0);
  assert!(outcome.report.peak_in_flight <= 2);
  let seqs: Vec<u64> = outcome.results.iter().map(|r| r.seq).collect();
  assert_eq!(seqs, vec![0, 1, 2, 3]);
  for result in &outcome.results {
    assert_eq!(result.status, QueryStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("query task panicked"));
  }
  assert_eq!(probe.calls_of(1), 4);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_vanishing_rate_admits_only_the_first_query() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new().scripted(0, &[], "{}");
  doc.rate = 1e-30;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();
  assert_eq!(outcome.report.total, 1);
  assert_eq!(outcome.report.completed, 1);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_failed_branch_cancels_sibling_branch() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new()
    .scripted(0, &[1, 2], "{}")
    .scripted(1, &[], "{delay_ms: 10, fail_times: 1}")
    .scripted(2, &[], "{delay_ms: 5000}");
  doc.max_queries = 1;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();
  assert_eq!(outcome.results[0].status, QueryStatus::Failed);
  assert_near(outcome.results[0].latency, 10);
  assert!(probe.finished_for_query(0).iter().all(|id| *id != 2));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_slow_stage_times_out_and_frees_slot() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new().scripted(0, &[], "{delay_ms: 500}");
  doc.timeout_ms = 100;
  doc.queue_depth = 1;
  doc.rate = 100.0;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();

  assert_eq!(outcome.report.timed_out, 4);
  assert_eq!(outcome.report.timeout_rate, 1.0);
  assert_eq!(outcome.report.peak_in_flight, 1);
  for (k, result) in outcome.results.iter().enumerate() {
    assert_eq!(result.status, QueryStatus::TimedOut);
    assert_near(result.latency, 100);
    // Depth 1: each query is admitted when the previous one times out.
    assert_near(result.admitted_offset, 100 * k as u64);
    assert!(result.error.as_deref().unwrap().contains("deadline"));
  }
  assert!(probe.finished.lock().is_empty());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_idempotent_stage_recovers_with_retries() {
  setup_tracing();
  let probe = Probe::new();
  let doc = PipelineDoc::new().scripted(0, &[], "{fail_times: 2, retries: 2}");
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();
  assert_eq!(outcome.report.completed, 4);
  assert_eq!(probe.calls_of(0), 12);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_retries_are_bounded() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new().scripted(0, &[], "{fail_times: 5, retries: 2}");
  doc.max_queries = 1;
  let outcome = doc.executor(&registry(&probe)).run(CancellationToken::new()).await.unwrap();
  assert_eq!(outcome.report.failed, 1);
  assert_eq!(probe.calls_of(0), 3);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_shutdown_resolves_in_flight_queries() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new().scripted(0, &[], "{delay_ms: 60000}");
  doc.max_queries = 0;
  doc.rate = 10.0;
  doc.timeout_ms = 120_000;

  let shutdown = CancellationToken::new();
  let trigger = shutdown.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(450)).await;
    trigger.cancel();
  });
  let outcome = doc.executor(&registry(&probe)).run(shutdown).await.unwrap();

  assert_eq!(outcome.report.total, 5);
  assert_eq!(outcome.report.failed, 5);
  assert!(outcome.report.elapsed < Duration::from_secs(1));
  for result in &outcome.results {
    assert!(result.error.as_deref().unwrap().contains("cancelled"));
  }
}

#[tokio::test]
#[serial]
async fn test_cycle_is_a_load_time_error() {
  setup_tracing();
  let probe = Probe::new();
  let doc = PipelineDoc::new()
    .scripted(0, &[1], "{}")
    .scripted(1, &[2], "{}")
    .scripted(2, &[1], "{}");
  let err = doc.try_executor(&registry(&probe)).err().unwrap();
  assert!(err.is_load_time());
  match err {
    BenchError::Cycle { stages } => assert_eq!(stages, vec![1, 2]),
    other => panic!("Expected BenchError::Cycle, got {:?}", other),
  }
}

#[tokio::test]
#[serial]
async fn test_dangling_stage_reference_is_rejected() {
  setup_tracing();
  let probe = Probe::new();
  let doc = PipelineDoc::new().scripted(0, &[9], "{}");
  match doc.try_executor(&registry(&probe)).err().unwrap() {
    BenchError::UnknownId { id, .. } => assert_eq!(id, 9),
    other => panic!("Expected BenchError::UnknownId, got {:?}", other),
  }
}

#[tokio::test]
#[serial]
async fn test_bad_stage_config_names_pipeline_and_field() {
  setup_tracing();
  let probe = Probe::new();
  let doc = PipelineDoc::new().scripted(0, &[], "{delay_ms: soon}");
  let err = doc.try_executor(&registry(&probe)).err().unwrap();
  let text = err.to_string();
  assert!(text.contains("test_pipeline.stages[id=0].config"), "{}", text);
}

#[tokio::test]
#[serial]
async fn test_zero_timeout_is_rejected() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new().scripted(0, &[], "{}");
  doc.timeout_ms = 0;
  let err = doc.try_executor(&registry(&probe)).err().unwrap();
  assert!(matches!(err, BenchError::Config { .. }));
  assert!(err.to_string().contains("timeout"), "{}", err);
}

#[tokio::test]
#[serial]
async fn test_queue_depth_beyond_slot_capacity_is_rejected() {
  setup_tracing();
  let probe = Probe::new();
  let mut doc = PipelineDoc::new().scripted(0, &[], "{}");
  doc.queue_depth = 4_000_000_000_000_000_000;
  let err = doc.try_executor(&registry(&probe)).err().unwrap();
  assert!(matches!(err, BenchError::Config { .. }), "{}", err);
  assert!(err.to_string().contains("loadgen.queue_depth"), "{}", err);
}
