// benchline/src/loadgen/offline.rs

//! `loadgen.OfflineLoadScheduler`: open-loop arrivals at a target average rate.

use crate::config::LoadgenSpec;
use crate::error::{BenchError, BenchResult};
use crate::loadgen::LoadScheduler;
use crate::pipeline::slots::MAX_QUEUE_DEPTH;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::time::Duration;
use tracing::{event, Level};

pub const OFFLINE_SCHEDULER: &str = "loadgen.OfflineLoadScheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalProcess {
  /// Exponentially distributed gaps with mean `1/rate`.
  #[default]
  Poisson,
  /// Every gap is exactly `1/rate`.
  Uniform,
}

/// Scheduler-specific part of `loadgen.config`.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
  /// Average queries per second.
  pub rate: f64,
  #[serde(default)]
  pub arrival: ArrivalProcess,
  /// Seed for reproducible Poisson gaps. Drawn from the OS when absent.
  #[serde(default)]
  pub seed: Option<u64>,
}

#[derive(Debug)]
pub struct OfflineLoadScheduler {
  rate: f64,
  arrival: ArrivalProcess,
  queue_depth: usize,
  max_queries: Option<u64>,
  timeout: Duration,
  rng: StdRng,
}

impl OfflineLoadScheduler {
  pub fn new(
    rate: f64,
    arrival: ArrivalProcess,
    queue_depth: usize,
    max_queries: Option<u64>,
    timeout: Duration,
    seed: Option<u64>,
  ) -> BenchResult<Self> {
    if !(rate.is_finite() && rate > 0.0) {
      return Err(BenchError::config("loadgen.config.rate", format!("must be > 0, got {}", rate)));
    }
    if queue_depth == 0 {
      return Err(BenchError::config("loadgen.queue_depth", "must be > 0, got 0"));
    }
    if queue_depth > MAX_QUEUE_DEPTH {
      return Err(BenchError::config(
        "loadgen.queue_depth",
        format!("must be <= {}, got {}", MAX_QUEUE_DEPTH, queue_depth),
      ));
    }
    if timeout.is_zero() {
      return Err(BenchError::config("loadgen.timeout", "must be > 0 milliseconds, got 0"));
    }
    let rng = match seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_os_rng(),
    };
    Ok(Self {
      rate,
      arrival,
      queue_depth,
      max_queries,
      timeout,
      rng,
    })
  }

  /// Builds the scheduler from a pipeline's `loadgen` block.
  pub fn from_spec(spec: &LoadgenSpec) -> BenchResult<Self> {
    spec.validate()?;
    let config: OfflineConfig = spec.typed_config()?;
    let scheduler = Self::new(
      config.rate,
      config.arrival,
      spec.queue_depth(),
      spec.max_queries(),
      spec.timeout(),
      config.seed,
    )?;
    event!(
      Level::DEBUG,
      rate = scheduler.rate,
      arrival = ?scheduler.arrival,
      queue_depth = scheduler.queue_depth,
      max_queries = ?scheduler.max_queries,
      timeout_ms = scheduler.timeout.as_millis() as u64,
      "Offline load scheduler configured."
    );
    Ok(scheduler)
  }

  pub fn rate(&self) -> f64 {
    self.rate
  }

  pub fn arrival(&self) -> ArrivalProcess {
    self.arrival
  }

  fn mean_gap_secs(&self) -> f64 {
    1.0 / self.rate
  }
}

impl LoadScheduler for OfflineLoadScheduler {
  fn component(&self) -> &str {
    OFFLINE_SCHEDULER
  }

  fn queue_depth(&self) -> usize {
    self.queue_depth
  }

  fn max_queries(&self) -> Option<u64> {
    self.max_queries
  }

  fn timeout(&self) -> Duration {
    self.timeout
  }

  fn next_arrival_delay(&mut self) -> Duration {
    let mean = self.mean_gap_secs();
    let secs = match self.arrival {
      ArrivalProcess::Uniform => mean,
      ArrivalProcess::Poisson => {
        // Inverse CDF of Exp(rate). `random` yields [0, 1), so 1 - u is in (0, 1].
        let u: f64 = self.rng.random();
        -(1.0 - u).ln() * mean
      }
    };
    // A vanishing rate yields gaps beyond what `Duration` can hold.
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
  }

  fn cap_queries(&mut self, limit: u64) {
    let capped = self.max_queries.map_or(limit, |current| current.min(limit));
    if self.max_queries != Some(capped) {
      event!(Level::INFO, from = ?self.max_queries, to = capped, "Query cap lowered.");
      self.max_queries = Some(capped);
    }
  }
}
