// benchline/src/core/query.rs

//! The runtime unit of work created by a load scheduler, and its lifecycle.

use crate::error::{BenchError, BenchResult};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Terminal outcome of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
  /// Every exit stage produced an output before the deadline.
  Completed,
  /// The deadline elapsed first.
  TimedOut,
  /// A stage failed (after any retries) or the run was shut down.
  Failed,
}

/// Lifecycle state: `Created -> InFlight -> {Completed, TimedOut, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
  Created,
  InFlight,
  Finished(QueryStatus),
}

impl QueryState {
  pub fn is_terminal(self) -> bool {
    matches!(self, QueryState::Finished(_))
  }
}

impl fmt::Display for QueryState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      QueryState::Created => write!(f, "created"),
      QueryState::InFlight => write!(f, "in_flight"),
      QueryState::Finished(QueryStatus::Completed) => write!(f, "completed"),
      QueryState::Finished(QueryStatus::TimedOut) => write!(f, "timed_out"),
      QueryState::Finished(QueryStatus::Failed) => write!(f, "failed"),
    }
  }
}

/// A query admitted into the pipeline.
///
/// `scheduled_at` is when the arrival process wanted the query to start;
/// `created_at` is when it actually got a queue slot. The two differ only
/// under back-pressure. The deadline is measured from `created_at`.
#[derive(Debug, Clone)]
pub struct Query {
  seq: u64,
  scheduled_at: Instant,
  created_at: Instant,
  deadline: Instant,
  state: QueryState,
}

impl Query {
  pub fn new(seq: u64, scheduled_at: Instant, created_at: Instant, timeout: Duration) -> Self {
    Self {
      seq,
      scheduled_at,
      created_at,
      deadline: created_at + timeout,
      state: QueryState::Created,
    }
  }

  pub fn seq(&self) -> u64 {
    self.seq
  }

  pub fn scheduled_at(&self) -> Instant {
    self.scheduled_at
  }

  pub fn created_at(&self) -> Instant {
    self.created_at
  }

  pub fn deadline(&self) -> Instant {
    self.deadline
  }

  pub fn state(&self) -> QueryState {
    self.state
  }

  /// Time spent waiting for a queue slot after the scheduled arrival.
  pub fn admission_delay(&self) -> Duration {
    self.created_at.saturating_duration_since(self.scheduled_at)
  }

  /// Time left before the deadline, zero once it has passed.
  pub fn remaining(&self) -> Duration {
    self.deadline.saturating_duration_since(Instant::now())
  }

  /// Moves the query to `next`, rejecting transitions the lifecycle does not allow.
  pub fn transition(&mut self, next: QueryState) -> BenchResult<()> {
    let allowed = match (self.state, next) {
      (QueryState::Created, QueryState::InFlight) => true,
      // Shutdown can fail a query before it ever started.
      (QueryState::Created, QueryState::Finished(QueryStatus::Failed)) => true,
      (QueryState::InFlight, QueryState::Finished(_)) => true,
      _ => false,
    };
    if !allowed {
      return Err(BenchError::Internal(format!(
        "query {} cannot move from {} to {}",
        self.seq, self.state, next
      )));
    }
    self.state = next;
    Ok(())
  }
}
