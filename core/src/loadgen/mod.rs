// benchline/src/loadgen/mod.rs

//! Load generation: schedulers decide *when* queries arrive, `produce` turns a
//! scheduler into a lazy stream of admitted queries.

pub mod offline;

pub use offline::{ArrivalProcess, OfflineConfig, OfflineLoadScheduler};

use crate::core::Query;
use crate::error::BenchResult;
use crate::pipeline::slots::{QueueSlots, SlotGuard};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// A source of arrival times plus the admission limits that go with it.
pub trait LoadScheduler: Send {
  /// Registry id this scheduler was built from.
  fn component(&self) -> &str;

  /// Maximum number of queries in flight at once.
  fn queue_depth(&self) -> usize;

  /// Total queries to emit; `None` is unbounded.
  fn max_queries(&self) -> Option<u64>;

  /// Per-query deadline, measured from admission.
  fn timeout(&self) -> Duration;

  /// Gap between the previous scheduled arrival and the next one.
  fn next_arrival_delay(&mut self) -> Duration;

  /// Lowers the query cap, e.g. to the length of a finite dataset.
  /// A limit above the current cap has no effect.
  fn cap_queries(&mut self, limit: u64);
}

/// A query that has been granted a queue slot. The slot is released when
/// `slot` is dropped.
#[derive(Debug)]
pub struct Admission {
  pub query: Query,
  pub slot: SlotGuard,
}

struct ProduceState {
  scheduler: Box<dyn LoadScheduler>,
  slots: Arc<QueueSlots>,
  cancel: CancellationToken,
  next_seq: u64,
  /// `None` once the next arrival lies past what `Instant` can represent.
  next_at: Option<Instant>,
  failed: bool,
}

/// Turns `scheduler` into a lazy stream of admitted queries.
///
/// Arrivals are open-loop: query `k` is scheduled at the previous scheduled
/// time plus `next_arrival_delay()`, independent of when earlier queries
/// finish. The first query is scheduled immediately. Each emission waits for
/// its scheduled time and then for a free slot in `slots`; its creation time
/// (and thus its deadline) is the moment the slot was granted.
///
/// The stream ends after `max_queries` emissions, when `cancel` fires, when
/// the next arrival would fall outside the range of `Instant`, or after
/// yielding an accounting error.
pub fn produce(
  scheduler: Box<dyn LoadScheduler>,
  slots: Arc<QueueSlots>,
  cancel: CancellationToken,
) -> BoxStream<'static, BenchResult<Admission>> {
  let state = ProduceState {
    scheduler,
    slots,
    cancel,
    next_seq: 0,
    next_at: Some(Instant::now()),
    failed: false,
  };

  stream::unfold(state, |mut st| async move {
    if st.failed || st.cancel.is_cancelled() {
      return None;
    }
    if let Some(limit) = st.scheduler.max_queries() {
      if st.next_seq >= limit {
        event!(Level::DEBUG, emitted = st.next_seq, "Load scheduler exhausted.");
        return None;
      }
    }

    let Some(scheduled_at) = st.next_at else {
      event!(Level::DEBUG, emitted = st.next_seq, "Next arrival out of range; load scheduler exhausted.");
      return None;
    };
    let seq = st.next_seq;
    tokio::select! {
      biased;
      _ = st.cancel.cancelled() => return None,
      _ = sleep_until(scheduled_at) => {}
    }

    let slot = tokio::select! {
      biased;
      _ = st.cancel.cancelled() => return None,
      slot = st.slots.acquire(seq) => slot,
    };
    let slot = match slot {
      Ok(slot) => slot,
      Err(e) => {
        st.failed = true;
        return Some((Err(e), st));
      }
    };

    let created_at = Instant::now();
    let query = Query::new(seq, scheduled_at, created_at, st.scheduler.timeout());
    event!(
      Level::TRACE,
      seq,
      admission_delay_us = query.admission_delay().as_micros() as u64,
      "Query admitted."
    );

    st.next_seq += 1;
    st.next_at = scheduled_at.checked_add(st.scheduler.next_arrival_delay());
    Some((Ok(Admission { query, slot }), st))
  })
  .boxed()
}
