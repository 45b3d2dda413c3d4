// benchline/src/pipeline/slots.rs

//! Queue-depth accounting shared by the scheduler and every in-flight query.
//!
//! Admission takes a semaphore permit and then records the query in the
//! in-flight set under one lock. Release happens in the same order in reverse
//! when the `SlotGuard` drops, so the set never holds more than `depth` entries.

use crate::error::{BenchError, BenchResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{event, Level};

/// Largest queue depth a run accepts; the slot semaphore cannot hold more
/// permits.
pub const MAX_QUEUE_DEPTH: usize = Semaphore::MAX_PERMITS;

#[derive(Debug)]
pub struct QueueSlots {
  depth: usize,
  permits: Arc<Semaphore>,
  active: Mutex<BTreeSet<u64>>,
  peak: AtomicUsize,
}

impl QueueSlots {
  pub fn new(depth: usize) -> Arc<Self> {
    Arc::new(Self {
      depth,
      permits: Arc::new(Semaphore::new(depth)),
      active: Mutex::new(BTreeSet::new()),
      peak: AtomicUsize::new(0),
    })
  }

  /// Waits for a free slot and registers query `seq` as in flight.
  ///
  /// Fails only if the accounting is inconsistent (a closed semaphore, a
  /// duplicate sequence number, or more entries than permits). The executor
  /// treats that as fatal.
  pub async fn acquire(self: &Arc<Self>, seq: u64) -> BenchResult<SlotGuard> {
    let permit = Arc::clone(&self.permits)
      .acquire_owned()
      .await
      .map_err(|_| BenchError::Internal("queue slot semaphore closed".to_string()))?;

    let mut active = self.active.lock();
    if !active.insert(seq) {
      return Err(BenchError::Internal(format!("query {} admitted twice", seq)));
    }
    let in_flight = active.len();
    if in_flight > self.depth {
      active.remove(&seq);
      return Err(BenchError::Internal(format!(
        "{} queries in flight with queue_depth {}",
        in_flight, self.depth
      )));
    }
    self.peak.fetch_max(in_flight, Ordering::Relaxed);
    drop(active);

    event!(Level::TRACE, seq, in_flight, "Queue slot acquired.");
    Ok(SlotGuard {
      seq,
      slots: Arc::clone(self),
      _permit: permit,
    })
  }

  pub fn depth(&self) -> usize {
    self.depth
  }

  pub fn in_flight(&self) -> usize {
    self.active.lock().len()
  }

  /// Sequence numbers currently holding a slot, in ascending order.
  pub fn in_flight_queries(&self) -> Vec<u64> {
    self.active.lock().iter().copied().collect()
  }

  /// Highest number of simultaneously held slots so far.
  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::Relaxed)
  }
}

/// A held queue slot. Dropping it removes the query from the in-flight set and
/// then returns the permit.
#[derive(Debug)]
pub struct SlotGuard {
  seq: u64,
  slots: Arc<QueueSlots>,
  _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
  pub fn seq(&self) -> u64 {
    self.seq
  }
}

impl Drop for SlotGuard {
  fn drop(&mut self) {
    // `_permit` is dropped after this body runs.
    self.slots.active.lock().remove(&self.seq);
    event!(Level::TRACE, seq = self.seq, "Queue slot released.");
  }
}
