//! Worker registry: registration, heartbeats and least-latency selection.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Worker;
use crate::store::{BusySwap, ClientStore, StoreError};

/// A worker this caller flipped from idle to busy.
#[derive(Debug)]
#[must_use = "a claimed worker stays busy until released"]
pub struct ClaimTicket {
  worker: Worker,
}

impl ClaimTicket {
  pub fn worker(&self) -> &Worker {
    &self.worker
  }

  pub fn worker_id(&self) -> Uuid {
    self.worker.id
  }
}

pub struct WorkerRegistry {
  store: Arc<dyn ClientStore>,
  default_model: String,
}

/// Selection order: recorded ping ascending, unknown ping last, then oldest
/// `last_update`, then id.
fn selection_order(a: &Worker, b: &Worker) -> Ordering {
  let by_ping = match (a.ping, b.ping) {
    (Some(x), Some(y)) => x.cmp(&y),
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  };
  by_ping
    .then_with(|| a.last_update.cmp(&b.last_update))
    .then_with(|| a.id.cmp(&b.id))
}

impl WorkerRegistry {
  pub fn new(store: Arc<dyn ClientStore>, default_model: impl Into<String>) -> Self {
    Self {
      store,
      default_model: default_model.into(),
    }
  }

  pub async fn register(&self, address: String, model_name: Option<String>) -> Result<Worker, StoreError> {
    let worker = Worker::new(address, model_name.unwrap_or_else(|| self.default_model.clone()));
    let worker = self.store.register(worker).await?;
    info!("Registered worker {} at {} ({})", worker.id, worker.address, worker.model_name);
    Ok(worker)
  }

  /// Refreshes liveness. A missing ping keeps the previous measurement.
  pub async fn heartbeat(&self, id: &Uuid, ping: Option<u32>) -> Result<Option<Worker>, StoreError> {
    let worker = self.store.refresh(id, ping).await?;
    if worker.is_none() {
      debug!("Heartbeat from unknown worker {}", id);
    }
    Ok(worker)
  }

  pub async fn get(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
    self.store.get(id).await
  }

  pub async fn get_all(&self) -> Result<Vec<Worker>, StoreError> {
    self.store.all().await
  }

  /// Idle worker with the lowest ping. Read-only; use `claim_best` to dispatch.
  pub async fn get_best(&self) -> Result<Option<Worker>, StoreError> {
    Ok(self.idle_candidates(&HashSet::new()).await?.into_iter().next())
  }

  async fn idle_candidates(&self, exclude: &HashSet<Uuid>) -> Result<Vec<Worker>, StoreError> {
    let mut idle: Vec<Worker> = self.store
      .all()
      .await?
      .into_iter()
      .filter(|w| !w.busy && !exclude.contains(&w.id))
      .collect();
    idle.sort_by(selection_order);
    Ok(idle)
  }

  /// Picks the best idle worker and marks it busy in one step.
  pub async fn claim_best(&self, exclude: &HashSet<Uuid>) -> Result<Option<ClaimTicket>, StoreError> {
    for candidate in self.idle_candidates(exclude).await? {
      match self.store.swap_busy(&candidate.id, false, true).await? {
        BusySwap::Swapped(worker) => {
          debug!("Claimed worker {} (ping {:?})", worker.id, worker.ping);
          return Ok(Some(ClaimTicket { worker }));
        }
        BusySwap::Conflict(_) | BusySwap::Missing => continue,
      }
    }
    Ok(None)
  }

  pub async fn release(&self, ticket: ClaimTicket) -> Result<(), StoreError> {
    self.release_id(&ticket.worker.id).await
  }

  pub async fn release_id(&self, id: &Uuid) -> Result<(), StoreError> {
    match self.store.swap_busy(id, true, false).await? {
      BusySwap::Swapped(_) => debug!("Released worker {}", id),
      BusySwap::Conflict(_) => warn!("Worker {} was already idle on release", id),
      BusySwap::Missing => warn!("Worker {} vanished before release", id),
    }
    Ok(())
  }

  pub async fn remove(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
    let removed = self.store.delete(id).await?;
    if removed.is_some() {
      info!("Removed worker {}", id);
    }
    Ok(removed)
  }
}
